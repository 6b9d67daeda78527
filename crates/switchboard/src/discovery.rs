//! Synth discovery: probe every output/channel combination with a vendor
//! detect message and record which input answered.
//!
//! The bulk path scans the whole network; the quick path re-verifies the
//! last known location from the settings store with a single probe.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::backend::MidiEndpoint;
use crate::devices::DeviceManager;
use crate::message::MidiMessage;
use crate::protocol::{AbortFlag, ProtocolContext};

/// Zero-based MIDI channel, 0..=15.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MidiChannel(u8);

impl MidiChannel {
    pub fn from_zero_based(channel: u8) -> Option<Self> {
        (channel < 16).then_some(Self(channel))
    }

    pub fn to_zero_based(self) -> u8 {
        self.0
    }

    pub fn to_one_based(self) -> u8 {
        self.0 + 1
    }
}

/// Device id used in detect messages when no channel-specific probing is
/// required ("whoever you are, answer").
pub const BROADCAST_DEVICE_ID: u8 = 0x7f;

/// Where a synth was found on the MIDI network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiNetworkLocation {
    pub input: MidiEndpoint,
    pub output: MidiEndpoint,
    pub channel: MidiChannel,
}

/// A device the discovery engine knows how to probe. Implemented by synth
/// adapters; the engine itself is device-agnostic.
pub trait DiscoverableDevice: Send + Sync {
    fn name(&self) -> String;

    /// Build the detect message(s) for a zero-based device id / channel, or
    /// [`BROADCAST_DEVICE_ID`].
    fn device_detect(&self, device_id: u8) -> Vec<MidiMessage>;

    /// Classify a reply: `Some(channel)` when the message proves the device
    /// is listening on that channel.
    fn channel_if_valid_response(&self, message: &MidiMessage) -> Option<MidiChannel>;

    /// How long to wait for a reply per output.
    fn detect_sleep(&self) -> Duration {
        Duration::from_millis(200)
    }

    /// Whether detect messages must be repeated for each of the 16 channels.
    fn needs_channel_specific_detection(&self) -> bool {
        true
    }

    /// Message to send to the winning output after a positive detection.
    fn end_device_detect(&self) -> Option<MidiMessage> {
        None
    }
}

/// Scan the whole MIDI network for one device. Every located
/// `(input, output, channel)` triple is returned; callers wanting a single
/// location should use [`best_location`].
pub fn detect_device(
    manager: &Arc<DeviceManager>,
    device: &dyn DiscoverableDevice,
    abort: &AbortFlag,
) -> Vec<MidiNetworkLocation> {
    let inputs = manager.list_inputs(false);
    let outputs = manager.list_outputs(false);
    let mut locations = Vec::new();

    for input in &inputs {
        manager.enable_input(input);
    }

    for output in &outputs {
        if abort.is_aborted() {
            break;
        }
        // Attach per output so replies to earlier probes cannot leak into
        // this round.
        let ctx = ProtocolContext::attach(manager.dispatcher(), abort.clone());
        let safe_output = manager.open_output(output);

        if device.needs_channel_specific_detection() {
            for channel in 0..16u8 {
                safe_output.send_block_full_speed(&device.device_detect(channel));
            }
        } else {
            safe_output.send_block_full_speed(&device.device_detect(BROADCAST_DEVICE_ID));
        }

        // Bounded polling window rather than a hard sleep: leave early on a
        // positive reply.
        let deadline = Instant::now() + device.detect_sleep();
        while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
            let Some(event) = ctx.next_message(remaining) else {
                break;
            };
            debug!(received = %event.message, "discovery received message");
            if let Some(channel) = device.channel_if_valid_response(&event.message) {
                info!(
                    device = %device.name(),
                    input = %event.source.name,
                    output = %output.name,
                    channel = channel.to_one_based(),
                    "detected device"
                );
                locations.push(MidiNetworkLocation {
                    input: event.source.clone(),
                    output: output.clone(),
                    channel,
                });
                if let Some(teardown) = device.end_device_detect() {
                    safe_output.send_now(&teardown);
                }
                break;
            }
        }
    }

    for input in &inputs {
        manager.disable_input(input);
    }

    if locations.is_empty() {
        info!(device = %device.name(), "no device located, is it turned on?");
    }
    locations
}

/// The location to actually use from a scan result: the *last* one. The
/// first hit is frequently the OS-provided "all devices" port, which must not
/// be used to address a device individually.
pub fn best_location(locations: &[MidiNetworkLocation]) -> Option<&MidiNetworkLocation> {
    locations.last()
}

/// Quick path: single probe of a known location. A negative result only logs
/// a warning; the caller decides whether to fall back to a full scan.
pub fn verify_device(
    manager: &Arc<DeviceManager>,
    device: &dyn DiscoverableDevice,
    location: &MidiNetworkLocation,
) -> bool {
    let was_enabled = manager.is_input_enabled(&location.input);
    manager.enable_input(&location.input);
    let ctx = ProtocolContext::attach(manager.dispatcher(), AbortFlag::new());
    let safe_output = manager.open_output(&location.output);

    safe_output.send_block_full_speed(&device.device_detect(location.channel.to_zero_based()));

    let mut found = false;
    let deadline = Instant::now() + device.detect_sleep();
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        let Some(event) = ctx.next_message(remaining) else {
            break;
        };
        match device.channel_if_valid_response(&event.message) {
            Some(channel)
                if event.source.id == location.input.id && channel == location.channel =>
            {
                found = true;
                if let Some(teardown) = device.end_device_detect() {
                    safe_output.send_now(&teardown);
                }
                break;
            }
            _ => continue,
        }
    }

    if !was_enabled {
        manager.disable_input(&location.input);
    }
    if found {
        info!(
            device = %device.name(),
            channel = location.channel.to_one_based(),
            output = %location.output.name,
            "verified device at stored location"
        );
    } else {
        warn!(
            device = %device.name(),
            output = %location.output.name,
            "lost communication with device, re-run discovery"
        );
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimBackend;

    /// Test device answering on exactly one wired (input, channel) pair.
    struct SimSynth {
        reply_via: MidiEndpoint,
        answer_to_output: MidiEndpoint,
        channel: u8,
        channel_specific: bool,
    }

    impl DiscoverableDevice for SimSynth {
        fn name(&self) -> String {
            "SimSynth".to_string()
        }

        fn device_detect(&self, device_id: u8) -> Vec<MidiMessage> {
            vec![MidiMessage::sysex(&[0x7d, 0x06, device_id])]
        }

        fn channel_if_valid_response(&self, message: &MidiMessage) -> Option<MidiChannel> {
            let payload = message.sysex_payload()?;
            match payload {
                [0x7d, 0x07, channel] => MidiChannel::from_zero_based(*channel),
                _ => None,
            }
        }

        fn detect_sleep(&self) -> Duration {
            Duration::from_millis(100)
        }

        fn needs_channel_specific_detection(&self) -> bool {
            self.channel_specific
        }

        fn end_device_detect(&self) -> Option<MidiMessage> {
            Some(MidiMessage::sysex(&[0x7d, 0x08]))
        }
    }

    fn wire_synth(backend: &SimBackend, synth: &SimSynth) {
        let reply_via = synth.reply_via.clone();
        let answer_to = synth.answer_to_output.clone();
        let channel = synth.channel;
        backend.set_responder(Arc::new(move |output, message| {
            if output.id != answer_to.id {
                return vec![];
            }
            let Some(payload) = message.sysex_payload() else {
                return vec![];
            };
            match payload {
                [0x7d, 0x06, device_id]
                    if *device_id == channel || *device_id == BROADCAST_DEVICE_ID =>
                {
                    vec![(reply_via.clone(), MidiMessage::sysex(&[0x7d, 0x07, channel]))]
                }
                _ => vec![],
            }
        }));
    }

    #[test]
    fn test_discovery_finds_exactly_the_wired_triple() {
        let backend = SimBackend::new();
        let input_a = backend.add_input("In A");
        let _input_b = backend.add_input("In B");
        let output_a = backend.add_output("Out A");
        let output_b = backend.add_output("Out B");
        let manager = DeviceManager::new(backend.clone().as_backend());

        let synth = SimSynth {
            reply_via: input_a.clone(),
            answer_to_output: output_b.clone(),
            channel: 5,
            channel_specific: true,
        };
        wire_synth(&backend, &synth);

        let locations = detect_device(&manager, &synth, &AbortFlag::new());
        assert_eq!(locations.len(), 1);
        let location = &locations[0];
        assert_eq!(location.input.id, input_a.id);
        assert_eq!(location.output.id, output_b.id);
        assert_eq!(location.channel.to_zero_based(), 5);

        // The teardown message went to the winning output.
        let sent = backend.sent_to(&output_b);
        assert!(sent
            .iter()
            .any(|m| m.sysex_payload() == Some(&[0x7d, 0x08][..])));
        // The other output only saw probes, no teardown.
        let other = backend.sent_to(&output_a);
        assert!(other
            .iter()
            .all(|m| m.sysex_payload() != Some(&[0x7d, 0x08][..])));
    }

    #[test]
    fn test_broadcast_detection_sends_single_probe_per_output() {
        let backend = SimBackend::new();
        let input = backend.add_input("In");
        let output = backend.add_output("Out");
        let manager = DeviceManager::new(backend.clone().as_backend());

        let synth = SimSynth {
            reply_via: input.clone(),
            answer_to_output: output.clone(),
            channel: 0,
            channel_specific: false,
        };
        wire_synth(&backend, &synth);

        let locations = detect_device(&manager, &synth, &AbortFlag::new());
        assert_eq!(locations.len(), 1);
        let probes: Vec<_> = backend
            .sent_to(&output)
            .into_iter()
            .filter(|m| matches!(m.sysex_payload(), Some([0x7d, 0x06, _])))
            .collect();
        assert_eq!(probes.len(), 1);
    }

    #[test]
    fn test_best_location_is_the_last_one() {
        let a = MidiNetworkLocation {
            input: MidiEndpoint::new("1", "All devices"),
            output: MidiEndpoint::new("2", "All devices"),
            channel: MidiChannel::from_zero_based(0).unwrap(),
        };
        let b = MidiNetworkLocation {
            input: MidiEndpoint::new("3", "Real port"),
            output: MidiEndpoint::new("4", "Real port"),
            channel: MidiChannel::from_zero_based(0).unwrap(),
        };
        let locations = vec![a, b.clone()];
        assert_eq!(best_location(&locations), Some(&b));
        assert_eq!(best_location(&[]), None);
    }

    #[test]
    fn test_verify_at_stored_location() {
        let backend = SimBackend::new();
        let input = backend.add_input("In");
        let output = backend.add_output("Out");
        let manager = DeviceManager::new(backend.clone().as_backend());

        let synth = SimSynth {
            reply_via: input.clone(),
            answer_to_output: output.clone(),
            channel: 3,
            channel_specific: true,
        };
        wire_synth(&backend, &synth);

        let good = MidiNetworkLocation {
            input: input.clone(),
            output: output.clone(),
            channel: MidiChannel::from_zero_based(3).unwrap(),
        };
        assert!(verify_device(&manager, &synth, &good));

        let bad = MidiNetworkLocation {
            channel: MidiChannel::from_zero_based(4).unwrap(),
            ..good
        };
        assert!(!verify_device(&manager, &synth, &bad));
    }

    #[test]
    fn test_abort_stops_scan() {
        let backend = SimBackend::new();
        backend.add_input("In");
        backend.add_output("Out");
        let manager = DeviceManager::new(backend.clone().as_backend());

        let synth = SimSynth {
            reply_via: MidiEndpoint::invalid(),
            answer_to_output: MidiEndpoint::invalid(),
            channel: 0,
            channel_specific: true,
        };
        let abort = AbortFlag::new();
        abort.abort();
        let locations = detect_device(&manager, &synth, &abort);
        assert!(locations.is_empty());
    }
}
