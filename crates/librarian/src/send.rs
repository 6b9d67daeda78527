//! Pushing banks back into the instrument.
//!
//! Inverse of the download engine: either the adapter packs all patches into
//! bank-framed messages in one go, or the engine loops patch by patch,
//! optionally restricted to the dirty positions of the bank.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use switchboard::{AbortFlag, MidiMessage, SafeOutput};

use crate::lists::SynthBank;
use crate::model::{PatchHolder, ProgramNumber};
use crate::synth::Synth;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("synth {0} has no way to send patches (neither bank send, program dump nor edit buffer)")]
    NoSendMethod(String),

    #[error("send cancelled")]
    Cancelled,
}

/// Progress observer for long sends.
pub type SendProgress = Arc<dyn Fn(f64) + Send + Sync>;

/// Send a bank to the synth. With `full_bank == false` only the dirty
/// positions of the bank go out. Returns the number of patches sent.
pub fn send_bank_to_synth(
    output: &SafeOutput,
    bank: &SynthBank,
    full_bank: bool,
    progress: Option<&SendProgress>,
    abort: &AbortFlag,
) -> Result<usize, SendError> {
    let synth = Arc::clone(bank.synth());
    let capabilities = synth.capabilities();
    let bank_send = capabilities.bank_send.as_ref().map(Arc::clone);
    let program_dump = capabilities.program_dump.as_ref().map(Arc::clone);
    let edit_buffer = capabilities.edit_buffer.as_ref().map(Arc::clone);

    if let (Some(bank_send), true) = (
        bank_send,
        program_dump.is_some() || edit_buffer.is_some(),
    ) {
        // The adapter frames everything itself; this path always sends the
        // whole bank.
        let mut patch_messages: Vec<Vec<MidiMessage>> = Vec::new();
        for (i, holder) in bank.patches().iter().enumerate() {
            let Some(patch) = holder.patch() else {
                continue;
            };
            if let Some(program_dump) = &program_dump {
                patch_messages.push(
                    program_dump.program_dump_for_patch(patch, ProgramNumber::from_zero_based(i as u32)),
                );
            } else if let Some(edit_buffer) = &edit_buffer {
                patch_messages.push(edit_buffer.edit_buffer_for_patch(patch));
            }
        }
        let count = patch_messages.len();
        let messages = bank_send.bank_messages(&patch_messages);
        output.send_block_full_speed(&messages);
        return Ok(count);
    }

    if let Some(program_dump) = program_dump {
        let to_send: Vec<(usize, &PatchHolder)> = bank
            .patches()
            .iter()
            .enumerate()
            .filter(|(i, holder)| {
                holder.has_patch() && (full_bank || bank.is_position_dirty(*i))
            })
            .collect();
        let total = to_send.len().max(1);
        let mut sent = 0usize;
        for (position, holder) in to_send {
            if abort.is_aborted() {
                warn!("cancelled bank upload in mid-flight");
                return Err(SendError::Cancelled);
            }
            let Some(patch) = holder.patch() else {
                continue;
            };
            let place = holder
                .program
                .unwrap_or_else(|| ProgramNumber::from_zero_based(position as u32));
            info!(
                patch = holder.name(),
                place = synth.friendly_program_name(place),
                "sending patch"
            );
            output.send_block_full_speed(&program_dump.program_dump_for_patch(patch, place));
            sent += 1;
            if let Some(progress) = progress {
                progress(sent as f64 / total as f64);
            }
        }
        return Ok(sent);
    }

    Err(SendError::NoSendMethod(synth.name()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lists::SynthBank;
    use crate::model::BankNumber;
    use crate::synth::BankSendCapability;
    use crate::testsynth::{make_holder, TestSynth};
    use switchboard::{DeviceManager, SimBackend};

    fn test_bank(size: u32) -> (SimBackend, Arc<DeviceManager>, switchboard::MidiEndpoint, SynthBank) {
        let backend = SimBackend::new();
        let endpoint = backend.add_output("Out");
        let manager = DeviceManager::new(backend.clone().as_backend());
        let synth = TestSynth::builder("SendSynth").single_bank(size).build();
        let bank = SynthBank::new("Bank", synth, BankNumber::new(0, size));
        (backend, manager, endpoint, bank)
    }

    #[test]
    fn test_full_bank_send_sends_every_patch() {
        let (backend, manager, endpoint, mut bank) = test_bank(3);
        let synth = Arc::clone(bank.synth());
        bank.set_patches(vec![
            make_holder(&synth, "A", bank.bank(), 0, Some(vec![1])),
            make_holder(&synth, "B", bank.bank(), 1, Some(vec![2])),
        ])
        .unwrap();

        let output = manager.open_output(&endpoint);
        let sent = send_bank_to_synth(&output, &bank, true, None, &AbortFlag::new()).unwrap();
        // Two real patches; the empty pad slot is skipped.
        assert_eq!(sent, 2);
        assert_eq!(backend.sent_to(&endpoint).len(), 2);
    }

    #[test]
    fn test_partial_send_only_dirty_positions() {
        let (backend, manager, endpoint, mut bank) = test_bank(3);
        let synth = Arc::clone(bank.synth());
        bank.set_patches(vec![
            make_holder(&synth, "A", bank.bank(), 0, Some(vec![1])),
            make_holder(&synth, "B", bank.bank(), 1, Some(vec![2])),
            make_holder(&synth, "C", bank.bank(), 2, Some(vec![3])),
        ])
        .unwrap();
        bank.clear_dirty();
        bank.update_patch_at_position(1, make_holder(&synth, "B2", bank.bank(), 1, Some(vec![9])))
            .unwrap();

        let output = manager.open_output(&endpoint);
        let sent = send_bank_to_synth(&output, &bank, false, None, &AbortFlag::new()).unwrap();
        assert_eq!(sent, 1);
        let wire = backend.sent_to(&endpoint);
        assert_eq!(wire.len(), 1);
        // The dump carries the new voice byte.
        assert!(wire[0].bytes().contains(&9));
    }

    #[test]
    fn test_bank_send_capability_used_when_present() {
        struct OneBlob;
        impl BankSendCapability for OneBlob {
            fn bank_messages(&self, patch_messages: &[Vec<MidiMessage>]) -> Vec<MidiMessage> {
                // Pack everything into a single framed message.
                let mut payload = vec![0x7d, 0x7e];
                payload.push(patch_messages.len() as u8);
                vec![MidiMessage::sysex(&payload)]
            }
        }

        let backend = SimBackend::new();
        let endpoint = backend.add_output("Out");
        let manager = DeviceManager::new(backend.clone().as_backend());

        // Graft the bank-send capability onto a test synth.
        let base = TestSynth::builder("Packer").single_bank(2).build();
        let mut capabilities = base.capabilities().clone();
        capabilities.bank_send = Some(Arc::new(OneBlob));
        let synth: Arc<dyn Synth> =
            crate::testsynth::wrap_with_capabilities("Packer", capabilities);

        let mut bank = SynthBank::new("Bank", Arc::clone(&synth), BankNumber::new(0, 2));
        bank.set_patches(vec![
            make_holder(&synth, "A", bank.bank(), 0, Some(vec![1])),
            make_holder(&synth, "B", bank.bank(), 1, Some(vec![2])),
        ])
        .unwrap();

        let output = manager.open_output(&endpoint);
        let sent = send_bank_to_synth(&output, &bank, true, None, &AbortFlag::new()).unwrap();
        assert_eq!(sent, 2);
        let wire = backend.sent_to(&endpoint);
        assert_eq!(wire.len(), 1);
        assert_eq!(wire[0].sysex_payload(), Some(&[0x7d, 0x7e, 2][..]));
    }

    #[test]
    fn test_cancelled_send() {
        let (_backend, manager, endpoint, mut bank) = test_bank(2);
        let synth = Arc::clone(bank.synth());
        bank.set_patches(vec![make_holder(&synth, "A", bank.bank(), 0, Some(vec![1]))])
            .unwrap();
        let output = manager.open_output(&endpoint);
        let abort = AbortFlag::new();
        abort.abort();
        assert!(matches!(
            send_bank_to_synth(&output, &bank, true, None, &abort),
            Err(SendError::Cancelled)
        ));
    }
}
