//! Device manager: owns the open MIDI endpoint handles and the authoritative
//! roster of known inputs and outputs.
//!
//! Incoming messages are fanned out through the [`MidiDispatcher`]; outgoing
//! messages go through reference-counted [`SafeOutput`] handles that turn into
//! silent no-ops when the physical port disappears. A poll thread reconciles
//! the OS port set with the internal set twice a second and publishes a change
//! event on every difference.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, trace};

use crate::backend::{InputCallback, InputConnection, MidiBackend, MidiEndpoint, OutputConnection};
use crate::dispatch::MidiDispatcher;
use crate::message::MidiMessage;

/// How much traffic reaches the logging sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiLogLevel {
    /// Only System Exclusive messages.
    SysexOnly,
    /// Everything except realtime chatter (clock, active sense).
    AllButRealtime,
}

/// Direction of a logged message relative to this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiDirection {
    In,
    Out,
}

/// Pluggable sink that observes every message crossing the device manager.
pub trait MidiLogger: Send + Sync {
    fn log(&self, direction: MidiDirection, endpoint: &MidiEndpoint, message: &MidiMessage);
}

struct LogSink {
    logger: Mutex<Option<Arc<dyn MidiLogger>>>,
    level: Mutex<MidiLogLevel>,
}

impl LogSink {
    fn offer(&self, direction: MidiDirection, endpoint: &MidiEndpoint, message: &MidiMessage) {
        let logger = {
            let guard = self.logger.lock().expect("log sink mutex poisoned");
            match guard.as_ref() {
                Some(logger) => Arc::clone(logger),
                None => return,
            }
        };
        let level = *self.level.lock().expect("log sink mutex poisoned");
        let wanted = match level {
            MidiLogLevel::SysexOnly => message.is_sysex(),
            MidiLogLevel::AllButRealtime => !message.is_active_sense() && !message.is_clock(),
        };
        if wanted {
            logger.log(direction, endpoint, message);
        }
    }
}

struct SafeOutputInner {
    endpoint: MidiEndpoint,
    connection: Mutex<Option<Box<dyn OutputConnection>>>,
    log: Arc<LogSink>,
}

/// Handle to an open output. Cloneable and cheap to share; when the physical
/// port goes away the handle stays alive but drops everything sent through it.
#[derive(Clone)]
pub struct SafeOutput {
    inner: Arc<SafeOutputInner>,
}

impl SafeOutput {
    fn new(endpoint: MidiEndpoint, connection: Option<Box<dyn OutputConnection>>, log: Arc<LogSink>) -> Self {
        Self {
            inner: Arc::new(SafeOutputInner {
                endpoint,
                connection: Mutex::new(connection),
                log,
            }),
        }
    }

    pub fn endpoint(&self) -> &MidiEndpoint {
        &self.inner.endpoint
    }

    pub fn name(&self) -> &str {
        if self.is_valid() {
            &self.inner.endpoint.name
        } else {
            "invalid_midi_out"
        }
    }

    pub fn is_valid(&self) -> bool {
        self.inner
            .connection
            .lock()
            .expect("safe output mutex poisoned")
            .is_some()
    }

    fn invalidate(&self) {
        self.inner
            .connection
            .lock()
            .expect("safe output mutex poisoned")
            .take();
    }

    /// Send one message immediately. Empty SysEx is suppressed, vintage
    /// hardware misinterprets it. Sends through an invalid handle are no-ops.
    pub fn send_now(&self, message: &MidiMessage) {
        if message.is_empty_sysex() {
            return;
        }
        let mut guard = self.inner.connection.lock().expect("safe output mutex poisoned");
        if let Some(connection) = guard.as_mut() {
            if let Err(e) = connection.send(message.bytes()) {
                debug!(output = %self.inner.endpoint.name, "send failed, dropping message: {e}");
                return;
            }
            self.inner
                .log
                .offer(MidiDirection::Out, &self.inner.endpoint, message);
        }
    }

    /// Send a block back to back, as fast as the OS takes them.
    pub fn send_block_full_speed(&self, messages: &[MidiMessage]) {
        for message in messages {
            self.send_now(message);
        }
    }

    /// Send a block with a fixed pause before each message, for devices that
    /// drop bytes when flooded. Blocks the calling thread.
    pub fn send_block_throttled(&self, messages: &[MidiMessage], gap: Duration) {
        for message in messages {
            if message.is_empty_sysex() {
                continue;
            }
            thread::sleep(gap);
            self.send_now(message);
        }
    }
}

struct DeviceState {
    inputs_open: HashMap<String, Box<dyn InputConnection>>,
    outputs_open: HashMap<String, SafeOutput>,
    known_inputs: BTreeSet<MidiEndpoint>,
    known_outputs: BTreeSet<MidiEndpoint>,
    input_history: BTreeSet<MidiEndpoint>,
    output_history: BTreeSet<MidiEndpoint>,
}

type ChangeListener = Box<dyn Fn() + Send>;

/// The MIDI transport hub. Construct once, share as `Arc`.
pub struct DeviceManager {
    backend: Arc<dyn MidiBackend>,
    dispatcher: Arc<MidiDispatcher>,
    state: Mutex<DeviceState>,
    log: Arc<LogSink>,
    change_listeners: Mutex<Vec<ChangeListener>>,
}

impl DeviceManager {
    /// Create the manager and start its device poll thread. The thread exits
    /// when the last strong reference to the manager is gone.
    pub fn new(backend: Arc<dyn MidiBackend>) -> Arc<Self> {
        let known_inputs: BTreeSet<_> = backend.list_inputs().into_iter().collect();
        let known_outputs: BTreeSet<_> = backend.list_outputs().into_iter().collect();
        let manager = Arc::new(Self {
            backend,
            dispatcher: MidiDispatcher::new(),
            state: Mutex::new(DeviceState {
                inputs_open: HashMap::new(),
                outputs_open: HashMap::new(),
                input_history: known_inputs.clone(),
                output_history: known_outputs.clone(),
                known_inputs,
                known_outputs,
            }),
            log: Arc::new(LogSink {
                logger: Mutex::new(None),
                level: Mutex::new(MidiLogLevel::SysexOnly),
            }),
            change_listeners: Mutex::new(Vec::new()),
        });
        Self::start_poll_thread(&manager);
        manager
    }

    fn start_poll_thread(this: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(this);
        thread::Builder::new()
            .name("midi-device-poll".to_string())
            .spawn(move || loop {
                thread::sleep(Duration::from_millis(500));
                let Some(manager) = weak.upgrade() else {
                    return;
                };
                manager.poll_devices();
            })
            .expect("failed to spawn midi device poll thread");
    }

    pub fn dispatcher(&self) -> &Arc<MidiDispatcher> {
        &self.dispatcher
    }

    pub fn set_midi_logger(&self, logger: Option<Arc<dyn MidiLogger>>) {
        *self.log.logger.lock().expect("log sink mutex poisoned") = logger;
    }

    pub fn set_midi_log_level(&self, level: MidiLogLevel) {
        *self.log.level.lock().expect("log sink mutex poisoned") = level;
    }

    /// Register a callback fired whenever the endpoint roster changes.
    pub fn on_devices_changed(&self, listener: impl Fn() + Send + 'static) {
        self.change_listeners
            .lock()
            .expect("change listener mutex poisoned")
            .push(Box::new(listener));
    }

    /// Current inputs; with `with_history` every input ever seen this run.
    pub fn list_inputs(&self, with_history: bool) -> Vec<MidiEndpoint> {
        let state = self.state.lock().expect("device state mutex poisoned");
        let set = if with_history {
            &state.input_history
        } else {
            &state.known_inputs
        };
        set.iter().cloned().collect()
    }

    /// Current outputs; with `with_history` every output ever seen this run.
    pub fn list_outputs(&self, with_history: bool) -> Vec<MidiEndpoint> {
        let state = self.state.lock().expect("device state mutex poisoned");
        let set = if with_history {
            &state.output_history
        } else {
            &state.known_outputs
        };
        set.iter().cloned().collect()
    }

    pub fn input_by_id(&self, id: &str) -> Option<MidiEndpoint> {
        let state = self.state.lock().expect("device state mutex poisoned");
        state.input_history.iter().find(|e| e.id == id).cloned()
    }

    pub fn output_by_id(&self, id: &str) -> Option<MidiEndpoint> {
        let state = self.state.lock().expect("device state mutex poisoned");
        state.output_history.iter().find(|e| e.id == id).cloned()
    }

    fn input_callback(self: &Arc<Self>) -> InputCallback {
        let weak = Arc::downgrade(self);
        Arc::new(move |source: &MidiEndpoint, message: MidiMessage| {
            if let Some(manager) = weak.upgrade() {
                manager.log.offer(MidiDirection::In, source, &message);
                manager.dispatcher.dispatch(source, &message);
            }
        })
    }

    /// Open (or reopen) an input. Idempotent: enabling an already open input
    /// is treated as a restart, which covers unplug/replug of USB leads.
    pub fn enable_input(self: &Arc<Self>, endpoint: &MidiEndpoint) -> bool {
        if !endpoint.is_valid() {
            return false;
        }
        // Restart semantics: drop the old connection first.
        {
            let mut state = self.state.lock().expect("device state mutex poisoned");
            state.inputs_open.remove(&endpoint.id);
        }
        match self.backend.open_input(endpoint, self.input_callback()) {
            Ok(connection) => {
                trace!(input = %endpoint.name, id = %endpoint.id, "MIDI input opened");
                let mut state = self.state.lock().expect("device state mutex poisoned");
                state.inputs_open.insert(endpoint.id.clone(), connection);
                true
            }
            Err(e) => {
                error!(
                    input = %endpoint.name,
                    "MIDI input could not be opened, maybe it is locked by another program? {e}"
                );
                false
            }
        }
    }

    /// Close an input. Closing an input that was never open is logged only.
    pub fn disable_input(&self, endpoint: &MidiEndpoint) {
        if !endpoint.is_valid() {
            return;
        }
        let mut state = self.state.lock().expect("device state mutex poisoned");
        if state.inputs_open.remove(&endpoint.id).is_none() {
            debug!(input = %endpoint.name, "disable requested for input that is not open");
        } else {
            trace!(input = %endpoint.name, "MIDI input closed");
        }
    }

    pub fn is_input_enabled(&self, endpoint: &MidiEndpoint) -> bool {
        let state = self.state.lock().expect("device state mutex poisoned");
        state.inputs_open.contains_key(&endpoint.id)
    }

    /// Get a shareable handle for an output, opening it lazily. On open
    /// failure the returned handle is invalid and swallows all sends.
    pub fn open_output(&self, endpoint: &MidiEndpoint) -> SafeOutput {
        {
            let state = self.state.lock().expect("device state mutex poisoned");
            if let Some(existing) = state.outputs_open.get(&endpoint.id) {
                if existing.is_valid() {
                    return existing.clone();
                }
            }
        }
        let connection = if endpoint.is_valid() {
            match self.backend.open_output(endpoint) {
                Ok(connection) => {
                    trace!(output = %endpoint.name, id = %endpoint.id, "MIDI output opened");
                    Some(connection)
                }
                Err(e) => {
                    error!(
                        output = %endpoint.name,
                        "MIDI output could not be opened, is it in use elsewhere? {e}"
                    );
                    None
                }
            }
        } else {
            None
        };
        let output = SafeOutput::new(endpoint.clone(), connection, Arc::clone(&self.log));
        let mut state = self.state.lock().expect("device state mutex poisoned");
        state.outputs_open.insert(endpoint.id.clone(), output.clone());
        output
    }

    /// One reconciliation pass against the OS port set. The poll thread calls
    /// this twice a second; tests call it directly.
    pub fn poll_devices(&self) -> bool {
        let current_inputs: BTreeSet<_> = self.backend.list_inputs().into_iter().collect();
        let current_outputs: BTreeSet<_> = self.backend.list_outputs().into_iter().collect();

        let mut dirty = false;
        {
            let mut state = self.state.lock().expect("device state mutex poisoned");

            // Close open inputs whose port is gone.
            let lost_inputs: Vec<String> = state
                .inputs_open
                .keys()
                .filter(|id| !current_inputs.iter().any(|e| &&e.id == id))
                .cloned()
                .collect();
            for id in lost_inputs {
                if let Some(connection) = state.inputs_open.remove(&id) {
                    info!(input = %connection.endpoint().name, "MIDI input unplugged");
                    dirty = true;
                }
            }

            // Invalidate safe outputs whose port is gone.
            let lost_outputs: Vec<String> = state
                .outputs_open
                .keys()
                .filter(|id| !current_outputs.iter().any(|e| &&e.id == id))
                .cloned()
                .collect();
            for id in lost_outputs {
                if let Some(output) = state.outputs_open.remove(&id) {
                    info!(output = %output.name(), "MIDI output unplugged");
                    output.invalidate();
                    dirty = true;
                }
            }

            for input in current_inputs.difference(&state.known_inputs) {
                info!(input = %input.name, "MIDI input connected");
                dirty = true;
            }
            for output in current_outputs.difference(&state.known_outputs) {
                info!(output = %output.name, "MIDI output connected");
                dirty = true;
            }
            if state.known_inputs != current_inputs || state.known_outputs != current_outputs {
                dirty = true;
            }

            state.known_inputs = current_inputs;
            state.known_outputs = current_outputs;
            let known_inputs = state.known_inputs.clone();
            let known_outputs = state.known_outputs.clone();
            state.input_history.extend(known_inputs);
            state.output_history.extend(known_outputs);
        }

        if dirty {
            debug!("MIDI device list changed, notifying listeners");
            let listeners = self
                .change_listeners
                .lock()
                .expect("change listener mutex poisoned");
            for listener in listeners.iter() {
                listener();
            }
        }
        dirty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_enable_input_and_receive() {
        let backend = SimBackend::new();
        let input = backend.add_input("Synth In");
        let manager = DeviceManager::new(backend.clone().as_backend());

        let received = Arc::new(AtomicUsize::new(0));
        let seen = received.clone();
        manager.dispatcher().subscribe(
            crate::dispatch::HandlerHandle::new(),
            Arc::new(move |_, _| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(manager.enable_input(&input));
        backend.inject(&input, MidiMessage::sysex(&[0x10]));
        assert_eq!(received.load(Ordering::SeqCst), 1);

        manager.disable_input(&input);
        backend.inject(&input, MidiMessage::sysex(&[0x11]));
        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_enable_input_twice_is_restart() {
        let backend = SimBackend::new();
        let input = backend.add_input("Synth In");
        let manager = DeviceManager::new(backend.clone().as_backend());
        assert!(manager.enable_input(&input));
        assert!(manager.enable_input(&input));
        assert!(manager.is_input_enabled(&input));
    }

    #[test]
    fn test_safe_output_drops_empty_sysex() {
        let backend = SimBackend::new();
        let output = backend.add_output("Synth Out");
        let manager = DeviceManager::new(backend.clone().as_backend());

        let handle = manager.open_output(&output);
        assert!(handle.is_valid());
        handle.send_now(&MidiMessage::from_bytes(vec![0xf0, 0xf7]));
        handle.send_now(&MidiMessage::sysex(&[0x42]));

        let sent = backend.sent_to(&output);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].sysex_payload(), Some(&[0x42][..]));
    }

    #[test]
    fn test_invalid_output_is_silent() {
        let backend = SimBackend::new();
        let manager = DeviceManager::new(backend.as_backend());
        let handle = manager.open_output(&MidiEndpoint::invalid());
        assert!(!handle.is_valid());
        assert_eq!(handle.name(), "invalid_midi_out");
        // Must not panic or error.
        handle.send_now(&MidiMessage::sysex(&[0x01]));
        handle.send_block_full_speed(&[MidiMessage::sysex(&[0x02])]);
    }

    #[test]
    fn test_unplug_invalidates_output_and_notifies() {
        let backend = SimBackend::new();
        let output = backend.add_output("Synth Out");
        let manager = DeviceManager::new(backend.clone().as_backend());

        let changes = Arc::new(AtomicUsize::new(0));
        let seen = changes.clone();
        manager.on_devices_changed(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let handle = manager.open_output(&output);
        assert!(handle.is_valid());

        backend.unplug_output(&output);
        assert!(manager.poll_devices());
        assert!(!handle.is_valid());
        assert!(changes.load(Ordering::SeqCst) >= 1);

        // Sending through the invalidated handle stays a no-op.
        handle.send_now(&MidiMessage::sysex(&[0x01]));
    }

    #[test]
    fn test_unplug_closes_input() {
        let backend = SimBackend::new();
        let input = backend.add_input("Synth In");
        let manager = DeviceManager::new(backend.clone().as_backend());
        assert!(manager.enable_input(&input));

        backend.unplug_input(&input);
        assert!(manager.poll_devices());
        assert!(!manager.is_input_enabled(&input));
    }

    #[test]
    fn test_history_outlives_unplug() {
        let backend = SimBackend::new();
        let input = backend.add_input("Ephemeral In");
        let manager = DeviceManager::new(backend.clone().as_backend());

        backend.unplug_input(&input);
        manager.poll_devices();

        assert!(manager.list_inputs(false).is_empty());
        assert_eq!(manager.list_inputs(true), vec![input]);
    }

    #[test]
    fn test_logger_sees_sysex_only_by_default() {
        struct CountingLogger(AtomicUsize);
        impl MidiLogger for CountingLogger {
            fn log(&self, _: MidiDirection, _: &MidiEndpoint, _: &MidiMessage) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let backend = SimBackend::new();
        let input = backend.add_input("In");
        let manager = DeviceManager::new(backend.clone().as_backend());
        let logger = Arc::new(CountingLogger(AtomicUsize::new(0)));
        manager.set_midi_logger(Some(logger.clone()));
        manager.enable_input(&input);

        backend.inject(&input, MidiMessage::sysex(&[0x01]));
        backend.inject(&input, MidiMessage::program_change(0, 1));
        assert_eq!(logger.0.load(Ordering::SeqCst), 1);

        manager.set_midi_log_level(MidiLogLevel::AllButRealtime);
        backend.inject(&input, MidiMessage::program_change(0, 1));
        backend.inject(&input, MidiMessage::from_bytes(vec![0xf8]));
        assert_eq!(logger.0.load(Ordering::SeqCst), 2);
    }
}
