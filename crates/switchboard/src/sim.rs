//! In-memory MIDI backend for tests.
//!
//! Builds a virtual MIDI network: tests add ports, script device behavior by
//! attaching a responder to the output side, inject messages into inputs, and
//! inspect what was sent. The device manager and everything above it run
//! unchanged against this backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::backend::{
    BackendError, InputCallback, InputConnection, MidiBackend, MidiEndpoint, OutputConnection,
};
use crate::message::MidiMessage;

/// Scripted device behavior: invoked for every message sent to any sim
/// output, returns the replies to feed into sim inputs.
pub type SimResponder =
    Arc<dyn Fn(&MidiEndpoint, &MidiMessage) -> Vec<(MidiEndpoint, MidiMessage)> + Send + Sync>;

struct SimState {
    inputs: Mutex<Vec<MidiEndpoint>>,
    outputs: Mutex<Vec<MidiEndpoint>>,
    open_inputs: Mutex<HashMap<String, InputCallback>>,
    sent: Mutex<HashMap<String, Vec<MidiMessage>>>,
    responder: Mutex<Option<SimResponder>>,
    next_id: AtomicUsize,
}

/// Handle used by tests to manipulate the virtual network. Clone freely.
#[derive(Clone)]
pub struct SimBackend {
    state: Arc<SimState>,
}

impl SimBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(SimState {
                inputs: Mutex::new(Vec::new()),
                outputs: Mutex::new(Vec::new()),
                open_inputs: Mutex::new(HashMap::new()),
                sent: Mutex::new(HashMap::new()),
                responder: Mutex::new(None),
                next_id: AtomicUsize::new(1),
            }),
        }
    }

    /// View of this backend as the trait object the device manager expects.
    pub fn as_backend(&self) -> Arc<dyn MidiBackend> {
        Arc::new(self.clone())
    }

    fn fresh_id(&self, prefix: &str) -> String {
        format!("sim-{}-{}", prefix, self.state.next_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn add_input(&self, name: &str) -> MidiEndpoint {
        let endpoint = MidiEndpoint::new(self.fresh_id("in"), name);
        self.state
            .inputs
            .lock()
            .expect("sim inputs mutex poisoned")
            .push(endpoint.clone());
        endpoint
    }

    pub fn add_output(&self, name: &str) -> MidiEndpoint {
        let endpoint = MidiEndpoint::new(self.fresh_id("out"), name);
        self.state
            .outputs
            .lock()
            .expect("sim outputs mutex poisoned")
            .push(endpoint.clone());
        endpoint
    }

    pub fn unplug_input(&self, endpoint: &MidiEndpoint) {
        self.state
            .inputs
            .lock()
            .expect("sim inputs mutex poisoned")
            .retain(|e| e.id != endpoint.id);
    }

    pub fn unplug_output(&self, endpoint: &MidiEndpoint) {
        self.state
            .outputs
            .lock()
            .expect("sim outputs mutex poisoned")
            .retain(|e| e.id != endpoint.id);
    }

    /// Script the devices on the virtual network.
    pub fn set_responder(&self, responder: SimResponder) {
        *self.state.responder.lock().expect("sim responder mutex poisoned") = Some(responder);
    }

    /// Push a message into an input, as if hardware had sent it. Delivered
    /// synchronously on the calling thread (the test plays the I/O thread).
    pub fn inject(&self, input: &MidiEndpoint, message: MidiMessage) {
        let callback = {
            let open = self.state.open_inputs.lock().expect("sim open inputs mutex poisoned");
            open.get(&input.id).map(Arc::clone)
        };
        if let Some(callback) = callback {
            callback(input, message);
        }
    }

    /// Everything sent to the given output so far.
    pub fn sent_to(&self, output: &MidiEndpoint) -> Vec<MidiMessage> {
        self.state
            .sent
            .lock()
            .expect("sim sent mutex poisoned")
            .get(&output.id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn clear_sent(&self) {
        self.state.sent.lock().expect("sim sent mutex poisoned").clear();
    }

    fn record_and_respond(&self, output: &MidiEndpoint, message: &MidiMessage) {
        self.state
            .sent
            .lock()
            .expect("sim sent mutex poisoned")
            .entry(output.id.clone())
            .or_default()
            .push(message.clone());

        let responder = {
            let guard = self.state.responder.lock().expect("sim responder mutex poisoned");
            guard.as_ref().map(Arc::clone)
        };
        if let Some(responder) = responder {
            for (input, reply) in responder(output, message) {
                self.inject(&input, reply);
            }
        }
    }
}

impl Default for SimBackend {
    fn default() -> Self {
        Self::new()
    }
}

struct SimInputConnection {
    endpoint: MidiEndpoint,
    state: Weak<SimState>,
}

impl InputConnection for SimInputConnection {
    fn endpoint(&self) -> &MidiEndpoint {
        &self.endpoint
    }
}

impl Drop for SimInputConnection {
    fn drop(&mut self) {
        if let Some(state) = self.state.upgrade() {
            state
                .open_inputs
                .lock()
                .expect("sim open inputs mutex poisoned")
                .remove(&self.endpoint.id);
        }
    }
}

struct SimOutputConnection {
    endpoint: MidiEndpoint,
    backend: SimBackend,
}

impl OutputConnection for SimOutputConnection {
    fn endpoint(&self) -> &MidiEndpoint {
        &self.endpoint
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), BackendError> {
        let still_plugged = self
            .backend
            .state
            .outputs
            .lock()
            .expect("sim outputs mutex poisoned")
            .iter()
            .any(|e| e.id == self.endpoint.id);
        if !still_plugged {
            return Err(BackendError::SendFailed("port unplugged".to_string()));
        }
        self.backend
            .record_and_respond(&self.endpoint, &MidiMessage::from_bytes(bytes.to_vec()));
        Ok(())
    }
}

impl MidiBackend for SimBackend {
    fn list_inputs(&self) -> Vec<MidiEndpoint> {
        self.state.inputs.lock().expect("sim inputs mutex poisoned").clone()
    }

    fn list_outputs(&self) -> Vec<MidiEndpoint> {
        self.state.outputs.lock().expect("sim outputs mutex poisoned").clone()
    }

    fn open_input(
        &self,
        endpoint: &MidiEndpoint,
        callback: InputCallback,
    ) -> Result<Box<dyn InputConnection>, BackendError> {
        let exists = self
            .state
            .inputs
            .lock()
            .expect("sim inputs mutex poisoned")
            .iter()
            .any(|e| e.id == endpoint.id);
        if !exists {
            return Err(BackendError::PortNotFound(endpoint.name.clone()));
        }
        self.state
            .open_inputs
            .lock()
            .expect("sim open inputs mutex poisoned")
            .insert(endpoint.id.clone(), callback);
        Ok(Box::new(SimInputConnection {
            endpoint: endpoint.clone(),
            state: Arc::downgrade(&self.state),
        }))
    }

    fn open_output(
        &self,
        endpoint: &MidiEndpoint,
    ) -> Result<Box<dyn OutputConnection>, BackendError> {
        let exists = self
            .state
            .outputs
            .lock()
            .expect("sim outputs mutex poisoned")
            .iter()
            .any(|e| e.id == endpoint.id);
        if !exists {
            return Err(BackendError::PortNotFound(endpoint.name.clone()));
        }
        Ok(Box::new(SimOutputConnection {
            endpoint: endpoint.clone(),
            backend: self.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inject_reaches_open_input_only() {
        let backend = SimBackend::new();
        let input = backend.add_input("In");
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let connection = backend
            .open_input(
                &input,
                Arc::new(move |_, message| {
                    sink.lock().unwrap().push(message);
                }),
            )
            .unwrap();

        backend.inject(&input, MidiMessage::sysex(&[0x01]));
        assert_eq!(received.lock().unwrap().len(), 1);

        drop(connection);
        backend.inject(&input, MidiMessage::sysex(&[0x02]));
        assert_eq!(received.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_responder_loops_back() {
        let backend = SimBackend::new();
        let input = backend.add_input("In");
        let output = backend.add_output("Out");

        let reply_to = input.clone();
        backend.set_responder(Arc::new(move |_, message| {
            vec![(reply_to.clone(), message.clone())]
        }));

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let _connection = backend
            .open_input(
                &input,
                Arc::new(move |_, message| {
                    sink.lock().unwrap().push(message);
                }),
            )
            .unwrap();

        let mut out = backend.open_output(&output).unwrap();
        out.send(MidiMessage::sysex(&[0x7d, 0x42]).bytes()).unwrap();

        assert_eq!(backend.sent_to(&output).len(), 1);
        assert_eq!(received.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_unplugged_output_fails_sends() {
        let backend = SimBackend::new();
        let output = backend.add_output("Out");
        let mut connection = backend.open_output(&output).unwrap();
        backend.unplug_output(&output);
        assert!(connection.send(&[0xf0, 0x01, 0xf7]).is_err());
    }
}
