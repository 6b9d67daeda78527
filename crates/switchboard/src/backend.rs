//! Backend seam between the device manager and the OS MIDI stack.
//!
//! Production code talks to the hardware through midir; tests plug in an
//! in-memory backend with scriptable wiring. The device manager only ever
//! sees this trait, never midir types.

use std::sync::Arc;

use midir::{MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
use thiserror::Error;

use crate::message::MidiMessage;

/// Identifies one physical (or virtual) MIDI port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MidiEndpoint {
    /// Stable port id from the OS stack. Empty id marks an invalid endpoint.
    pub id: String,
    /// Human readable port name.
    pub name: String,
}

impl MidiEndpoint {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// An endpoint that refers to nothing. Sends to it are dropped.
    pub fn invalid() -> Self {
        Self {
            id: String::new(),
            name: "invalid".to_string(),
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.id.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to initialize MIDI: {0}")]
    InitFailed(String),

    #[error("port not found: {0}")]
    PortNotFound(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Callback invoked on the MIDI I/O thread for every inbound message.
pub type InputCallback = Arc<dyn Fn(&MidiEndpoint, MidiMessage) + Send + Sync>;

/// An open input port. Dropping the connection closes the port.
pub trait InputConnection: Send {
    fn endpoint(&self) -> &MidiEndpoint;
}

/// An open output port.
pub trait OutputConnection: Send {
    fn endpoint(&self) -> &MidiEndpoint;
    fn send(&mut self, bytes: &[u8]) -> Result<(), BackendError>;
}

/// Abstract MIDI stack: enumeration plus open/close of ports.
pub trait MidiBackend: Send + Sync {
    fn list_inputs(&self) -> Vec<MidiEndpoint>;
    fn list_outputs(&self) -> Vec<MidiEndpoint>;

    fn open_input(
        &self,
        endpoint: &MidiEndpoint,
        callback: InputCallback,
    ) -> Result<Box<dyn InputConnection>, BackendError>;

    fn open_output(&self, endpoint: &MidiEndpoint)
        -> Result<Box<dyn OutputConnection>, BackendError>;
}

/// midir-based backend used outside of tests.
pub struct MidirBackend {
    client_name: String,
}

impl MidirBackend {
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
        }
    }

    fn scan_input(&self) -> Result<MidiInput, BackendError> {
        MidiInput::new(&self.client_name).map_err(|e| BackendError::InitFailed(e.to_string()))
    }

    fn scan_output(&self) -> Result<MidiOutput, BackendError> {
        MidiOutput::new(&self.client_name).map_err(|e| BackendError::InitFailed(e.to_string()))
    }
}

struct MidirInputConnection {
    endpoint: MidiEndpoint,
    // Kept alive until drop; midir closes the port when the connection drops.
    _connection: MidiInputConnection<()>,
}

impl InputConnection for MidirInputConnection {
    fn endpoint(&self) -> &MidiEndpoint {
        &self.endpoint
    }
}

struct MidirOutputConnection {
    endpoint: MidiEndpoint,
    connection: MidiOutputConnection,
}

impl OutputConnection for MidirOutputConnection {
    fn endpoint(&self) -> &MidiEndpoint {
        &self.endpoint
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), BackendError> {
        self.connection
            .send(bytes)
            .map_err(|e| BackendError::SendFailed(e.to_string()))
    }
}

impl MidiBackend for MidirBackend {
    fn list_inputs(&self) -> Vec<MidiEndpoint> {
        let Ok(midi_in) = self.scan_input() else {
            return Vec::new();
        };
        midi_in
            .ports()
            .iter()
            .filter_map(|port| {
                midi_in
                    .port_name(port)
                    .ok()
                    .map(|name| MidiEndpoint::new(port.id(), name))
            })
            .collect()
    }

    fn list_outputs(&self) -> Vec<MidiEndpoint> {
        let Ok(midi_out) = self.scan_output() else {
            return Vec::new();
        };
        midi_out
            .ports()
            .iter()
            .filter_map(|port| {
                midi_out
                    .port_name(port)
                    .ok()
                    .map(|name| MidiEndpoint::new(port.id(), name))
            })
            .collect()
    }

    fn open_input(
        &self,
        endpoint: &MidiEndpoint,
        callback: InputCallback,
    ) -> Result<Box<dyn InputConnection>, BackendError> {
        let midi_in = self.scan_input()?;
        let port = midi_in
            .ports()
            .into_iter()
            .find(|p| p.id() == endpoint.id)
            .ok_or_else(|| BackendError::PortNotFound(endpoint.name.clone()))?;

        let source = endpoint.clone();
        let connection = midi_in
            .connect(
                &port,
                "switchboard-in",
                move |_timestamp, data, _| {
                    callback(&source, MidiMessage::from_bytes(data.to_vec()));
                },
                (),
            )
            .map_err(|e| BackendError::ConnectionFailed(e.to_string()))?;

        Ok(Box::new(MidirInputConnection {
            endpoint: endpoint.clone(),
            _connection: connection,
        }))
    }

    fn open_output(
        &self,
        endpoint: &MidiEndpoint,
    ) -> Result<Box<dyn OutputConnection>, BackendError> {
        let midi_out = self.scan_output()?;
        let port = midi_out
            .ports()
            .into_iter()
            .find(|p| p.id() == endpoint.id)
            .ok_or_else(|| BackendError::PortNotFound(endpoint.name.clone()))?;

        let connection = midi_out
            .connect(&port, "switchboard-out")
            .map_err(|e| BackendError::ConnectionFailed(e.to_string()))?;

        Ok(Box::new(MidirOutputConnection {
            endpoint: endpoint.clone(),
            connection,
        }))
    }
}
