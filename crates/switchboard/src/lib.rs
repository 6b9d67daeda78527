//! Switchboard: the MIDI transport layer of the patch librarian.
//!
//! Owns the OS-level MIDI handles and everything needed to hold a
//! conversation with a synthesizer:
//!
//! - **Device manager**: port roster with hot-plug polling, idempotent
//!   open/close, reference-counted output handles that degrade to no-ops when
//!   a cable is pulled.
//! - **Handler dispatch**: keyed subscriptions fed from the I/O thread, with
//!   optional per-handler idle timeouts delivered as a sentinel message.
//! - **Protocol runtime**: "send request, await next message" conversations
//!   on worker threads, cancellable between awaits.
//! - **Discovery**: probe every output/channel combination with a vendor
//!   detect message, remember the winning location in a settings file.
//!
//! Production code runs on midir; tests swap in [`sim::SimBackend`], an
//! in-memory network with scriptable devices.

pub mod backend;
pub mod devices;
pub mod discovery;
pub mod dispatch;
pub mod message;
pub mod protocol;
pub mod settings;
pub mod sim;
pub mod timed;

pub use backend::{BackendError, MidiBackend, MidiEndpoint, MidirBackend};
pub use devices::{DeviceManager, MidiDirection, MidiLogLevel, MidiLogger, SafeOutput};
pub use discovery::{
    best_location, detect_device, verify_device, DiscoverableDevice, MidiChannel,
    MidiNetworkLocation, BROADCAST_DEVICE_ID,
};
pub use dispatch::{HandlerHandle, MidiDispatcher};
pub use message::MidiMessage;
pub use protocol::{run_protocol, AbortFlag, MidiEvent, ProtocolContext, ProtocolTask};
pub use settings::{LocationSettings, SettingsError};
pub use sim::SimBackend;
pub use timed::TimedSender;
