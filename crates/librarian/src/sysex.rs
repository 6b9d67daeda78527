//! Raw `.syx` file handling: framed SysEx messages, back to back, nothing
//! else.

use std::fs;
use std::path::Path;

use switchboard::message::{SYSEX_END, SYSEX_START};
use switchboard::MidiMessage;
use tracing::warn;

/// Split a raw byte buffer into the framed SysEx messages it contains.
/// Bytes outside F0…F7 frames are skipped (resource forks, stray data).
pub fn messages_from_bytes(bytes: &[u8]) -> Vec<MidiMessage> {
    let mut messages = Vec::new();
    let mut current: Option<Vec<u8>> = None;
    for &byte in bytes {
        match (&mut current, byte) {
            (None, SYSEX_START) => current = Some(vec![SYSEX_START]),
            (None, _) => {}
            (Some(buffer), SYSEX_END) => {
                buffer.push(SYSEX_END);
                messages.push(MidiMessage::from_bytes(current.take().unwrap_or_default()));
            }
            (Some(_), SYSEX_START) => {
                // Unterminated message; drop it and start over.
                warn!("unterminated sysex message in buffer, discarding");
                current = Some(vec![SYSEX_START]);
            }
            (Some(buffer), data) => buffer.push(data),
        }
    }
    if current.is_some() {
        warn!("trailing unterminated sysex message in buffer, discarding");
    }
    messages
}

/// Concatenate messages into the raw `.syx` wire form.
pub fn messages_to_bytes(messages: &[MidiMessage]) -> Vec<u8> {
    let mut bytes = Vec::new();
    for message in messages {
        bytes.extend_from_slice(message.bytes());
    }
    bytes
}

pub fn load_sysex_file(path: &Path) -> std::io::Result<Vec<MidiMessage>> {
    Ok(messages_from_bytes(&fs::read(path)?))
}

pub fn save_sysex_file(path: &Path, messages: &[MidiMessage]) -> std::io::Result<()> {
    fs::write(path, messages_to_bytes(messages))
}

/// Turn a patch name into something every filesystem accepts.
pub fn sanitize_file_name(name: &str) -> String {
    let trimmed = name.trim();
    let mut result: String = trimmed
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    if result.is_empty() {
        result = "unnamed".to_string();
    }
    result
}
