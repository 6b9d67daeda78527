//! A scriptable synth adapter for tests.
//!
//! Speaks a tiny sysex dialect under the educational manufacturer id 0x7d:
//!
//! | opcode | meaning |
//! |---|---|
//! | 0x01 | request program `n` |
//! | 0x02 | program dump for program `n` |
//! | 0x03 | edit buffer dump |
//! | 0x04 | request bank dump `b` |
//! | 0x05 | bank dump entry |
//! | 0x06 | bank dump end marker |
//! | 0x07 | stream element |
//! | 0x08 | handshake data block |
//! | 0x09 | handshake ACK |
//! | 0x0a | data file (tuning) |
//!
//! The builder decides which capabilities the instance exposes, so each test
//! gets exactly the synth it needs. This lives in the library (not behind
//! `cfg(test)`) because the catalog crate's tests use it too.

use std::sync::Arc;

use switchboard::MidiMessage;

use crate::model::{BankNumber, Patch, ProgramNumber};
use crate::synth::{
    BankDescriptor, BankDownloadMethod, BankDumpCapability, DataFileLoadCapability,
    DefaultNameCapability, EditBufferCapability, HandshakeLoadingCapability, HandshakeState,
    HasBanksCapability, MessageClassification, ProgramDumpCapability, StreamLoadCapability,
    StreamType, Synth, SynthCapabilities,
};

const MANUFACTURER: u8 = 0x7d;

pub const OP_REQUEST_PROGRAM: u8 = 0x01;
pub const OP_PROGRAM_DUMP: u8 = 0x02;
pub const OP_EDIT_BUFFER: u8 = 0x03;
pub const OP_REQUEST_BANK: u8 = 0x04;
pub const OP_BANK_ENTRY: u8 = 0x05;
pub const OP_BANK_END: u8 = 0x06;
pub const OP_STREAM_ELEMENT: u8 = 0x07;
pub const OP_HANDSHAKE_DATA: u8 = 0x08;
pub const OP_HANDSHAKE_ACK: u8 = 0x09;
pub const OP_DATA_FILE: u8 = 0x0a;

/// Data type id the test synth uses for its tuning data files.
pub const DATA_TYPE_TUNING: i32 = 10;

fn opcode_of(message: &MidiMessage) -> Option<(u8, &[u8])> {
    let payload = message.sysex_payload()?;
    match payload {
        [m, op, rest @ ..] if *m == MANUFACTURER => Some((*op, rest)),
        _ => None,
    }
}

/// Build the wire form of a program dump.
pub fn program_dump_message(program: u8, voice: &[u8]) -> MidiMessage {
    let mut payload = vec![MANUFACTURER, OP_PROGRAM_DUMP, program];
    payload.extend_from_slice(voice);
    MidiMessage::sysex(&payload)
}

/// Build the wire form of an edit buffer dump.
pub fn edit_buffer_message(voice: &[u8]) -> MidiMessage {
    let mut payload = vec![MANUFACTURER, OP_EDIT_BUFFER];
    payload.extend_from_slice(voice);
    MidiMessage::sysex(&payload)
}

pub fn bank_entry_message(voice: &[u8]) -> MidiMessage {
    let mut payload = vec![MANUFACTURER, OP_BANK_ENTRY];
    payload.extend_from_slice(voice);
    MidiMessage::sysex(&payload)
}

pub fn bank_end_message() -> MidiMessage {
    MidiMessage::sysex(&[MANUFACTURER, OP_BANK_END])
}

pub fn stream_element_message(voice: &[u8]) -> MidiMessage {
    let mut payload = vec![MANUFACTURER, OP_STREAM_ELEMENT];
    payload.extend_from_slice(voice);
    MidiMessage::sysex(&payload)
}

pub fn handshake_data_message(voice: &[u8]) -> MidiMessage {
    let mut payload = vec![MANUFACTURER, OP_HANDSHAKE_DATA];
    payload.extend_from_slice(voice);
    MidiMessage::sysex(&payload)
}

pub fn data_file_message(content: &[u8]) -> MidiMessage {
    let mut payload = vec![MANUFACTURER, OP_DATA_FILE];
    payload.extend_from_slice(content);
    MidiMessage::sysex(&payload)
}

struct TestProgramDump;

impl ProgramDumpCapability for TestProgramDump {
    fn request_program(&self, program_no: u32) -> Vec<MidiMessage> {
        vec![MidiMessage::sysex(&[
            MANUFACTURER,
            OP_REQUEST_PROGRAM,
            (program_no & 0x7f) as u8,
        ])]
    }

    fn is_part_of_program_dump(&self, message: &MidiMessage) -> MessageClassification {
        match opcode_of(message) {
            Some((OP_PROGRAM_DUMP, _)) => MessageClassification::yes(),
            _ => MessageClassification::no(),
        }
    }

    fn is_single_program_dump(&self, messages: &[MidiMessage]) -> bool {
        messages.len() == 1 && self.is_part_of_program_dump(&messages[0]).accepted
    }

    fn patch_from_program_dump(&self, messages: &[MidiMessage]) -> Option<Patch> {
        let (op, rest) = opcode_of(messages.first()?)?;
        (op == OP_PROGRAM_DUMP && !rest.is_empty()).then(|| Patch::voice(rest[1..].to_vec()))
    }

    fn program_dump_for_patch(&self, patch: &Patch, place: ProgramNumber) -> Vec<MidiMessage> {
        vec![program_dump_message(
            (place.to_zero_based_with_bank() & 0x7f) as u8,
            patch.data(),
        )]
    }

    fn program_number_of(&self, messages: &[MidiMessage]) -> Option<ProgramNumber> {
        let (op, rest) = opcode_of(messages.first()?)?;
        (op == OP_PROGRAM_DUMP && !rest.is_empty())
            .then(|| ProgramNumber::from_zero_based(rest[0] as u32))
    }
}

struct TestEditBuffer;

impl EditBufferCapability for TestEditBuffer {
    fn request_edit_buffer(&self) -> Vec<MidiMessage> {
        vec![MidiMessage::sysex(&[MANUFACTURER, OP_REQUEST_PROGRAM, 0x7f])]
    }

    fn is_part_of_edit_buffer(&self, message: &MidiMessage) -> MessageClassification {
        match opcode_of(message) {
            Some((OP_EDIT_BUFFER, _)) => MessageClassification::yes(),
            _ => MessageClassification::no(),
        }
    }

    fn is_edit_buffer_dump(&self, messages: &[MidiMessage]) -> bool {
        messages.len() == 1 && self.is_part_of_edit_buffer(&messages[0]).accepted
    }

    fn patch_from_edit_buffer(&self, messages: &[MidiMessage]) -> Option<Patch> {
        let (op, rest) = opcode_of(messages.first()?)?;
        (op == OP_EDIT_BUFFER).then(|| Patch::voice(rest.to_vec()))
    }

    fn edit_buffer_for_patch(&self, patch: &Patch) -> Vec<MidiMessage> {
        vec![edit_buffer_message(patch.data())]
    }
}

struct TestBankDump;

impl BankDumpCapability for TestBankDump {
    fn request_bank_dump(&self, bank: BankNumber) -> Vec<MidiMessage> {
        vec![MidiMessage::sysex(&[
            MANUFACTURER,
            OP_REQUEST_BANK,
            (bank.index() & 0x7f) as u8,
        ])]
    }

    fn is_bank_dump_part(&self, message: &MidiMessage) -> bool {
        matches!(opcode_of(message), Some((OP_BANK_ENTRY | OP_BANK_END, _)))
    }

    fn is_bank_dump_finished(&self, messages: &[MidiMessage]) -> bool {
        messages
            .last()
            .and_then(opcode_of)
            .map(|(op, _)| op == OP_BANK_END)
            .unwrap_or(false)
    }

    fn patches_from_bank_dump(&self, messages: &[MidiMessage]) -> Vec<Patch> {
        messages
            .iter()
            .filter_map(|m| match opcode_of(m) {
                Some((OP_BANK_ENTRY, rest)) => Some(Patch::voice(rest.to_vec())),
                _ => None,
            })
            .collect()
    }
}

struct TestStreamLoad {
    expected: usize,
}

impl StreamLoadCapability for TestStreamLoad {
    fn request_stream_element(&self, index: u32, _kind: StreamType) -> Vec<MidiMessage> {
        vec![MidiMessage::sysex(&[
            MANUFACTURER,
            OP_REQUEST_BANK,
            (index & 0x7f) as u8,
        ])]
    }

    fn is_part_of_stream(&self, message: &MidiMessage, _kind: StreamType) -> bool {
        matches!(opcode_of(message), Some((OP_STREAM_ELEMENT, _)))
    }

    fn is_stream_complete(&self, messages: &[MidiMessage], _kind: StreamType) -> bool {
        messages.len() >= self.expected
    }

    fn should_stream_advance(&self, _messages: &[MidiMessage], _kind: StreamType) -> bool {
        false
    }

    fn expected_stream_messages(&self, _kind: StreamType) -> Option<usize> {
        Some(self.expected)
    }

    fn patches_from_stream(&self, messages: &[MidiMessage]) -> Vec<Patch> {
        messages
            .iter()
            .filter_map(|m| match opcode_of(m) {
                Some((OP_STREAM_ELEMENT, rest)) => Some(Patch::voice(rest.to_vec())),
                _ => None,
            })
            .collect()
    }
}

struct TestHandshake {
    expected: usize,
}

struct TestHandshakeConversation {
    expected: usize,
    received: usize,
}

impl HandshakeState for TestHandshakeConversation {
    fn next_message(&mut self, message: &MidiMessage) -> MessageClassification {
        match opcode_of(message) {
            Some((OP_HANDSHAKE_DATA, _)) => {
                self.received += 1;
                MessageClassification::yes_with_reply(vec![MidiMessage::sysex(&[
                    MANUFACTURER,
                    OP_HANDSHAKE_ACK,
                ])])
            }
            _ => MessageClassification::no(),
        }
    }

    fn progress(&self) -> f64 {
        if self.expected == 0 {
            1.0
        } else {
            self.received as f64 / self.expected as f64
        }
    }

    fn is_finished(&self) -> bool {
        self.received >= self.expected
    }

    fn was_successful(&self) -> bool {
        self.is_finished()
    }
}

impl HandshakeLoadingCapability for TestHandshake {
    fn create_state(&self) -> Box<dyn HandshakeState> {
        Box::new(TestHandshakeConversation {
            expected: self.expected,
            received: 0,
        })
    }

    fn start_download(&self, bank: BankNumber) -> Vec<MidiMessage> {
        vec![MidiMessage::sysex(&[
            MANUFACTURER,
            OP_REQUEST_BANK,
            (bank.index() & 0x7f) as u8,
        ])]
    }
}

struct TestDataFiles;

impl DataFileLoadCapability for TestDataFiles {
    fn data_type_ids(&self) -> Vec<i32> {
        vec![DATA_TYPE_TUNING]
    }

    fn is_data_file(&self, message: &MidiMessage, data_type_id: i32) -> bool {
        data_type_id == DATA_TYPE_TUNING
            && matches!(opcode_of(message), Some((OP_DATA_FILE, _)))
    }

    fn load_data(&self, messages: &[MidiMessage], data_type_id: i32) -> Vec<Patch> {
        messages
            .iter()
            .filter_map(|m| match opcode_of(m) {
                Some((OP_DATA_FILE, rest)) => {
                    Some(Patch::new(data_type_id, rest.to_vec()))
                }
                _ => None,
            })
            .collect()
    }
}

struct TestDefaultNames {
    names: Vec<String>,
}

impl DefaultNameCapability for TestDefaultNames {
    fn is_default_name(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }
}

struct TestBanks {
    descriptors: Vec<BankDescriptor>,
}

impl HasBanksCapability for TestBanks {
    fn bank_descriptors(&self) -> Vec<BankDescriptor> {
        self.descriptors.clone()
    }
}

/// The test synth itself.
pub struct TestSynth {
    name: String,
    capabilities: SynthCapabilities,
}

impl Synth for TestSynth {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn is_own_sysex(&self, message: &MidiMessage) -> bool {
        message
            .sysex_payload()
            .map(|p| p.first() == Some(&MANUFACTURER))
            .unwrap_or(false)
    }

    fn capabilities(&self) -> &SynthCapabilities {
        &self.capabilities
    }
}

pub struct TestSynthBuilder {
    name: String,
    descriptors: Vec<BankDescriptor>,
    program_dump: bool,
    edit_buffer: bool,
    bank_dump: bool,
    stream_load: Option<usize>,
    handshake: Option<usize>,
    data_files: bool,
    default_names: Vec<String>,
    preferred_download: Option<BankDownloadMethod>,
}

impl TestSynth {
    pub fn builder(name: &str) -> TestSynthBuilder {
        TestSynthBuilder {
            name: name.to_string(),
            descriptors: vec![
                BankDescriptor {
                    name: "Bank A".to_string(),
                    size: 8,
                    is_rom: false,
                },
                BankDescriptor {
                    name: "Bank B".to_string(),
                    size: 8,
                    is_rom: false,
                },
            ],
            program_dump: true,
            edit_buffer: true,
            bank_dump: false,
            stream_load: None,
            handshake: None,
            data_files: false,
            default_names: Vec::new(),
            preferred_download: None,
        }
    }
}

impl TestSynthBuilder {
    pub fn banks(mut self, descriptors: Vec<BankDescriptor>) -> Self {
        self.descriptors = descriptors;
        self
    }

    pub fn bank_size(mut self, size: u32) -> Self {
        for descriptor in &mut self.descriptors {
            descriptor.size = size;
        }
        self
    }

    pub fn single_bank(mut self, size: u32) -> Self {
        self.descriptors = vec![BankDescriptor {
            name: "Bank A".to_string(),
            size,
            is_rom: false,
        }];
        self
    }

    pub fn without_program_dump(mut self) -> Self {
        self.program_dump = false;
        self
    }

    pub fn without_edit_buffer(mut self) -> Self {
        self.edit_buffer = false;
        self
    }

    pub fn with_bank_dump(mut self) -> Self {
        self.bank_dump = true;
        self
    }

    pub fn with_stream_load(mut self, expected_messages: usize) -> Self {
        self.stream_load = Some(expected_messages);
        self
    }

    pub fn with_handshake(mut self, expected_messages: usize) -> Self {
        self.handshake = Some(expected_messages);
        self
    }

    pub fn with_data_files(mut self) -> Self {
        self.data_files = true;
        self
    }

    pub fn with_default_names(mut self, names: &[&str]) -> Self {
        self.default_names = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn preferred_download(mut self, method: BankDownloadMethod) -> Self {
        self.preferred_download = Some(method);
        self
    }

    pub fn build(self) -> Arc<dyn Synth> {
        let mut capabilities = SynthCapabilities {
            banks: Some(Arc::new(TestBanks {
                descriptors: self.descriptors,
            })),
            preferred_download: self.preferred_download,
            ..SynthCapabilities::default()
        };
        if self.program_dump {
            capabilities.program_dump = Some(Arc::new(TestProgramDump));
        }
        if self.edit_buffer {
            capabilities.edit_buffer = Some(Arc::new(TestEditBuffer));
        }
        if self.bank_dump {
            capabilities.bank_dump = Some(Arc::new(TestBankDump));
        }
        if let Some(expected) = self.stream_load {
            capabilities.stream_load = Some(Arc::new(TestStreamLoad { expected }));
        }
        if let Some(expected) = self.handshake {
            capabilities.handshake = Some(Arc::new(TestHandshake { expected }));
        }
        if self.data_files {
            capabilities.data_file_load = Some(Arc::new(TestDataFiles));
        }
        if !self.default_names.is_empty() {
            capabilities.default_name = Some(Arc::new(TestDefaultNames {
                names: self.default_names,
            }));
        }
        Arc::new(TestSynth {
            name: self.name,
            capabilities,
        })
    }
}

/// Build a test synth with a hand-assembled capability record, for tests
/// that need capabilities the builder does not cover.
pub fn wrap_with_capabilities(name: &str, capabilities: SynthCapabilities) -> Arc<dyn Synth> {
    Arc::new(TestSynth {
        name: name.to_string(),
        capabilities,
    })
}

/// A holder with a unique voice payload per program index, the common test
/// fixture.
pub fn make_holder(
    synth: &Arc<dyn Synth>,
    name: &str,
    bank: BankNumber,
    program: u32,
    voice: Option<Vec<u8>>,
) -> crate::model::PatchHolder {
    let voice = voice.unwrap_or_else(|| vec![(program % 0x40) as u8 + 1]);
    let mut holder = crate::model::PatchHolder::new(
        synth,
        Some(crate::source::SourceInfo::FromFile {
            filename: format!("{name}.syx"),
            fullpath: format!("/tmp/{name}.syx"),
            program: Some(ProgramNumber::with_bank(bank, program)),
        }),
        Some(Patch::voice(voice)),
    );
    holder.set_name(name);
    holder.bank = Some(bank);
    holder.program = Some(ProgramNumber::with_bank(bank, program));
    holder
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_program_dump_roundtrip() {
        let synth = TestSynth::builder("T").build();
        let dump_capability = synth.capabilities().program_dump.as_ref().unwrap();
        let message = program_dump_message(4, &[0x10, 0x20]);
        assert!(dump_capability.is_part_of_program_dump(&message).accepted);
        assert!(dump_capability.is_single_program_dump(std::slice::from_ref(&message)));
        let patch = dump_capability
            .patch_from_program_dump(std::slice::from_ref(&message))
            .unwrap();
        assert_eq!(patch.data(), &[0x10, 0x20]);
        assert_eq!(
            dump_capability
                .program_number_of(std::slice::from_ref(&message))
                .map(|p| p.to_zero_based_with_bank()),
            Some(4)
        );
    }

    #[test]
    fn test_edit_buffer_and_program_dump_share_voice_data() {
        let synth = TestSynth::builder("T").build();
        let pd = synth.capabilities().program_dump.as_ref().unwrap();
        let eb = synth.capabilities().edit_buffer.as_ref().unwrap();
        let voice = [0x11, 0x22, 0x33];
        let from_pd = pd
            .patch_from_program_dump(&[program_dump_message(0, &voice)])
            .unwrap();
        let from_eb = eb
            .patch_from_edit_buffer(&[edit_buffer_message(&voice)])
            .unwrap();
        assert_eq!(synth.fingerprint(&from_pd), synth.fingerprint(&from_eb));
    }

    #[test]
    fn test_bank_dump_end_marker() {
        let synth = TestSynth::builder("T").with_bank_dump().build();
        let bd = synth.capabilities().bank_dump.as_ref().unwrap();
        let mut messages = vec![
            bank_entry_message(&[1]),
            bank_entry_message(&[2]),
        ];
        assert!(!bd.is_bank_dump_finished(&messages));
        messages.push(bank_end_message());
        assert!(bd.is_bank_dump_finished(&messages));
        assert_eq!(bd.patches_from_bank_dump(&messages).len(), 2);
    }

    #[test]
    fn test_handshake_conversation() {
        let synth = TestSynth::builder("T").with_handshake(2).build();
        let hs = synth.capabilities().handshake.as_ref().unwrap();
        let mut state = hs.create_state();
        assert!(!state.is_finished());
        let step = state.next_message(&handshake_data_message(&[1]));
        assert!(step.accepted);
        assert!(!step.reply.is_empty());
        state.next_message(&handshake_data_message(&[2]));
        assert!(state.is_finished());
        assert!(state.was_successful());
        assert!((state.progress() - 1.0).abs() < f64::EPSILON);
    }
}
