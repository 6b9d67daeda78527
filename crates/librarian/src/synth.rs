//! Synth adapters as capability records.
//!
//! A synth adapter implements the small required [`Synth`] trait and fills a
//! [`SynthCapabilities`] record with the optional protocol pieces it supports.
//! "Has capability X" is an `Option::is_some` check, nothing is discovered by
//! downcasting. The engines in this crate only ever talk to these traits.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use switchboard::MidiMessage;

use crate::fingerprint::Fingerprint;
use crate::model::{BankNumber, Patch, ProgramNumber};

/// How a bank is pulled from a device. Adapters may pin one; otherwise the
/// downloader picks the best the capability record offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BankDownloadMethod {
    Streaming,
    Handshakes,
    Banks,
    ProgramBuffers,
    EditBuffers,
}

/// Classification of one incoming message by an adapter, together with an
/// optional handshake reply (ACK) that must go back to the device.
#[derive(Debug, Clone, Default)]
pub struct MessageClassification {
    pub accepted: bool,
    pub reply: Vec<MidiMessage>,
}

impl MessageClassification {
    pub fn no() -> Self {
        Self::default()
    }

    pub fn yes() -> Self {
        Self {
            accepted: true,
            reply: Vec::new(),
        }
    }

    pub fn yes_with_reply(reply: Vec<MidiMessage>) -> Self {
        Self {
            accepted: true,
            reply,
        }
    }
}

/// Edit-buffer transport: request and parse the device's "currently loaded"
/// slot.
pub trait EditBufferCapability: Send + Sync {
    fn request_edit_buffer(&self) -> Vec<MidiMessage>;
    fn is_part_of_edit_buffer(&self, message: &MidiMessage) -> MessageClassification;
    fn is_edit_buffer_dump(&self, messages: &[MidiMessage]) -> bool;
    fn patch_from_edit_buffer(&self, messages: &[MidiMessage]) -> Option<Patch>;
    /// Frame a patch for sending into the edit buffer.
    fn edit_buffer_for_patch(&self, patch: &Patch) -> Vec<MidiMessage>;
}

/// Program-dump transport: request and parse one stored program at a time.
pub trait ProgramDumpCapability: Send + Sync {
    fn request_program(&self, program_no: u32) -> Vec<MidiMessage>;
    fn is_part_of_program_dump(&self, message: &MidiMessage) -> MessageClassification;
    fn is_single_program_dump(&self, messages: &[MidiMessage]) -> bool;
    fn patch_from_program_dump(&self, messages: &[MidiMessage]) -> Option<Patch>;
    /// Frame a patch as a program dump aimed at `place`.
    fn program_dump_for_patch(&self, patch: &Patch, place: ProgramNumber) -> Vec<MidiMessage>;
    /// The program place stored inside a dump, if the format carries one.
    fn program_number_of(&self, _messages: &[MidiMessage]) -> Option<ProgramNumber> {
        None
    }
}

/// Bank-dump transport: one request, a burst of messages back.
pub trait BankDumpCapability: Send + Sync {
    fn request_bank_dump(&self, bank: BankNumber) -> Vec<MidiMessage>;
    fn is_bank_dump_part(&self, message: &MidiMessage) -> bool;
    fn is_bank_dump_finished(&self, messages: &[MidiMessage]) -> bool;
    fn patches_from_bank_dump(&self, messages: &[MidiMessage]) -> Vec<Patch>;
}

/// Which stream a stream-loading synth is asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    EditBufferDump,
    BankDump,
}

/// Stream transport: the device pushes a self-delimiting message stream; the
/// adapter decides when it is complete and when to request the next element.
pub trait StreamLoadCapability: Send + Sync {
    fn request_stream_element(&self, index: u32, kind: StreamType) -> Vec<MidiMessage>;
    fn is_part_of_stream(&self, message: &MidiMessage, kind: StreamType) -> bool;
    fn is_stream_complete(&self, messages: &[MidiMessage], kind: StreamType) -> bool;
    fn should_stream_advance(&self, messages: &[MidiMessage], kind: StreamType) -> bool;
    fn expected_stream_messages(&self, _kind: StreamType) -> Option<usize> {
        None
    }
    fn patches_from_stream(&self, messages: &[MidiMessage]) -> Vec<Patch>;
}

/// One step of a handshake conversation.
pub trait HandshakeState: Send {
    /// Feed one incoming message; returns whether it belonged to the protocol
    /// and what (if anything) to send back.
    fn next_message(&mut self, message: &MidiMessage) -> MessageClassification;
    /// Progress in [0, 1].
    fn progress(&self) -> f64;
    fn is_finished(&self) -> bool;
    fn was_successful(&self) -> bool;
}

/// Handshake transport: a stateful protocol where every device message needs
/// an adapter-chosen answer.
pub trait HandshakeLoadingCapability: Send + Sync {
    fn create_state(&self) -> Box<dyn HandshakeState>;
    fn start_download(&self, bank: BankNumber) -> Vec<MidiMessage>;
}

/// Packs many per-patch message groups into bank-framed messages for upload.
pub trait BankSendCapability: Send + Sync {
    fn bank_messages(&self, patch_messages: &[Vec<MidiMessage>]) -> Vec<MidiMessage>;
}

/// Non-voice data files (tunings, waveforms, sequences) that arrive as single
/// messages.
pub trait DataFileLoadCapability: Send + Sync {
    fn data_type_ids(&self) -> Vec<i32>;
    fn is_data_file(&self, message: &MidiMessage, data_type_id: i32) -> bool;
    fn load_data(&self, messages: &[MidiMessage], data_type_id: i32) -> Vec<Patch>;
}

/// Recognizes factory placeholder names like `INIT` or `BASIC PATCH`.
pub trait DefaultNameCapability: Send + Sync {
    fn is_default_name(&self, name: &str) -> bool;
}

/// For synths that store the patch name inside the patch bytes.
pub trait StoredPatchNameCapability: Send + Sync {
    fn name_of(&self, patch: &Patch) -> Option<String>;
    /// Rewrite the name in place; returns the new patch bytes, with the name
    /// clamped to whatever the device can represent.
    fn rename(&self, patch: &Patch, new_name: &str) -> Option<Patch>;
}

/// Describes one bank of the device's patch memory.
#[derive(Debug, Clone)]
pub struct BankDescriptor {
    pub name: String,
    pub size: u32,
    pub is_rom: bool,
}

/// Bank layout of the device.
pub trait HasBanksCapability: Send + Sync {
    fn bank_descriptors(&self) -> Vec<BankDescriptor>;
}

/// The immutable capability record a synth adapter exposes.
#[derive(Default, Clone)]
pub struct SynthCapabilities {
    pub edit_buffer: Option<Arc<dyn EditBufferCapability>>,
    pub program_dump: Option<Arc<dyn ProgramDumpCapability>>,
    pub bank_dump: Option<Arc<dyn BankDumpCapability>>,
    pub stream_load: Option<Arc<dyn StreamLoadCapability>>,
    pub handshake: Option<Arc<dyn HandshakeLoadingCapability>>,
    pub bank_send: Option<Arc<dyn BankSendCapability>>,
    pub data_file_load: Option<Arc<dyn DataFileLoadCapability>>,
    pub default_name: Option<Arc<dyn DefaultNameCapability>>,
    pub stored_name: Option<Arc<dyn StoredPatchNameCapability>>,
    pub banks: Option<Arc<dyn HasBanksCapability>>,
    pub preferred_download: Option<BankDownloadMethod>,
}

/// A synth adapter. The required surface is deliberately small; everything
/// protocol-specific lives in the capability record.
pub trait Synth: Send + Sync {
    fn name(&self) -> String;

    /// Rebuild a patch from stored bytes.
    fn patch_from_data(&self, data_type_id: i32, data: Vec<u8>) -> Patch {
        Patch::new(data_type_id, data)
    }

    /// Whether a sysex message belongs to this device family at all.
    fn is_own_sysex(&self, message: &MidiMessage) -> bool;

    /// Project the patch down to the bytes that determine its sound. The
    /// default keeps everything, which is right for devices that do not even
    /// store a name in the patch.
    fn filter_voice_relevant_data(&self, patch: &Patch) -> Vec<u8> {
        patch.data().to_vec()
    }

    fn fingerprint(&self, patch: &Patch) -> Fingerprint {
        Fingerprint::from_data(&self.filter_voice_relevant_data(patch))
    }

    /// Human name of a program slot, e.g. `03-17`.
    fn friendly_program_name(&self, program: ProgramNumber) -> String {
        match program.bank() {
            Some(bank) => format!("{:02}-{:02}", bank.index(), program.program_in_bank()),
            None => format!("{:02}", program.to_zero_based_with_bank()),
        }
    }

    fn friendly_program_and_bank_name(&self, bank: BankNumber, program: ProgramNumber) -> String {
        if program.bank().is_some() {
            self.friendly_program_name(program)
        } else {
            self.friendly_program_name(ProgramNumber::with_bank(
                bank,
                program.to_zero_based_with_bank(),
            ))
        }
    }

    fn capabilities(&self) -> &SynthCapabilities;
}

/// Bank layout helpers over the capability record.
pub fn number_of_banks(synth: &dyn Synth) -> usize {
    synth
        .capabilities()
        .banks
        .as_ref()
        .map(|b| b.bank_descriptors().len())
        .unwrap_or(0)
}

pub fn bank_size(synth: &dyn Synth, bank_index: u32) -> Option<u32> {
    let banks = synth.capabilities().banks.as_ref()?;
    banks
        .bank_descriptors()
        .get(bank_index as usize)
        .map(|d| d.size)
}

/// Absolute index of the first program of a bank, summing preceding banks.
pub fn bank_start_index(synth: &dyn Synth, bank_index: u32) -> Option<u32> {
    let banks = synth.capabilities().banks.as_ref()?;
    let descriptors = banks.bank_descriptors();
    if bank_index as usize > descriptors.len() {
        return None;
    }
    Some(
        descriptors[..bank_index as usize]
            .iter()
            .map(|d| d.size)
            .sum(),
    )
}

pub fn friendly_bank_name(synth: &dyn Synth, bank_index: u32) -> String {
    synth
        .capabilities()
        .banks
        .as_ref()
        .and_then(|b| b.bank_descriptors().get(bank_index as usize).map(|d| d.name.clone()))
        .unwrap_or_else(|| format!("invalid bank {bank_index}"))
}

pub fn is_bank_writable(synth: &dyn Synth, bank_index: u32) -> bool {
    // Without descriptors we don't know; assume writable.
    synth
        .capabilities()
        .banks
        .as_ref()
        .and_then(|b| b.bank_descriptors().get(bank_index as usize).map(|d| !d.is_rom))
        .unwrap_or(true)
}

/// Owning registry of the configured synths. Patch holders keep weak
/// references; the registry is what keeps adapters alive.
#[derive(Default)]
pub struct SynthRegistry {
    synths: RwLock<HashMap<String, Arc<dyn Synth>>>,
}

impl SynthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, synth: Arc<dyn Synth>) {
        self.synths
            .write()
            .expect("synth registry lock poisoned")
            .insert(synth.name(), synth);
    }

    pub fn remove(&self, name: &str) -> Option<Arc<dyn Synth>> {
        self.synths
            .write()
            .expect("synth registry lock poisoned")
            .remove(name)
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn Synth>> {
        self.synths
            .read()
            .expect("synth registry lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn all(&self) -> Vec<Arc<dyn Synth>> {
        self.synths
            .read()
            .expect("synth registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// The synth whose sysex family matches the given messages, if exactly
    /// one does.
    pub fn sniff(&self, messages: &[MidiMessage]) -> Option<Arc<dyn Synth>> {
        let synths = self.synths.read().expect("synth registry lock poisoned");
        let mut matches: Vec<Arc<dyn Synth>> = Vec::new();
        for synth in synths.values() {
            if messages.iter().any(|m| synth.is_own_sysex(m)) {
                matches.push(Arc::clone(synth));
            }
        }
        match matches.len() {
            1 => matches.pop(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsynth::TestSynth;

    #[test]
    fn test_capability_record_defaults_to_nothing() {
        let capabilities = SynthCapabilities::default();
        assert!(capabilities.edit_buffer.is_none());
        assert!(capabilities.program_dump.is_none());
        assert!(capabilities.preferred_download.is_none());
    }

    #[test]
    fn test_bank_helpers() {
        let synth = TestSynth::builder("BankSynth")
            .banks(vec![
                BankDescriptor {
                    name: "Bank A".to_string(),
                    size: 16,
                    is_rom: false,
                },
                BankDescriptor {
                    name: "ROM".to_string(),
                    size: 32,
                    is_rom: true,
                },
            ])
            .build();
        assert_eq!(number_of_banks(&*synth), 2);
        assert_eq!(bank_size(&*synth, 0), Some(16));
        assert_eq!(bank_size(&*synth, 1), Some(32));
        assert_eq!(bank_size(&*synth, 2), None);
        assert_eq!(bank_start_index(&*synth, 1), Some(16));
        assert_eq!(friendly_bank_name(&*synth, 1), "ROM");
        assert!(is_bank_writable(&*synth, 0));
        assert!(!is_bank_writable(&*synth, 1));
    }

    #[test]
    fn test_registry_find_and_sniff() {
        let registry = SynthRegistry::new();
        let synth = TestSynth::builder("OnlyOne").build();
        registry.register(synth);
        assert!(registry.find("OnlyOne").is_some());
        assert!(registry.find("Missing").is_none());

        let message = MidiMessage::sysex(&[0x7d, 0x01]);
        assert!(registry.sniff(&[message]).is_some());
        assert!(registry.sniff(&[]).is_none());
    }

    #[test]
    fn test_default_friendly_program_name() {
        let synth = TestSynth::builder("Names").build();
        let bank = BankNumber::new(2, 32);
        assert_eq!(
            synth.friendly_program_name(ProgramNumber::with_bank(bank, 7)),
            "02-07"
        );
        assert_eq!(synth.friendly_program_name(ProgramNumber::from_zero_based(9)), "09");
    }
}
