//! Turning a flat sysex message sequence into patches.
//!
//! Four independent sliding-window scanners run over the sequence (program
//! dumps, edit buffers, bank dumps, data files); a message may feed more than
//! one window. Stream-loading synths bypass all of it and get the whole
//! sequence handed to their adapter.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, info, warn};

use switchboard::MidiMessage;

use crate::fingerprint::Fingerprint;
use crate::model::Patch;
use crate::synth::Synth;

/// Window cap for single-patch dumps (program and edit buffer).
pub const DEFAULT_MAX_MSGS_PER_PATCH: usize = 14;
/// Window cap for bank dumps.
pub const DEFAULT_MAX_MSGS_PER_BANK: usize = 256;

const ENV_MAX_MSGS_PER_PATCH: &str = "ORM_MAX_MSG_PER_PATCH";
const ENV_MAX_MSGS_PER_BANK: &str = "ORM_MAX_MSG_PER_BANK";

/// Sliding-window sizes, overridable through the environment.
#[derive(Debug, Clone, Copy)]
pub struct ParserConfig {
    pub max_msgs_per_patch: usize,
    pub max_msgs_per_bank: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            max_msgs_per_patch: DEFAULT_MAX_MSGS_PER_PATCH,
            max_msgs_per_bank: DEFAULT_MAX_MSGS_PER_BANK,
        }
    }
}

impl ParserConfig {
    /// Defaults with `ORM_MAX_MSG_PER_PATCH` / `ORM_MAX_MSG_PER_BANK` applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = read_env_cap(ENV_MAX_MSGS_PER_PATCH) {
            config.max_msgs_per_patch = value;
        }
        if let Some(value) = read_env_cap(ENV_MAX_MSGS_PER_BANK) {
            config.max_msgs_per_bank = value;
        }
        config
    }
}

fn read_env_cap(name: &str) -> Option<usize> {
    let text = std::env::var(name).ok()?;
    match text.parse::<usize>() {
        Ok(value) if value > 0 => Some(value),
        _ => {
            warn!(variable = name, value = %text, "ignoring invalid window cap override");
            None
        }
    }
}

/// Assemble every patch found in `messages`, using the environment-derived
/// window caps.
pub fn assemble_patches(synth: &Arc<dyn Synth>, messages: &[MidiMessage]) -> Vec<Patch> {
    assemble_patches_with_config(synth, messages, ParserConfig::from_env())
}

/// Assemble with explicit window caps.
pub fn assemble_patches_with_config(
    synth: &Arc<dyn Synth>,
    messages: &[MidiMessage],
    config: ParserConfig,
) -> Vec<Patch> {
    let capabilities = synth.capabilities();

    if let Some(stream) = capabilities.stream_load.as_ref() {
        // Stream-loading synths know their own framing, hand everything over.
        return stream.patches_from_stream(messages);
    }

    let mut assembler = Assembler::new(synth, config);
    for message in messages {
        assembler.feed(message);
    }
    assembler.finish()
}

struct Assembler<'a> {
    synth: &'a Arc<dyn Synth>,
    config: ParserConfig,
    program_window: VecDeque<MidiMessage>,
    edit_buffer_window: VecDeque<MidiMessage>,
    bank_window: VecDeque<MidiMessage>,
    result: Vec<Patch>,
    /// Fingerprints of emitted single-patch dumps, pointing at their slot in
    /// `result` for the default-name fallback.
    emitted: HashMap<Fingerprint, usize>,
    /// Fingerprints that came out of the program-dump window specifically;
    /// edit-buffer duplicates of these are dropped.
    from_program_dumps: std::collections::HashSet<Fingerprint>,
}

impl<'a> Assembler<'a> {
    fn new(synth: &'a Arc<dyn Synth>, config: ParserConfig) -> Self {
        Self {
            synth,
            config,
            program_window: VecDeque::new(),
            edit_buffer_window: VecDeque::new(),
            bank_window: VecDeque::new(),
            result: Vec::new(),
            emitted: HashMap::new(),
            from_program_dumps: std::collections::HashSet::new(),
        }
    }

    fn feed(&mut self, message: &MidiMessage) {
        let capabilities = self.synth.capabilities();
        let mut accepted = false;

        if let Some(program_dump) = capabilities.program_dump.as_ref().map(Arc::clone) {
            if program_dump.is_part_of_program_dump(message).accepted {
                accepted = true;
                push_capped(&mut self.program_window, message.clone(), self.config.max_msgs_per_patch);
                let window: Vec<MidiMessage> = self.program_window.iter().cloned().collect();
                if program_dump.is_single_program_dump(&window) {
                    self.program_window.clear();
                    match program_dump.patch_from_program_dump(&window) {
                        Some(patch) => self.emit_single(patch, true),
                        None => log_undecodable("program dump", &window),
                    }
                }
            }
        }

        if let Some(edit_buffer) = capabilities.edit_buffer.as_ref().map(Arc::clone) {
            if edit_buffer.is_part_of_edit_buffer(message).accepted {
                accepted = true;
                push_capped(&mut self.edit_buffer_window, message.clone(), self.config.max_msgs_per_patch);
                let window: Vec<MidiMessage> = self.edit_buffer_window.iter().cloned().collect();
                if edit_buffer.is_edit_buffer_dump(&window) {
                    self.edit_buffer_window.clear();
                    match edit_buffer.patch_from_edit_buffer(&window) {
                        Some(patch) => self.emit_single(patch, false),
                        None => log_undecodable("edit buffer", &window),
                    }
                }
            }
        }

        if let Some(bank_dump) = capabilities.bank_dump.as_ref().map(Arc::clone) {
            if bank_dump.is_bank_dump_part(message) {
                accepted = true;
                push_capped(&mut self.bank_window, message.clone(), self.config.max_msgs_per_bank);
                let window: Vec<MidiMessage> = self.bank_window.iter().cloned().collect();
                if bank_dump.is_bank_dump_finished(&window) {
                    self.bank_window.clear();
                    let patches = bank_dump.patches_from_bank_dump(&window);
                    info!(count = patches.len(), "loaded bank dump");
                    self.result.extend(patches);
                }
            }
        }

        if let Some(data_files) = capabilities.data_file_load.as_ref().map(Arc::clone) {
            for data_type_id in data_files.data_type_ids() {
                if data_files.is_data_file(message, data_type_id) {
                    accepted = true;
                    self.result
                        .extend(data_files.load_data(std::slice::from_ref(message), data_type_id));
                }
            }
        }

        if !accepted {
            // Seen in the wild: macOS resource forks with a .syx extension
            // inside factory-bank ZIPs.
            warn!(bytes = %message, "ignoring sysex message no capability recognized");
        }
    }

    /// Emit one single-patch dump, applying cross-window dedup and the
    /// default-name fallback.
    fn emit_single(&mut self, patch: Patch, from_program_dump: bool) {
        let fingerprint = self.synth.fingerprint(&patch);

        if let Some(&slot) = self.emitted.get(&fingerprint) {
            // Same sound seen again; keep one instance, but let a properly
            // named duplicate replace a factory-default-named one.
            if self.existing_has_default_name(slot) && !self.patch_has_default_name(&patch) {
                debug!(fingerprint = %fingerprint, "replacing default-named patch with better-named duplicate");
                self.result[slot] = patch;
            }
            if from_program_dump {
                self.from_program_dumps.insert(fingerprint);
            }
            return;
        }

        if !from_program_dump && self.from_program_dumps.contains(&fingerprint) {
            // Some synths answer with the same patch both as program dump and
            // edit buffer; one is enough.
            return;
        }

        if from_program_dump {
            self.from_program_dumps.insert(fingerprint.clone());
        }
        self.emitted.insert(fingerprint, self.result.len());
        self.result.push(patch);
    }

    fn patch_name(&self, patch: &Patch) -> Option<String> {
        self.synth
            .capabilities()
            .stored_name
            .as_ref()
            .and_then(|sn| sn.name_of(patch))
    }

    fn patch_has_default_name(&self, patch: &Patch) -> bool {
        match (self.patch_name(patch), self.synth.capabilities().default_name.as_ref()) {
            (Some(name), Some(default_name)) => default_name.is_default_name(&name),
            _ => false,
        }
    }

    fn existing_has_default_name(&self, slot: usize) -> bool {
        self.patch_has_default_name(&self.result[slot])
    }

    fn finish(self) -> Vec<Patch> {
        if !self.bank_window.is_empty() {
            warn!(
                messages = self.bank_window.len(),
                "incomplete bank dump discarded, adaptation or transfer error?"
            );
        }
        self.result
    }
}

fn push_capped(window: &mut VecDeque<MidiMessage>, message: MidiMessage, cap: usize) {
    window.push_back(message);
    while window.len() > cap {
        window.pop_front();
    }
}

fn log_undecodable(kind: &str, window: &[MidiMessage]) {
    let dump: Vec<String> = window.iter().map(|m| m.to_hex_string()).collect();
    warn!(kind, window = ?dump, "failed to decode candidate, skipping");
}
