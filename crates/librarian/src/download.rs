//! Bank download engine.
//!
//! One state machine per synth-bank request. The strategy comes from the
//! synth's preference when it declares one, otherwise the best the capability
//! record offers: stream, handshake, bank request, program-dump loop,
//! edit-buffer loop. Every strategy runs as a protocol conversation; the
//! backing subscription is dropped on every exit path, success or not.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use switchboard::{DeviceManager, MidiChannel, MidiMessage, ProtocolContext, SafeOutput};
use switchboard::AbortFlag;
use thiserror::Error;

use crate::model::{BankNumber, PatchHolder, ProgramNumber};
use crate::parser;
use crate::source::SourceInfo;
use crate::synth::{self, BankDownloadMethod, StreamType, Synth};

/// Progress observer, called with a fraction in [0, 1].
pub type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("synth {0} has no capability to download a bank")]
    NoDownloadMethod(String),

    #[error("synth {synth} is missing the {capability} capability for the chosen method")]
    MissingCapability {
        synth: String,
        capability: &'static str,
    },

    #[error("no MIDI channel known for {0}, run discovery first")]
    MissingChannel(String),

    #[error("device went silent during {strategy} download")]
    Timeout { strategy: &'static str },

    #[error("download cancelled")]
    Cancelled,

    #[error("handshake protocol ended unsuccessfully")]
    HandshakeFailed,
}

/// Tuning knobs for a download run.
#[derive(Clone)]
pub struct DownloadOptions {
    /// How long the engine waits for any single next message.
    pub message_timeout: Duration,
    /// Channel of the device, needed for the edit-buffer loop.
    pub channel: Option<MidiChannel>,
    pub progress: Option<ProgressCallback>,
    pub abort: AbortFlag,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            message_timeout: Duration::from_secs(2),
            channel: None,
            progress: None,
            abort: AbortFlag::new(),
        }
    }
}

impl DownloadOptions {
    fn report(&self, fraction: f64) {
        if let Some(progress) = &self.progress {
            progress(fraction.clamp(0.0, 1.0));
        }
    }
}

/// The method that will be used for a synth: its declared preference, else
/// the best available in priority order.
pub fn determine_download_method(synth: &dyn Synth) -> Option<BankDownloadMethod> {
    let capabilities = synth.capabilities();
    if let Some(preferred) = capabilities.preferred_download {
        return Some(preferred);
    }
    if capabilities.stream_load.is_some() {
        Some(BankDownloadMethod::Streaming)
    } else if capabilities.handshake.is_some() {
        Some(BankDownloadMethod::Handshakes)
    } else if capabilities.bank_dump.is_some() {
        Some(BankDownloadMethod::Banks)
    } else if capabilities.program_dump.is_some() {
        Some(BankDownloadMethod::ProgramBuffers)
    } else if capabilities.edit_buffer.is_some() {
        Some(BankDownloadMethod::EditBuffers)
    } else {
        None
    }
}

/// Download one bank. Blocking; run it on a worker thread (or via
/// [`switchboard::run_protocol`]) when the caller must stay responsive. The
/// result is already parsed into holders tagged with synth provenance.
pub fn download_bank(
    manager: &Arc<DeviceManager>,
    output: &SafeOutput,
    synth: &Arc<dyn Synth>,
    bank: BankNumber,
    options: &DownloadOptions,
) -> Result<Vec<PatchHolder>, DownloadError> {
    let method = determine_download_method(&**synth)
        .ok_or_else(|| DownloadError::NoDownloadMethod(synth.name()))?;

    let messages = match method {
        BankDownloadMethod::Streaming => {
            run_stream(manager, output, synth, bank, StreamType::BankDump, options)?
        }
        BankDownloadMethod::Handshakes => run_handshake(manager, output, synth, bank, options)?,
        BankDownloadMethod::Banks => run_bank_request(manager, output, synth, bank, options)?,
        BankDownloadMethod::ProgramBuffers => {
            run_program_dump_loop(manager, output, synth, bank, options)?
        }
        BankDownloadMethod::EditBuffers => {
            run_edit_buffer_loop(manager, output, synth, bank, options)?
        }
    };

    let patches = parser::assemble_patches(synth, &messages);
    options.report(1.0);
    Ok(tag_with_synth_source(synth, patches, Some(bank)))
}

/// Download several banks in sequence. With more than one bank, the result
/// is re-tagged with a shared bulk provenance so the whole pull shows up as
/// one import.
pub fn download_banks(
    manager: &Arc<DeviceManager>,
    output: &SafeOutput,
    synth: &Arc<dyn Synth>,
    banks: &[BankNumber],
    options: &DownloadOptions,
) -> Result<Vec<PatchHolder>, DownloadError> {
    let mut all = Vec::new();
    for (i, bank) in banks.iter().enumerate() {
        if options.abort.is_aborted() {
            return Err(DownloadError::Cancelled);
        }
        info!(
            synth = %synth.name(),
            bank = %synth::friendly_bank_name(&**synth, bank.index()),
            "importing bank"
        );
        let sub_options = DownloadOptions {
            progress: options.progress.as_ref().map(|progress| {
                let progress = Arc::clone(progress);
                let banks_total = banks.len() as f64;
                let offset = i as f64;
                Arc::new(move |fraction: f64| progress((offset + fraction) / banks_total))
                    as ProgressCallback
            }),
            ..options.clone()
        };
        all.extend(download_bank(manager, output, synth, *bank, &sub_options)?);
    }
    if banks.len() > 1 {
        let bulk_stamp = chrono::Utc::now();
        for holder in &mut all {
            let inner = holder.source().cloned();
            holder.set_source(SourceInfo::FromBulk {
                timestamp: Some(bulk_stamp),
                inner: inner.map(Box::new),
            });
        }
    }
    Ok(all)
}

/// Pull the current edit buffer only.
pub fn download_edit_buffer(
    manager: &Arc<DeviceManager>,
    output: &SafeOutput,
    synth: &Arc<dyn Synth>,
    options: &DownloadOptions,
) -> Result<Vec<PatchHolder>, DownloadError> {
    let capabilities = synth.capabilities();
    let messages = if capabilities.stream_load.is_some() {
        run_stream(
            manager,
            output,
            synth,
            BankNumber::new(0, 0),
            StreamType::EditBufferDump,
            options,
        )?
    } else if let Some(edit_buffer) = capabilities.edit_buffer.as_ref().map(Arc::clone) {
        let ctx = ProtocolContext::attach(manager.dispatcher(), options.abort.clone());
        ctx.send_block(output, &edit_buffer.request_edit_buffer());
        collect_edit_buffer(&ctx, output, &*edit_buffer, options)?
    } else {
        return Err(DownloadError::MissingCapability {
            synth: synth.name(),
            capability: "edit buffer",
        });
    };
    let patches = parser::assemble_patches(synth, &messages);
    Ok(tag_with_synth_source(synth, patches, None))
}

fn run_stream(
    manager: &Arc<DeviceManager>,
    output: &SafeOutput,
    synth: &Arc<dyn Synth>,
    bank: BankNumber,
    kind: StreamType,
    options: &DownloadOptions,
) -> Result<Vec<MidiMessage>, DownloadError> {
    let stream = synth
        .capabilities()
        .stream_load
        .as_ref()
        .map(Arc::clone)
        .ok_or(DownloadError::MissingCapability {
            synth: synth.name(),
            capability: "stream load",
        })?;

    let ctx = ProtocolContext::attach(manager.dispatcher(), options.abort.clone());
    let expected = stream.expected_stream_messages(kind);
    let bank_patch_count = bank.size().max(1) as usize;
    let mut element_index = match kind {
        StreamType::BankDump => bank.index(),
        StreamType::EditBufferDump => 0,
    };
    ctx.send_block(output, &stream.request_stream_element(element_index, kind));

    let mut collected: Vec<MidiMessage> = Vec::new();
    loop {
        if ctx.is_aborted() {
            return Err(DownloadError::Cancelled);
        }
        let Some(event) = ctx.next_message(options.message_timeout) else {
            return if ctx.is_aborted() {
                Err(DownloadError::Cancelled)
            } else {
                Err(DownloadError::Timeout { strategy: "stream" })
            };
        };
        if !stream.is_part_of_stream(&event.message, kind) {
            continue;
        }
        collected.push(event.message);
        match expected {
            Some(total) if total > 0 => options.report(collected.len() as f64 / total as f64),
            _ => options.report(collected.len() as f64 / bank_patch_count as f64),
        }
        if stream.is_stream_complete(&collected, kind) {
            return Ok(collected);
        }
        if stream.should_stream_advance(&collected, kind) {
            element_index += 1;
            ctx.send_block(output, &stream.request_stream_element(element_index, kind));
        }
    }
}

fn run_handshake(
    manager: &Arc<DeviceManager>,
    output: &SafeOutput,
    synth: &Arc<dyn Synth>,
    bank: BankNumber,
    options: &DownloadOptions,
) -> Result<Vec<MidiMessage>, DownloadError> {
    let handshake = synth
        .capabilities()
        .handshake
        .as_ref()
        .map(Arc::clone)
        .ok_or(DownloadError::MissingCapability {
            synth: synth.name(),
            capability: "handshake",
        })?;

    let ctx = ProtocolContext::attach(manager.dispatcher(), options.abort.clone());
    let mut state = handshake.create_state();
    ctx.send_block(output, &handshake.start_download(bank));

    let mut collected: Vec<MidiMessage> = Vec::new();
    loop {
        if ctx.is_aborted() {
            return Err(DownloadError::Cancelled);
        }
        let Some(event) = ctx.next_message(options.message_timeout) else {
            return if ctx.is_aborted() {
                Err(DownloadError::Cancelled)
            } else {
                Err(DownloadError::Timeout {
                    strategy: "handshake",
                })
            };
        };
        let step = state.next_message(&event.message);
        if step.accepted {
            collected.push(event.message);
        }
        if !step.reply.is_empty() {
            ctx.send_block(output, &step.reply);
        }
        options.report(state.progress());
        if state.is_finished() {
            return if state.was_successful() {
                Ok(collected)
            } else {
                Err(DownloadError::HandshakeFailed)
            };
        }
    }
}

fn run_bank_request(
    manager: &Arc<DeviceManager>,
    output: &SafeOutput,
    synth: &Arc<dyn Synth>,
    bank: BankNumber,
    options: &DownloadOptions,
) -> Result<Vec<MidiMessage>, DownloadError> {
    let bank_dump = synth
        .capabilities()
        .bank_dump
        .as_ref()
        .map(Arc::clone)
        .ok_or(DownloadError::MissingCapability {
            synth: synth.name(),
            capability: "bank dump",
        })?;

    let ctx = ProtocolContext::attach(manager.dispatcher(), options.abort.clone());
    let expected = bank.size().max(1) as usize;
    ctx.send_block(output, &bank_dump.request_bank_dump(bank));

    let mut collected: Vec<MidiMessage> = Vec::new();
    loop {
        if ctx.is_aborted() {
            return Err(DownloadError::Cancelled);
        }
        let Some(event) = ctx.next_message(options.message_timeout) else {
            return if ctx.is_aborted() {
                Err(DownloadError::Cancelled)
            } else {
                Err(DownloadError::Timeout {
                    strategy: "bank request",
                })
            };
        };
        if !bank_dump.is_bank_dump_part(&event.message) {
            continue;
        }
        collected.push(event.message);
        options.report(collected.len() as f64 / expected as f64);
        if bank_dump.is_bank_dump_finished(&collected) {
            return Ok(collected);
        }
    }
}

fn run_program_dump_loop(
    manager: &Arc<DeviceManager>,
    output: &SafeOutput,
    synth: &Arc<dyn Synth>,
    bank: BankNumber,
    options: &DownloadOptions,
) -> Result<Vec<MidiMessage>, DownloadError> {
    let program_dump = synth
        .capabilities()
        .program_dump
        .as_ref()
        .map(Arc::clone)
        .ok_or(DownloadError::MissingCapability {
            synth: synth.name(),
            capability: "program dump",
        })?;

    let ctx = ProtocolContext::attach(manager.dispatcher(), options.abort.clone());
    let start = synth::bank_start_index(&**synth, bank.index()).unwrap_or(0);
    let count = bank.size();
    let mut collected: Vec<MidiMessage> = Vec::new();

    for i in 0..count {
        if ctx.is_aborted() {
            return Err(DownloadError::Cancelled);
        }
        ctx.send_block(output, &program_dump.request_program(start + i));

        let mut current: Vec<MidiMessage> = Vec::new();
        loop {
            let Some(event) = ctx.next_message(options.message_timeout) else {
                return if ctx.is_aborted() {
                    Err(DownloadError::Cancelled)
                } else {
                    Err(DownloadError::Timeout {
                        strategy: "program dump",
                    })
                };
            };
            let step = program_dump.is_part_of_program_dump(&event.message);
            if !step.accepted {
                continue;
            }
            current.push(event.message);
            if !step.reply.is_empty() {
                ctx.send_block(output, &step.reply);
            }
            if program_dump.is_single_program_dump(&current) {
                collected.append(&mut current);
                break;
            }
        }
        options.report((i + 1) as f64 / count as f64);
    }
    Ok(collected)
}

fn run_edit_buffer_loop(
    manager: &Arc<DeviceManager>,
    output: &SafeOutput,
    synth: &Arc<dyn Synth>,
    bank: BankNumber,
    options: &DownloadOptions,
) -> Result<Vec<MidiMessage>, DownloadError> {
    let edit_buffer = synth
        .capabilities()
        .edit_buffer
        .as_ref()
        .map(Arc::clone)
        .ok_or(DownloadError::MissingCapability {
            synth: synth.name(),
            capability: "edit buffer",
        })?;
    let channel = options
        .channel
        .ok_or_else(|| DownloadError::MissingChannel(synth.name()))?;

    let ctx = ProtocolContext::attach(manager.dispatcher(), options.abort.clone());
    let start = synth::bank_start_index(&**synth, bank.index()).unwrap_or(0);
    let count = bank.size();
    let mut collected: Vec<MidiMessage> = Vec::new();

    for i in 0..count {
        if ctx.is_aborted() {
            return Err(DownloadError::Cancelled);
        }
        // Move the synth to the program, then ask for its edit buffer.
        ctx.send(
            output,
            &MidiMessage::program_change(channel.to_zero_based(), ((start + i) & 0x7f) as u8),
        );
        ctx.send_block(output, &edit_buffer.request_edit_buffer());
        collected.extend(collect_edit_buffer(&ctx, output, &*edit_buffer, options)?);
        options.report((i + 1) as f64 / count as f64);
    }
    Ok(collected)
}

fn collect_edit_buffer(
    ctx: &ProtocolContext,
    output: &SafeOutput,
    edit_buffer: &dyn crate::synth::EditBufferCapability,
    options: &DownloadOptions,
) -> Result<Vec<MidiMessage>, DownloadError> {
    let mut current: Vec<MidiMessage> = Vec::new();
    loop {
        let Some(event) = ctx.next_message(options.message_timeout) else {
            return if ctx.is_aborted() {
                Err(DownloadError::Cancelled)
            } else {
                Err(DownloadError::Timeout {
                    strategy: "edit buffer",
                })
            };
        };
        let step = edit_buffer.is_part_of_edit_buffer(&event.message);
        if !step.accepted {
            continue;
        }
        current.push(event.message);
        if !step.reply.is_empty() {
            ctx.send_block(output, &step.reply);
        }
        if edit_buffer.is_edit_buffer_dump(&current) {
            return Ok(current);
        }
    }
}

/// Wrap parsed patches into holders with synth-import provenance, program
/// numbering and a fallback name.
pub fn tag_with_synth_source(
    synth: &Arc<dyn Synth>,
    patches: Vec<crate::model::Patch>,
    bank: Option<BankNumber>,
) -> Vec<PatchHolder> {
    let now = chrono::Utc::now();
    let program_dump = synth.capabilities().program_dump.as_ref().map(Arc::clone);
    patches
        .into_iter()
        .enumerate()
        .map(|(i, patch)| {
            let source = SourceInfo::FromSynth {
                timestamp: Some(now),
                bank,
            };
            let running_number = match bank {
                Some(bank) => ProgramNumber::with_bank(bank, i as u32),
                None => ProgramNumber::from_zero_based(i as u32),
            };
            // Prefer the program place stored in the dump itself when the
            // format carries one.
            let stored_number = program_dump.as_ref().and_then(|pd| {
                let messages = pd.program_dump_for_patch(&patch, running_number);
                pd.program_number_of(&messages)
            });
            let program = stored_number.unwrap_or(running_number);
            let mut holder = PatchHolder::new(synth, Some(source), Some(patch));
            holder.bank = bank;
            holder.program = Some(program);
            if holder.name().is_empty() {
                let name = match bank {
                    Some(bank) => synth.friendly_program_and_bank_name(bank, program),
                    None => synth.friendly_program_name(program),
                };
                holder.set_name(&name);
            }
            holder
        })
        .collect()
}
