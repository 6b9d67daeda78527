//! Writing patches out as files.
//!
//! Four shapes: a directory of one `.syx` per patch, the same packed into a
//! zip archive, one concatenated `.syx`, or a Standard MIDI File carrying
//! every dump as sysex events on a single track.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use midly::{Format, Header, Smf, Timing, TrackEvent, TrackEventKind};
use thiserror::Error;
use tracing::debug;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use switchboard::{AbortFlag, MidiMessage};

use crate::model::{PatchHolder, ProgramNumber};
use crate::sysex::{messages_to_bytes, sanitize_file_name};
use crate::synth::Synth;

/// What byte form each patch takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// Program dumps aimed at the patch's stored place.
    ProgramDumps,
    /// Edit buffer dumps.
    EditBufferDumps,
    /// One adapter-framed bank dump of all patches together.
    BankDump,
}

/// How the bytes land on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    /// One `.syx` per patch into the target directory.
    ManyFiles,
    /// The same files inside one zip archive.
    ZipArchive,
    /// One concatenated `.syx`.
    OneSyx,
    /// A format-1 SMF, 96 ppqn, every message at tick 0.
    StandardMidiFile,
}

#[derive(Debug, Clone, Copy)]
pub struct ExportParameters {
    pub format: ExportFormat,
    pub file_mode: FileMode,
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("I/O error during export: {0}")]
    Io(#[from] std::io::Error),

    #[error("zip error during export: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("synth {synth} cannot produce {format:?} exports")]
    NoCapability {
        synth: String,
        format: ExportFormat,
    },

    #[error("export cancelled")]
    Cancelled,

    #[error("nothing to export")]
    Empty,
}

/// The messages representing one patch under the chosen format. Also used
/// by the interchange format to produce the transport form of a patch.
pub(crate) fn messages_for_export(
    synth: &Arc<dyn Synth>,
    holder: &PatchHolder,
    index: usize,
    format: ExportFormat,
) -> Result<Vec<MidiMessage>, ExportError> {
    let Some(patch) = holder.patch() else {
        return Ok(Vec::new());
    };
    let capabilities = synth.capabilities();
    match format {
        ExportFormat::ProgramDumps => {
            if let Some(program_dump) = capabilities.program_dump.as_ref() {
                let place = holder
                    .program
                    .unwrap_or_else(|| ProgramNumber::from_zero_based(index as u32));
                return Ok(program_dump.program_dump_for_patch(patch, place));
            }
            // Fall through to the edit buffer form, as the program dump
            // option is best-effort.
            messages_for_export(synth, holder, index, ExportFormat::EditBufferDumps)
        }
        ExportFormat::EditBufferDumps => {
            if let Some(edit_buffer) = capabilities.edit_buffer.as_ref() {
                Ok(edit_buffer.edit_buffer_for_patch(patch))
            } else if let Some(program_dump) = capabilities.program_dump.as_ref() {
                let place = holder
                    .program
                    .unwrap_or_else(|| ProgramNumber::from_zero_based(index as u32));
                Ok(program_dump.program_dump_for_patch(patch, place))
            } else {
                Err(ExportError::NoCapability {
                    synth: synth.name(),
                    format,
                })
            }
        }
        // Bank dumps are built over all patches at once in `all_messages`;
        // a single patch has no bank-dump form.
        ExportFormat::BankDump => Err(ExportError::NoCapability {
            synth: synth.name(),
            format,
        }),
    }
}

/// Collect the complete message list of an export.
fn all_messages(
    patches: &[(Arc<dyn Synth>, PatchHolder)],
    params: ExportParameters,
    abort: &AbortFlag,
) -> Result<Vec<MidiMessage>, ExportError> {
    if params.format == ExportFormat::BankDump {
        let Some((synth, _)) = patches.first() else {
            return Err(ExportError::Empty);
        };
        let Some(bank_send) = synth.capabilities().bank_send.as_ref() else {
            return Err(ExportError::NoCapability {
                synth: synth.name(),
                format: params.format,
            });
        };
        let mut per_patch = Vec::new();
        for (i, (synth, holder)) in patches.iter().enumerate() {
            if abort.is_aborted() {
                return Err(ExportError::Cancelled);
            }
            let messages = messages_for_export(synth, holder, i, ExportFormat::ProgramDumps)?;
            if !messages.is_empty() {
                per_patch.push(messages);
            }
        }
        return Ok(bank_send.bank_messages(&per_patch));
    }

    let mut all = Vec::new();
    for (i, (synth, holder)) in patches.iter().enumerate() {
        if abort.is_aborted() {
            return Err(ExportError::Cancelled);
        }
        all.extend(messages_for_export(synth, holder, i, params.format)?);
    }
    Ok(all)
}

/// Export patches to `destination` (a directory for [`FileMode::ManyFiles`],
/// a file path otherwise). Returns the number of files written.
pub fn export_patches(
    destination: &Path,
    patches: &[(Arc<dyn Synth>, PatchHolder)],
    params: ExportParameters,
    abort: &AbortFlag,
) -> Result<usize, ExportError> {
    match params.file_mode {
        FileMode::ManyFiles => {
            fs::create_dir_all(destination)?;
            let mut written = 0usize;
            for (i, (synth, holder)) in patches.iter().enumerate() {
                if abort.is_aborted() {
                    return Err(ExportError::Cancelled);
                }
                let messages = messages_for_export(synth, holder, i, params.format)?;
                if messages.is_empty() {
                    continue;
                }
                let file_name = format!("{}.syx", sanitize_file_name(holder.name()));
                let path = destination.join(file_name);
                debug!(path = %path.display(), "writing patch file");
                fs::write(path, messages_to_bytes(&messages))?;
                written += 1;
            }
            Ok(written)
        }
        FileMode::ZipArchive => {
            let file = File::create(destination)?;
            let mut archive = ZipWriter::new(file);
            let options: FileOptions =
                FileOptions::default().compression_method(CompressionMethod::Deflated);
            let mut written = 0usize;
            for (i, (synth, holder)) in patches.iter().enumerate() {
                if abort.is_aborted() {
                    return Err(ExportError::Cancelled);
                }
                let messages = messages_for_export(synth, holder, i, params.format)?;
                if messages.is_empty() {
                    continue;
                }
                let file_name = format!("{}.syx", sanitize_file_name(holder.name()));
                archive.start_file(file_name, options)?;
                archive.write_all(&messages_to_bytes(&messages))?;
                written += 1;
            }
            archive.finish()?;
            Ok(written)
        }
        FileMode::OneSyx => {
            let messages = all_messages(patches, params, abort)?;
            fs::write(destination, messages_to_bytes(&messages))?;
            Ok(1)
        }
        FileMode::StandardMidiFile => {
            let messages = all_messages(patches, params, abort)?;
            write_smf(destination, &messages)?;
            Ok(1)
        }
    }
}

/// One track, 96 ppqn, every sysex event at tick 0. SMF sysex events carry
/// the message without its leading F0, the writer re-adds it.
fn write_smf(destination: &Path, messages: &[MidiMessage]) -> Result<(), ExportError> {
    let stripped: Vec<Vec<u8>> = messages
        .iter()
        .map(|m| {
            let bytes = m.bytes();
            if bytes.first() == Some(&0xf0) {
                bytes[1..].to_vec()
            } else {
                bytes.to_vec()
            }
        })
        .collect();

    let mut track: Vec<TrackEvent> = stripped
        .iter()
        .map(|bytes| TrackEvent {
            delta: 0.into(),
            kind: TrackEventKind::SysEx(bytes),
        })
        .collect();
    track.push(TrackEvent {
        delta: 1.into(),
        kind: TrackEventKind::Meta(midly::MetaMessage::EndOfTrack),
    });

    let smf = Smf {
        header: Header::new(Format::Parallel, Timing::Metrical(96.into())),
        tracks: vec![track],
    };
    smf.save(destination)
        .map_err(|e| ExportError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BankNumber;
    use crate::sysex::messages_from_bytes;
    use crate::testsynth::{make_holder, TestSynth};
    use anyhow::Result;
    use tempfile::TempDir;

    fn patch_set(count: u32) -> Vec<(Arc<dyn Synth>, PatchHolder)> {
        let synth = TestSynth::builder("ExportSynth").single_bank(8).build();
        let bank = BankNumber::new(0, 8);
        (0..count)
            .map(|i| {
                (
                    Arc::clone(&synth),
                    make_holder(&synth, &format!("Patch {i}"), bank, i, None),
                )
            })
            .collect()
    }

    #[test]
    fn test_many_files_export() -> Result<()> {
        let dir = TempDir::new()?;
        let destination = dir.path().join("export");
        let patches = patch_set(3);
        let written = export_patches(
            &destination,
            &patches,
            ExportParameters {
                format: ExportFormat::ProgramDumps,
                file_mode: FileMode::ManyFiles,
            },
            &AbortFlag::new(),
        )?;
        assert_eq!(written, 3);
        assert!(destination.join("Patch 0.syx").exists());
        assert!(destination.join("Patch 2.syx").exists());
        Ok(())
    }

    #[test]
    fn test_one_syx_concatenates_all() -> Result<()> {
        let dir = TempDir::new()?;
        let destination = dir.path().join("all.syx");
        let patches = patch_set(3);
        export_patches(
            &destination,
            &patches,
            ExportParameters {
                format: ExportFormat::ProgramDumps,
                file_mode: FileMode::OneSyx,
            },
            &AbortFlag::new(),
        )?;
        let bytes = fs::read(&destination)?;
        assert_eq!(messages_from_bytes(&bytes).len(), 3);
        Ok(())
    }

    #[test]
    fn test_zip_export() -> Result<()> {
        let dir = TempDir::new()?;
        let destination = dir.path().join("patches.zip");
        let patches = patch_set(2);
        let written = export_patches(
            &destination,
            &patches,
            ExportParameters {
                format: ExportFormat::EditBufferDumps,
                file_mode: FileMode::ZipArchive,
            },
            &AbortFlag::new(),
        )?;
        assert_eq!(written, 2);

        let file = File::open(&destination)?;
        let mut archive = zip::ZipArchive::new(file)?;
        assert_eq!(archive.len(), 2);
        assert!(archive.by_name("Patch 0.syx").is_ok());
        Ok(())
    }

    #[test]
    fn test_smf_export_roundtrips_through_midly() -> Result<()> {
        let dir = TempDir::new()?;
        let destination = dir.path().join("patches.mid");
        let patches = patch_set(2);
        export_patches(
            &destination,
            &patches,
            ExportParameters {
                format: ExportFormat::ProgramDumps,
                file_mode: FileMode::StandardMidiFile,
            },
            &AbortFlag::new(),
        )?;

        let bytes = fs::read(&destination)?;
        let smf = Smf::parse(&bytes)?;
        assert_eq!(smf.header.timing, Timing::Metrical(96.into()));
        assert_eq!(smf.tracks.len(), 1);
        let sysex_events = smf.tracks[0]
            .iter()
            .filter(|e| matches!(e.kind, TrackEventKind::SysEx(_)))
            .count();
        assert_eq!(sysex_events, 2);
        Ok(())
    }

    #[test]
    fn test_empty_slots_are_skipped() -> Result<()> {
        let dir = TempDir::new()?;
        let destination = dir.path().join("export");
        let synth = TestSynth::builder("E").single_bank(4).build();
        let empty = PatchHolder::empty_slot(&synth);
        let patches = vec![(Arc::clone(&synth), empty)];
        let written = export_patches(
            &destination,
            &patches,
            ExportParameters {
                format: ExportFormat::ProgramDumps,
                file_mode: FileMode::ManyFiles,
            },
            &AbortFlag::new(),
        )?;
        assert_eq!(written, 0);
        Ok(())
    }

    #[test]
    fn test_cancel_aborts_export() {
        let dir = TempDir::new().unwrap();
        let destination = dir.path().join("export");
        let patches = patch_set(2);
        let abort = AbortFlag::new();
        abort.abort();
        let result = export_patches(
            &destination,
            &patches,
            ExportParameters {
                format: ExportFormat::ProgramDumps,
                file_mode: FileMode::ManyFiles,
            },
            &abort,
        );
        assert!(matches!(result, Err(ExportError::Cancelled)));
    }
}
