//! PatchInterchangeFormat: a human-readable JSON envelope that carries
//! patches and their metadata between catalogs.
//!
//! Version history:
//! - 0: no header, the whole file is an array of patches (Rev2SequencerTool
//!   exports).
//! - 1: header `{"FileFormat": "PatchInterchangeFormat", "Version": 1}`,
//!   patches in the `Library` array.
//!
//! Loading is deliberately permissive: entries for unknown synths, unknown
//! categories or with broken base64 are skipped with a warning, numbers are
//! accepted as strings, and a version-0 root array still loads.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{error, warn};

use crate::category::CategoryBitfield;
use crate::export;
use crate::model::{BankNumber, Favorite, PatchHolder, ProgramNumber};
use crate::parser;
use crate::source::SourceInfo;
use crate::synth::{self, Synth};
use crate::sysex::{messages_from_bytes, messages_to_bytes};

const K_HEADER: &str = "Header";
const K_FILE_FORMAT: &str = "FileFormat";
const K_VERSION: &str = "Version";
const K_LIBRARY: &str = "Library";
const K_SYNTH: &str = "Synth";
const K_NAME: &str = "Name";
const K_SYSEX: &str = "Sysex";
const K_FAVORITE: &str = "Favorite";
const K_BANK: &str = "Bank";
const K_PLACE: &str = "Place";
const K_CATEGORIES: &str = "Categories";
const K_NON_CATEGORIES: &str = "NonCategories";
const K_SOURCE_INFO: &str = "SourceInfo";
const K_COMMENT: &str = "Comment";
const K_AUTHOR: &str = "Author";
const K_INFO: &str = "Info";
const PIF: &str = "PatchInterchangeFormat";

#[derive(Debug, Error)]
pub enum InterchangeError {
    #[error("I/O error on interchange file: {0}")]
    Io(#[from] std::io::Error),

    #[error("interchange file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Map historical category names onto today's catalog names.
fn canonical_category_name(name: &str) -> &str {
    match name {
        "Bells" => "Bell",
        "FX" => "SFX",
        other => other,
    }
}

fn integer_field(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// Load a PatchInterchangeFormat file. Unknown synths or categories and
/// malformed entries are skipped with warnings.
pub fn load_interchange(
    synths: &HashMap<String, Arc<dyn Synth>>,
    path: &Path,
    categories: &CategoryBitfield,
) -> Result<Vec<PatchHolder>, InterchangeError> {
    let text = fs::read_to_string(path)?;
    let doc: Value = serde_json::from_str(&text)?;

    let mut version = 0i64;
    if let Value::Object(root) = &doc {
        let Some(header) = root.get(K_HEADER) else {
            error!("not a PatchInterchangeFormat file, no header defined, aborting");
            return Ok(Vec::new());
        };
        let header = header.as_object().cloned().unwrap_or_default();
        match header.get(K_FILE_FORMAT).and_then(Value::as_str) {
            Some(PIF) => {}
            Some(_) => {
                error!("file header defines a different FileFormat than PatchInterchangeFormat, aborting");
                return Ok(Vec::new());
            }
            None => {
                error!("file header has no string FileFormat member, aborting");
                return Ok(Vec::new());
            }
        }
        match header.get(K_VERSION).and_then(Value::as_i64) {
            Some(v) => version = v,
            None => {
                error!("file header has no integer Version member, aborting");
                return Ok(Vec::new());
            }
        }
    }

    let patch_array: &Vec<Value> = if version == 0 {
        match doc.as_array() {
            Some(array) => array,
            None => {
                warn!("no patches defined in PatchInterchangeFormat, nothing loaded");
                return Ok(Vec::new());
            }
        }
    } else {
        match doc.get(K_LIBRARY).and_then(Value::as_array) {
            Some(array) => array,
            None => {
                warn!("no Library defined in PatchInterchangeFormat, nothing loaded");
                return Ok(Vec::new());
            }
        }
    };

    let file_source = SourceInfo::FromFile {
        filename: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        fullpath: path.to_string_lossy().into_owned(),
        program: None,
    };

    let mut result = Vec::new();
    for item in patch_array {
        if let Some(holder) = load_entry(item, synths, categories, &file_source) {
            result.push(holder);
        }
    }
    Ok(result)
}

fn load_entry(
    item: &Value,
    synths: &HashMap<String, Arc<dyn Synth>>,
    categories: &CategoryBitfield,
    file_source: &SourceInfo,
) -> Option<PatchHolder> {
    let Some(synth_name) = item.get(K_SYNTH).and_then(Value::as_str) else {
        warn!("skipping patch which has no 'Synth' field");
        return None;
    };
    let Some(synth) = synths.get(synth_name) else {
        warn!(synth = synth_name, "skipping patch for synth not present in the given list");
        return None;
    };
    let Some(patch_name) = item.get(K_NAME).and_then(Value::as_str) else {
        warn!("skipping patch which has no 'Name' field");
        return None;
    };
    let Some(sysex_text) = item.get(K_SYSEX).and_then(Value::as_str) else {
        warn!(patch = patch_name, "skipping patch which has no 'Sysex' field");
        return None;
    };

    let favorite = match item.get(K_FAVORITE) {
        None | Some(Value::Null) => Favorite::Unknown,
        Some(value) => match integer_field(value) {
            Some(0) => Favorite::No,
            Some(-1) => Favorite::Unknown,
            Some(_) => Favorite::Yes,
            None => {
                warn!(
                    patch = patch_name,
                    "ignoring favorite information that does not convert to an integer"
                );
                Favorite::Unknown
            }
        },
    };

    let bank = item.get(K_BANK).and_then(|value| match integer_field(value) {
        Some(index) if index >= 0 => {
            let size = synth::bank_size(&**synth, index as u32).unwrap_or(0);
            Some(BankNumber::new(index as u32, size))
        }
        _ => {
            warn!(patch = patch_name, "ignoring MIDI bank information that does not convert");
            None
        }
    });

    let program = item.get(K_PLACE).and_then(|value| match integer_field(value) {
        Some(place) if place >= 0 => Some(match bank {
            Some(bank) => ProgramNumber::with_bank(bank, place as u32),
            None => ProgramNumber::from_zero_based(place as u32),
        }),
        _ => {
            warn!(patch = patch_name, "ignoring MIDI place information that does not convert");
            None
        }
    });

    let mut category_bits = Vec::new();
    if let Some(list) = item.get(K_CATEGORIES).and_then(Value::as_array) {
        for value in list {
            let Some(name) = value.as_str() else { continue };
            match categories.category_by_name(canonical_category_name(name)) {
                Some(category) => category_bits.push(category.bit_index),
                None => warn!(
                    category = name,
                    patch = patch_name,
                    "ignoring category that is not part of the catalog"
                ),
            }
        }
    }
    let mut non_category_bits = Vec::new();
    if let Some(list) = item.get(K_NON_CATEGORIES).and_then(Value::as_array) {
        for value in list {
            let Some(name) = value.as_str() else { continue };
            match categories.category_by_name(canonical_category_name(name)) {
                Some(category) => non_category_bits.push(category.bit_index),
                None => warn!(
                    category = name,
                    patch = patch_name,
                    "ignoring non-category that is not part of the catalog"
                ),
            }
        }
    }

    let source = item.get(K_SOURCE_INFO).and_then(|value| match value {
        Value::String(text) => SourceInfo::from_string_rep(text),
        other => SourceInfo::from_json(other),
    });

    let Ok(sysex_bytes) = BASE64.decode(sysex_text) else {
        warn!(patch = patch_name, "skipping patch with invalid base64 encoded data");
        return None;
    };
    let messages = messages_from_bytes(&sysex_bytes);
    let patches = parser::assemble_patches(synth, &messages);
    if patches.len() != 1 {
        warn!(
            patch = patch_name,
            decoded = patches.len(),
            "skipping entry that does not decode to exactly one patch"
        );
        return None;
    }
    let patch = patches.into_iter().next()?;

    let mut holder = PatchHolder::new(synth, Some(file_source.clone()), Some(patch));
    holder.favorite = favorite;
    holder.bank = bank;
    holder.program = program;
    holder.set_name(patch_name);
    for bit in category_bits {
        holder.set_category(bit, true);
        // Everything listed in a PIF file counts as a user decision.
        holder.set_user_decision(bit);
    }
    for bit in non_category_bits {
        // Mentioned as explicitly absent, which is a user decision too.
        holder.set_user_decision(bit);
    }
    if let Some(source) = source {
        holder.set_source(source);
    }
    if let Some(comment) = item.get(K_COMMENT).and_then(Value::as_str) {
        holder.comment = comment.to_string();
    }
    if let Some(author) = item.get(K_AUTHOR).and_then(Value::as_str) {
        holder.author = author.to_string();
    }
    if let Some(info) = item.get(K_INFO).and_then(Value::as_str) {
        holder.info = info.to_string();
    }
    Some(holder)
}

/// Save patches as a version-1 PatchInterchangeFormat file. Only categories
/// the user has ruled on are written, auto-tags are re-derivable.
pub fn save_interchange(
    patches: &[(Arc<dyn Synth>, PatchHolder)],
    categories: &CategoryBitfield,
    path: &Path,
) -> Result<(), InterchangeError> {
    let mut library = Vec::new();
    for (i, (synth, holder)) in patches.iter().enumerate() {
        let mut entry = Map::new();
        entry.insert(K_SYNTH.to_string(), json!(synth.name()));
        entry.insert(K_NAME.to_string(), json!(holder.name()));
        entry.insert(
            K_FAVORITE.to_string(),
            match holder.favorite {
                Favorite::Unknown => Value::Null,
                Favorite::No => json!(0),
                Favorite::Yes => json!(1),
            },
        );
        if let Some(bank) = holder.bank {
            entry.insert(K_BANK.to_string(), json!(bank.index()));
        }
        entry.insert(
            K_PLACE.to_string(),
            json!(holder
                .program
                .map(|p| p.to_zero_based_discarding_bank())
                .unwrap_or(0)),
        );

        let user_decided: Vec<String> = holder
            .categories()
            .intersection(holder.user_decisions())
            .filter_map(|bit| categories.category_by_bit(*bit).map(|c| c.name.clone()))
            .collect();
        if !user_decided.is_empty() {
            entry.insert(K_CATEGORIES.to_string(), json!(user_decided));
        }
        let user_denied: Vec<String> = holder
            .user_decisions()
            .difference(holder.categories())
            .filter_map(|bit| categories.category_by_bit(*bit).map(|c| c.name.clone()))
            .collect();
        if !user_denied.is_empty() {
            entry.insert(K_NON_CATEGORIES.to_string(), json!(user_denied));
        }

        if let Some(source) = holder.source() {
            entry.insert(K_SOURCE_INFO.to_string(), source.to_json());
        }
        if !holder.comment.is_empty() {
            entry.insert(K_COMMENT.to_string(), json!(holder.comment));
        }
        if !holder.author.is_empty() {
            entry.insert(K_AUTHOR.to_string(), json!(holder.author));
        }
        if !holder.info.is_empty() {
            entry.insert(K_INFO.to_string(), json!(holder.info));
        }

        let messages =
            export::messages_for_export(synth, holder, i, export::ExportFormat::EditBufferDumps)
                .unwrap_or_default();
        entry.insert(
            K_SYSEX.to_string(),
            json!(BASE64.encode(messages_to_bytes(&messages))),
        );

        library.push(Value::Object(entry));
    }

    let doc = json!({
        K_HEADER: {
            K_FILE_FORMAT: PIF,
            K_VERSION: 1,
        },
        K_LIBRARY: library,
    });
    fs::write(path, serde_json::to_string_pretty(&doc)?)?;
    Ok(())
}
