//! Provenance of a patch: where it came from and when.
//!
//! The JSON representation keeps the legacy field names (`synthsource`,
//! `filesource`, `bulksource`, …) so existing catalogs and interchange files
//! keep round-tripping. The import id is the MD5 of the stored representation, with
//! edit-buffer imports collapsing onto one stable id so repeated edit-buffer
//! pulls land in the same import list.

use chrono::{DateTime, SecondsFormat, Utc};
use md5::{Digest, Md5};
use serde_json::{json, Value};
use tracing::warn;

use crate::model::{BankNumber, ProgramNumber};

const K_SYNTH_SOURCE: &str = "synthsource";
const K_FILE_SOURCE: &str = "filesource";
const K_BULK_SOURCE: &str = "bulksource";
const K_TIMESTAMP: &str = "timestamp";
const K_BANK_NUMBER: &str = "banknumber";
const K_FILE_NAME: &str = "filename";
const K_FULL_PATH: &str = "fullpath";
const K_PROGRAM: &str = "program";
const K_FILE_IN_BULK: &str = "fileInBulk";

/// Import id shared by every edit-buffer pull of a synth.
pub const EDIT_BUFFER_IMPORT_ID: &str = "EditBufferImport";

/// Where a patch came from.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceInfo {
    /// Pulled from the instrument. Without a bank it was an edit-buffer
    /// import.
    FromSynth {
        timestamp: Option<DateTime<Utc>>,
        bank: Option<BankNumber>,
    },
    /// Loaded from a file on disk.
    FromFile {
        filename: String,
        fullpath: String,
        program: Option<ProgramNumber>,
    },
    /// Part of a multi-source bulk import, wrapping the individual origin.
    FromBulk {
        timestamp: Option<DateTime<Utc>>,
        inner: Option<Box<SourceInfo>>,
    },
}

impl SourceInfo {
    pub fn from_synth_now(bank: Option<BankNumber>) -> Self {
        SourceInfo::FromSynth {
            timestamp: Some(Utc::now()),
            bank,
        }
    }

    pub fn edit_buffer_now() -> Self {
        Self::from_synth_now(None)
    }

    pub fn bulk_now(inner: SourceInfo) -> Self {
        SourceInfo::FromBulk {
            timestamp: Some(Utc::now()),
            inner: Some(Box::new(inner)),
        }
    }

    /// An edit-buffer import is a synth import with no bank recorded.
    pub fn is_edit_buffer_import(&self) -> bool {
        matches!(
            self,
            SourceInfo::FromSynth { bank: None, .. }
        )
    }

    /// The legacy JSON representation.
    pub fn to_json(&self) -> Value {
        match self {
            SourceInfo::FromSynth { timestamp, bank } => {
                let mut doc = json!({ K_SYNTH_SOURCE: true });
                if let Some(ts) = timestamp {
                    doc[K_TIMESTAMP] = json!(ts.to_rfc3339_opts(SecondsFormat::Millis, true));
                }
                if let Some(bank) = bank {
                    doc[K_BANK_NUMBER] = json!(bank.index());
                }
                doc
            }
            SourceInfo::FromFile {
                filename,
                fullpath,
                program,
            } => {
                let mut doc = json!({
                    K_FILE_SOURCE: true,
                    K_FILE_NAME: filename,
                    K_FULL_PATH: fullpath,
                });
                match program {
                    Some(program) => match program.bank() {
                        Some(bank) => {
                            doc[K_BANK_NUMBER] = json!(bank.index());
                            doc[K_PROGRAM] = json!(program.to_zero_based_with_bank());
                        }
                        None => {
                            doc[K_PROGRAM] = json!(program.to_zero_based_discarding_bank());
                        }
                    },
                    None => {
                        doc[K_PROGRAM] = json!(0);
                    }
                }
                doc
            }
            SourceInfo::FromBulk { timestamp, inner } => {
                let mut doc = json!({ K_BULK_SOURCE: true });
                if let Some(ts) = timestamp {
                    doc[K_TIMESTAMP] = json!(ts.to_rfc3339_opts(SecondsFormat::Millis, true));
                }
                if let Some(inner) = inner {
                    doc[K_FILE_IN_BULK] = inner.to_json();
                }
                doc
            }
        }
    }

    pub fn to_string_rep(&self) -> String {
        self.to_json().to_string()
    }

    /// Parse the legacy representation; `None` with a warning on anything
    /// unrecognizable (old catalogs carry surprises).
    pub fn from_json(doc: &Value) -> Option<Self> {
        let obj = doc.as_object()?;
        if obj.contains_key(K_FILE_SOURCE) {
            let filename = obj.get(K_FILE_NAME)?.as_str()?.to_string();
            let fullpath = obj
                .get(K_FULL_PATH)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let program = obj
                .get(K_PROGRAM)
                .and_then(Value::as_i64)
                .map(|p| ProgramNumber::from_zero_based(p.max(0) as u32));
            Some(SourceInfo::FromFile {
                filename,
                fullpath,
                program,
            })
        } else if obj.contains_key(K_SYNTH_SOURCE) {
            let timestamp = obj
                .get(K_TIMESTAMP)
                .and_then(Value::as_str)
                .and_then(parse_timestamp);
            // Bank size is not stored in the legacy representation; it is
            // reconstructed from the synth's descriptors when needed.
            let bank = obj
                .get(K_BANK_NUMBER)
                .and_then(Value::as_i64)
                .map(|b| BankNumber::new(b.max(0) as u32, 0));
            Some(SourceInfo::FromSynth { timestamp, bank })
        } else if obj.contains_key(K_BULK_SOURCE) {
            let timestamp = obj
                .get(K_TIMESTAMP)
                .and_then(Value::as_str)
                .and_then(parse_timestamp);
            let inner = match obj.get(K_FILE_IN_BULK) {
                Some(Value::String(text)) => Self::from_string_rep(text).map(Box::new),
                Some(value) => Self::from_json(value).map(Box::new),
                None => None,
            };
            Some(SourceInfo::FromBulk { timestamp, inner })
        } else {
            warn!("source info JSON has no recognized type marker");
            None
        }
    }

    pub fn from_string_rep(text: &str) -> Option<Self> {
        match serde_json::from_str::<Value>(text) {
            Ok(doc) => Self::from_json(&doc),
            Err(e) => {
                warn!("failed to parse source info of patch: {e}");
                None
            }
        }
    }

    /// Human description used as import list name.
    pub fn display_string(&self, bank_name: Option<&str>) -> String {
        match self {
            SourceInfo::FromSynth { timestamp, bank } => {
                let place = match bank {
                    Some(bank) => match bank_name {
                        Some(name) => format!(" {name}"),
                        None => format!(" bank {}", bank.index() + 1),
                    },
                    None => " edit buffer".to_string(),
                };
                match timestamp {
                    Some(ts) => format!(
                        "Imported from synth{} on {}",
                        place,
                        ts.format("%Y-%m-%d at %H:%M:%S")
                    ),
                    None => format!("Imported from synth{place}"),
                }
            }
            SourceInfo::FromFile { filename, .. } => {
                format!("Imported from file {filename}")
            }
            SourceInfo::FromBulk { timestamp, inner } => match timestamp {
                Some(ts) => match inner {
                    Some(inner) => format!(
                        "Bulk import {} ({})",
                        ts.format("%Y-%m-%d at %H:%M:%S"),
                        inner.display_string(bank_name)
                    ),
                    None => format!("Bulk import ({})", ts.format("%Y-%m-%d at %H:%M:%S")),
                },
                None => "Bulk file import".to_string(),
            },
        }
    }

    /// Stable import id: the MD5 of the source-info representation, so one
    /// download/file equals one import list. Edit-buffer imports share
    /// [`EDIT_BUFFER_IMPORT_ID`]; bulk imports identify by their timestamp
    /// alone so every bank of one bulk operation lands in the same import.
    pub fn import_id(&self) -> String {
        if self.is_edit_buffer_import() {
            return EDIT_BUFFER_IMPORT_ID.to_string();
        }
        let identity = match self {
            SourceInfo::FromBulk { timestamp, .. } => match timestamp {
                Some(ts) => format!("Bulk import {}", ts.format("%Y-%m-%d at %H:%M:%S")),
                None => "Bulk file import".to_string(),
            },
            _ => self.to_string_rep(),
        };
        hex::encode(Md5::digest(identity.as_bytes()))
    }
}

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synth_source_json_roundtrip() {
        let source = SourceInfo::FromSynth {
            timestamp: Some("2024-05-01T12:30:00Z".parse().unwrap()),
            bank: Some(BankNumber::new(3, 128)),
        };
        let json = source.to_json();
        assert_eq!(json["synthsource"], true);
        assert_eq!(json["banknumber"], 3);

        let parsed = SourceInfo::from_json(&json).unwrap();
        match parsed {
            SourceInfo::FromSynth { timestamp, bank } => {
                assert!(timestamp.is_some());
                assert_eq!(bank.map(|b| b.index()), Some(3));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_file_source_json_roundtrip() {
        let source = SourceInfo::FromFile {
            filename: "factory.syx".to_string(),
            fullpath: "/tmp/factory.syx".to_string(),
            program: Some(ProgramNumber::from_zero_based(12)),
        };
        let json = source.to_json();
        assert_eq!(json["filesource"], true);
        assert_eq!(json["filename"], "factory.syx");
        assert_eq!(json["program"], 12);

        let parsed = SourceInfo::from_json(&json).unwrap();
        assert_eq!(parsed, source);
    }

    #[test]
    fn test_bulk_source_wraps_inner() {
        let inner = SourceInfo::FromFile {
            filename: "a.syx".to_string(),
            fullpath: "/x/a.syx".to_string(),
            program: None,
        };
        let bulk = SourceInfo::FromBulk {
            timestamp: Some("2024-05-01T12:30:00Z".parse().unwrap()),
            inner: Some(Box::new(inner)),
        };
        let parsed = SourceInfo::from_string_rep(&bulk.to_string_rep()).unwrap();
        match parsed {
            SourceInfo::FromBulk { inner: Some(inner), .. } => {
                assert!(matches!(*inner, SourceInfo::FromFile { .. }));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_bulk_source_accepts_legacy_string_inner() {
        // Old files stored the inner source as an embedded JSON string.
        let inner_text = SourceInfo::FromFile {
            filename: "b.syx".to_string(),
            fullpath: String::new(),
            program: None,
        }
        .to_string_rep();
        let doc = json!({
            "bulksource": true,
            "timestamp": "2020-01-01T00:00:00Z",
            "fileInBulk": inner_text,
        });
        let parsed = SourceInfo::from_json(&doc).unwrap();
        match parsed {
            SourceInfo::FromBulk { inner: Some(inner), .. } => {
                assert!(matches!(*inner, SourceInfo::FromFile { .. }));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_edit_buffer_import_detection_and_id() {
        let edit_buffer = SourceInfo::FromSynth {
            timestamp: Some(Utc::now()),
            bank: None,
        };
        assert!(edit_buffer.is_edit_buffer_import());
        assert_eq!(edit_buffer.import_id(), EDIT_BUFFER_IMPORT_ID);

        let banked = SourceInfo::FromSynth {
            timestamp: Some(Utc::now()),
            bank: Some(BankNumber::new(0, 100)),
        };
        assert!(!banked.is_edit_buffer_import());
        assert_ne!(banked.import_id(), EDIT_BUFFER_IMPORT_ID);
    }

    #[test]
    fn test_import_id_stable_for_same_source() {
        let ts = "2024-05-01T12:30:00Z".parse().unwrap();
        let a = SourceInfo::FromSynth {
            timestamp: Some(ts),
            bank: Some(BankNumber::new(1, 64)),
        };
        let b = SourceInfo::FromSynth {
            timestamp: Some(ts),
            bank: Some(BankNumber::new(1, 64)),
        };
        assert_eq!(a.import_id(), b.import_id());
    }

    #[test]
    fn test_unrecognized_json_is_none() {
        assert!(SourceInfo::from_json(&json!({ "whatever": 1 })).is_none());
        assert!(SourceInfo::from_string_rep("not json").is_none());
    }
}
