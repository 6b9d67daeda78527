//! Persisted per-synth MIDI locations.
//!
//! One flat JSON file of string keys, with the well-known key scheme
//! `<synth>-channel`, `<synth>-input`, `<synth>-output`. Endpoint *ids* are
//! stored so a renamed port keeps working across restarts.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing::warn;

use crate::backend::MidiEndpoint;
use crate::devices::DeviceManager;
use crate::discovery::{MidiChannel, MidiNetworkLocation};

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write settings file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("settings file {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Flat key/value settings store persisted as JSON.
pub struct LocationSettings {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl LocationSettings {
    /// Open the store, loading the file when it exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();
        let values = if path.exists() {
            let text = fs::read_to_string(&path).map_err(|source| SettingsError::Read {
                path: path.clone(),
                source,
            })?;
            serde_json::from_str(&text).map_err(|source| SettingsError::Parse {
                path: path.clone(),
                source,
            })?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    /// Default location under the user's data directory.
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("KnobKraft")
            .join("MidiLocations.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .expect("settings mutex poisoned")
            .get(key)
            .cloned()
    }

    pub fn set(&self, key: &str, value: impl Into<String>) {
        self.values
            .lock()
            .expect("settings mutex poisoned")
            .insert(key.to_string(), value.into());
    }

    /// Persist the current values, creating parent directories as needed.
    pub fn save(&self) -> Result<(), SettingsError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| SettingsError::Write {
                path: self.path.clone(),
                source,
            })?;
        }
        let values = self.values.lock().expect("settings mutex poisoned");
        let text = serde_json::to_string_pretty(&*values).expect("string map serializes");
        fs::write(&self.path, text).map_err(|source| SettingsError::Write {
            path: self.path.clone(),
            source,
        })
    }

    /// Store the detected location for a synth.
    pub fn set_location(&self, synth_name: &str, location: &MidiNetworkLocation) {
        self.set(
            &format!("{synth_name}-channel"),
            location.channel.to_zero_based().to_string(),
        );
        self.set(&format!("{synth_name}-input"), location.input.id.clone());
        self.set(&format!("{synth_name}-output"), location.output.id.clone());
    }

    /// Resolve the stored location for a synth against the manager's roster
    /// (including historical endpoints, so a currently unplugged port still
    /// resolves by name).
    pub fn location_for(
        &self,
        synth_name: &str,
        manager: &DeviceManager,
    ) -> Option<MidiNetworkLocation> {
        let input_id = self.get(&format!("{synth_name}-input"))?;
        let output_id = self.get(&format!("{synth_name}-output"))?;
        let channel_text = self.get(&format!("{synth_name}-channel"))?;
        let channel = channel_text
            .parse::<u8>()
            .ok()
            .and_then(MidiChannel::from_zero_based);
        let Some(channel) = channel else {
            warn!(synth = synth_name, channel = %channel_text, "ignoring invalid stored channel");
            return None;
        };
        let input = manager
            .input_by_id(&input_id)
            .unwrap_or_else(|| MidiEndpoint::new(input_id, "unknown input"));
        let output = manager
            .output_by_id(&output_id)
            .unwrap_or_else(|| MidiEndpoint::new(output_id, "unknown output"));
        Some(MidiNetworkLocation {
            input,
            output,
            channel,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimBackend;
    use anyhow::Result;
    use tempfile::TempDir;

    #[test]
    fn test_roundtrip_location() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("locations.json");

        let backend = SimBackend::new();
        let input = backend.add_input("In");
        let output = backend.add_output("Out");
        let manager = DeviceManager::new(backend.as_backend());

        let settings = LocationSettings::open(&path)?;
        let location = MidiNetworkLocation {
            input: input.clone(),
            output: output.clone(),
            channel: MidiChannel::from_zero_based(9).unwrap(),
        };
        settings.set_location("Matrix-1000", &location);
        settings.save()?;

        let reloaded = LocationSettings::open(&path)?;
        let resolved = reloaded
            .location_for("Matrix-1000", &manager)
            .expect("stored location resolves");
        assert_eq!(resolved.input.id, input.id);
        assert_eq!(resolved.output.id, output.id);
        assert_eq!(resolved.channel.to_zero_based(), 9);
        Ok(())
    }

    #[test]
    fn test_missing_synth_yields_none() -> Result<()> {
        let dir = TempDir::new()?;
        let settings = LocationSettings::open(dir.path().join("locations.json"))?;
        let manager = DeviceManager::new(SimBackend::new().as_backend());
        assert!(settings.location_for("Nope", &manager).is_none());
        Ok(())
    }

    #[test]
    fn test_invalid_channel_is_ignored() -> Result<()> {
        let dir = TempDir::new()?;
        let settings = LocationSettings::open(dir.path().join("locations.json"))?;
        settings.set("Broken-channel", "notanumber");
        settings.set("Broken-input", "id1");
        settings.set("Broken-output", "id2");
        let manager = DeviceManager::new(SimBackend::new().as_backend());
        assert!(settings.location_for("Broken", &manager).is_none());
        Ok(())
    }
}
