//! Fingerprint: the identity of a patch across renames.
//!
//! MD5 over the synth-filtered, voice-relevant byte slice, kept as 32 hex
//! chars. Two patches that sound identical fingerprint identically even when
//! their names or transport framing differ.

use std::fmt;
use std::str::FromStr;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A patch fingerprint - 128 bits of MD5 as 32 lowercase hex chars.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("invalid fingerprint length: expected 32 hex chars, got {0}")]
    InvalidLength(usize),

    #[error("invalid hex character in fingerprint")]
    InvalidHex,
}

impl Fingerprint {
    /// Hash the (already filtered) voice-relevant bytes.
    pub fn from_data(data: &[u8]) -> Self {
        let digest = Md5::digest(data);
        Self(hex::encode(digest))
    }

    /// Accept an existing hex string, validating format.
    pub fn from_str_checked(s: &str) -> Result<Self, FingerprintError> {
        if s.len() != 32 {
            return Err(FingerprintError::InvalidLength(s.len()));
        }
        if !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(FingerprintError::InvalidHex);
        }
        Ok(Self(s.to_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = FingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str_checked(s)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_data_produces_32_hex_chars() {
        let fp = Fingerprint::from_data(b"Hello, World!");
        assert_eq!(fp.as_str().len(), 32);
        assert!(fp.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_is_deterministic() {
        assert_eq!(
            Fingerprint::from_data(b"voice data"),
            Fingerprint::from_data(b"voice data")
        );
    }

    #[test]
    fn test_different_data_different_fingerprint() {
        assert_ne!(
            Fingerprint::from_data(b"patch a"),
            Fingerprint::from_data(b"patch b")
        );
    }

    #[test]
    fn test_known_md5_vector() {
        // RFC 1321 test vector.
        let fp = Fingerprint::from_data(b"abc");
        assert_eq!(fp.as_str(), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn test_parse_validates() {
        assert!("900150983cd24fb0d6963f7d28e17f72".parse::<Fingerprint>().is_ok());
        assert!(matches!(
            "short".parse::<Fingerprint>(),
            Err(FingerprintError::InvalidLength(5))
        ));
        assert!(matches!(
            "zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz".parse::<Fingerprint>(),
            Err(FingerprintError::InvalidHex)
        ));
    }

    #[test]
    fn test_parse_lowercases() {
        let fp: Fingerprint = "900150983CD24FB0D6963F7D28E17F72".parse().unwrap();
        assert_eq!(fp.as_str(), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn test_serde_roundtrip() {
        let fp = Fingerprint::from_data(b"serde");
        let json = serde_json::to_string(&fp).unwrap();
        let back: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(fp, back);
    }
}
