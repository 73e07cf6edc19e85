//! Content fingerprints for notebook documents.
//!
//! A [`Fingerprint`] is the BLAKE3 hash of a document's source bytes. It is
//! the only identifier a client ever uses to address a document, so it must
//! be a pure function of the bytes: the same file yields the same fingerprint
//! on every machine and across restarts.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Size of a fingerprint in bytes.
pub const FINGERPRINT_SIZE: usize = 32;

/// Errors produced when parsing a fingerprint from its hex form.
#[derive(Debug, Error, PartialEq)]
pub enum FingerprintError {
    /// The string has the wrong number of characters.
    #[error("invalid fingerprint length: expected {expected} hex chars, got {actual}")]
    InvalidLength {
        /// Expected length in hex characters.
        expected: usize,
        /// Actual length in characters.
        actual: usize,
    },

    /// The string contains a non-hex character.
    #[error("invalid fingerprint: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Stable identifier derived from a document's source bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; FINGERPRINT_SIZE]);

impl Fingerprint {
    /// Computes the fingerprint of raw document bytes.
    #[must_use]
    pub fn of_bytes(source: &[u8]) -> Self {
        Self(*blake3::hash(source).as_bytes())
    }

    /// Reads a file and fingerprints its contents.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the file cannot be read.
    pub fn of_file(path: &Path) -> std::io::Result<Self> {
        let source = std::fs::read(path)?;
        Ok(Self::of_bytes(&source))
    }

    /// Returns the raw hash bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; FINGERPRINT_SIZE] {
        &self.0
    }

    /// Lowercase hex encoding, as used in URLs and cache file names.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = FingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != FINGERPRINT_SIZE * 2 {
            return Err(FingerprintError::InvalidLength {
                expected: FINGERPRINT_SIZE * 2,
                actual: s.len(),
            });
        }
        let mut bytes = [0u8; FINGERPRINT_SIZE];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Abbreviated: the full hash only adds noise to logs.
        write!(f, "Fingerprint({})", &self.to_hex()[..12])
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
