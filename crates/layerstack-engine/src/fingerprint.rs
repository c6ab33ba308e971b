//! Content fingerprints
//!
//! A fingerprint is the blake3 digest of a value's canonical JSON encoding.
//! `serde_json::Value` keeps object keys sorted, so equal values always
//! encode to the same bytes. Across layers the fingerprint is an opaque
//! string: an import node adopts the remote fingerprint as-is.

use serde::{Deserialize, Serialize};

/// Opaque content hash of a node value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint a JSON value
    pub fn of(value: &serde_json::Value) -> Self {
        // Serializing a Value cannot fail: every map key is already a string.
        let bytes = serde_json::to_vec(value).unwrap_or_default();
        Self::of_bytes(&bytes)
    }

    /// Fingerprint raw bytes
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(blake3::hash(bytes).to_hex().to_string())
    }

    /// Wrap a fingerprint string received from another layer
    pub fn from_remote(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
