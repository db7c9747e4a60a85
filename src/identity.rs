//! Composite identity hashing
//!
//! A target is identified across signal types by a 256-bit digest over its
//! stable attributes. The raw host id is hashed before anything else touches
//! it; only the hash ever reaches the window table or the analytics store.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::EvidenceKind;

/// Stand-in for optional identity fields that were not observed.
pub const EMPTY_TOKEN: &str = "-";

/// SHA-256 of the raw host id, hex-encoded.
pub fn host_id_hash(host_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(host_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Composite id over `(host_id_hash, port, manifest_hash, process_signature)`.
/// Missing fields are replaced by [`EMPTY_TOKEN`] so that the digest input is
/// unambiguous.
pub fn composite_id(
    host_id_hash: &str,
    port: u16,
    manifest_hash: Option<&str>,
    process_signature: Option<&str>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(host_id_hash.as_bytes());
    hasher.update(b":");
    hasher.update(port.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(manifest_hash.unwrap_or(EMPTY_TOKEN).as_bytes());
    hasher.update(b":");
    hasher.update(process_signature.unwrap_or(EMPTY_TOKEN).as_bytes());
    hex::encode(hasher.finalize())
}

/// Duplicate-rejection signature for an evidence record. The details value is
/// hashed through its canonical JSON encoding (object keys are ordered).
pub fn evidence_signature(
    kind: EvidenceKind,
    source: &str,
    timestamp: DateTime<Utc>,
    details: &serde_json::Value,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(source.as_bytes());
    hasher.update(b"|");
    hasher.update(timestamp.timestamp_millis().to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(details.to_string().as_bytes());
    hex::encode(hasher.finalize())
}
