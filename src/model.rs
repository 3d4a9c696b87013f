//! # Storage data model
//!
//! `StorageEntry` is the single persisted record type shared by the storage
//! engine, the replication pipeline, and the Merkle tree. Conflict
//! resolution is Last-Write-Wins over the per-entry version vector
//! `(timestamp_ms, node_id)`; `seq` rides along for diagnostics and
//! anti-entropy but never participates in the LWW order.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Byte-length caps enforced across the crate.
pub const MAX_KEY_BYTES: usize = 256;
pub const MAX_VALUE_BYTES: usize = 262_144;
pub const MAX_COMMAND_PAYLOAD_BYTES: usize = 524_288;
pub const MAX_EVENT_BYTES: usize = 307_200;
pub const MAX_SYNC_KEYS_BATCH_BYTES: usize = 524_288;

/// A single persisted key's current state: either a live value or a tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEntry {
    pub key: String,
    pub value: Option<String>,
    pub timestamp_ms: i64,
    pub node_id: String,
    pub seq: i64,
    pub is_tombstone: bool,
}

impl StorageEntry {
    pub fn live(key: impl Into<String>, value: impl Into<String>, timestamp_ms: i64, node_id: impl Into<String>, seq: i64) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            timestamp_ms,
            node_id: node_id.into(),
            seq,
            is_tombstone: false,
        }
    }

    pub fn tombstone(key: impl Into<String>, timestamp_ms: i64, node_id: impl Into<String>, seq: i64) -> Self {
        Self {
            key: key.into(),
            value: None,
            timestamp_ms,
            node_id: node_id.into(),
            seq,
            is_tombstone: true,
        }
    }

    /// This entry's version vector, used for LWW comparisons.
    pub fn version(&self) -> (i64, &str) {
        (self.timestamp_ms, self.node_id.as_str())
    }

    /// Validates key/value size caps and the `is_tombstone` <-> `value` invariant.
    /// Does not validate `key` against a separately supplied expected key; callers
    /// that need that check (e.g. `put`) do it themselves so they can report which
    /// key mismatched.
    pub fn validate(&self) -> Result<(), String> {
        let key_len = self.key.as_bytes().len();
        if key_len == 0 || key_len > MAX_KEY_BYTES {
            return Err(format!("key length {key_len} outside 1..={MAX_KEY_BYTES}"));
        }
        match (&self.is_tombstone, &self.value) {
            (true, Some(_)) => return Err("tombstone entries must not carry a value".into()),
            (false, None) => return Err("live entries must carry a value".into()),
            (false, Some(v)) => {
                let len = v.as_bytes().len();
                if len > MAX_VALUE_BYTES {
                    return Err(format!("value length {len} exceeds {MAX_VALUE_BYTES}"));
                }
            }
            (true, None) => {}
        }
        Ok(())
    }
}

/// Total order over version vectors: compare `timestamp_ms` first, then break
/// ties lexicographically on `node_id`.
///
/// Equal pairs compare `Equal`; callers treat that as "do not overwrite".
pub fn compare_version(a: (i64, &str), b: (i64, &str)) -> Ordering {
    a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1))
}

/// `true` if `candidate` strictly wins over `incumbent` under LWW ordering.
pub fn wins(candidate: &StorageEntry, incumbent: &StorageEntry) -> bool {
    compare_version(candidate.version(), incumbent.version()) == Ordering::Greater
}
