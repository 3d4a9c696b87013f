//! # Storage engine trait
//!
//! `StorageEngine` is the async trait every key-value backend implements:
//! last-write-wins semantics with tombstones for deletion. This crate keeps
//! one safe in-memory engine (`memory::MemoryEngine`) with optional
//! append-only persistence (`persistence`) layered underneath it.

use crate::error::Result;
use crate::model::StorageEntry;
use tokio::sync::broadcast;

/// A change to local storage, emitted after a `put`/`put_reconciled`/`delete`
/// actually mutates state: only when the entry it stores wins the LWW
/// comparison against what was there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    pub entry: StorageEntry,
}

/// The local, durable key-value half of a node.
///
/// Implementations must be safe for concurrent use from the storage lane
/// (command handling, replication apply, anti-entropy reconciliation all
/// call into the same engine instance).
#[async_trait::async_trait]
pub trait StorageEngine: Send + Sync {
    /// Returns the current entry for `key`, including tombstones, or `None`
    /// if the key has never been written.
    async fn get_raw(&self, key: &str) -> Option<StorageEntry>;

    /// Returns the live value for `key`, or `None` if absent or tombstoned.
    async fn get(&self, key: &str) -> Option<String> {
        self.get_raw(key).await.and_then(|e| if e.is_tombstone { None } else { e.value })
    }

    /// Writes a new locally-originated entry. Callers (the command layer)
    /// supply `timestamp_ms`/`node_id`/`seq`; this only decides whether the
    /// write wins LWW against the current entry and applies it if so.
    async fn put(&self, entry: StorageEntry) -> Result<bool>;

    /// Applies an entry received from replication or anti-entropy, using the
    /// same LWW rule as `put` but never re-publishing it: reconciliation
    /// writes must not re-enter the outbox.
    async fn put_reconciled(&self, entry: StorageEntry) -> Result<bool>;

    /// Writes a tombstone for `key` with the given version vector, following
    /// the same LWW rule as `put`.
    async fn delete(&self, key: &str, timestamp_ms: i64, node_id: &str, seq: i64) -> Result<bool>;

    /// All entries, including tombstones, sorted ascending by key — Merkle
    /// leaves are formed from storage entries in this order.
    async fn scan(&self) -> Vec<StorageEntry>;

    /// Removes tombstones older than `older_than_ms` compared to `now_ms`
    /// (the tombstone retention window, default 24h).
    async fn gc_tombstones(&self, now_ms: i64, older_than_ms: i64) -> usize;

    /// Subscribes to a stream of accepted local/reconciled changes, consumed
    /// by the Merkle tree and the outbox.
    fn subscribe(&self) -> broadcast::Receiver<StorageChange>;

    /// Number of live (non-tombstone) entries, for metrics/diagnostics.
    async fn len(&self) -> usize;
}
