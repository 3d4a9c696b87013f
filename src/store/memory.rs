//! # In-memory storage engine
//!
//! An `Arc<RwLock<_>>`-guarded map where readers don't block each other.
//! Backed by `BTreeMap<String, StorageEntry>` rather than a hash map so
//! `scan()` always yields keys in ascending order without a sort step,
//! which the Merkle tree needs for deterministic leaf ordering. The lock is
//! `tokio::sync::RwLock` rather than `std::sync::RwLock` because
//! `StorageEngine` methods are `async fn` and may hold the guard across
//! other awaits in `put`/`put_reconciled`.

use super::engine::{StorageChange, StorageEngine};
use super::persistence;
use crate::error::{MerkleKvError, Result};
use crate::model::{wins, StorageEntry};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

const CHANGE_CHANNEL_CAPACITY: usize = 4096;

pub struct MemoryEngine {
    data: Arc<RwLock<BTreeMap<String, StorageEntry>>>,
    changes: broadcast::Sender<StorageChange>,
    persist_path: Option<PathBuf>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            data: Arc::new(RwLock::new(BTreeMap::new())),
            changes,
            persist_path: None,
        }
    }

    /// Makes every subsequent LWW-winning `put`/`put_reconciled`/`delete`
    /// append to `path`, so local writes, replicated writes, and reconciled
    /// anti-entropy merges all persist through the same call site.
    pub fn with_persistence(mut self, path: PathBuf) -> Self {
        self.persist_path = Some(path);
        self
    }

    /// Seeds the engine from entries already on disk. Multiple lines for the
    /// same key (the append-only log never rewrites in place) are merged
    /// through the same LWW comparison `apply_if_wins` uses at runtime, so
    /// file order never matters to the final state.
    pub async fn load_raw(&self, entries: Vec<StorageEntry>) {
        let mut data = self.data.write().await;
        for entry in entries {
            let should_apply = match data.get(&entry.key) {
                Some(incumbent) => wins(&entry, incumbent),
                None => true,
            };
            if should_apply {
                data.insert(entry.key.clone(), entry);
            }
        }
    }

    async fn apply_if_wins(&self, entry: StorageEntry, broadcast_change: bool) -> Result<bool> {
        entry.validate().map_err(MerkleKvError::InvalidRequest)?;
        let mut data = self.data.write().await;
        let should_apply = match data.get(&entry.key) {
            Some(incumbent) => wins(&entry, incumbent),
            None => true,
        };
        if !should_apply {
            return Ok(false);
        }
        data.insert(entry.key.clone(), entry.clone());
        drop(data);
        if let Some(path) = &self.persist_path {
            persistence::append(path, &entry)?;
        }
        if broadcast_change {
            // No receivers is normal before C9/C5 subscribe; a send error
            // here just means nobody is listening yet, not a failure.
            let _ = self.changes.send(StorageChange { entry });
        }
        Ok(true)
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl StorageEngine for MemoryEngine {
    async fn get_raw(&self, key: &str) -> Option<StorageEntry> {
        self.data.read().await.get(key).cloned()
    }

    async fn put(&self, entry: StorageEntry) -> Result<bool> {
        self.apply_if_wins(entry, true).await
    }

    async fn put_reconciled(&self, entry: StorageEntry) -> Result<bool> {
        self.apply_if_wins(entry, true).await
    }

    async fn delete(&self, key: &str, timestamp_ms: i64, node_id: &str, seq: i64) -> Result<bool> {
        let tombstone = StorageEntry::tombstone(key, timestamp_ms, node_id, seq);
        self.apply_if_wins(tombstone, true).await
    }

    async fn scan(&self) -> Vec<StorageEntry> {
        self.data.read().await.values().cloned().collect()
    }

    async fn gc_tombstones(&self, now_ms: i64, older_than_ms: i64) -> usize {
        let mut data = self.data.write().await;
        let cutoff = now_ms - older_than_ms;
        let expired: Vec<String> = data
            .iter()
            .filter(|(_, e)| e.is_tombstone && e.timestamp_ms <= cutoff)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            data.remove(key);
        }
        expired.len()
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }

    async fn len(&self) -> usize {
        self.data.read().await.values().filter(|e| !e.is_tombstone).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, value: &str, ts: i64, node: &str) -> StorageEntry {
        StorageEntry::live(key, value, ts, node, 1)
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let engine = MemoryEngine::new();
        assert!(engine.put(entry("k", "v", 1, "A")).await.unwrap());
        assert_eq!(engine.get("k").await, Some("v".to_string()));
    }

    #[tokio::test]
    async fn older_write_does_not_overwrite_newer() {
        let engine = MemoryEngine::new();
        engine.put(entry("k", "new", 2000, "A")).await.unwrap();
        let applied = engine.put(entry("k", "old", 1000, "A")).await.unwrap();
        assert!(!applied);
        assert_eq!(engine.get("k").await, Some("new".to_string()));
    }

    #[tokio::test]
    async fn delete_wins_over_older_live_entry() {
        let engine = MemoryEngine::new();
        engine.put(entry("k", "v", 1000, "A")).await.unwrap();
        let applied = engine.delete("k", 2000, "A", 2).await.unwrap();
        assert!(applied);
        assert_eq!(engine.get("k").await, None);
        let raw = engine.get_raw("k").await.unwrap();
        assert!(raw.is_tombstone);
    }

    #[tokio::test]
    async fn scan_returns_keys_in_ascending_order() {
        let engine = MemoryEngine::new();
        engine.put(entry("zebra", "1", 1, "A")).await.unwrap();
        engine.put(entry("apple", "2", 1, "A")).await.unwrap();
        engine.put(entry("mango", "3", 1, "A")).await.unwrap();
        let keys: Vec<String> = engine.scan().await.into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["apple", "mango", "zebra"]);
    }

    #[tokio::test]
    async fn gc_tombstones_removes_only_expired_ones() {
        let engine = MemoryEngine::new();
        engine.delete("old", 1_000, "A", 1).await.unwrap();
        engine.delete("fresh", 100_000, "A", 1).await.unwrap();
        let removed = engine.gc_tombstones(200_000, 24 * 60 * 60 * 1000).await;
        assert_eq!(removed, 0);
        let removed = engine.gc_tombstones(200_000_000, 1000).await;
        assert_eq!(removed, 1);
        assert!(engine.get_raw("old").await.is_none());
        assert!(engine.get_raw("fresh").await.is_some());
    }

    #[tokio::test]
    async fn subscribers_receive_accepted_changes_only() {
        let engine = MemoryEngine::new();
        let mut rx = engine.subscribe();
        engine.put(entry("k", "v1", 2000, "A")).await.unwrap();
        engine.put(entry("k", "v2", 1000, "A")).await.unwrap(); // loses, no broadcast
        let change = rx.try_recv().unwrap();
        assert_eq!(change.entry.value, Some("v1".to_string()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn invalid_entry_is_rejected_before_mutation() {
        let engine = MemoryEngine::new();
        let oversized_key = "k".repeat(crate::model::MAX_KEY_BYTES + 1);
        let result = engine.put(entry(&oversized_key, "v", 1, "A")).await;
        assert!(result.is_err());
        assert!(engine.get(&oversized_key).await.is_none());
    }

    #[tokio::test]
    async fn load_raw_applies_lww_regardless_of_file_order() {
        let engine = MemoryEngine::new();
        let newer = entry("k1", "newer", 2000, "A");
        let older = entry("k1", "older", 1000, "A");
        engine.load_raw(vec![newer.clone(), older]).await;
        assert_eq!(engine.get("k1").await, Some("newer".to_string()));

        let engine = MemoryEngine::new();
        let newer = entry("k1", "newer", 2000, "A");
        let older = entry("k1", "older", 1000, "A");
        engine.load_raw(vec![older, newer]).await;
        assert_eq!(engine.get("k1").await, Some("newer".to_string()));
    }

    #[tokio::test]
    async fn put_with_persistence_appends_every_winning_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.log");
        let engine = MemoryEngine::new().with_persistence(path.clone());
        engine.put(entry("k", "v1", 1000, "A")).await.unwrap();
        engine.put_reconciled(entry("k", "v2", 2000, "A")).await.unwrap();
        engine.delete("k", 3000, "A", 2).await.unwrap();
        // The superseded write below must not append.
        engine.put(entry("k", "stale", 500, "A")).await.unwrap();

        let (loaded, skipped) = persistence::load(&path).unwrap();
        assert_eq!(skipped, 0);
        assert_eq!(loaded.len(), 3);
    }
}
