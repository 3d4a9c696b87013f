//! # Replication: dedup index, applicator, and publisher drain loop
//!
//! Change events are published to a shared topic and consumed by every
//! other node. `Applicator::apply_event` runs each incoming payload through
//! a size check, canonical decode, clock-skew rejection, and a
//! `(node_id, seq)` dedup index before applying it to storage via
//! `put_reconciled`, so a redelivered or out-of-order event is a no-op
//! rather than a double-apply.

use crate::codec;
use crate::connection::{replication_topic, BusClient};
use crate::error::Result;
use crate::metrics::NodeMetrics;
use crate::model::StorageEntry;
use crate::outbox::Outbox;
use crate::store::StorageEngine;
use lru::LruCache;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Bounded set of `(node_id, seq)` pairs already applied, with arrival-order
/// expiration after `dedup_ttl` or LRU eviction under capacity pressure.
pub struct DedupIndex {
    seen: Mutex<LruCache<(String, i64), Instant>>,
    ttl: Duration,
    active_nodes: Mutex<HashSet<String>>,
    window_evictions: std::sync::atomic::AtomicU64,
    ttl_evictions: std::sync::atomic::AtomicU64,
    total_checks: std::sync::atomic::AtomicU64,
    duplicate_hits: std::sync::atomic::AtomicU64,
}

impl DedupIndex {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self {
            seen: Mutex::new(LruCache::new(capacity)),
            ttl,
            active_nodes: Mutex::new(HashSet::new()),
            window_evictions: std::sync::atomic::AtomicU64::new(0),
            ttl_evictions: std::sync::atomic::AtomicU64::new(0),
            total_checks: std::sync::atomic::AtomicU64::new(0),
            duplicate_hits: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Returns `true` if `(node_id, seq)` was already seen (and still within
    /// its TTL), otherwise records it as seen and returns `false`.
    pub fn check_and_insert(&self, node_id: &str, seq: i64) -> bool {
        use std::sync::atomic::Ordering::Relaxed;
        self.total_checks.fetch_add(1, Relaxed);
        let key = (node_id.to_string(), seq);
        let mut seen = self.seen.lock().expect("dedup index mutex poisoned");
        if let Some(arrived_at) = seen.get(&key) {
            if arrived_at.elapsed() < self.ttl {
                self.duplicate_hits.fetch_add(1, Relaxed);
                return true;
            }
            self.ttl_evictions.fetch_add(1, Relaxed);
            seen.pop(&key);
        }
        let evicted = seen.len() == seen.cap().get();
        seen.put(key, Instant::now());
        if evicted {
            self.window_evictions.fetch_add(1, Relaxed);
        }
        self.active_nodes.lock().expect("dedup index mutex poisoned").insert(node_id.to_string());
        false
    }

    pub fn active_node_count(&self) -> usize {
        self.active_nodes.lock().expect("dedup index mutex poisoned").len()
    }
}

/// Processes events received from the bus: size check, decode, clock-skew
/// rejection, dedup, then `put_reconciled`.
pub struct Applicator {
    dedup: DedupIndex,
}

impl Applicator {
    pub fn new(dedup_capacity: usize, dedup_ttl: Duration) -> Self {
        Self { dedup: DedupIndex::new(dedup_capacity, dedup_ttl) }
    }

    pub fn dedup_index(&self) -> &DedupIndex {
        &self.dedup
    }

    pub async fn apply_event(
        &self,
        payload: &[u8],
        now_ms: i64,
        skew_max_future_ms: i64,
        storage: &dyn StorageEngine,
        metrics: &NodeMetrics,
    ) -> Result<()> {
        if payload.len() > crate::model::MAX_EVENT_BYTES {
            NodeMetrics::incr(&metrics.payload_too_large);
            NodeMetrics::incr(&metrics.events_rejected);
            return Ok(());
        }

        let entry: StorageEntry = match codec::decode_change_event(payload) {
            Ok(entry) => entry,
            Err(_) => {
                NodeMetrics::incr(&metrics.events_rejected);
                return Ok(());
            }
        };

        if entry.timestamp_ms > now_ms + skew_max_future_ms {
            NodeMetrics::incr(&metrics.events_rejected_clock_skew);
            return Ok(());
        }

        if self.dedup.check_and_insert(&entry.node_id, entry.seq) {
            NodeMetrics::incr(&metrics.events_duplicate);
            return Ok(());
        }

        storage.put_reconciled(entry).await?;
        NodeMetrics::incr(&metrics.events_applied);
        Ok(())
    }
}

/// Drains the outbox to the bus in FIFO order, preserving strictly
/// increasing `seq` per node on the wire.
pub struct Publisher {
    topic_prefix: String,
}

impl Publisher {
    pub fn new(topic_prefix: impl Into<String>) -> Self {
        Self { topic_prefix: topic_prefix.into() }
    }

    /// Runs the single-writer publish loop until `bus.publish` returns an
    /// unrecoverable error or the task is cancelled. On failure, re-queues
    /// the head record with the given backoff instead of dropping it.
    pub async fn drain_forever(&self, outbox: &Outbox, bus: &dyn BusClient, backoff: Duration, metrics: &NodeMetrics) {
        let topic = replication_topic(&self.topic_prefix);
        loop {
            let Some(record) = outbox.peek_ready().await else {
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            };
            match bus.publish(&topic, record.encoded_bytes.clone()).await {
                Ok(()) => {
                    outbox.pop_published().await;
                    NodeMetrics::incr(&metrics.events_published);
                }
                Err(_) => {
                    outbox.requeue_front_with_backoff(backoff).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryEngine;

    fn entry(key: &str, value: &str, ts: i64, node: &str, seq: i64) -> StorageEntry {
        StorageEntry::live(key, value, ts, node, seq)
    }

    #[test]
    fn dedup_detects_repeated_node_seq_pair() {
        let dedup = DedupIndex::new(10, Duration::from_secs(600));
        assert!(!dedup.check_and_insert("node-a", 1));
        assert!(dedup.check_and_insert("node-a", 1));
        assert_eq!(dedup.active_node_count(), 1);
    }

    #[test]
    fn dedup_treats_different_seqs_as_distinct() {
        let dedup = DedupIndex::new(10, Duration::from_secs(600));
        assert!(!dedup.check_and_insert("node-a", 1));
        assert!(!dedup.check_and_insert("node-a", 2));
    }

    #[test]
    fn dedup_expires_after_ttl() {
        let dedup = DedupIndex::new(10, Duration::from_millis(20));
        assert!(!dedup.check_and_insert("node-a", 1));
        std::thread::sleep(Duration::from_millis(30));
        assert!(!dedup.check_and_insert("node-a", 1));
    }

    #[tokio::test]
    async fn applicator_applies_a_well_formed_event() {
        let storage = MemoryEngine::new();
        let metrics = NodeMetrics::new();
        let applicator = Applicator::new(1000, Duration::from_secs(600));
        let payload = codec::encode_change_event(&entry("k", "v", 1000, "node-a", 1)).unwrap();
        applicator.apply_event(&payload, 2000, 300_000, &storage, &metrics).await.unwrap();
        assert_eq!(storage.get("k").await, Some("v".to_string()));
        assert_eq!(metrics.events_applied.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn applicator_rejects_future_skewed_events() {
        let storage = MemoryEngine::new();
        let metrics = NodeMetrics::new();
        let applicator = Applicator::new(1000, Duration::from_secs(600));
        let far_future = entry("k", "v", 10_000_000, "node-a", 1);
        let payload = codec::encode_change_event(&far_future).unwrap();
        applicator.apply_event(&payload, 1000, 300_000, &storage, &metrics).await.unwrap();
        assert_eq!(storage.get("k").await, None);
        assert_eq!(metrics.events_rejected_clock_skew.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn applicator_drops_duplicates_without_reapplying() {
        let storage = MemoryEngine::new();
        let metrics = NodeMetrics::new();
        let applicator = Applicator::new(1000, Duration::from_secs(600));
        let payload = codec::encode_change_event(&entry("k", "v1", 1000, "node-a", 1)).unwrap();
        applicator.apply_event(&payload, 2000, 300_000, &storage, &metrics).await.unwrap();
        // Same (node_id, seq) again, even with a different value, must be dropped as a duplicate.
        let replay = codec::encode_change_event(&entry("k", "v2", 1500, "node-a", 1)).unwrap();
        applicator.apply_event(&replay, 2000, 300_000, &storage, &metrics).await.unwrap();
        assert_eq!(storage.get("k").await, Some("v1".to_string()));
        assert_eq!(metrics.events_duplicate.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn applicator_never_panics_on_oversized_or_garbage_payload() {
        let storage = MemoryEngine::new();
        let metrics = NodeMetrics::new();
        let applicator = Applicator::new(1000, Duration::from_secs(600));
        let oversized = vec![0u8; crate::model::MAX_EVENT_BYTES + 1];
        applicator.apply_event(&oversized, 2000, 300_000, &storage, &metrics).await.unwrap();
        assert_eq!(metrics.payload_too_large.load(std::sync::atomic::Ordering::Relaxed), 1);

        let garbage = vec![0xffu8; 16];
        applicator.apply_event(&garbage, 2000, 300_000, &storage, &metrics).await.unwrap();
        assert_eq!(metrics.events_rejected.load(std::sync::atomic::Ordering::Relaxed), 1);
    }
}
