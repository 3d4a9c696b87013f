//! # Node-wide observability counters
//!
//! A flat struct of `AtomicU64` fields with a hand-written `Clone` that
//! snapshots each counter with `Ordering::Relaxed` — metrics don't need to
//! participate in any cross-field invariant, so relaxed loads/stores are
//! sufficient. Field names name the events they count directly
//! (`events_published`, `events_applied`, `events_duplicate`, ...).

use std::sync::atomic::{AtomicU64, Ordering};

pub struct NodeMetrics {
    pub events_published: AtomicU64,
    pub events_applied: AtomicU64,
    pub events_duplicate: AtomicU64,
    pub events_rejected: AtomicU64,
    pub events_rejected_clock_skew: AtomicU64,
    pub payload_too_large: AtomicU64,
    pub merkle_root_hash_changes: AtomicU64,
    pub ae_sync_attempts: AtomicU64,
    pub ae_sync_success: AtomicU64,
    pub ae_sync_rate_limited: AtomicU64,
    pub ae_sync_timeout: AtomicU64,
    pub dedup_index_size: AtomicU64,
    pub dedup_index_evictions: AtomicU64,
    pub outbox_dropped: AtomicU64,
    pub commands_total: AtomicU64,
    pub commands_timed_out: AtomicU64,
    pub commands_idempotent_replay: AtomicU64,
    pub reconnects: AtomicU64,
}

impl NodeMetrics {
    pub fn new() -> Self {
        Self {
            events_published: AtomicU64::new(0),
            events_applied: AtomicU64::new(0),
            events_duplicate: AtomicU64::new(0),
            events_rejected: AtomicU64::new(0),
            events_rejected_clock_skew: AtomicU64::new(0),
            payload_too_large: AtomicU64::new(0),
            merkle_root_hash_changes: AtomicU64::new(0),
            ae_sync_attempts: AtomicU64::new(0),
            ae_sync_success: AtomicU64::new(0),
            ae_sync_rate_limited: AtomicU64::new(0),
            ae_sync_timeout: AtomicU64::new(0),
            dedup_index_size: AtomicU64::new(0),
            dedup_index_evictions: AtomicU64::new(0),
            outbox_dropped: AtomicU64::new(0),
            commands_total: AtomicU64::new(0),
            commands_timed_out: AtomicU64::new(0),
            commands_idempotent_replay: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for NodeMetrics {
    fn clone(&self) -> Self {
        Self {
            events_published: AtomicU64::new(self.events_published.load(Ordering::Relaxed)),
            events_applied: AtomicU64::new(self.events_applied.load(Ordering::Relaxed)),
            events_duplicate: AtomicU64::new(self.events_duplicate.load(Ordering::Relaxed)),
            events_rejected: AtomicU64::new(self.events_rejected.load(Ordering::Relaxed)),
            events_rejected_clock_skew: AtomicU64::new(self.events_rejected_clock_skew.load(Ordering::Relaxed)),
            payload_too_large: AtomicU64::new(self.payload_too_large.load(Ordering::Relaxed)),
            merkle_root_hash_changes: AtomicU64::new(self.merkle_root_hash_changes.load(Ordering::Relaxed)),
            ae_sync_attempts: AtomicU64::new(self.ae_sync_attempts.load(Ordering::Relaxed)),
            ae_sync_success: AtomicU64::new(self.ae_sync_success.load(Ordering::Relaxed)),
            ae_sync_rate_limited: AtomicU64::new(self.ae_sync_rate_limited.load(Ordering::Relaxed)),
            ae_sync_timeout: AtomicU64::new(self.ae_sync_timeout.load(Ordering::Relaxed)),
            dedup_index_size: AtomicU64::new(self.dedup_index_size.load(Ordering::Relaxed)),
            dedup_index_evictions: AtomicU64::new(self.dedup_index_evictions.load(Ordering::Relaxed)),
            outbox_dropped: AtomicU64::new(self.outbox_dropped.load(Ordering::Relaxed)),
            commands_total: AtomicU64::new(self.commands_total.load(Ordering::Relaxed)),
            commands_timed_out: AtomicU64::new(self.commands_timed_out.load(Ordering::Relaxed)),
            commands_idempotent_replay: AtomicU64::new(self.commands_idempotent_replay.load(Ordering::Relaxed)),
            reconnects: AtomicU64::new(self.reconnects.load(Ordering::Relaxed)),
        }
    }
}
