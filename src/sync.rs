//! # Anti-entropy protocol
//!
//! `SyncManager` owns a node's peer list and drives a two-round SYNC /
//! SYNC_KEYS protocol: SYNC compares root hashes to detect divergence, and
//! SYNC_KEYS exchanges the diverging keys' entries so both sides converge
//! via `put_reconciled`. A token bucket rate-limits how often this node
//! answers sync requests.

use crate::connection::{sync_keys_request_topic, sync_request_topic, BusClient};
use crate::error::{MerkleKvError, Result};
use crate::metrics::NodeMetrics;
use crate::model::{StorageEntry, MAX_SYNC_KEYS_BATCH_BYTES};
use crate::store::{MerkleTree, StorageEngine};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub request_id: String,
    pub source_node_id: String,
    pub root_hash: String,
    pub timestamp: i64,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    pub request_id: String,
    pub response_node_id: String,
    pub root_hash: String,
    pub hashes_match: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub divergent_paths: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncKeysRequest {
    pub request_id: String,
    pub source_node_id: String,
    pub keys: Vec<String>,
    pub entries: Vec<StorageEntry>,
    pub timestamp: i64,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncKeysResponse {
    pub request_id: String,
    pub response_node_id: String,
    pub entries: Vec<StorageEntry>,
    pub not_found_keys: Vec<String>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    AlreadyConverged,
    Reconciled { entries_exchanged: usize },
}

/// Token bucket rate limiter on outbound SYNC initiations (default 5 req/s,
/// bucket size 10).
pub struct TokenBucket {
    capacity: f64,
    tokens: Mutex<(f64, Instant)>,
    refill_per_second: f64,
}

impl TokenBucket {
    pub fn new(refill_per_second: f64, capacity: u32) -> Self {
        Self {
            capacity: capacity as f64,
            tokens: Mutex::new((capacity as f64, Instant::now())),
            refill_per_second,
        }
    }

    /// Attempts to take one token, refilling based on elapsed time first.
    /// Returns `false` (rate limited) if no token is available.
    pub fn try_acquire(&self) -> bool {
        let mut guard = self.tokens.lock().expect("token bucket mutex poisoned");
        let (tokens, last_refill) = &mut *guard;
        let elapsed = last_refill.elapsed().as_secs_f64();
        *tokens = (*tokens + elapsed * self.refill_per_second).min(self.capacity);
        *last_refill = Instant::now();
        if *tokens >= 1.0 {
            *tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

/// Waits for sync responses matching a `request_id`, parallel to
/// `command::Correlator` but scoped to the SYNC/SYNC_KEYS wire formats.
#[derive(Default)]
struct SyncWaiters {
    sync: Mutex<HashMap<String, oneshot::Sender<SyncResponse>>>,
    sync_keys: Mutex<HashMap<String, oneshot::Sender<SyncKeysResponse>>>,
}

pub struct SyncManager {
    node_id: String,
    topic_prefix: String,
    rate_limiter: TokenBucket,
    waiters: SyncWaiters,
}

impl SyncManager {
    pub fn new(node_id: impl Into<String>, topic_prefix: impl Into<String>, requests_per_second: f64, bucket: u32) -> Self {
        Self {
            node_id: node_id.into(),
            topic_prefix: topic_prefix.into(),
            rate_limiter: TokenBucket::new(requests_per_second, bucket),
            waiters: SyncWaiters::default(),
        }
    }

    /// Dispatches an incoming `SyncResponse`/`SyncKeysResponse` payload to
    /// whichever `initiate_sync` call is waiting on its `request_id`.
    pub fn deliver_sync_response(&self, response: SyncResponse) {
        if let Some(tx) = self.waiters.sync.lock().expect("sync waiters mutex poisoned").remove(&response.request_id) {
            let _ = tx.send(response);
        }
    }

    pub fn deliver_sync_keys_response(&self, response: SyncKeysResponse) {
        if let Some(tx) = self.waiters.sync_keys.lock().expect("sync waiters mutex poisoned").remove(&response.request_id) {
            let _ = tx.send(response);
        }
    }

    /// Runs a full SYNC / SYNC_KEYS round against `peer_node_id`. Rate
    /// limited per node on outbound initiations.
    pub async fn initiate_sync(
        &self,
        peer_node_id: &str,
        bus: &dyn BusClient,
        merkle: &MerkleTree,
        storage: &dyn StorageEngine,
        timeout_ms: u64,
        metrics: &NodeMetrics,
    ) -> Result<SyncOutcome> {
        if !self.rate_limiter.try_acquire() {
            NodeMetrics::incr(&metrics.ae_sync_rate_limited);
            return Err(MerkleKvError::RateLimited);
        }
        NodeMetrics::incr(&metrics.ae_sync_attempts);

        let request_id = uuid::Uuid::new_v4().to_string();
        let request = SyncRequest {
            request_id: request_id.clone(),
            source_node_id: self.node_id.clone(),
            root_hash: hex_encode(&merkle.root_hash()),
            timestamp: now_ms(),
            timeout_ms,
        };

        let (tx, rx) = oneshot::channel();
        self.waiters.sync.lock().expect("sync waiters mutex poisoned").insert(request_id.clone(), tx);

        let payload = serde_json::to_vec(&request).map_err(|e| MerkleKvError::InternalError(e.to_string()))?;
        bus.publish(&sync_request_topic(&self.topic_prefix, peer_node_id), payload).await?;

        let response = match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(response)) => response,
            _ => {
                self.waiters.sync.lock().expect("sync waiters mutex poisoned").remove(&request_id);
                NodeMetrics::incr(&metrics.ae_sync_timeout);
                return Err(MerkleKvError::Timeout);
            }
        };

        if response.hashes_match {
            NodeMetrics::incr(&metrics.ae_sync_success);
            return Ok(SyncOutcome::AlreadyConverged);
        }

        // Root hashes diverged; request every local key rather than walking
        // internal Merkle nodes for a narrower diff (see DESIGN.md).
        let local_entries = storage.scan().await;
        let keys: Vec<String> = local_entries.iter().map(|e| e.key.clone()).collect();

        let batch = batch_within_cap(&keys, &local_entries, MAX_SYNC_KEYS_BATCH_BYTES)?;

        let sync_keys_request_id = uuid::Uuid::new_v4().to_string();
        let keys_request = SyncKeysRequest {
            request_id: sync_keys_request_id.clone(),
            source_node_id: self.node_id.clone(),
            keys: batch.keys,
            entries: batch.entries,
            timestamp: now_ms(),
            timeout_ms,
        };

        let (tx, rx) = oneshot::channel();
        self.waiters.sync_keys.lock().expect("sync waiters mutex poisoned").insert(sync_keys_request_id.clone(), tx);

        let payload = serde_json::to_vec(&keys_request).map_err(|e| MerkleKvError::InternalError(e.to_string()))?;
        bus.publish(&sync_keys_request_topic(&self.topic_prefix, peer_node_id), payload).await?;

        let keys_response = match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(response)) => response,
            _ => {
                self.waiters.sync_keys.lock().expect("sync waiters mutex poisoned").remove(&sync_keys_request_id);
                NodeMetrics::incr(&metrics.ae_sync_timeout);
                return Err(MerkleKvError::Timeout);
            }
        };

        // Apply the peer's pushed entries unconditionally; LWW merge makes a
        // losing entry a no-op, so this is safe regardless of who actually
        // needed it (see DESIGN.md).
        let mut exchanged = 0usize;
        for entry in keys_response.entries {
            storage.put_reconciled(entry).await?;
            exchanged += 1;
        }

        NodeMetrics::incr(&metrics.ae_sync_success);
        Ok(SyncOutcome::Reconciled { entries_exchanged: exchanged })
    }

    /// Responder side of Round 1: compares the incoming root hash against
    /// ours and returns the `SyncResponse` to publish back.
    pub fn handle_sync_request(&self, request: &SyncRequest, merkle: &MerkleTree) -> SyncResponse {
        let local_root = hex_encode(&merkle.root_hash());
        SyncResponse {
            request_id: request.request_id.clone(),
            response_node_id: self.node_id.clone(),
            hashes_match: local_root == request.root_hash,
            root_hash: local_root,
            divergent_paths: None,
        }
    }

    /// Responder side of Round 2: applies the initiator's pushed entries,
    /// then returns our own entries for the requested keys (reconciling
    /// both directions in one round trip).
    pub async fn handle_sync_keys_request(&self, request: &SyncKeysRequest, storage: &dyn StorageEngine) -> Result<SyncKeysResponse> {
        for entry in &request.entries {
            storage.put_reconciled(entry.clone()).await?;
        }

        let mut entries = Vec::new();
        let mut not_found_keys = Vec::new();
        for key in &request.keys {
            match storage.get_raw(key).await {
                Some(entry) => entries.push(entry),
                None => not_found_keys.push(key.clone()),
            }
        }

        Ok(SyncKeysResponse {
            request_id: request.request_id.clone(),
            response_node_id: self.node_id.clone(),
            entries,
            not_found_keys,
            timestamp: now_ms(),
        })
    }
}

struct KeyBatch {
    keys: Vec<String>,
    entries: Vec<StorageEntry>,
}

/// Batches candidate keys/entries so the encoded `SyncKeysRequest` stays
/// within `cap` bytes. Fails with `PayloadTooLarge` only if a single key
/// cannot fit even alone.
fn batch_within_cap(keys: &[String], entries: &[StorageEntry], cap: usize) -> Result<KeyBatch> {
    let mut batch_keys = Vec::new();
    let mut batch_entries = Vec::new();
    let mut running_size = 0usize;

    for (key, entry) in keys.iter().zip(entries.iter()) {
        let entry_size = serde_json::to_vec(entry).map(|v| v.len()).unwrap_or(0);
        if entry_size > cap {
            return Err(MerkleKvError::PayloadTooLarge(format!("key {key} alone exceeds the sync_keys batch cap")));
        }
        if running_size + entry_size > cap {
            break;
        }
        running_size += entry_size;
        batch_keys.push(key.clone());
        batch_entries.push(entry.clone());
    }

    Ok(KeyBatch { keys: batch_keys, entries: batch_entries })
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_bucket_allows_bursts_up_to_capacity() {
        let bucket = TokenBucket::new(0.0, 3);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn token_bucket_refills_over_time() {
        let bucket = TokenBucket::new(1000.0, 1);
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
        std::thread::sleep(Duration::from_millis(5));
        assert!(bucket.try_acquire());
    }

    #[test]
    fn responder_reports_matching_hashes() {
        let manager = SyncManager::new("node-b", "mkv", 5.0, 10);
        let merkle = MerkleTree::new();
        let request = SyncRequest {
            request_id: "r1".into(),
            source_node_id: "node-a".into(),
            root_hash: hex_encode(&merkle.root_hash()),
            timestamp: 0,
            timeout_ms: 1000,
        };
        let response = manager.handle_sync_request(&request, &merkle);
        assert!(response.hashes_match);
    }

    #[test]
    fn responder_reports_divergent_hashes() {
        let manager = SyncManager::new("node-b", "mkv", 5.0, 10);
        let merkle = MerkleTree::new();
        let request = SyncRequest {
            request_id: "r1".into(),
            source_node_id: "node-a".into(),
            root_hash: "not-the-real-hash".into(),
            timestamp: 0,
            timeout_ms: 1000,
        };
        let response = manager.handle_sync_request(&request, &merkle);
        assert!(!response.hashes_match);
    }

    #[tokio::test]
    async fn handle_sync_keys_request_applies_and_echoes_entries() {
        use crate::store::MemoryEngine;
        let manager = SyncManager::new("node-b", "mkv", 5.0, 10);
        let storage = MemoryEngine::new();
        storage.put(StorageEntry::live("local-only", "v", 100, "node-b", 1)).await.unwrap();

        let request = SyncKeysRequest {
            request_id: "r1".into(),
            source_node_id: "node-a".into(),
            keys: vec!["local-only".into(), "missing".into()],
            entries: vec![StorageEntry::live("pushed", "v2", 200, "node-a", 1)],
            timestamp: 0,
            timeout_ms: 1000,
        };
        let response = manager.handle_sync_keys_request(&request, &storage).await.unwrap();

        assert_eq!(response.entries.len(), 1);
        assert_eq!(response.entries[0].key, "local-only");
        assert_eq!(response.not_found_keys, vec!["missing".to_string()]);
        assert_eq!(storage.get("pushed").await, Some("v2".to_string()));
    }

    #[test]
    fn batch_fails_fast_when_a_single_entry_cannot_fit() {
        let huge_value = "x".repeat(MAX_SYNC_KEYS_BATCH_BYTES);
        let entry = StorageEntry::live("k", huge_value, 1, "node-a", 1);
        let result = batch_within_cap(&["k".to_string()], &[entry], MAX_SYNC_KEYS_BATCH_BYTES);
        assert!(matches!(result, Err(MerkleKvError::PayloadTooLarge(_))));
    }
}
