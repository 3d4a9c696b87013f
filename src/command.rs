//! # Command layer
//!
//! `Command`/`Request`/`Response` model a request/response cycle published
//! over the bus rather than a raw line protocol: every request carries an
//! id, duplicate ids within the idempotency window replay the cached
//! response instead of re-executing, and `uuid` generates/validates those
//! ids. `lru` backs the bounded, TTL-expiring idempotency cache.

use crate::error::{MerkleKvError, Result};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use uuid::Uuid;

pub const MAX_MULTI_KEY_PAYLOAD_BYTES: usize = 512 * 1024;
pub const MAX_MGET_KEYS: usize = 256;
pub const MAX_MSET_PAIRS: usize = 100;
pub const INT_MIN: i64 = -9_000_000_000_000_000;
pub const INT_MAX: i64 = 9_000_000_000_000_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum Command {
    Get { key: String },
    Set { key: String, value: String },
    Delete { key: String },
    Incr { key: String, delta: i64 },
    Decr { key: String, delta: i64 },
    Append { key: String, suffix: String },
    Prepend { key: String, prefix: String },
    MGet { keys: Vec<String> },
    MSet { map: HashMap<String, String> },
    Sync { target_node_id: String },
    SyncKeys { target_node_id: String, keys: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutClass {
    A,
    B,
    C,
}

impl TimeoutClass {
    pub fn duration(self) -> Duration {
        match self {
            TimeoutClass::A => Duration::from_secs(10),
            TimeoutClass::B => Duration::from_secs(20),
            TimeoutClass::C => Duration::from_secs(30),
        }
    }
}

impl Command {
    pub fn timeout_class(&self) -> TimeoutClass {
        match self {
            Command::Get { .. }
            | Command::Set { .. }
            | Command::Delete { .. }
            | Command::Incr { .. }
            | Command::Decr { .. }
            | Command::Append { .. }
            | Command::Prepend { .. } => TimeoutClass::A,
            Command::MGet { .. } | Command::MSet { .. } => TimeoutClass::B,
            Command::Sync { .. } | Command::SyncKeys { .. } => TimeoutClass::C,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Command::MGet { keys } => {
                let unique: std::collections::HashSet<&String> = keys.iter().collect();
                if unique.len() > MAX_MGET_KEYS {
                    return Err(MerkleKvError::InvalidRequest(format!(
                        "mget accepts at most {MAX_MGET_KEYS} unique keys"
                    )));
                }
            }
            Command::MSet { map } => {
                if map.len() > MAX_MSET_PAIRS {
                    return Err(MerkleKvError::InvalidRequest(format!("mset accepts at most {MAX_MSET_PAIRS} pairs")));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    #[serde(flatten)]
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "NOT_FOUND")]
    NotFound,
    #[serde(rename = "ERROR")]
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub status: ResponseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "errorCode")]
    pub error_code: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<HashMap<String, String>>,
}

impl Response {
    pub fn ok(id: impl Into<String>, value: Option<String>) -> Self {
        Self { id: id.into(), status: ResponseStatus::Ok, value, error: None, error_code: None, results: None }
    }

    pub fn not_found(id: impl Into<String>) -> Self {
        Self { id: id.into(), status: ResponseStatus::NotFound, value: None, error: None, error_code: None, results: None }
    }

    pub fn error(id: impl Into<String>, err: &MerkleKvError) -> Self {
        Self {
            id: id.into(),
            status: ResponseStatus::Error,
            value: None,
            error: Some(err.to_string()),
            error_code: Some(err.error_code()),
            results: None,
        }
    }
}

/// Normalizes and validates a request id: empty/absent yields a fresh
/// UUIDv4; a 36-character id must have UUIDv4 shape; anything else up to
/// 64 characters is accepted verbatim.
pub fn normalize_request_id(id: Option<&str>) -> Result<String> {
    match id {
        None => Ok(Uuid::new_v4().to_string()),
        Some(id) if id.is_empty() => Ok(Uuid::new_v4().to_string()),
        Some(id) if id.len() == 36 => {
            if is_uuid_v4_shaped(id) {
                Ok(id.to_string())
            } else {
                Err(MerkleKvError::InvalidRequest("36-character id must be UUIDv4-shaped".into()))
            }
        }
        Some(id) if id.len() <= 64 => Ok(id.to_string()),
        Some(_) => Err(MerkleKvError::InvalidRequest("id must be 1-64 characters".into())),
    }
}

fn is_uuid_v4_shaped(id: &str) -> bool {
    let Ok(parsed) = Uuid::parse_str(id) else { return false };
    parsed.get_version_num() == 4
}

/// Parses canonical decimal text into a signed 64-bit integer, tolerating
/// leading zeros, and rejecting values outside the ±9e15 band.
pub fn parse_numeric(text: &str) -> Result<i64> {
    let value: i64 = text
        .parse()
        .map_err(|_| MerkleKvError::InvalidRequest(format!("{text} is not a valid integer")))?;
    if !(INT_MIN..=INT_MAX).contains(&value) {
        return Err(MerkleKvError::InvalidRequest("value out of the supported numeric range".into()));
    }
    Ok(value)
}

pub fn checked_incr(existing: Option<&str>, delta: i64) -> Result<i64> {
    let base = match existing {
        Some(text) => parse_numeric(text)?,
        None => 0,
    };
    let result = base.checked_add(delta).ok_or_else(|| MerkleKvError::InvalidRequest("overflow".into()))?;
    if !(INT_MIN..=INT_MAX).contains(&result) {
        return Err(MerkleKvError::InvalidRequest("overflow".into()));
    }
    Ok(result)
}

/// LRU idempotency cache: `id -> Response`, with a TTL applied at read
/// time. Wrapped in a `std::sync::Mutex` since `lru::LruCache` isn't
/// internally synchronized and operations here are never held across an
/// `.await`.
pub struct IdempotencyCache {
    inner: Mutex<LruCache<String, (Response, Instant)>>,
    ttl: Duration,
}

impl IdempotencyCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self { inner: Mutex::new(LruCache::new(capacity)), ttl }
    }

    /// Returns the cached response for `id` if present and not expired.
    pub fn get(&self, id: &str) -> Option<Response> {
        let mut cache = self.inner.lock().expect("idempotency cache mutex poisoned");
        match cache.get(id) {
            Some((response, inserted_at)) if inserted_at.elapsed() < self.ttl => Some(response.clone()),
            Some(_) => {
                cache.pop(id);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, id: String, response: Response) {
        let mut cache = self.inner.lock().expect("idempotency cache mutex poisoned");
        cache.put(id, (response, Instant::now()));
    }
}

/// Matches responses back to pending `send()` calls, coalescing duplicate
/// in-flight ids onto the same future.
pub struct Correlator {
    pending: Mutex<HashMap<String, Vec<oneshot::Sender<Response>>>>,
    idempotency: IdempotencyCache,
}

impl Correlator {
    pub fn new(idempotency_capacity: usize, idempotency_ttl: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            idempotency: IdempotencyCache::new(idempotency_capacity, idempotency_ttl),
        }
    }

    /// Registers a new waiter for `id`. Returns `Err(IdempotentReplay)` with
    /// the cached response if one already exists, without registering a
    /// waiter. Otherwise returns the receiver half of the future the caller
    /// should await; if another waiter is already registered for the same
    /// `id`, the send is coalesced onto the same set of waiters.
    pub fn register(&self, id: &str) -> std::result::Result<oneshot::Receiver<Response>, Response> {
        if let Some(cached) = self.idempotency.get(id) {
            return Err(cached);
        }
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().expect("correlator mutex poisoned");
        pending.entry(id.to_string()).or_default().push(tx);
        Ok(rx)
    }

    /// Completes every waiter registered for `id` with `response`, and
    /// caches the response for late/duplicate lookups.
    pub fn complete(&self, response: Response) {
        self.idempotency.insert(response.id.clone(), response.clone());
        let waiters = {
            let mut pending = self.pending.lock().expect("correlator mutex poisoned");
            pending.remove(&response.id).unwrap_or_default()
        };
        for waiter in waiters {
            let _ = waiter.send(response.clone());
        }
    }

    /// Drops the waiter registration for `id` without caching a response;
    /// used when the operation-class timer fires first. The request stays
    /// out of the idempotency cache until (if ever) a late response arrives
    /// and is cached by `complete`.
    pub fn forget(&self, id: &str) {
        let mut pending = self.pending.lock().expect("correlator mutex poisoned");
        pending.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_id_is_replaced_with_a_fresh_uuid() {
        let id = normalize_request_id(None).unwrap();
        assert_eq!(id.len(), 36);
    }

    #[test]
    fn a_36_char_non_uuid_is_rejected() {
        let id = "x".repeat(36);
        assert!(normalize_request_id(Some(&id)).is_err());
    }

    #[test]
    fn arbitrary_short_id_is_accepted_verbatim() {
        let id = normalize_request_id(Some("client-local-42")).unwrap();
        assert_eq!(id, "client-local-42");
    }

    #[test]
    fn over_64_chars_is_rejected() {
        let id = "x".repeat(65);
        assert!(normalize_request_id(Some(&id)).is_err());
    }

    #[test]
    fn incr_on_missing_key_treats_it_as_zero() {
        assert_eq!(checked_incr(None, 5).unwrap(), 5);
    }

    #[test]
    fn incr_overflow_is_rejected() {
        assert!(checked_incr(Some("9000000000000000"), 1).is_err());
    }

    #[test]
    fn leading_zeros_parse_but_are_not_emitted() {
        assert_eq!(parse_numeric("007").unwrap(), 7);
    }

    #[test]
    fn mget_over_the_key_limit_is_rejected() {
        let keys: Vec<String> = (0..300).map(|i| format!("k{i}")).collect();
        let cmd = Command::MGet { keys };
        assert!(cmd.validate().is_err());
    }

    #[test]
    fn idempotency_cache_returns_the_same_response_until_ttl_expires() {
        let cache = IdempotencyCache::new(10, Duration::from_millis(50));
        let response = Response::ok("id-1", Some("v".into()));
        cache.insert("id-1".into(), response.clone());
        assert_eq!(cache.get("id-1"), Some(response));
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(cache.get("id-1"), None);
    }

    #[tokio::test]
    async fn correlator_coalesces_duplicate_in_flight_ids() {
        let correlator = Correlator::new(100, Duration::from_secs(600));
        let rx1 = correlator.register("dup").unwrap();
        let rx2 = correlator.register("dup").unwrap();
        correlator.complete(Response::ok("dup", Some("value".into())));
        assert_eq!(rx1.await.unwrap().value, Some("value".into()));
        assert_eq!(rx2.await.unwrap().value, Some("value".into()));
    }

    #[test]
    fn second_register_after_completion_hits_the_idempotency_cache() {
        let correlator = Correlator::new(100, Duration::from_secs(600));
        let _rx = correlator.register("id-2").unwrap();
        correlator.complete(Response::ok("id-2", Some("v".into())));
        let replay = correlator.register("id-2");
        assert!(replay.is_err());
    }
}
