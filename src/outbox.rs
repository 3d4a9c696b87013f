//! # Outbox
//!
//! A bounded FIFO of encoded change events awaiting publish, with
//! drop-oldest overflow and a loss counter. The optional persistence mirror
//! reuses the same "temp-file-then-rename" idiom as `store::persistence`.

use crate::error::{MerkleKvError, Result};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Clone)]
pub struct OutboxRecord {
    pub encoded_bytes: Vec<u8>,
    pub attempts: u32,
    pub next_attempt_at: Instant,
}

impl OutboxRecord {
    fn fresh(encoded_bytes: Vec<u8>) -> Self {
        Self {
            encoded_bytes,
            attempts: 0,
            next_attempt_at: Instant::now(),
        }
    }
}

/// A single-writer FIFO: one publish loop owns `pop_ready`/`requeue_front`,
/// any number of producers call `enqueue`.
pub struct Outbox {
    capacity: usize,
    queue: Mutex<VecDeque<OutboxRecord>>,
    mirror_path: Option<PathBuf>,
    dropped: std::sync::atomic::AtomicU64,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: if capacity == 0 { DEFAULT_CAPACITY } else { capacity },
            queue: Mutex::new(VecDeque::new()),
            mirror_path: None,
            dropped: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn with_mirror(capacity: usize, mirror_path: PathBuf) -> Self {
        Self {
            mirror_path: Some(mirror_path),
            ..Self::new(capacity)
        }
    }

    /// Replays the persistence mirror into the queue; call once at startup
    /// before new events are enqueued. A leading `-` line is a published
    /// marker, written in file order as each record is drained, so it
    /// retires the oldest record still pending in the replay instead of
    /// just being skipped. Without that, every event ever enqueued would
    /// re-publish on every restart.
    pub async fn replay_mirror(&self) -> Result<usize> {
        let Some(path) = &self.mirror_path else { return Ok(0) };
        if !path.exists() {
            return Ok(0);
        }
        let file = File::open(path).map_err(|e| MerkleKvError::StorageFailure(e.to_string()))?;
        let reader = BufReader::new(file);
        let mut pending: VecDeque<OutboxRecord> = VecDeque::new();
        for line in reader.lines() {
            let line = line.map_err(|e| MerkleKvError::StorageFailure(e.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            if line.starts_with('-') {
                pending.pop_front();
                continue;
            }
            if let Ok(bytes) = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &line) {
                pending.push_back(OutboxRecord::fresh(bytes));
            }
        }
        let replayed = pending.len();
        let mut queue = self.queue.lock().await;
        queue.extend(pending);
        Ok(replayed)
    }

    /// Enqueues an already-encoded event. On overflow, drops the oldest
    /// record and increments the loss counter.
    pub async fn enqueue(&self, encoded_bytes: Vec<u8>) -> Result<()> {
        if let Some(path) = &self.mirror_path {
            append_mirror_line(path, &encoded_bytes)?;
        }
        let mut queue = self.queue.lock().await;
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        queue.push_back(OutboxRecord::fresh(encoded_bytes));
        Ok(())
    }

    /// Returns the head record if it is due for an attempt (`next_attempt_at`
    /// has passed), without removing it.
    pub async fn peek_ready(&self) -> Option<OutboxRecord> {
        let queue = self.queue.lock().await;
        match queue.front() {
            Some(record) if record.next_attempt_at <= Instant::now() => Some(record.clone()),
            _ => None,
        }
    }

    /// Removes the head record after a successful publish, and appends a
    /// `-` marker to the mirror so a restart doesn't re-enqueue it.
    pub async fn pop_published(&self) {
        let mut queue = self.queue.lock().await;
        let popped = queue.pop_front().is_some();
        drop(queue);
        if popped {
            if let Some(path) = &self.mirror_path {
                if let Err(e) = append_mirror_marker(path) {
                    log::warn!("failed to append outbox publish marker: {e}");
                }
            }
        }
    }

    /// Re-queues the head record after a failed publish attempt, bumping
    /// its attempt count and scheduling the next attempt after `backoff`.
    pub async fn requeue_front_with_backoff(&self, backoff: Duration) {
        let mut queue = self.queue.lock().await;
        if let Some(record) = queue.front_mut() {
            record.attempts += 1;
            record.next_attempt_at = Instant::now() + backoff;
        }
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(std::sync::atomic::Ordering::Relaxed)
    }
}

fn append_mirror_line(path: &Path, encoded_bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| MerkleKvError::StorageFailure(e.to_string()))?;
        }
    }
    let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, encoded_bytes);
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| MerkleKvError::StorageFailure(e.to_string()))?;
    writeln!(file, "{encoded}").map_err(|e| MerkleKvError::StorageFailure(e.to_string()))?;
    Ok(())
}

fn append_mirror_marker(path: &Path) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| MerkleKvError::StorageFailure(e.to_string()))?;
    writeln!(file, "-").map_err(|e| MerkleKvError::StorageFailure(e.to_string()))?;
    Ok(())
}
