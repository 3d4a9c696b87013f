//! # Per-node sequence counter
//!
//! A single 64-bit counter for the local `node_id`. `next()` persists the
//! new value before returning it, so a crash between incrementing in memory
//! and persisting can never hand out a sequence the disk doesn't know about;
//! on restart the persisted value is reloaded, and a missing or corrupt file
//! restarts the counter at 0. The same "persist before return" discipline is
//! used for the outbox and storage mirrors elsewhere in the crate.

use crate::error::{MerkleKvError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

pub struct Sequencer {
    current: AtomicI64,
    persist_path: Option<PathBuf>,
}

impl Sequencer {
    /// Creates a sequencer with no persistence; `next()` only tracks state
    /// in memory. Used for tests and for nodes configured without
    /// persistence enabled.
    pub fn in_memory() -> Self {
        Self {
            current: AtomicI64::new(0),
            persist_path: None,
        }
    }

    /// Loads the counter from `path` if present; a missing or corrupt file
    /// starts the counter at 0.
    pub fn load(path: &Path) -> Self {
        let current = fs::read_to_string(path)
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok())
            .unwrap_or(0);
        Self {
            current: AtomicI64::new(current),
            persist_path: Some(path.to_path_buf()),
        }
    }

    /// Returns `current + 1`, persisting the new value before returning it.
    /// The next sequence issued after a crash is guaranteed strictly greater
    /// than any sequence this node already emitted, because the persisted
    /// value is always written before the call returns.
    pub fn next(&self) -> Result<i64> {
        let value = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(path) = &self.persist_path {
            persist(path, value)?;
        }
        Ok(value)
    }

    pub fn current(&self) -> i64 {
        self.current.load(Ordering::SeqCst)
    }
}

fn persist(path: &Path, value: i64) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| MerkleKvError::StorageFailure(e.to_string()))?;
        }
    }
    let tmp_path = {
        let mut tmp = path.to_path_buf();
        let file_name = tmp.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        tmp.set_file_name(format!("{file_name}.tmp"));
        tmp
    };
    fs::write(&tmp_path, value.to_string()).map_err(|e| MerkleKvError::StorageFailure(e.to_string()))?;
    if fs::rename(&tmp_path, path).is_err() {
        fs::copy(&tmp_path, path).map_err(|e| MerkleKvError::StorageFailure(e.to_string()))?;
        let _ = fs::remove_file(&tmp_path);
    }
    Ok(())
}
