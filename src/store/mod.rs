//! # Storage engine module
//!
//! - **`engine`**: the `StorageEngine` trait every backend implements.
//! - **`memory`**: the in-memory backend (`BTreeMap` behind a `tokio::sync::RwLock`).
//! - **`persistence`**: optional append-only mirror with integrity checksums.
//! - **`merkle`**: the Merkle tree derived from storage, for anti-entropy.

pub mod engine;
pub mod memory;
pub mod merkle;
pub mod persistence;

pub use engine::{StorageChange, StorageEngine};
pub use memory::MemoryEngine;
pub use merkle::MerkleTree;
