//! # MerkleKV - Distributed Key-Value Store
//!
//! A node in a distributed, eventually consistent key-value store that uses
//! Merkle trees for efficient anti-entropy synchronization over an MQTT bus.
//!
//! ## Architecture Overview
//!
//! - **Storage Engine**: in-memory LWW key-value store with an optional
//!   append-only persistence mirror.
//! - **Merkle Tree**: hash tree over storage, rebuilt incrementally, used to
//!   detect divergence between nodes without transferring full state.
//! - **Command Layer**: request/response cycle over the bus, with
//!   idempotency and per-class timeouts.
//! - **Replication**: change events published to and consumed from a shared
//!   topic, deduplicated by `(node_id, seq)`.
//! - **Sync Manager**: two-round SYNC/SYNC_KEYS anti-entropy protocol.

use clap::Parser;
use merkle_kv::config::NodeConfig;
use merkle_kv::node::Node;
use std::path::PathBuf;

/// MerkleKV node binary.
#[derive(Parser, Debug)]
#[command(name = "merkle_kv", about = "A distributed key-value store with Merkle tree synchronization")]
struct Cli {
    /// Path to the node's TOML configuration file.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let config = NodeConfig::load(&cli.config)?;
    log::info!("starting node {} (client_id={})", config.node_id, config.client_id);

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(async {
        let node = Node::connect(config).await?;
        node.run().await?;
        Ok(())
    })
}
