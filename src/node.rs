//! # Node façade
//!
//! One long-lived struct owning the storage engine, sequencer, outbox,
//! applicator, Merkle tree, sync manager, and a metrics block, with a single
//! `run()` entry point that subscribes to the bus and dispatches incoming
//! messages to command handling, replication, or anti-entropy. Local writes
//! mutate storage and release the lock before anything is enqueued for
//! replication, so readers are never blocked behind a publish.

use crate::codec;
use crate::command::{
    checked_incr, normalize_request_id, Command, Correlator, Request, Response, MAX_MGET_KEYS,
};
use crate::config::NodeConfig;
use crate::connection::{
    command_topic, replication_topic, response_topic, sync_keys_request_topic, sync_keys_response_topic,
    sync_request_topic, sync_response_topic, BusClient, IncomingMessage, MqttBusClient,
};
use crate::error::{MerkleKvError, Result};
use crate::metrics::NodeMetrics;
use crate::model::StorageEntry;
use crate::outbox::Outbox;
use crate::replication::{Applicator, Publisher};
use crate::sequencer::Sequencer;
use crate::store::persistence;
use crate::store::{MemoryEngine, MerkleTree, StorageEngine};
use crate::sync::{SyncKeysRequest, SyncKeysResponse, SyncManager, SyncRequest, SyncResponse};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

const IDEMPOTENCY_CAPACITY: usize = 10_000;
const IDEMPOTENCY_TTL: Duration = Duration::from_secs(600);
const PUBLISH_BACKOFF: Duration = Duration::from_millis(500);
const TOMBSTONE_GC_INTERVAL: Duration = Duration::from_secs(3600);

/// A single peer node. Owns local storage, the replication pipeline, the
/// Merkle tree, and the anti-entropy manager, and drives all of their
/// background loops once `run` is called.
pub struct Node {
    config: NodeConfig,
    storage: Arc<dyn StorageEngine>,
    merkle: Arc<AsyncMutex<MerkleTree>>,
    sequencer: Arc<Sequencer>,
    outbox: Arc<Outbox>,
    applicator: Arc<Applicator>,
    publisher: Publisher,
    sync_manager: Arc<SyncManager>,
    correlator: Arc<Correlator>,
    bus: Arc<dyn BusClient>,
    metrics: Arc<NodeMetrics>,
}

impl Node {
    /// Builds a node backed by a real MQTT bus.
    pub async fn connect(config: NodeConfig) -> Result<Arc<Self>> {
        let bus = Arc::new(MqttBusClient::connect_new(&config)?);
        Self::with_bus(config, bus).await
    }

    /// Builds a node against an arbitrary `BusClient`, e.g. an in-memory
    /// double in tests.
    pub async fn with_bus(config: NodeConfig, bus: Arc<dyn BusClient>) -> Result<Arc<Self>> {
        let mut memory = MemoryEngine::new();

        if config.persistence_enabled {
            let path = storage_log_path(&config)?;
            let (entries, skipped) = persistence::load(&path)?;
            if skipped > 0 {
                log::warn!("discarded {skipped} corrupt persisted entries for node {}", config.node_id);
            }
            memory = memory.with_persistence(path);
            memory.load_raw(entries).await;
        }
        let storage: Arc<dyn StorageEngine> = Arc::new(memory);

        let sequencer = Arc::new(if config.persistence_enabled {
            Sequencer::load(&sequencer_path(&config)?)
        } else {
            Sequencer::in_memory()
        });

        let merkle = {
            let mut tree = MerkleTree::new();
            let entries = storage.scan().await;
            tree.rebuild_from_storage(&entries);
            Arc::new(AsyncMutex::new(tree))
        };

        let outbox = Arc::new(if config.persistence_enabled {
            Outbox::with_mirror(config.outbox_capacity, outbox_mirror_path(&config)?)
        } else {
            Outbox::new(config.outbox_capacity)
        });
        outbox.replay_mirror().await?;

        let applicator = Arc::new(Applicator::new(
            config.dedup_capacity,
            Duration::from_millis(config.dedup_ttl_ms),
        ));
        let publisher = Publisher::new(config.normalized_topic_prefix());
        let sync_manager = Arc::new(SyncManager::new(
            config.node_id.clone(),
            config.normalized_topic_prefix(),
            config.ae_requests_per_second,
            config.ae_bucket,
        ));
        let correlator = Arc::new(Correlator::new(IDEMPOTENCY_CAPACITY, IDEMPOTENCY_TTL));
        let metrics = Arc::new(NodeMetrics::new());

        Ok(Arc::new(Self {
            config,
            storage,
            merkle,
            sequencer,
            outbox,
            applicator,
            publisher,
            sync_manager,
            correlator,
            bus,
            metrics,
        }))
    }

    pub fn metrics(&self) -> Arc<NodeMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Forwards the host app's background transition to the bus client so
    /// it can disconnect gracefully instead of leaving a dead socket for
    /// the broker's keep-alive to notice.
    pub async fn on_background(&self) -> Result<()> {
        self.bus.on_background().await
    }

    /// Forwards the host app's foreground transition to the bus client so
    /// it reconnects immediately with a reset backoff.
    pub async fn on_foreground(&self) -> Result<()> {
        self.bus.on_foreground().await
    }

    /// Subscribes to this node's topics and runs every background loop
    /// until the process is torn down: accept incoming messages forever,
    /// spawning a task per message so a slow handler never stalls the rest.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let prefix = self.config.normalized_topic_prefix();
        self.bus.connect().await?;
        self.bus.subscribe(&command_topic(&prefix, &self.config.client_id)).await?;
        self.bus.subscribe(&replication_topic(&prefix)).await?;
        self.bus.subscribe(&sync_request_topic(&prefix, &self.config.node_id)).await?;
        self.bus.subscribe(&sync_response_topic(&prefix, &self.config.node_id)).await?;
        self.bus.subscribe(&sync_keys_request_topic(&prefix, &self.config.node_id)).await?;
        self.bus.subscribe(&sync_keys_response_topic(&prefix, &self.config.node_id)).await?;

        let publish_node = Arc::clone(&self);
        tokio::spawn(async move {
            publish_node.publisher.drain_forever(&publish_node.outbox, publish_node.bus.as_ref(), PUBLISH_BACKOFF, &publish_node.metrics).await;
        });

        let gc_node = Arc::clone(&self);
        tokio::spawn(async move { gc_node.tombstone_gc_loop().await });

        if !self.config.peer_node_ids.is_empty() {
            let ae_node = Arc::clone(&self);
            tokio::spawn(async move { ae_node.anti_entropy_loop().await });
        }

        let mut incoming = self.bus.incoming();
        loop {
            match incoming.recv().await {
                Ok(message) => {
                    let node = Arc::clone(&self);
                    tokio::spawn(async move { node.dispatch(message).await });
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, message: IncomingMessage) {
        let prefix = self.config.normalized_topic_prefix();
        if message.topic == command_topic(&prefix, &self.config.client_id) {
            self.handle_command_message(&message.payload).await;
        } else if message.topic == replication_topic(&prefix) {
            let _ = self
                .applicator
                .apply_event(&message.payload, now_ms(), self.config.skew_max_future_ms, self.storage.as_ref(), &self.metrics)
                .await;
            self.rebuild_merkle_from_storage().await;
        } else if message.topic == sync_request_topic(&prefix, &self.config.node_id) {
            self.handle_sync_request_message(&message.payload).await;
        } else if message.topic == sync_response_topic(&prefix, &self.config.node_id) {
            if let Ok(response) = serde_json::from_slice::<SyncResponse>(&message.payload) {
                self.sync_manager.deliver_sync_response(response);
            }
        } else if message.topic == sync_keys_request_topic(&prefix, &self.config.node_id) {
            self.handle_sync_keys_request_message(&message.payload).await;
        } else if message.topic == sync_keys_response_topic(&prefix, &self.config.node_id) {
            if let Ok(response) = serde_json::from_slice::<SyncKeysResponse>(&message.payload) {
                self.sync_manager.deliver_sync_keys_response(response);
            }
        }
    }

    async fn handle_sync_request_message(&self, payload: &[u8]) {
        let Ok(request) = serde_json::from_slice::<SyncRequest>(payload) else { return };
        let response = {
            let merkle = self.merkle.lock().await;
            self.sync_manager.handle_sync_request(&request, &merkle)
        };
        if let Ok(bytes) = serde_json::to_vec(&response) {
            let topic = sync_response_topic(&self.config.normalized_topic_prefix(), &request.source_node_id);
            let _ = self.bus.publish(&topic, bytes).await;
        }
    }

    async fn handle_sync_keys_request_message(&self, payload: &[u8]) {
        let Ok(request) = serde_json::from_slice::<SyncKeysRequest>(payload) else { return };
        if let Ok(response) = self.sync_manager.handle_sync_keys_request(&request, self.storage.as_ref()).await {
            self.rebuild_merkle_from_storage().await;
            if let Ok(bytes) = serde_json::to_vec(&response) {
                let topic = sync_keys_response_topic(&self.config.normalized_topic_prefix(), &request.source_node_id);
                let _ = self.bus.publish(&topic, bytes).await;
            }
        }
    }

    /// Executes one `Request`/`Response` cycle against local storage. The
    /// mutation commands (`Set`/`Delete`/`Incr`/`Decr`/`Append`/`Prepend`/
    /// `MSet`) allocate a sequence number, apply the write locally, and only
    /// then enqueue the encoded change event to the outbox for replication.
    ///
    /// The command runs on a detached task so an operation-class timeout
    /// (`Command::timeout_class`) can race it: if the timer wins, the
    /// waiter is forgotten and a `Timeout` response returned to the caller,
    /// but the task keeps running and its eventual response still reaches
    /// `on_response`, so a late duplicate of the same id still replays the
    /// real outcome instead of a stale timeout.
    pub async fn execute(self: &Arc<Self>, request: Request) -> Response {
        NodeMetrics::incr(&self.metrics.commands_total);
        let id = match normalize_request_id(Some(&request.id)) {
            Ok(id) => id,
            Err(e) => return Response::error(&request.id, &e),
        };
        if let Err(e) = request.command.validate() {
            return Response::error(&id, &e);
        }

        let rx = match self.correlator.register(&id) {
            Ok(rx) => rx,
            Err(mut cached) => {
                NodeMetrics::incr(&self.metrics.commands_idempotent_replay);
                cached.error_code = Some(crate::error::error_code::IDEMPOTENT_REPLAY);
                return cached;
            }
        };

        let timeout = request.command.timeout_class().duration();
        let node = Arc::clone(self);
        let task_id = id.clone();
        tokio::spawn(async move {
            let response = node.execute_command(&task_id, request.command).await;
            node.on_response(response);
        });

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => Response::error(&id, &MerkleKvError::InternalError("response channel dropped".into())),
            Err(_) => {
                NodeMetrics::incr(&self.metrics.commands_timed_out);
                self.correlator.forget(&id);
                Response::error(&id, &MerkleKvError::Timeout)
            }
        }
    }

    /// Records a command's outcome: completes any waiter registered for its
    /// id and caches the response for idempotent replay, even if the
    /// waiter already gave up after an operation-class timeout.
    fn on_response(&self, response: Response) {
        self.correlator.complete(response);
    }

    async fn execute_command(&self, id: &str, command: Command) -> Response {
        match command {
            Command::Get { key } => match self.storage.get(&key).await {
                Some(value) => Response::ok(id, Some(value)),
                None => Response::not_found(id),
            },
            Command::Set { key, value } => {
                let entry = self.next_local_entry_live(&key, value);
                self.apply_and_publish(id, entry).await
            }
            Command::Delete { key } => {
                let (timestamp_ms, node_id, seq) = self.version_for_local_write();
                let entry = StorageEntry::tombstone(&key, timestamp_ms, node_id, seq);
                self.apply_and_publish(id, entry).await
            }
            Command::Incr { key, delta } => self.apply_numeric(id, &key, delta).await,
            Command::Decr { key, delta } => self.apply_numeric(id, &key, -delta).await,
            Command::Append { key, suffix } => self.apply_concat(id, &key, &suffix, false).await,
            Command::Prepend { key, prefix } => self.apply_concat(id, &key, &prefix, true).await,
            Command::MGet { keys } => {
                if keys.len() > MAX_MGET_KEYS {
                    return Response::error(id, &MerkleKvError::InvalidRequest("too many keys".into()));
                }
                let mut results = std::collections::HashMap::new();
                for key in keys {
                    if let Some(value) = self.storage.get(&key).await {
                        results.insert(key, value);
                    }
                }
                Response { id: id.to_string(), status: crate::command::ResponseStatus::Ok, value: None, error: None, error_code: None, results: Some(results) }
            }
            Command::MSet { map } => {
                for (key, value) in map {
                    let entry = self.next_local_entry_live(&key, value);
                    if let Err(e) = self.apply_and_enqueue(entry).await {
                        return Response::error(id, &e);
                    }
                }
                Response::ok(id, None)
            }
            Command::Sync { target_node_id } => self.run_sync(id, &target_node_id).await,
            Command::SyncKeys { target_node_id, keys: _ } => self.run_sync(id, &target_node_id).await,
        }
    }

    async fn run_sync(&self, id: &str, target_node_id: &str) -> Response {
        let merkle = self.merkle.lock().await;
        let outcome = self
            .sync_manager
            .initiate_sync(target_node_id, self.bus.as_ref(), &merkle, self.storage.as_ref(), self.config.ae_timeout_ms, &self.metrics)
            .await;
        drop(merkle);
        match outcome {
            Ok(_) => {
                self.rebuild_merkle_from_storage().await;
                Response::ok(id, None)
            }
            Err(e) => Response::error(id, &e),
        }
    }

    async fn apply_numeric(&self, id: &str, key: &str, delta: i64) -> Response {
        let current = self.storage.get(key).await;
        let new_value = match checked_incr(current.as_deref(), delta) {
            Ok(value) => value,
            Err(e) => return Response::error(id, &e),
        };
        let entry = self.next_local_entry_live(key, new_value.to_string());
        self.apply_and_publish_with_value(id, entry, new_value.to_string()).await
    }

    async fn apply_concat(&self, id: &str, key: &str, addition: &str, prepend: bool) -> Response {
        let current = self.storage.get(key).await.unwrap_or_default();
        let new_value = if prepend { format!("{addition}{current}") } else { format!("{current}{addition}") };
        let entry = self.next_local_entry_live(key, new_value.clone());
        self.apply_and_publish_with_value(id, entry, new_value).await
    }

    async fn apply_and_publish(&self, id: &str, entry: StorageEntry) -> Response {
        match self.apply_and_enqueue(entry).await {
            Ok(()) => Response::ok(id, None),
            Err(e) => Response::error(id, &e),
        }
    }

    async fn apply_and_publish_with_value(&self, id: &str, entry: StorageEntry, value: String) -> Response {
        match self.apply_and_enqueue(entry).await {
            Ok(()) => Response::ok(id, Some(value)),
            Err(e) => Response::error(id, &e),
        }
    }

    async fn apply_and_enqueue(&self, entry: StorageEntry) -> Result<()> {
        let accepted = self.storage.put(entry.clone()).await?;
        if !accepted {
            return Ok(());
        }
        let encoded = codec::encode_change_event(&entry)?;
        self.outbox.enqueue(encoded).await?;
        self.rebuild_merkle_from_storage().await;
        Ok(())
    }

    fn next_local_entry_live(&self, key: &str, value: impl Into<String>) -> StorageEntry {
        let (timestamp_ms, node_id, seq) = self.version_for_local_write();
        StorageEntry::live(key, value, timestamp_ms, node_id, seq)
    }

    fn version_for_local_write(&self) -> (i64, &str, i64) {
        let seq = self.sequencer.next().unwrap_or_else(|_| self.sequencer.current());
        (now_ms(), self.config.node_id.as_str(), seq)
    }

    async fn rebuild_merkle_from_storage(&self) {
        let entries = self.storage.scan().await;
        let mut tree = self.merkle.lock().await;
        let before = tree.root_hash();
        tree.rebuild_from_storage(&entries);
        if tree.root_hash() != before {
            NodeMetrics::incr(&self.metrics.merkle_root_hash_changes);
        }
    }

    async fn handle_command_message(self: &Arc<Self>, payload: &[u8]) {
        let request: Request = match serde_json::from_slice(payload) {
            Ok(request) => request,
            Err(e) => {
                log::warn!("dropping malformed command payload: {e}");
                return;
            }
        };
        let response = self.execute(request).await;
        if let Ok(bytes) = serde_json::to_vec(&response) {
            let topic = response_topic(&self.config.normalized_topic_prefix(), &self.config.client_id);
            let _ = self.bus.publish(&topic, bytes).await;
        }
    }

    async fn tombstone_gc_loop(&self) {
        let retention_ms = self.config.tombstone_retention_hours as i64 * 3_600_000;
        loop {
            tokio::time::sleep(TOMBSTONE_GC_INTERVAL).await;
            let removed = self.storage.gc_tombstones(now_ms(), retention_ms).await;
            if removed > 0 {
                self.rebuild_merkle_from_storage().await;
            }
        }
    }

    async fn anti_entropy_loop(&self) {
        loop {
            tokio::time::sleep(Duration::from_secs(self.config.ae_sync_interval_seconds)).await;
            for peer in &self.config.peer_node_ids {
                let merkle = self.merkle.lock().await;
                let result = self
                    .sync_manager
                    .initiate_sync(peer, self.bus.as_ref(), &merkle, self.storage.as_ref(), self.config.ae_timeout_ms, &self.metrics)
                    .await;
                drop(merkle);
                if let Err(e) = result {
                    log::warn!("anti-entropy round with {peer} failed: {e}");
                } else {
                    self.rebuild_merkle_from_storage().await;
                }
            }
        }
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn storage_log_path(config: &NodeConfig) -> Result<PathBuf> {
    let base = config
        .storage_path
        .as_ref()
        .ok_or_else(|| MerkleKvError::InvalidConfiguration("storage_path required when persistence_enabled".into()))?;
    Ok(PathBuf::from(base).join("store.log"))
}

fn sequencer_path(config: &NodeConfig) -> Result<PathBuf> {
    let base = config
        .storage_path
        .as_ref()
        .ok_or_else(|| MerkleKvError::InvalidConfiguration("storage_path required when persistence_enabled".into()))?;
    Ok(PathBuf::from(base).join("sequencer.state"))
}

fn outbox_mirror_path(config: &NodeConfig) -> Result<PathBuf> {
    let base = config
        .storage_path
        .as_ref()
        .ok_or_else(|| MerkleKvError::InvalidConfiguration("storage_path required when persistence_enabled".into()))?;
    Ok(PathBuf::from(base).join("outbox.mirror"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionEvent;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::broadcast;

    /// An in-process `BusClient` double that records every `publish` call
    /// so tests can assert on outgoing traffic without a real MQTT broker.
    struct LoopbackBus {
        incoming_tx: broadcast::Sender<IncomingMessage>,
        published: StdMutex<Vec<(String, Vec<u8>)>>,
    }

    impl LoopbackBus {
        fn new() -> Self {
            let (incoming_tx, _) = broadcast::channel(256);
            Self { incoming_tx, published: StdMutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl BusClient for LoopbackBus {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }
        async fn disconnect(&self, _suppress_lwt: bool) -> Result<()> {
            Ok(())
        }
        async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
            self.published.lock().unwrap().push((topic.to_string(), payload));
            Ok(())
        }
        async fn subscribe(&self, _topic: &str) -> Result<()> {
            Ok(())
        }
        fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
            let (_tx, rx) = broadcast::channel(1);
            rx
        }
        fn incoming(&self) -> broadcast::Receiver<IncomingMessage> {
            self.incoming_tx.subscribe()
        }
        async fn on_background(&self) -> Result<()> {
            Ok(())
        }
        async fn on_foreground(&self) -> Result<()> {
            Ok(())
        }
    }

    fn test_config() -> NodeConfig {
        toml_config(
            r#"
client_id = "client-a"
node_id = "node-a"
"#,
        )
    }

    fn toml_config(contents: &str) -> NodeConfig {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "{contents}").unwrap();
        NodeConfig::load(file.path()).unwrap()
    }

    async fn test_node() -> Arc<Node> {
        let bus = Arc::new(LoopbackBus::new());
        Node::with_bus(test_config(), bus).await.unwrap()
    }

    #[tokio::test]
    async fn set_then_get_round_trips_through_execute() {
        let node = test_node().await;
        let set = Request { id: "r1".into(), command: Command::Set { key: "k".into(), value: "v".into() } };
        let response = node.execute(set).await;
        assert_eq!(response.status, crate::command::ResponseStatus::Ok);

        let get = Request { id: "r2".into(), command: Command::Get { key: "k".into() } };
        let response = node.execute(get).await;
        assert_eq!(response.value, Some("v".to_string()));
    }

    #[tokio::test]
    async fn get_on_missing_key_is_not_found() {
        let node = test_node().await;
        let get = Request { id: "r1".into(), command: Command::Get { key: "missing".into() } };
        let response = node.execute(get).await;
        assert_eq!(response.status, crate::command::ResponseStatus::NotFound);
    }

    #[tokio::test]
    async fn duplicate_request_id_replays_the_cached_response() {
        let node = test_node().await;
        let set = Request { id: "dup".into(), command: Command::Set { key: "k".into(), value: "v1".into() } };
        let first = node.execute(set.clone()).await;
        assert_eq!(first.error_code, None);

        let replay = node.execute(set).await;
        assert_eq!(replay.status, first.status);
        assert_eq!(replay.value, first.value);
        assert_eq!(replay.error_code, Some(crate::error::error_code::IDEMPOTENT_REPLAY));
    }

    #[tokio::test]
    async fn incr_on_a_fresh_key_starts_from_zero() {
        let node = test_node().await;
        let incr = Request { id: "r1".into(), command: Command::Incr { key: "counter".into(), delta: 5 } };
        let response = node.execute(incr).await;
        assert_eq!(response.value, Some("5".to_string()));
    }

    #[tokio::test]
    async fn delete_then_get_is_not_found() {
        let node = test_node().await;
        node.execute(Request { id: "r1".into(), command: Command::Set { key: "k".into(), value: "v".into() } }).await;
        node.execute(Request { id: "r2".into(), command: Command::Delete { key: "k".into() } }).await;
        let response = node.execute(Request { id: "r3".into(), command: Command::Get { key: "k".into() } }).await;
        assert_eq!(response.status, crate::command::ResponseStatus::NotFound);
    }

    #[tokio::test]
    async fn a_successful_write_enqueues_a_change_event_for_replication() {
        let node = test_node().await;
        node.execute(Request { id: "r1".into(), command: Command::Set { key: "k".into(), value: "v".into() } }).await;
        assert_eq!(node.outbox.len().await, 1);
    }

    #[tokio::test]
    async fn mset_applies_every_pair() {
        let node = test_node().await;
        let mut map = std::collections::HashMap::new();
        map.insert("a".to_string(), "1".to_string());
        map.insert("b".to_string(), "2".to_string());
        let response = node.execute(Request { id: "r1".into(), command: Command::MSet { map } }).await;
        assert_eq!(response.status, crate::command::ResponseStatus::Ok);
        assert_eq!(node.storage.get("a").await, Some("1".to_string()));
        assert_eq!(node.storage.get("b").await, Some("2".to_string()));
    }

    #[tokio::test]
    async fn background_and_foreground_hooks_forward_to_the_bus() {
        let node = test_node().await;
        node.on_background().await.unwrap();
        node.on_foreground().await.unwrap();
    }
}
