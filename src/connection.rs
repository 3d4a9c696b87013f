//! # Connection lifecycle
//!
//! `BusClient` is the async-trait seam between this crate's protocol logic
//! and a concrete pub/sub transport. `MqttBusClient` is the one real
//! implementation, built on `rumqttc`; `async-trait` lets a same-process
//! in-memory double satisfy the same interface for tests.
//!
//! The connection state machine drives reconnect with exponential backoff
//! and jitter, and publishes a last-will-and-testament payload so peers can
//! detect an ungraceful disconnect.

use crate::error::{MerkleKvError, Result};
use crate::config::NodeConfig;
use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub state: ConnectionState,
    pub reason: String,
    pub error: Option<String>,
}

/// A message arriving on any topic this client has subscribed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// The transport seam. A `rumqttc`-backed implementation and an in-memory
/// test double both satisfy this.
#[async_trait]
pub trait BusClient: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self, suppress_lwt: bool) -> Result<()>;
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
    async fn subscribe(&self, topic: &str) -> Result<()>;
    fn events(&self) -> broadcast::Receiver<ConnectionEvent>;
    fn incoming(&self) -> broadcast::Receiver<IncomingMessage>;

    /// Called when the host app moves to the background. Disconnects
    /// gracefully rather than waiting for the broker to notice a dead
    /// socket via keep-alive.
    async fn on_background(&self) -> Result<()>;

    /// Called when the host app returns to the foreground. Resets the
    /// reconnect backoff and reconnects immediately instead of waiting out
    /// whatever delay a background disconnect left pending.
    async fn on_foreground(&self) -> Result<()>;
}

/// Exponential backoff starting at 1s, doubling to a 32s cap, with ±20%
/// uniform jitter per attempt.
pub struct ReconnectBackoff {
    attempt: AtomicU32,
}

impl ReconnectBackoff {
    const BASE: Duration = Duration::from_secs(1);
    const CAP: Duration = Duration::from_secs(32);

    pub fn new() -> Self {
        Self { attempt: AtomicU32::new(0) }
    }

    pub fn reset(&self) {
        self.attempt.store(0, Ordering::SeqCst);
    }

    /// Computes the next wait duration and advances the internal attempt
    /// counter.
    pub fn next_delay(&self) -> Duration {
        let attempt = self.attempt.fetch_add(1, Ordering::SeqCst);
        let base_secs = (Self::BASE.as_secs_f64() * 2f64.powi(attempt as i32)).min(Self::CAP.as_secs_f64());
        let jitter_fraction = rand::thread_rng().gen_range(-0.2..=0.2);
        let jittered = (base_secs * (1.0 + jitter_fraction)).max(0.0);
        Duration::from_secs_f64(jittered)
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Last-will-and-testament payload published by the broker if this client
/// disconnects ungracefully.
pub fn last_will_payload(now_ms: i64) -> Vec<u8> {
    serde_json::json!({ "status": "offline", "timestamp_ms": now_ms })
        .to_string()
        .into_bytes()
}

pub fn response_topic(topic_prefix: &str, client_id: &str) -> String {
    format!("{topic_prefix}/{client_id}/res")
}

pub fn command_topic(topic_prefix: &str, client_id: &str) -> String {
    format!("{topic_prefix}/{client_id}/cmd")
}

pub fn replication_topic(topic_prefix: &str) -> String {
    format!("{topic_prefix}/replication/events")
}

pub fn sync_request_topic(topic_prefix: &str, target_node_id: &str) -> String {
    format!("{topic_prefix}/{target_node_id}/sync/request")
}

pub fn sync_response_topic(topic_prefix: &str, target_node_id: &str) -> String {
    format!("{topic_prefix}/{target_node_id}/sync/response")
}

pub fn sync_keys_request_topic(topic_prefix: &str, target_node_id: &str) -> String {
    format!("{topic_prefix}/{target_node_id}/sync_keys/request")
}

pub fn sync_keys_response_topic(topic_prefix: &str, target_node_id: &str) -> String {
    format!("{topic_prefix}/{target_node_id}/sync_keys/response")
}

/// `rumqttc`-backed `BusClient`: `MqttOptions::new` + `AsyncClient::new`
/// plus a polling task, wrapped with the full session/LWT/keep-alive
/// policy.
pub struct MqttBusClient {
    client: rumqttc::AsyncClient,
    events_tx: broadcast::Sender<ConnectionEvent>,
    incoming_tx: broadcast::Sender<IncomingMessage>,
    backoff: Arc<ReconnectBackoff>,
}

impl MqttBusClient {
    pub fn connect_new(config: &NodeConfig) -> Result<Self> {
        let mut options = rumqttc::MqttOptions::new(&config.client_id, &config.mqtt_host, config.mqtt_port());
        options.set_keep_alive(Duration::from_secs(config.keep_alive_seconds));
        options.set_clean_session(false);
        if let Some(username) = &config.username {
            options.set_credentials(username, config.password.0.clone().unwrap_or_default());
        }
        let lwt_topic = response_topic(&config.normalized_topic_prefix(), &config.client_id);
        options.set_last_will(rumqttc::LastWill::new(
            lwt_topic,
            last_will_payload(0),
            rumqttc::QoS::AtLeastOnce,
            false,
        ));

        let (client, mut eventloop) = rumqttc::AsyncClient::new(options, 64);
        let (events_tx, _) = broadcast::channel(256);
        let (incoming_tx, _) = broadcast::channel(256);
        let events_tx_task = events_tx.clone();
        let incoming_tx_task = incoming_tx.clone();
        let backoff = Arc::new(ReconnectBackoff::new());
        let backoff_task = Arc::clone(&backoff);

        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_))) => {
                        backoff_task.reset();
                        let _ = events_tx_task.send(ConnectionEvent {
                            state: ConnectionState::Connected,
                            reason: "broker acknowledged connection".into(),
                            error: None,
                        });
                    }
                    Ok(rumqttc::Event::Incoming(rumqttc::Packet::Publish(publish))) => {
                        let _ = incoming_tx_task.send(IncomingMessage {
                            topic: publish.topic,
                            payload: publish.payload.to_vec(),
                        });
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let delay = backoff_task.next_delay();
                        let _ = events_tx_task.send(ConnectionEvent {
                            state: ConnectionState::Reconnecting,
                            reason: "eventloop error".into(),
                            error: Some(e.to_string()),
                        });
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        });

        Ok(Self { client, events_tx, incoming_tx, backoff })
    }
}

#[async_trait]
impl BusClient for MqttBusClient {
    async fn connect(&self) -> Result<()> {
        // rumqttc connects lazily on first poll; nothing else to do here.
        Ok(())
    }

    async fn disconnect(&self, _suppress_lwt: bool) -> Result<()> {
        self.client.disconnect().await.map_err(|e| {
            log::warn!("disconnect failed: {e}");
            MerkleKvError::ConnectionLost
        })
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .publish(topic, rumqttc::QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| MerkleKvError::NetworkError(e.to_string()))
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        self.client
            .subscribe(topic, rumqttc::QoS::AtLeastOnce)
            .await
            .map_err(|e| MerkleKvError::NetworkError(e.to_string()))
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events_tx.subscribe()
    }

    fn incoming(&self) -> broadcast::Receiver<IncomingMessage> {
        self.incoming_tx.subscribe()
    }

    async fn on_background(&self) -> Result<()> {
        self.disconnect(true).await
    }

    async fn on_foreground(&self) -> Result<()> {
        self.backoff.reset();
        self.connect().await
    }
}
