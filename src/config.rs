//! # Node configuration
//!
//! Loads a `NodeConfig` from TOML via `config::Config::builder()
//! .add_source(File::from(path)).build()`. The field set covers bus
//! connection settings, node/client identity, topic prefix, storage and
//! persistence options, and anti-entropy tuning — there is no TCP-server
//! configuration here since this crate has no TCP listener.

use crate::error::MerkleKvError;
use config::{Config as ConfigLib, File};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Wraps a secret so `Debug`/`Display` never print it: credentials must
/// never end up in logs.
#[derive(Clone, Serialize, Deserialize, Default)]
pub struct Secret(pub Option<String>);

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(_) => write!(f, "Secret(***)"),
            None => write!(f, "Secret(None)"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_mqtt_host")]
    pub mqtt_host: String,
    #[serde(default)]
    pub mqtt_port: Option<u16>,
    #[serde(default)]
    pub mqtt_use_tls: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Secret,

    pub client_id: String,
    pub node_id: String,

    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    #[serde(default = "default_keep_alive_seconds")]
    pub keep_alive_seconds: u64,
    #[serde(default = "default_session_expiry_seconds")]
    pub session_expiry_seconds: u64,

    #[serde(default = "default_skew_max_future_ms")]
    pub skew_max_future_ms: i64,
    #[serde(default = "default_tombstone_retention_hours")]
    pub tombstone_retention_hours: u64,

    #[serde(default)]
    pub persistence_enabled: bool,
    #[serde(default)]
    pub storage_path: Option<String>,

    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,
    #[serde(default = "default_dedup_ttl_ms")]
    pub dedup_ttl_ms: u64,
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,

    #[serde(default = "default_ae_requests_per_second")]
    pub ae_requests_per_second: f64,
    #[serde(default = "default_ae_bucket")]
    pub ae_bucket: u32,
    #[serde(default = "default_ae_sync_interval_seconds")]
    pub ae_sync_interval_seconds: u64,
    #[serde(default = "default_ae_timeout_ms")]
    pub ae_timeout_ms: u64,

    /// Node ids this node runs anti-entropy rounds against on a timer.
    #[serde(default)]
    pub peer_node_ids: Vec<String>,
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}
fn default_topic_prefix() -> String {
    "mkv".to_string()
}
fn default_keep_alive_seconds() -> u64 {
    60
}
fn default_session_expiry_seconds() -> u64 {
    86_400
}
fn default_skew_max_future_ms() -> i64 {
    300_000
}
fn default_tombstone_retention_hours() -> u64 {
    24
}
fn default_outbox_capacity() -> usize {
    1000
}
fn default_dedup_ttl_ms() -> u64 {
    600_000
}
fn default_dedup_capacity() -> usize {
    1000
}
fn default_ae_requests_per_second() -> f64 {
    5.0
}
fn default_ae_bucket() -> u32 {
    10
}
fn default_ae_sync_interval_seconds() -> u64 {
    60
}
fn default_ae_timeout_ms() -> u64 {
    30_000
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self, MerkleKvError> {
        let settings = ConfigLib::builder()
            .add_source(File::from(path))
            .build()
            .map_err(|e| MerkleKvError::InvalidConfiguration(e.to_string()))?;
        let config: NodeConfig = settings
            .try_deserialize()
            .map_err(|e| MerkleKvError::InvalidConfiguration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Resolved MQTT port: the configured value, or the TLS/plain default
    /// (8883 for TLS, 1883 for plain).
    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port.unwrap_or(if self.mqtt_use_tls { 8883 } else { 1883 })
    }

    pub fn validate(&self) -> Result<(), MerkleKvError> {
        let invalid = |field: &str, msg: String| Err(MerkleKvError::InvalidConfiguration(format!("{field}: {msg}")));

        if self.client_id.is_empty() || self.client_id.len() > 128 {
            return invalid("client_id", "must be 1-128 bytes".into());
        }
        if self.node_id.is_empty() || self.node_id.len() > 128 {
            return invalid("node_id", "must be 1-128 bytes".into());
        }
        let trimmed_prefix = self.topic_prefix.trim_matches('/');
        if trimmed_prefix.chars().any(char::is_whitespace) {
            return invalid("topic_prefix", "whitespace is forbidden".into());
        }
        if (self.username.is_some() || self.password.0.is_some()) && !self.mqtt_use_tls {
            log::warn!("mqtt credentials configured without TLS for node {}", self.node_id);
        }
        if self.persistence_enabled && self.storage_path.is_none() {
            return invalid("storage_path", "required when persistence_enabled is true".into());
        }
        if self.ae_requests_per_second <= 0.0 {
            return invalid("ae_requests_per_second", "must be positive".into());
        }
        if self.ae_bucket == 0 {
            return invalid("ae_bucket", "must be positive".into());
        }
        if self.outbox_capacity == 0 {
            return invalid("outbox_capacity", "must be positive".into());
        }
        Ok(())
    }

    /// The normalized topic prefix used when building topic names.
    pub fn normalized_topic_prefix(&self) -> String {
        self.topic_prefix.trim_matches('/').to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "{contents}").unwrap();
        file
    }

    #[test]
    fn loads_minimal_config_with_defaults_filled_in() {
        let file = write_config(
            r#"
client_id = "node-a-client"
node_id = "node-a"
"#,
        );
        let config = NodeConfig::load(file.path()).unwrap();
        assert_eq!(config.topic_prefix, "mkv");
        assert_eq!(config.keep_alive_seconds, 60);
        assert_eq!(config.mqtt_port(), 1883);
    }

    #[test]
    fn tls_changes_the_default_port() {
        let file = write_config(
            r#"
client_id = "node-a-client"
node_id = "node-a"
mqtt_use_tls = true
"#,
        );
        let config = NodeConfig::load(file.path()).unwrap();
        assert_eq!(config.mqtt_port(), 8883);
    }

    #[test]
    fn rejects_empty_node_id() {
        let file = write_config(
            r#"
client_id = "node-a-client"
node_id = ""
"#,
        );
        assert!(NodeConfig::load(file.path()).is_err());
    }

    #[test]
    fn rejects_whitespace_in_topic_prefix() {
        let file = write_config(
            r#"
client_id = "node-a-client"
node_id = "node-a"
topic_prefix = "mkv prod"
"#,
        );
        assert!(NodeConfig::load(file.path()).is_err());
    }

    #[test]
    fn persistence_enabled_requires_storage_path() {
        let file = write_config(
            r#"
client_id = "node-a-client"
node_id = "node-a"
persistence_enabled = true
"#,
        );
        assert!(NodeConfig::load(file.path()).is_err());
    }

    #[test]
    fn secret_debug_never_prints_the_password() {
        let secret = Secret(Some("hunter2".to_string()));
        let debugged = format!("{secret:?}");
        assert!(!debugged.contains("hunter2"));
    }
}
