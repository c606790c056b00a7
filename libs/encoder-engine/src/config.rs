use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use crate::error::EngineError;

/// Root configuration, parsed from TOML.
#[derive(Clone, Deserialize)]
pub struct EncoderConfig {
    /// Address the lifecycle RPC surface listens on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Passphrase sealing recipient keys at rest. Usually supplied through
    /// `ENCODER_ENCRYPTION_PASSWORD` rather than the file.
    #[serde(default)]
    pub encryption_password: String,

    /// Deadline for every single storage / broker / cipher / datastore call.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// Grace period for in-flight work at shutdown.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub datastore: DatastoreConfig,

    #[serde(default)]
    pub recovery: RecoveryConfig,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_call_timeout_ms() -> u64 {
    5_000
}
fn default_shutdown_grace_ms() -> u64 {
    5_000
}

impl fmt::Debug for EncoderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncoderConfig")
            .field("listen_addr", &self.listen_addr)
            .field("encryption_password", &"<redacted>")
            .field("call_timeout_ms", &self.call_timeout_ms)
            .field("shutdown_grace_ms", &self.shutdown_grace_ms)
            .field("storage", &self.storage)
            .field("broker", &self.broker)
            .field("datastore", &self.datastore)
            .field("recovery", &self.recovery)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Memory,
    Postgres,
}

#[derive(Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub kind: StorageKind,
    /// Connection string, required for `postgres`.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::default(),
            url: None,
            max_connections: default_max_connections(),
        }
    }
}

impl fmt::Debug for StorageConfig {
    // The url may carry credentials.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("kind", &self.kind)
            .field("url", &self.url.as_ref().map(|_| "<redacted>"))
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_host")]
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Queue length per subscription before messages are dropped.
    #[serde(default = "default_dispatch_buffer")]
    pub dispatch_buffer: usize,
    /// Subscription QoS (0, 1 or 2).
    #[serde(default = "default_qos")]
    pub qos: u8,
}

fn default_broker_host() -> String {
    "localhost".to_string()
}
fn default_broker_port() -> u16 {
    1883
}
fn default_client_id() -> String {
    "iotencoder".to_string()
}
fn default_keep_alive_secs() -> u64 {
    30
}
fn default_dispatch_buffer() -> usize {
    1024
}
fn default_qos() -> u8 {
    1
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
            client_id: default_client_id(),
            keep_alive_secs: default_keep_alive_secs(),
            dispatch_buffer: default_dispatch_buffer(),
            qos: default_qos(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatastoreConfig {
    #[serde(default = "default_datastore_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_call_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_datastore_endpoint() -> String {
    "http://localhost:8081".to_string()
}

impl Default for DatastoreConfig {
    fn default() -> Self {
        Self {
            endpoint: default_datastore_endpoint(),
            timeout_ms: default_call_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecoveryConfig {
    /// Subscribe attempts per stream, first one included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_initial_backoff_ms() -> u64 {
    200
}
fn default_max_backoff_ms() -> u64 {
    5_000
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Upper bound for call and grace timeouts (one hour); deadlines are
/// computed as `now + timeout`.
pub const MAX_TIMEOUT_MS: u64 = 60 * 60 * 1000;

impl EncoderConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, EngineError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| EngineError::Config(format!("{path}: {e}")))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(toml_str: &str) -> Result<Self, EngineError> {
        toml::from_str(toml_str).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.encryption_password.is_empty() {
            return Err(EngineError::Config(
                "encryption_password must be set (file or ENCODER_ENCRYPTION_PASSWORD)".into(),
            ));
        }
        if self.call_timeout_ms == 0 || self.call_timeout_ms > MAX_TIMEOUT_MS {
            return Err(EngineError::Config(format!(
                "call_timeout_ms must be in 1..={MAX_TIMEOUT_MS}"
            )));
        }
        if self.shutdown_grace_ms > MAX_TIMEOUT_MS {
            return Err(EngineError::Config(format!(
                "shutdown_grace_ms must be at most {MAX_TIMEOUT_MS}"
            )));
        }
        if self.storage.kind == StorageKind::Postgres && self.storage.url.is_none() {
            return Err(EngineError::Config("url is required for postgres storage".into())
                .with_context("[storage]"));
        }
        if self.broker.qos > 2 {
            return Err(EngineError::Config(format!("qos {} out of range 0..=2", self.broker.qos))
                .with_context("[broker]"));
        }
        if self.broker.dispatch_buffer == 0 {
            return Err(EngineError::Config("dispatch_buffer must be positive".into())
                .with_context("[broker]"));
        }
        if self.recovery.max_attempts == 0 {
            return Err(EngineError::Config("max_attempts must be at least 1".into())
                .with_context("[recovery]"));
        }
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_sections() {
        let config = EncoderConfig::parse(r#"encryption_password = "secret""#).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.storage.kind, StorageKind::Memory);
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.recovery.max_attempts, 5);
        assert_eq!(config.call_timeout(), Duration::from_secs(5));
        config.validate().unwrap();
    }

    #[test]
    fn parses_full_file() {
        let config = EncoderConfig::parse(
            r#"
            listen_addr = "127.0.0.1:9000"
            encryption_password = "secret"
            call_timeout_ms = 1500
            shutdown_grace_ms = 3000

            [storage]
            kind = "postgres"
            url = "postgres://encoder@localhost/encoder"
            max_connections = 8

            [broker]
            host = "mqtt.local"
            port = 8883
            client_id = "encoder-1"
            qos = 0

            [datastore]
            endpoint = "http://datastore:8081"

            [recovery]
            max_attempts = 3
            initial_backoff_ms = 50
            max_backoff_ms = 400
            "#,
        )
        .unwrap();

        assert_eq!(config.storage.kind, StorageKind::Postgres);
        assert_eq!(config.storage.max_connections, 8);
        assert_eq!(config.broker.host, "mqtt.local");
        assert_eq!(config.broker.qos, 0);
        assert_eq!(config.datastore.endpoint, "http://datastore:8081");
        assert_eq!(config.recovery.max_backoff_ms, 400);
        config.validate().unwrap();
    }

    #[test]
    fn unbounded_timeouts_are_rejected() {
        let config = EncoderConfig::parse(&format!(
            "encryption_password = \"secret\"\ncall_timeout_ms = {}",
            i64::MAX
        ))
        .unwrap();
        assert!(matches!(config.validate(), Err(EngineError::Config(msg)) if msg.contains("call_timeout_ms")));

        let config = EncoderConfig::parse(&format!(
            "encryption_password = \"secret\"\nshutdown_grace_ms = {}",
            MAX_TIMEOUT_MS + 1
        ))
        .unwrap();
        assert!(matches!(config.validate(), Err(EngineError::Config(msg)) if msg.contains("shutdown_grace_ms")));

        let config = EncoderConfig::parse(&format!(
            "encryption_password = \"secret\"\ncall_timeout_ms = {MAX_TIMEOUT_MS}"
        ))
        .unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn empty_password_is_rejected() {
        let config = EncoderConfig::parse("").unwrap();
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn postgres_without_url_is_rejected() {
        let config = EncoderConfig::parse(
            r#"
            encryption_password = "secret"
            [storage]
            kind = "postgres"
            "#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("[storage]"));
    }

    #[test]
    fn debug_output_hides_secrets() {
        let config = EncoderConfig::parse(
            r#"
            encryption_password = "hunter2"
            [storage]
            kind = "postgres"
            url = "postgres://user:pw@db/encoder"
            "#,
        )
        .unwrap();
        let printed = format!("{config:?}");
        assert!(!printed.contains("hunter2"));
        assert!(!printed.contains("user:pw"));
    }
}
