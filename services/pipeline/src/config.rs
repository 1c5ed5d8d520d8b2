//! Pipeline configuration.
//!
//! Layered with the `config` crate: built-in defaults, then an optional
//! `config/pipeline` or `/etc/mosb/pipeline` file, then `MOSB__*`
//! environment variables (`MOSB__STORE__CAPACITY` -> `store.capacity`).

use crate::pipeline::PipelineSettings;
use crate::projector::EtaSettings;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

/// Event store bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Maximum number of retained events
    #[serde(default = "default_capacity")]
    pub capacity: i64,
    /// Sliding window applied by the periodic prune
    #[serde(default = "default_window_hours")]
    pub window_hours: i64,
}

fn default_capacity() -> i64 {
    1000
}

fn default_window_hours() -> i64 {
    24
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            window_hours: default_window_hours(),
        }
    }
}

/// Wedge geometry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtaConfig {
    #[serde(default = "default_spread_deg")]
    pub spread_deg: f64,
    #[serde(default = "default_steps")]
    pub steps: usize,
}

fn default_spread_deg() -> f64 {
    20.0
}

fn default_steps() -> usize {
    9
}

impl Default for EtaConfig {
    fn default() -> Self {
        Self {
            spread_deg: default_spread_deg(),
            steps: default_steps(),
        }
    }
}

/// Periodic window prune, shared by the consumer and the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneConfig {
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
}

fn default_tick_secs() -> u64 {
    60
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Buffered notices per subscriber before it starts lagging
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_channel_capacity() -> usize {
    1024
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Zone and reference-table sources. Unset paths mean "start empty".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataConfig {
    /// GeoJSON FeatureCollection of zones
    #[serde(default)]
    pub zones_path: Option<PathBuf>,
    #[serde(default)]
    pub locations_csv: Option<PathBuf>,
    #[serde(default)]
    pub legs_csv: Option<PathBuf>,
}

/// Security protocol for Kafka connections
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecurityProtocol {
    #[default]
    Plaintext,
    Ssl,
    SaslPlaintext,
    SaslSsl,
}

impl SecurityProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "plaintext",
            SecurityProtocol::Ssl => "ssl",
            SecurityProtocol::SaslPlaintext => "sasl_plaintext",
            SecurityProtocol::SaslSsl => "sasl_ssl",
        }
    }

    fn uses_sasl(&self) -> bool {
        matches!(self, SecurityProtocol::SaslPlaintext | SecurityProtocol::SaslSsl)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SaslMechanism {
    #[default]
    Plain,
    ScramSha256,
    ScramSha512,
}

impl SaslMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::ScramSha256 => "SCRAM-SHA-256",
            SaslMechanism::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SslConfig {
    /// Path to CA certificate file
    pub ca_location: Option<String>,
    pub certificate_location: Option<String>,
    pub key_location: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SaslConfig {
    #[serde(default)]
    pub mechanism: SaslMechanism,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_group_id")]
    pub group_id: String,
    /// earliest, latest, none
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    #[serde(default = "default_session_timeout")]
    pub session_timeout_ms: u64,
    #[serde(default = "default_max_poll_interval")]
    pub max_poll_interval_ms: u64,
}

fn default_group_id() -> String {
    "mosb-pipeline".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout() -> u64 {
    30000
}

fn default_max_poll_interval() -> u64 {
    300000
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: default_group_id(),
            auto_offset_reset: default_auto_offset_reset(),
            session_timeout_ms: default_session_timeout(),
            max_poll_interval_ms: default_max_poll_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Raw position events from trackers and the operational backend
    #[serde(default = "default_raw_events_topic")]
    pub raw_events: String,
    /// Zone-annotated events relayed downstream
    #[serde(default = "default_annotated_events_topic")]
    pub annotated_events: String,
    #[serde(default = "default_dlq_topic")]
    pub dead_letter_queue: String,
}

fn default_raw_events_topic() -> String {
    "mosb.events.raw".to_string()
}

fn default_annotated_events_topic() -> String {
    "mosb.events.annotated".to_string()
}

fn default_dlq_topic() -> String {
    "mosb.dlq".to_string()
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            raw_events: default_raw_events_topic(),
            annotated_events: default_annotated_events_topic(),
            dead_letter_queue: default_dlq_topic(),
        }
    }
}

/// Event transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Comma-separated list of broker addresses
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub security_protocol: SecurityProtocol,
    #[serde(default)]
    pub ssl: SslConfig,
    #[serde(default)]
    pub sasl: SaslConfig,
    /// Producer acknowledgments: 0, 1 or all
    #[serde(default = "default_acks")]
    pub acks: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub topics: TopicConfig,
}

fn default_bootstrap_servers() -> String {
    "localhost:9092".to_string()
}

fn default_client_id() -> String {
    "mosb-pipeline".to_string()
}

fn default_acks() -> String {
    "all".to_string()
}

fn default_request_timeout_ms() -> u64 {
    30000
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: default_bootstrap_servers(),
            client_id: default_client_id(),
            security_protocol: SecurityProtocol::default(),
            ssl: SslConfig::default(),
            sasl: SaslConfig::default(),
            acks: default_acks(),
            request_timeout_ms: default_request_timeout_ms(),
            consumer: ConsumerConfig::default(),
            topics: TopicConfig::default(),
        }
    }
}

impl KafkaConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bootstrap_servers.trim().is_empty() {
            return Err(ConfigError::MissingRequired("kafka.bootstrap_servers".to_string()));
        }
        if self.consumer.group_id.trim().is_empty() {
            return Err(ConfigError::MissingRequired("kafka.consumer.group_id".to_string()));
        }
        if self.security_protocol.uses_sasl() && self.sasl.username.is_none() {
            return Err(ConfigError::MissingRequired(
                "kafka.sasl.username (required for SASL)".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(feature = "kafka")]
impl KafkaConfig {
    fn build_base_config(&self) -> rdkafka::config::ClientConfig {
        let mut config = rdkafka::config::ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("client.id", &self.client_id);
        config.set("security.protocol", self.security_protocol.as_str());

        if let Some(ref ca) = self.ssl.ca_location {
            config.set("ssl.ca.location", ca);
        }
        if let Some(ref cert) = self.ssl.certificate_location {
            config.set("ssl.certificate.location", cert);
        }
        if let Some(ref key) = self.ssl.key_location {
            config.set("ssl.key.location", key);
        }

        if self.security_protocol.uses_sasl() {
            config.set("sasl.mechanism", self.sasl.mechanism.as_str());
            if let Some(ref username) = self.sasl.username {
                config.set("sasl.username", username);
            }
            if let Some(ref password) = self.sasl.password {
                config.set("sasl.password", password);
            }
        }
        config
    }

    pub fn build_producer_config(&self) -> rdkafka::config::ClientConfig {
        let mut config = self.build_base_config();
        config.set("acks", &self.acks);
        config.set("request.timeout.ms", self.request_timeout_ms.to_string());
        config.set("enable.idempotence", "true");
        config.set("compression.type", "lz4");
        config
    }

    /// Offsets are committed manually after each handled message.
    pub fn build_consumer_config(&self) -> rdkafka::config::ClientConfig {
        let mut config = self.build_base_config();
        config.set("group.id", &self.consumer.group_id);
        config.set("auto.offset.reset", &self.consumer.auto_offset_reset);
        config.set("enable.auto.commit", "false");
        config.set("session.timeout.ms", self.consumer.session_timeout_ms.to_string());
        config.set("max.poll.interval.ms", self.consumer.max_poll_interval_ms.to_string());
        config
    }
}

/// Full pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub eta: EtaConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub prune: PruneConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub kafka: KafkaConfig,
}

impl PipelineConfig {
    /// Load configuration from environment and config files
    pub fn load() -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/pipeline").required(false))
            .add_source(config::File::with_name("/etc/mosb/pipeline").required(false))
            .add_source(
                config::Environment::with_prefix("MOSB")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let loaded: Self = config.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Checks everything except the Kafka section, which only matters when
    /// the transport is enabled.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.capacity <= 0 {
            return Err(invalid("store.capacity", format!("must be positive, got {}", self.store.capacity)));
        }
        if self.store.window_hours <= 0 {
            return Err(invalid(
                "store.window_hours",
                format!("must be positive, got {}", self.store.window_hours),
            ));
        }
        if self.eta.steps < 2 {
            return Err(invalid("eta.steps", format!("must be at least 2, got {}", self.eta.steps)));
        }
        if !self.eta.spread_deg.is_finite() || self.eta.spread_deg <= 0.0 {
            return Err(invalid("eta.spread_deg", "must be a positive angle"));
        }
        if self.notify.channel_capacity == 0 {
            return Err(invalid("notify.channel_capacity", "must be positive"));
        }
        if self.prune.tick_secs == 0 {
            return Err(invalid("prune.tick_secs", "must be positive"));
        }
        Ok(())
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune.tick_secs)
    }

    pub fn settings(&self) -> PipelineSettings {
        PipelineSettings {
            capacity: self.store.capacity,
            window_hours: self.store.window_hours,
            eta: EtaSettings {
                spread_deg: self.eta.spread_deg,
                steps: self.eta.steps,
            },
            channel_capacity: self.notify.channel_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.store.capacity, 1000);
        assert_eq!(config.store.window_hours, 24);
        assert_eq!(config.eta.steps, 9);
        assert_eq!(config.kafka.client_id, "mosb-pipeline");
        assert!(config.validate().is_ok());
        assert!(config.kafka.validate().is_ok());
    }

    #[test]
    fn test_partial_sections_fill_defaults() {
        let config: PipelineConfig = serde_json::from_str(r#"{"store":{"capacity":50},"kafka":{"topics":{"raw_events":"raw"}}}"#).unwrap();
        assert_eq!(config.store.capacity, 50);
        assert_eq!(config.store.window_hours, 24);
        assert_eq!(config.kafka.topics.raw_events, "raw");
        assert_eq!(config.kafka.topics.dead_letter_queue, "mosb.dlq");
        assert_eq!(config.settings().capacity, 50);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = PipelineConfig::default();
        config.store.capacity = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue { .. })));

        let mut config = PipelineConfig::default();
        config.eta.steps = 1;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.store.window_hours = -1;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.prune.tick_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_prune_tick() {
        assert_eq!(PipelineConfig::default().prune_interval(), Duration::from_secs(60));

        let config: PipelineConfig = serde_json::from_str(r#"{"prune":{"tick_secs":5}}"#).unwrap();
        assert_eq!(config.prune_interval(), Duration::from_secs(5));
        assert_eq!(config.store.window_hours, 24);
    }

    #[test]
    fn test_kafka_validation() {
        let mut kafka = KafkaConfig::default();
        kafka.security_protocol = SecurityProtocol::SaslSsl;
        assert!(matches!(kafka.validate(), Err(ConfigError::MissingRequired(_))));
        kafka.sasl.username = Some("svc".into());
        assert!(kafka.validate().is_ok());

        kafka.consumer.group_id = String::new();
        assert!(kafka.validate().is_err());
    }

    #[cfg(feature = "kafka")]
    #[test]
    fn test_client_configs() {
        let kafka = KafkaConfig::default();
        let producer = kafka.build_producer_config();
        assert_eq!(producer.get("acks"), Some("all"));
        let consumer = kafka.build_consumer_config();
        assert_eq!(consumer.get("group.id"), Some("mosb-pipeline"));
        assert_eq!(consumer.get("enable.auto.commit"), Some("false"));
    }
}
