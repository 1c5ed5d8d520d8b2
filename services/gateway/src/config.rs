//! Gateway configuration.
//!
//! Same layering as the pipeline: defaults, then `config/gateway` or
//! `/etc/mosb/gateway`, then `MOSB__*` environment variables
//! (`MOSB__API__PORT` -> `api.port`, `MOSB__PIPELINE__STORE__CAPACITY` ->
//! `pipeline.store.capacity`). The prune tick lives in the pipeline
//! section (`pipeline.prune.tick_secs`).

use mosb_pipeline::{ConfigError, PipelineConfig};
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the gateway
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub ws: WsConfig,
    /// Embedded pipeline section
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// HTTP listener
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins; empty allows any
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WsConfig {
    /// Keep-alive ping cadence on `/ws/events`
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
}

fn default_service_name() -> String {
    "mosb-gateway".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8000
}

fn default_true() -> bool {
    true
}

fn default_ping_interval_secs() -> u64 {
    10
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
        }
    }
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval_secs(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from environment and config files
    pub fn load() -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            .set_default("service.name", default_service_name())?
            .set_default("service.log_level", default_log_level())?
            .add_source(config::File::with_name("config/gateway").required(false))
            .add_source(config::File::with_name("/etc/mosb/gateway").required(false))
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

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ws.ping_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ws.ping_interval_secs".to_string(),
                message: "must be positive".to_string(),
            });
        }
        self.pipeline.validate()
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ws.ping_interval_secs)
    }

    pub fn prune_interval(&self) -> Duration {
        self.pipeline.prune_interval()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = GatewayConfig::default();
        assert_eq!(config.service.name, "mosb-gateway");
        assert_eq!(config.api.port, 8000);
        assert!(config.api.cors_enabled);
        assert_eq!(config.ping_interval(), Duration::from_secs(10));
        assert_eq!(config.prune_interval(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_embedded_pipeline_section() {
        let config: GatewayConfig =
            serde_json::from_str(r#"{"api":{"port":9000},"pipeline":{"store":{"capacity":10}}}"#).unwrap();
        assert_eq!(config.api.port, 9000);
        assert_eq!(config.api.host, "0.0.0.0");
        assert_eq!(config.pipeline.store.capacity, 10);
        assert_eq!(config.pipeline.eta.steps, 9);
    }

    #[test]
    fn test_prune_tick_comes_from_pipeline_section() {
        let config: GatewayConfig = serde_json::from_str(r#"{"pipeline":{"prune":{"tick_secs":15}}}"#).unwrap();
        assert_eq!(config.prune_interval(), Duration::from_secs(15));
        assert_eq!(config.prune_interval(), config.pipeline.prune_interval());
    }

    #[test]
    fn test_validation() {
        let mut config = GatewayConfig::default();
        config.ws.ping_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.pipeline.prune.tick_secs = 0;
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.pipeline.store.capacity = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue { .. })));
    }
}
