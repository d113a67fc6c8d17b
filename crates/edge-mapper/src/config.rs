// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Mapper configuration.
//!
//! Loaded from a TOML file, every field has a default. CLI flags override
//! file values; API credentials fall back to the `C8Y_*` environment.

use crate::api::{ApiClientConfig, Credentials, TOKEN_REQUEST_TOPIC, TOKEN_RESPONSE_TOPIC};
use crate::broker::MqttSettings;
use crate::context::{RecursionGuard, DEFAULT_MAX_DEPTH};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Mapper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MapperConfig {
    /// Service name (for identification).
    pub name: String,

    /// Directories scanned for route files.
    pub route_dirs: Vec<PathBuf>,

    /// Maximum routing depth of a message chain.
    pub max_depth: u64,

    /// Pause after each dispatched message (milliseconds).
    pub post_message_delay_ms: u64,

    /// Log instead of publishing or calling the API.
    pub dry_run: bool,

    /// Entity document loaded at startup.
    pub entity_file: Option<PathBuf>,

    /// Track entity registrations published on `te/+/+/+/+`.
    pub registration_listener: bool,

    /// Messages processed concurrently.
    pub workers: usize,

    /// Inbound queue size; messages arriving on a full queue are dropped.
    pub queue_capacity: usize,

    /// Stop evaluating further routes after the first route error.
    pub stop_on_error: bool,

    /// Statistics reporting interval (seconds, 0 = disabled).
    pub stats_interval_secs: u64,

    /// Log level.
    pub log_level: String,

    pub broker: BrokerConfig,

    pub api: ApiConfig,

    pub meta: MetaConfig,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            name: "edge-mapper".to_string(),
            route_dirs: vec![PathBuf::from("routes")],
            max_depth: DEFAULT_MAX_DEPTH,
            post_message_delay_ms: 2000,
            dry_run: false,
            entity_file: None,
            registration_listener: true,
            workers: 4,
            queue_capacity: 256,
            stop_on_error: false,
            stats_interval_secs: 0,
            log_level: "info".to_string(),
            broker: BrokerConfig::default(),
            api: ApiConfig::default(),
            meta: MetaConfig::default(),
        }
    }
}

impl MapperConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate TOML.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_depth == 0 {
            return Err(ConfigError::Invalid("max_depth must be at least 1".into()));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "queue_capacity must be at least 1".into(),
            ));
        }
        if self.route_dirs.is_empty() {
            return Err(ConfigError::Invalid("No route directories configured".into()));
        }
        if self.broker.host.is_empty() {
            return Err(ConfigError::Invalid("Broker host is empty".into()));
        }
        if self.broker.client_id.is_empty() {
            return Err(ConfigError::Invalid("Broker client id is empty".into()));
        }
        Ok(())
    }

    pub fn post_message_delay(&self) -> Duration {
        Duration::from_millis(self.post_message_delay_ms)
    }

    pub fn guard(&self) -> RecursionGuard {
        RecursionGuard::new(self.max_depth)
    }

    /// Fill missing API settings from the environment, then from the
    /// thin-edge configuration.
    pub fn resolve_api(&mut self) {
        self.api.apply_env(|key| std::env::var(key).ok());
        if self.api.url.is_empty() {
            if let Some(url) = crate::meta::tedge_config_get(&self.meta.tedge_binary, "c8y.http") {
                tracing::info!("Using API host from tedge config: {}", url);
                self.api.url = url;
            }
        }
    }

    pub fn mqtt_settings(&self) -> MqttSettings {
        MqttSettings {
            host: self.broker.host.clone(),
            port: self.broker.port,
            client_id: self.broker.client_id.clone(),
            clean_session: self.broker.clean_session,
            keep_alive: Duration::from_secs(self.broker.keep_alive_secs),
            last_will: None,
        }
    }
}

/// MQTT broker connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "edge-mapper".to_string(),
            clean_session: true,
            keep_alive_secs: 30,
        }
    }
}

/// Cloud REST API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Default host or base URL.
    pub url: String,
    pub tenant: String,
    pub user: String,
    pub password: String,
    pub token: String,

    /// Minimum interval between two token requests (seconds).
    pub renewal_cooldown_secs: u64,

    pub token_request_topic: String,
    pub token_response_topic: String,

    /// Request timeout (seconds).
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            tenant: String::new(),
            user: String::new(),
            password: String::new(),
            token: String::new(),
            renewal_cooldown_secs: 60,
            token_request_topic: TOKEN_REQUEST_TOPIC.to_string(),
            token_response_topic: TOKEN_RESPONSE_TOPIC.to_string(),
            timeout_secs: 30,
        }
    }
}

impl ApiConfig {
    /// Fill empty fields from `C8Y_HOST`, `C8Y_TENANT`, `C8Y_USER`,
    /// `C8Y_PASSWORD` and `C8Y_TOKEN`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let fields = [
            (&mut self.url, "C8Y_HOST"),
            (&mut self.tenant, "C8Y_TENANT"),
            (&mut self.user, "C8Y_USER"),
            (&mut self.password, "C8Y_PASSWORD"),
            (&mut self.token, "C8Y_TOKEN"),
        ];
        for (field, key) in fields {
            if field.is_empty() {
                if let Some(value) = lookup(key) {
                    *field = value;
                }
            }
        }
    }

    /// Whether a default API host is known.
    pub fn is_configured(&self) -> bool {
        !self.url.is_empty()
    }

    pub fn client_config(&self) -> ApiClientConfig {
        ApiClientConfig {
            base_url: self.url.clone(),
            credentials: Credentials {
                tenant: self.tenant.clone(),
                user: self.user.clone(),
                password: self.password.clone(),
                token: self.token.clone(),
            },
            renewal_cooldown: Duration::from_secs(self.renewal_cooldown_secs),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

/// Meta bag sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaConfig {
    /// Device id used when thin-edge does not provide one.
    pub device_id: String,

    /// Extra values; keys are lowercased with `.` replaced by `_`.
    pub defaults: BTreeMap<String, String>,

    /// Environment variables with this prefix are exposed under `meta.env`.
    pub env_prefix: String,

    /// Binary queried for thin-edge settings.
    pub tedge_binary: String,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            defaults: BTreeMap::new(),
            env_prefix: "ROUTE_".to_string(),
            tedge_binary: "tedge".to_string(),
        }
    }
}

/// Annotated example written by `gen-config`.
pub const EXAMPLE_CONFIG: &str = r#"# edge-mapper configuration

name = "edge-mapper"

# Directories scanned (recursively) for *.yaml / *.yml route files
route_dirs = ["routes"]

# Maximum routing depth of a message chain
max_depth = 3

# Pause after each dispatched message (milliseconds)
post_message_delay_ms = 2000

# Log instead of publishing or calling the API
dry_run = false

# Entity document loaded at startup
# entity_file = "entities.json"

# Track entity registrations published on te/+/+/+/+
registration_listener = true

# Messages processed concurrently
workers = 4

# Inbound queue size; messages arriving on a full queue are dropped
queue_capacity = 256

# Stop evaluating further routes after the first route error
stop_on_error = false

# Statistics reporting interval in seconds (0 = disabled)
stats_interval_secs = 0

log_level = "info"

[broker]
host = "localhost"
port = 1883
client_id = "edge-mapper"
clean_session = true
keep_alive_secs = 30

[api]
# Default host; falls back to C8Y_HOST, then `tedge config get c8y.http`
# url = "http://127.0.0.1:8001/c8y"
# Credentials fall back to C8Y_TENANT, C8Y_USER, C8Y_PASSWORD, C8Y_TOKEN
renewal_cooldown_secs = 60
token_request_topic = "c8y/s/uat"
token_response_topic = "c8y/s/dat"
timeout_secs = 30

[meta]
# Device id used when thin-edge does not provide one
device_id = ""
env_prefix = "ROUTE_"
tedge_binary = "tedge"

[meta.defaults]
# "device.type" = "gateway"
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MapperConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_depth, 3);
        assert_eq!(config.post_message_delay(), Duration::from_secs(2));
        assert_eq!(config.route_dirs, vec![PathBuf::from("routes")]);
        assert_eq!(config.api.token_request_topic, "c8y/s/uat");
        assert_eq!(config.guard().max_depth(), 3);
    }

    #[test]
    fn test_partial_file() {
        let config = MapperConfig::from_toml(
            r#"
max_depth = 5
route_dirs = ["a", "b"]

[broker]
port = 1884

[meta.defaults]
"device.type" = "gateway"
"#,
        )
        .unwrap();
        assert_eq!(config.max_depth, 5);
        assert_eq!(config.route_dirs.len(), 2);
        assert_eq!(config.broker.port, 1884);
        assert_eq!(config.broker.host, "localhost");
        assert_eq!(config.meta.defaults["device.type"], "gateway");
    }

    #[test]
    fn test_validation() {
        let mut config = MapperConfig {
            max_depth: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.max_depth = 1;
        config.workers = 0;
        assert!(config.validate().is_err());

        config.workers = 1;
        config.route_dirs.clear();
        assert!(config.validate().is_err());

        config.route_dirs.push("r".into());
        config.broker.client_id.clear();
        assert!(config.validate().is_err());

        config.broker.client_id = "x".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            MapperConfig::from_toml("max_depth = \"deep\""),
            Err(ConfigError::Toml(_))
        ));
        assert!(matches!(
            MapperConfig::from_toml("queue_capacity = 0"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_example_config_is_valid() {
        let config = MapperConfig::from_toml(EXAMPLE_CONFIG).unwrap();
        let defaults = MapperConfig::default();
        assert_eq!(config.max_depth, defaults.max_depth);
        assert_eq!(config.workers, defaults.workers);
        assert_eq!(config.broker.client_id, defaults.broker.client_id);
    }

    #[test]
    fn test_api_env_fallback() {
        let mut api = ApiConfig {
            user: "configured".into(),
            ..Default::default()
        };
        api.apply_env(|key| match key {
            "C8Y_HOST" => Some("example.com".into()),
            "C8Y_USER" => Some("from-env".into()),
            _ => None,
        });
        assert_eq!(api.url, "example.com");
        assert_eq!(api.user, "configured");
        assert!(api.is_configured());

        let client = api.client_config();
        assert_eq!(client.base_url, "example.com");
        assert_eq!(client.renewal_cooldown, Duration::from_secs(60));
    }

    #[test]
    fn test_config_serialization() {
        let config = MapperConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        assert!(toml_str.contains("max_depth = 3"));
        assert!(toml_str.contains("[broker]"));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapper.toml");
        std::fs::write(&path, "workers = 8\n").unwrap();
        assert_eq!(MapperConfig::from_file(&path).unwrap().workers, 8);
        assert!(matches!(
            MapperConfig::from_file(dir.path().join("missing.toml")),
            Err(ConfigError::Io(_))
        ));
    }
}
