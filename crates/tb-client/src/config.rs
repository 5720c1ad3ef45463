//! Client Configuration
//!
//! Connection parameters handed to the engine at initialization, plus the
//! client-side request deadline and log level.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable naming a JSON configuration file
pub const CONFIG_ENV: &str = "TB_CLIENT_CONFIG";

/// Largest `concurrency_max` the engine accepts
pub const CONCURRENCY_MAX_LIMIT: u32 = 8192;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Cluster the engine connects to
    pub cluster_id: u128,
    /// Replica addresses, `host:port` or a bare port
    pub addresses: Vec<String>,
    /// Number of packets the engine preallocates
    pub concurrency_max: u32,
    /// Per-request deadline; `None` waits for the engine indefinitely
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    /// Default tracing filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            cluster_id: 0,
            addresses: vec!["3000".to_string()],
            concurrency_max: 256,
            request_timeout_ms: None,
            log_level: default_log_level(),
        }
    }
}

impl ClientConfig {
    pub fn new(cluster_id: u128, addresses: Vec<String>) -> Self {
        Self {
            cluster_id,
            addresses,
            ..Self::default()
        }
    }

    /// Packet budget handed to the engine
    pub fn with_concurrency_max(mut self, concurrency_max: u32) -> Self {
        self.concurrency_max = concurrency_max;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = Some(timeout.as_millis().min(u64::MAX as u128) as u64);
        self
    }

    /// Per-request deadline, if any
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    /// Addresses joined the way the engine expects them
    pub fn address_list(&self) -> String {
        self.addresses.join(",")
    }

    /// Reject configurations the engine would refuse
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.addresses.is_empty() {
            return Err(ConfigError::Invalid("at least one address is required".into()));
        }
        if let Some(bad) = self.addresses.iter().find(|a| a.trim().is_empty() || a.contains(',')) {
            return Err(ConfigError::Invalid(format!("malformed address {bad:?}")));
        }
        if self.concurrency_max == 0 || self.concurrency_max > CONCURRENCY_MAX_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "concurrency_max must be within 1..={CONCURRENCY_MAX_LIMIT}, got {}",
                self.concurrency_max
            )));
        }
        if self.request_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid("request_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        let config: ClientConfig = serde_json::from_str(&content)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteError(e.to_string()))?;
        }

        std::fs::write(path, content)
            .map_err(|e| ConfigError::WriteError(e.to_string()))?;

        Ok(())
    }

    /// Install the global tracing subscriber with `log_level` as the default
    /// filter; `RUST_LOG` still takes precedence
    pub fn init_tracing(&self) -> bool {
        crate::telemetry::init_tracing(&self.log_level)
    }

    /// Load from the file named by `TB_CLIENT_CONFIG`, or fall back to defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Failed to write config: {0}")]
    WriteError(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}
