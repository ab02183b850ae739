//! Agent pool configuration

use crate::ReconnectConfig;
use localup_track::TrackerConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// What to do with global requests the agent does not understand
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownRequestPolicy {
    /// Reply `false` when the peer wants a reply
    #[default]
    Reject,
    /// Drop the request without replying
    Ignore,
}

/// Configuration for a pool of agents serving one cluster
///
/// ```yaml
/// proxy_addr: "proxy.example.com:3024"
/// cluster_name: "example"
/// connection_count: 2
/// keep_alive: 30
/// reconnect:
///   initial_backoff: 500
///   max_backoff: 30000
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentPoolConfig {
    /// Proxy address in `host:port` form
    pub proxy_addr: String,

    pub cluster_name: String,

    /// Fixed number of agents; when unset one agent per known proxy
    #[serde(default)]
    pub connection_count: Option<usize>,

    /// Heartbeat interval in seconds
    #[serde(default = "default_keep_alive", with = "duration_secs")]
    pub keep_alive: Duration,

    #[serde(default)]
    pub unknown_requests: UnknownRequestPolicy,

    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(30)
}

impl AgentPoolConfig {
    pub fn new(proxy_addr: impl Into<String>, cluster_name: impl Into<String>) -> Self {
        Self {
            proxy_addr: proxy_addr.into(),
            cluster_name: cluster_name.into(),
            connection_count: None,
            keep_alive: default_keep_alive(),
            unknown_requests: UnknownRequestPolicy::default(),
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_address(&self.proxy_addr).map_err(ConfigError::Invalid)?;
        if self.keep_alive.is_zero() {
            return Err(ConfigError::Invalid(
                "keep_alive must be greater than zero".to_string(),
            ));
        }
        self.reconnect.validate().map_err(ConfigError::Invalid)?;
        self.tracker_config()
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            cluster_name: self.cluster_name.clone(),
            connection_count: self.connection_count,
        }
    }
}

/// Checks `host:port` form with a non-empty host and a numeric port
pub(crate) fn validate_address(addr: &str) -> Result<(), String> {
    let Some((host, port)) = addr.rsplit_once(':') else {
        return Err(format!(
            "invalid proxy address '{}' (expected host:port)",
            addr
        ));
    };
    if host.is_empty() {
        return Err(format!("invalid proxy address '{}' (empty host)", addr));
    }
    port.parse::<u16>()
        .map_err(|_| format!("invalid port in proxy address '{}'", addr))?;
    Ok(())
}

/// Serializes a Duration as whole seconds
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

/// Serializes a Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
