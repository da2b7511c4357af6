// Node Configuration
//
// Loaded from JSON. Every field is optional and falls back to its default.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::producer::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: String,
    /// Upper bound for consistency-token waits on reads and dependent writes.
    pub barrier_timeout_ms: u64,
    /// Upper bound for a query to acknowledge a stop before it is forced.
    pub query_shutdown_timeout_ms: u64,
    pub retry: RetryConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "node-1".into(),
            barrier_timeout_ms: 10_000,
            query_shutdown_timeout_ms: 5_000,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_retries: policy.max_retries,
            initial_backoff_ms: policy.initial_backoff.as_millis() as u64,
            max_backoff_ms: policy.max_backoff.as_millis() as u64,
            backoff_multiplier: policy.backoff_multiplier,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            backoff_multiplier: self.backoff_multiplier,
        }
    }
}

impl NodeConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&data)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.trim().is_empty() {
            return Err(ConfigError::Invalid("node_id must not be empty".into()));
        }
        if self.barrier_timeout_ms == 0 {
            return Err(ConfigError::Invalid("barrier_timeout_ms must be positive".into()));
        }
        if self.query_shutdown_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "query_shutdown_timeout_ms must be positive".into(),
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "retry.backoff_multiplier must be at least 1.0".into(),
            ));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::Invalid(
                "retry.initial_backoff_ms exceeds retry.max_backoff_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn barrier_timeout(&self) -> Duration {
        Duration::from_millis(self.barrier_timeout_ms)
    }

    pub fn query_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.query_shutdown_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config = NodeConfig::from_json_str(r#"{ "node_id": "node-7", "retry": { "max_retries": 1 } }"#)
            .unwrap();

        assert_eq!(config.node_id, "node-7");
        assert_eq!(config.barrier_timeout(), Duration::from_secs(10));
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.retry.policy().initial_backoff, Duration::from_millis(100));
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let err = NodeConfig::from_json_str(r#"{ "barrier_timeout_ms": 0 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = NodeConfig::load(dir.path().join("absent.json")).unwrap_err();
        assert!(err.to_string().contains("absent.json"));
    }

    #[test]
    fn load_reads_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        fs::write(&path, r#"{ "query_shutdown_timeout_ms": 250 }"#).unwrap();

        let config = NodeConfig::load(&path).unwrap();
        assert_eq!(config.query_shutdown_timeout(), Duration::from_millis(250));
        assert_eq!(config.node_id, "node-1");
    }
}
