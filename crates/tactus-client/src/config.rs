//! Unit runner configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tactus_core::VariableSpec;
use tactus_transport::{RetryPolicy, TransportKind};
use thiserror::Error;

/// Errors from loading or validating a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read configuration")]
    Io(#[from] std::io::Error),

    /// The file is not valid JSON for this schema.
    #[error("cannot parse configuration")]
    Parse(#[from] serde_json::Error),

    /// The configuration is syntactically valid but inconsistent.
    #[error("invalid configuration: {detail}")]
    Invalid {
        /// What is inconsistent.
        detail: String,
    },
}

fn default_server_name() -> String {
    "localhost".to_owned()
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    100
}

/// Connect/attach retry settings.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RetrySettings {
    /// Attempts before giving up.
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
    /// Backoff before the second attempt in milliseconds; doubles after.
    #[serde(default = "default_retry_backoff_ms")]
    pub initial_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            initial_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl From<RetrySettings> for RetryPolicy {
    fn from(settings: RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
        }
    }
}

/// Top-level unit runner configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// This unit's id, presented in the `Attach` handshake.
    pub unit_id: u32,
    /// Local (shared memory) or remote (QUIC).
    pub transport: TransportKind,
    /// Orchestrator address for a remote unit, e.g. `"127.0.0.1:4433"`.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// TLS server name expected on the orchestrator's certificate.
    #[serde(default = "default_server_name")]
    pub server_name: String,
    /// CA certificate (PEM) to verify the orchestrator against; absent
    /// means no verification (closed bench).
    #[serde(default)]
    pub ca_certificate: Option<PathBuf>,
    /// Region base path for a local unit; must match the orchestrator's.
    #[serde(default)]
    pub region: Option<PathBuf>,
    /// Bound on connection establishment in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Connect/attach retry settings.
    #[serde(default)]
    pub retry: RetrySettings,
    /// Stop after this much request silence, in milliseconds; absent keeps
    /// the unit waiting indefinitely.
    #[serde(default)]
    pub idle_limit_ms: Option<u64>,
    /// The unit's exposed variables, in registration order. Must match the
    /// orchestrator's view of this unit.
    pub variables: Vec<VariableSpec>,
}

impl ClientConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.transport {
            TransportKind::Remote if self.endpoint.is_none() => Err(ConfigError::Invalid {
                detail: format!("remote unit {} has no endpoint", self.unit_id),
            }),
            TransportKind::Local if self.region.is_none() => Err(ConfigError::Invalid {
                detail: format!("local unit {} has no region path", self.unit_id),
            }),
            _ => Ok(()),
        }
    }

    /// Connection establishment bound.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Idle limit, when configured.
    pub fn idle_limit(&self) -> Option<Duration> {
        self.idle_limit_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "unit_id": 3,
        "transport": "remote",
        "endpoint": "127.0.0.1:4433",
        "variables": [
            { "reference": 0, "kind": "real", "causality": "input" },
            { "reference": 1, "kind": "real", "causality": "output" }
        ]
    }"#;

    #[test]
    fn sample_parses_with_defaults() {
        let config: ClientConfig = serde_json::from_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.unit_id, 3);
        assert_eq!(config.server_name, "localhost");
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert!(config.idle_limit().is_none());
    }

    #[test]
    fn remote_requires_endpoint() {
        let mut config: ClientConfig = serde_json::from_str(SAMPLE).unwrap();
        config.endpoint = None;

        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { .. })), "{result:?}");
    }

    #[test]
    fn local_requires_region() {
        let mut config: ClientConfig = serde_json::from_str(SAMPLE).unwrap();
        config.transport = TransportKind::Local;

        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { .. })), "{result:?}");
    }
}
