//! Orchestrator configuration.
//!
//! Configuration comes from one JSON file naming the bind address, the
//! timestep, the failure policy, and every unit with its transport and
//! variable set. The region capacity of a local unit is its variable
//! count; it is agreed here, out of band, and never renegotiated.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tactus_core::VariableSpec;
use tactus_transport::TransportKind;
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

/// TLS certificate material for the QUIC listener.
#[derive(Debug, Clone, Deserialize)]
pub struct CertificatePaths {
    /// PEM certificate chain.
    pub cert: PathBuf,
    /// PEM private key.
    pub key: PathBuf,
}

/// One unit the orchestrator drives.
#[derive(Debug, Clone, Deserialize)]
pub struct UnitEntry {
    /// Unique unit id; remote units present it in their `Attach`.
    pub unit_id: u32,
    /// Local (shared memory) or remote (QUIC).
    pub transport: TransportKind,
    /// Region base path for a local unit (e.g. under `/dev/shm`).
    #[serde(default)]
    pub region: Option<PathBuf>,
    /// The unit's exposed variables, in registration order.
    pub variables: Vec<VariableSpec>,
}

impl UnitEntry {
    /// Shared-region capacity agreed for this unit.
    pub fn capacity(&self) -> usize {
        self.variables.len()
    }
}

fn default_round_deadline_ms() -> u64 {
    1000
}

fn default_setup_timeout_ms() -> u64 {
    30_000
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address the QUIC listener binds to.
    pub bind: String,
    /// Timestep per round in microseconds.
    pub timestep_us: u64,
    /// Number of rounds to run; `None` runs until stopped.
    #[serde(default)]
    pub rounds: Option<u64>,
    /// Per-round response deadline in milliseconds.
    #[serde(default = "default_round_deadline_ms")]
    pub round_deadline_ms: u64,
    /// Bound on the attach phase in milliseconds.
    #[serde(default = "default_setup_timeout_ms")]
    pub setup_timeout_ms: u64,
    /// Unit failures tolerated per round before the round fails.
    #[serde(default)]
    pub max_round_failures: u32,
    /// Halt on a failed round instead of continuing with the reduced set.
    #[serde(default)]
    pub strict: bool,
    /// Sleep one timestep of wall clock between rounds.
    #[serde(default)]
    pub pace_realtime: bool,
    /// TLS material; absent means a self-signed certificate.
    #[serde(default)]
    pub certificate: Option<CertificatePaths>,
    /// The units to drive. Must not be empty.
    pub units: Vec<UnitEntry>,
}

impl ServerConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timestep_us == 0 {
            return Err(ConfigError::Invalid { detail: "timestep_us must be > 0".to_owned() });
        }
        if self.units.is_empty() {
            return Err(ConfigError::Invalid { detail: "no units configured".to_owned() });
        }

        let mut seen = std::collections::HashSet::new();
        for unit in &self.units {
            if !seen.insert(unit.unit_id) {
                return Err(ConfigError::Invalid {
                    detail: format!("duplicate unit_id {}", unit.unit_id),
                });
            }
            if unit.transport == TransportKind::Local && unit.region.is_none() {
                return Err(ConfigError::Invalid {
                    detail: format!("local unit {} has no region path", unit.unit_id),
                });
            }
        }
        Ok(())
    }

    /// Per-round response deadline.
    pub fn round_deadline(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.round_deadline_ms)
    }

    /// Attach phase bound.
    pub fn setup_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.setup_timeout_ms)
    }
}
