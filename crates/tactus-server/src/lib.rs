//! Tactus orchestrator server.
//!
//! This crate provides the orchestrator process:
//!
//! ```text
//! tactus-server
//!   ├─ ServerConfig        (JSON configuration, per-unit transport + variables)
//!   ├─ ConnectionRegistry  (active connection set, attach order)
//!   ├─ Orchestrator        (round loop: fan-out, collect, failure policy)
//!   └─ Server              (attach phase + run loop over quinn/shared memory)
//! ```
//!
//! Startup is two-phase: [`Server::bind`] claims resources (creates the
//! shared regions for local units, binds the QUIC listener), then
//! [`Server::attach`] waits for every configured remote unit to identify
//! itself. Coupling between units — turning one unit's outputs into
//! another's next-round inputs — is deliberately external: the round API
//! takes a per-unit input map and the bundled run loop passes an empty one.

pub mod config;
pub mod orchestrator;
pub mod registry;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use tactus_proto::{AttachAck, Message};
use tactus_transport::{Channel, NetworkListener, SharedChannel, TransportError};
use thiserror::Error;

pub use config::{CertificatePaths, ConfigError, ServerConfig, UnitEntry};
pub use orchestrator::{
    FailurePolicy, Orchestrator, OrchestratorError, RoundConfig, RoundFailure, RoundReport,
};
pub use registry::{ConnectionRegistry, UnitConnection, UnitStatus};

/// Errors from running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Configuration problems.
    #[error("configuration error")]
    Config(#[from] ConfigError),

    /// Transport-level failure outside any round.
    #[error("transport error")]
    Transport(#[from] TransportError),

    /// The round loop hit a fatal condition.
    #[error("orchestrator error")]
    Orchestrator(#[from] OrchestratorError),

    /// Not every configured remote unit attached in time.
    #[error("attach phase timed out, missing units {missing:?}")]
    AttachTimeout {
        /// Unit ids that never attached.
        missing: Vec<u32>,
    },

    /// The bind address did not parse.
    #[error("invalid bind address: {addr}")]
    InvalidBind {
        /// The offending address string.
        addr: String,
    },
}

/// End-of-run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSummary {
    /// Rounds attempted.
    pub rounds: u64,
    /// Final global simulation time in microseconds.
    pub final_time_us: u64,
}

/// Production orchestrator: configuration, attach phase, and round loop.
pub struct Server {
    config: ServerConfig,
    orchestrator: Orchestrator,
    listener: Option<NetworkListener>,
    pending_remotes: Vec<u32>,
}

impl Server {
    /// Claim resources: create the shared regions for local units and bind
    /// the QUIC listener if any unit is remote.
    ///
    /// Remote units are not yet attached afterwards; call
    /// [`Server::attach`] before stepping.
    pub fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;

        let mut registry = ConnectionRegistry::new();
        let mut pending_remotes = Vec::new();

        for unit in &config.units {
            match unit.transport {
                tactus_transport::TransportKind::Local => {
                    // Validated: local units carry a region path.
                    let region = unit.region.clone().ok_or(ConfigError::Invalid {
                        detail: format!("local unit {} has no region path", unit.unit_id),
                    })?;
                    let channel = SharedChannel::create(&region, unit.capacity())?;
                    tracing::info!(
                        unit_id = unit.unit_id,
                        region = %region.display(),
                        capacity = unit.capacity(),
                        "shared region pair created"
                    );
                    registry.insert(UnitConnection::new(unit.unit_id, Channel::Shared(channel)));
                },
                tactus_transport::TransportKind::Remote => {
                    pending_remotes.push(unit.unit_id);
                },
            }
        }

        let listener = if pending_remotes.is_empty() {
            None
        } else {
            let addr: SocketAddr = config
                .bind
                .parse()
                .map_err(|_| ServerError::InvalidBind { addr: config.bind.clone() })?;
            let certificate = config
                .certificate
                .as_ref()
                .map(|paths| (paths.cert.as_path(), paths.key.as_path()));
            let listener = NetworkListener::bind(addr, certificate)?;
            tracing::info!(addr = %listener.local_addr()?, "listening for remote units");
            Some(listener)
        };

        let round_config = RoundConfig {
            timestep_us: config.timestep_us,
            deadline: config.round_deadline(),
            policy: FailurePolicy {
                max_round_failures: config.max_round_failures,
                strict: config.strict,
            },
        };

        Ok(Self {
            orchestrator: Orchestrator::new(registry, round_config),
            listener,
            pending_remotes,
            config,
        })
    }

    /// The listener's bound address, when any unit is remote.
    pub fn local_addr(&self) -> Result<Option<SocketAddr>, ServerError> {
        self.listener.as_ref().map(NetworkListener::local_addr).transpose().map_err(Into::into)
    }

    /// Accept connections until every configured remote unit has presented
    /// a valid `Attach`, bounded by the configured setup timeout.
    ///
    /// Unknown and duplicate unit ids are refused with a negative ack and
    /// their connections closed; they do not consume an attach slot.
    pub async fn attach(&mut self) -> Result<(), ServerError> {
        let Some(listener) = &self.listener else {
            return Ok(());
        };

        let deadline = tokio::time::Instant::now() + self.config.setup_timeout();

        while !self.pending_remotes.is_empty() {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .filter(|left| !left.is_zero())
                .ok_or_else(|| ServerError::AttachTimeout {
                    missing: self.pending_remotes.clone(),
                })?;

            let mut channel = match tokio::time::timeout(remaining, listener.accept()).await {
                Ok(accepted) => accepted?,
                Err(_) => {
                    return Err(ServerError::AttachTimeout {
                        missing: self.pending_remotes.clone(),
                    });
                },
            };

            // Connections have no identity until their Attach arrives; tag
            // them for the logs.
            let conn_id = {
                let mut buf = [0u8; 8];
                let _ = getrandom::fill(&mut buf);
                u64::from_le_bytes(buf)
            };
            tracing::debug!(conn_id, peer = %channel.remote_address(), "connection accepted");

            match channel.next_message(remaining).await {
                Ok(Message::Attach(attach)) => {
                    let unit_id = attach.unit_id;
                    if let Some(position) =
                        self.pending_remotes.iter().position(|&id| id == unit_id)
                    {
                        channel
                            .send(&Message::AttachAck(AttachAck { unit_id, accepted: true }))
                            .await?;
                        self.pending_remotes.swap_remove(position);
                        tracing::info!(conn_id, unit_id, "remote unit attached");
                        self.orchestrator
                            .registry_mut()
                            .insert(UnitConnection::new(unit_id, Channel::Network(channel)));
                    } else {
                        tracing::warn!(conn_id, unit_id, "unknown or duplicate unit, refusing");
                        let _ = channel
                            .send(&Message::AttachAck(AttachAck { unit_id, accepted: false }))
                            .await;
                        channel.close();
                    }
                },
                Ok(other) => {
                    tracing::warn!(conn_id, kind = ?other.kind(), "expected Attach, closing");
                    channel.close();
                },
                Err(error) => {
                    tracing::warn!(conn_id, %error, "no Attach received, closing");
                    channel.close();
                },
            }
        }

        Ok(())
    }

    /// The orchestrator, for callers driving rounds themselves.
    pub fn orchestrator_mut(&mut self) -> &mut Orchestrator {
        &mut self.orchestrator
    }

    /// Drive rounds until the configured count is reached, every unit is
    /// gone, or a strict-mode round failure halts the run.
    pub async fn run(mut self) -> Result<ServerSummary, ServerError> {
        let inputs: HashMap<u32, Vec<tactus_proto::Variable>> = HashMap::new();
        let pace = self
            .config
            .pace_realtime
            .then(|| Duration::from_micros(self.config.timestep_us));

        loop {
            if let Some(limit) = self.config.rounds {
                if self.orchestrator.round() >= limit {
                    break;
                }
            }

            match self.orchestrator.run_round(&inputs).await {
                Ok(report) => {
                    tracing::info!(
                        round = report.round,
                        time_us = report.time_us,
                        advanced = report.advanced,
                        responses = report.responses.len(),
                        failures = report.failures.len(),
                        "round complete"
                    );
                },
                Err(OrchestratorError::NoActiveUnits) => {
                    tracing::warn!("all units inactive, stopping");
                    break;
                },
                Err(error) => {
                    self.shutdown();
                    return Err(error.into());
                },
            }

            if let Some(pace) = pace {
                tokio::time::sleep(pace).await;
            }
        }

        let summary = ServerSummary {
            rounds: self.orchestrator.round(),
            final_time_us: self.orchestrator.time_us(),
        };
        self.shutdown();
        Ok(summary)
    }

    /// Close every channel and the listener.
    pub fn shutdown(&mut self) {
        self.orchestrator.shutdown();
        if let Some(listener) = &self.listener {
            listener.close();
        }
    }
}
