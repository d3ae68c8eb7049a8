//! Unit runner: the receive loop around a [`UnitAdapter`].
//!
//! The runner connects its channel (with retry, since the orchestrator may
//! come up later), performs the `Attach` handshake on remote transports,
//! and then serves step requests until the orchestrator goes away. A
//! faulted adapter closes the channel so the orchestrator sees this round
//! fail instead of waiting out its deadline.

use std::time::Duration;

use tactus_core::{AdapterError, CacheError, ModelBackend, UnitAdapter};
use tactus_proto::{Attach, Message};
use tactus_transport::{
    Channel, ConnectOptions, NetworkChannel, RetryPolicy, SharedChannel, TransportError,
    TransportKind,
};
use thiserror::Error;

use crate::config::ClientConfig;

/// Bound on the orchestrator's attach verdict after connecting.
const ATTACH_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Receive deadline used per wait when no idle limit is configured; a
/// timeout at this granularity just re-arms the wait.
const HEARTBEAT: Duration = Duration::from_secs(60);

/// Errors from running a unit.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Building the variable cache failed.
    #[error("cache error")]
    Cache(#[from] CacheError),

    /// Attach-time adapter failure.
    #[error("adapter error")]
    Adapter(#[from] AdapterError),

    /// Channel-level failure.
    #[error("transport error")]
    Transport(#[from] TransportError),

    /// The orchestrator refused this unit's attach.
    #[error("orchestrator refused attach of unit {unit_id}")]
    AttachRejected {
        /// This unit's id.
        unit_id: u32,
    },

    /// The configuration is missing a field this transport needs.
    #[error("invalid configuration: {detail}")]
    InvalidConfig {
        /// What is missing.
        detail: String,
    },

    /// The backend failed a step; the unit is faulted and its channel
    /// closed.
    #[error("unit faulted during a step")]
    Faulted,
}

/// End-of-run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerSummary {
    /// Step requests served.
    pub steps: u64,
    /// Total simulated time stepped, in microseconds.
    pub elapsed_us: u64,
}

/// Open this unit's channel per the configuration.
///
/// Remote: QUIC connect (with retry and timeout), then the
/// `Attach`/`AttachAck` handshake. Local: map the region pair the
/// orchestrator created, retrying while it does not exist yet.
pub async fn connect_channel(config: &ClientConfig) -> Result<Channel, RunnerError> {
    let retry: RetryPolicy = config.retry.into();

    match config.transport {
        TransportKind::Remote => {
            let endpoint = config.endpoint.as_ref().ok_or(RunnerError::InvalidConfig {
                detail: "remote unit has no endpoint".to_owned(),
            })?;
            let addr = endpoint.parse().map_err(|_| RunnerError::InvalidConfig {
                detail: format!("endpoint {endpoint} is not a socket address"),
            })?;
            let options = ConnectOptions {
                timeout: Some(config.connect_timeout()),
                ca_certificate: config.ca_certificate.clone(),
            };

            let server_name = config.server_name.clone();
            let mut channel = retry
                .run("quic connect", || {
                    NetworkChannel::connect(addr, &server_name, &options)
                })
                .await?;

            channel.send(&Message::Attach(Attach { unit_id: config.unit_id })).await?;
            match channel.next_message(ATTACH_REPLY_TIMEOUT).await? {
                Message::AttachAck(ack) if ack.accepted => {
                    tracing::info!(unit_id = config.unit_id, "attached to orchestrator");
                    Ok(Channel::Network(channel))
                },
                Message::AttachAck(_) => {
                    channel.close();
                    Err(RunnerError::AttachRejected { unit_id: config.unit_id })
                },
                other => {
                    channel.close();
                    Err(TransportError::Send {
                        detail: format!("expected AttachAck, got {:?}", other.kind()),
                    }
                    .into())
                },
            }
        },
        TransportKind::Local => {
            let region = config.region.clone().ok_or(RunnerError::InvalidConfig {
                detail: "local unit has no region path".to_owned(),
            })?;
            let capacity = config.variables.len();

            let channel = retry
                .run("open shared region", || {
                    let region = region.clone();
                    async move { SharedChannel::open(&region, capacity) }
                })
                .await?;
            tracing::info!(unit_id = config.unit_id, region = %region.display(), "region mapped");
            Ok(Channel::Shared(channel))
        },
    }
}

/// The receive loop around one adapter and its channel.
pub struct UnitRunner<B: ModelBackend> {
    adapter: UnitAdapter<B>,
    channel: Channel,
    idle_limit: Option<Duration>,
}

impl<B: ModelBackend> UnitRunner<B> {
    /// Attach and start the adapter, taking ownership of the channel.
    pub fn start(
        mut adapter: UnitAdapter<B>,
        channel: Channel,
        idle_limit: Option<Duration>,
    ) -> Result<Self, RunnerError> {
        adapter.attach()?;
        adapter.start()?;
        Ok(Self { adapter, channel, idle_limit })
    }

    /// Serve step requests until the orchestrator closes the channel or
    /// the idle limit elapses.
    pub async fn run(mut self) -> Result<RunnerSummary, RunnerError> {
        let unit_id = self.adapter.unit_id();
        let mut summary = RunnerSummary { steps: 0, elapsed_us: 0 };

        loop {
            let deadline = self.idle_limit.unwrap_or(HEARTBEAT);
            let message = match self.channel.next_message(deadline).await {
                Ok(message) => message,
                Err(TransportError::Timeout) => {
                    if self.idle_limit.is_some() {
                        tracing::info!(unit_id, "idle limit reached, stopping");
                        break;
                    }
                    continue;
                },
                Err(TransportError::Closed) => {
                    tracing::info!(unit_id, "orchestrator closed the channel");
                    break;
                },
                Err(error) => return Err(error.into()),
            };

            let request = match message {
                Message::StepRequest(request) => request,
                other => {
                    tracing::warn!(unit_id, kind = ?other.kind(), "discarding unexpected message");
                    continue;
                },
            };

            match self.adapter.handle_request(&request) {
                Ok(report) => {
                    if !report.is_clean() {
                        tracing::warn!(
                            unit_id,
                            skipped = report.skipped.len(),
                            "step completed with unresolved inputs"
                        );
                    }
                    summary.steps += 1;
                    summary.elapsed_us += request.timestep_us;
                    self.channel.send(&Message::StepResponse(report.response)).await?;
                },
                Err(AdapterError::Busy) => {
                    // Lockstep forbids queueing; the request is dropped.
                    tracing::warn!(unit_id, "step already in flight, rejecting request");
                },
                Err(AdapterError::StepFailed { source }) => {
                    tracing::error!(unit_id, error = %source, "backend failed, closing channel");
                    self.channel.close();
                    return Err(RunnerError::Faulted);
                },
                Err(error) => {
                    tracing::warn!(unit_id, %error, "request refused");
                },
            }
        }

        self.channel.close();
        Ok(summary)
    }
}
