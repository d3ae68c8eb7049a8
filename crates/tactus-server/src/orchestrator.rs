//! Lockstep round loop.
//!
//! The orchestrator owns global simulation time and the connection
//! registry. One round: drain stale responses, fan the per-unit
//! `StepRequest`s out concurrently, collect every response under the round
//! deadline, then advance time only if the failure tolerance holds.
//!
//! Responses are correlated by connection identity and round, never by
//! arrival order; draining before the fan-out keeps a late response from a
//! previous round out of the new one. Transport failures deactivate a unit
//! permanently, a timeout fails it for the current round only — if it
//! answers again next round it rejoins.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use futures::future::join_all;
use tactus_proto::{Message, StepRequest, StepResponse, Variable};
use tactus_transport::TransportError;
use thiserror::Error;

use crate::registry::ConnectionRegistry;

/// How many unit failures a round tolerates and what happens beyond that.
#[derive(Debug, Clone, Copy)]
pub struct FailurePolicy {
    /// Unit failures tolerated per round; exceeding this fails the round.
    pub max_round_failures: u32,
    /// Halt on a failed round instead of continuing with the reduced set.
    pub strict: bool,
}

impl FailurePolicy {
    /// Whether a round with `failures` failed units may advance time.
    pub fn allows(&self, failures: usize) -> bool {
        failures <= self.max_round_failures as usize
    }
}

/// Per-round parameters.
#[derive(Debug, Clone, Copy)]
pub struct RoundConfig {
    /// Timestep per round in microseconds; always greater than zero.
    pub timestep_us: u64,
    /// Response deadline per round.
    pub deadline: Duration,
    /// Failure tolerance.
    pub policy: FailurePolicy,
}

/// Why a unit failed its round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundFailure {
    /// No response within the round deadline; the unit stays attached.
    Timeout,
    /// The channel failed or closed; the unit is deactivated.
    Transport(String),
    /// The unit answered with something other than a step response; the
    /// pairing can no longer be trusted and the unit is deactivated.
    Protocol(String),
}

/// Outcome of one round.
#[derive(Debug)]
pub struct RoundReport {
    /// Round number, counted from 1, failed attempts included.
    pub round: u64,
    /// Global time after the round.
    pub time_us: u64,
    /// Whether time advanced this round.
    pub advanced: bool,
    /// Collected responses, one per completing unit.
    pub responses: Vec<(u32, StepResponse)>,
    /// Units that failed this round.
    pub failures: Vec<(u32, RoundFailure)>,
    /// Stale messages discarded before the fan-out.
    pub stale_drained: usize,
}

/// Fatal orchestrator conditions.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Every unit is inactive; there is nothing left to drive.
    #[error("no active units remain")]
    NoActiveUnits,

    /// A round exceeded the failure tolerance under the strict policy.
    #[error("round failed: {failures} unit failures, tolerance {tolerated}")]
    ToleranceExceeded {
        /// Units that failed the round.
        failures: usize,
        /// The configured tolerance.
        tolerated: u32,
    },
}

/// Owns global simulation time and drives the round loop.
pub struct Orchestrator {
    registry: ConnectionRegistry,
    config: RoundConfig,
    time_us: u64,
    round: u64,
}

impl Orchestrator {
    /// Create an orchestrator over an attached registry.
    pub fn new(registry: ConnectionRegistry, config: RoundConfig) -> Self {
        Self { registry, config, time_us: 0, round: 0 }
    }

    /// Global simulation time in microseconds.
    pub fn time_us(&self) -> u64 {
        self.time_us
    }

    /// Rounds attempted so far.
    pub fn round(&self) -> u64 {
        self.round
    }

    /// The connection set.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Mutable access to the connection set.
    pub fn registry_mut(&mut self) -> &mut ConnectionRegistry {
        &mut self.registry
    }

    /// Drive one round of `timestep_us` across all active units.
    ///
    /// `inputs` carries per-unit input variables for this round; how they
    /// are computed from previous outputs is the caller's business. Units
    /// absent from the map receive an empty input set.
    pub async fn run_round(
        &mut self,
        inputs: &HashMap<u32, Vec<Variable>>,
    ) -> Result<RoundReport, OrchestratorError> {
        if self.registry.active_count() == 0 {
            return Err(OrchestratorError::NoActiveUnits);
        }

        self.round += 1;
        let round = self.round;
        let timestep_us = self.config.timestep_us;

        // Stale responses from a previous round must not be attributed to
        // this one.
        let mut stale_drained = 0;
        for connection in self.registry.active_mut() {
            let dropped = connection.channel.drain();
            if dropped > 0 {
                tracing::warn!(
                    unit_id = connection.unit_id,
                    dropped,
                    "discarded stale messages before fan-out"
                );
                stale_drained += dropped;
            }
        }

        // Concurrent fan-out; a slow unit must not delay the others' sends.
        let send_results: Vec<(u32, Result<(), TransportError>)> =
            join_all(self.registry.active_mut().map(|connection| {
                let request = StepRequest {
                    timestep_us,
                    inputs: inputs.get(&connection.unit_id).cloned().unwrap_or_default(),
                };
                async move {
                    let message = Message::StepRequest(request);
                    let result = connection.channel.send(&message).await;
                    (connection.unit_id, result)
                }
            }))
            .await;

        let mut failures: Vec<(u32, RoundFailure)> = Vec::new();
        let mut awaiting: HashSet<u32> = HashSet::new();
        for (unit_id, result) in send_results {
            match result {
                Ok(()) => {
                    awaiting.insert(unit_id);
                },
                Err(error) => {
                    tracing::error!(unit_id, %error, "send failed");
                    failures.push((unit_id, RoundFailure::Transport(error.to_string())));
                },
            }
        }

        // Collect every response concurrently, each bounded by the round
        // deadline.
        let deadline = self.config.deadline;
        let recv_results: Vec<(u32, Result<Message, TransportError>)> = join_all(
            self.registry
                .active_mut()
                .filter(|connection| awaiting.contains(&connection.unit_id))
                .map(|connection| {
                    async move {
                        let result = connection.channel.next_message(deadline).await;
                        (connection.unit_id, result)
                    }
                }),
        )
        .await;

        let mut responses: Vec<(u32, StepResponse)> = Vec::new();
        for (unit_id, result) in recv_results {
            match result {
                Ok(Message::StepResponse(response)) => responses.push((unit_id, response)),
                Ok(other) => {
                    failures.push((
                        unit_id,
                        RoundFailure::Protocol(format!(
                            "unexpected {:?} during round",
                            other.kind()
                        )),
                    ));
                },
                Err(TransportError::Timeout) => {
                    tracing::warn!(unit_id, round, "no response within round deadline");
                    failures.push((unit_id, RoundFailure::Timeout));
                },
                Err(error) => {
                    failures.push((unit_id, RoundFailure::Transport(error.to_string())));
                },
            }
        }

        // Transport and protocol failures are unrecoverable for the
        // connection; a timeout leaves the unit attached for the next round.
        for (unit_id, failure) in &failures {
            match failure {
                RoundFailure::Timeout => {},
                RoundFailure::Transport(reason) | RoundFailure::Protocol(reason) => {
                    self.registry.deactivate(*unit_id, reason);
                },
            }
        }

        let advanced = self.config.policy.allows(failures.len());
        if advanced {
            self.time_us += timestep_us;
        } else {
            tracing::error!(
                round,
                failures = failures.len(),
                tolerated = self.config.policy.max_round_failures,
                "round failed, global time not advanced"
            );
            if self.config.policy.strict {
                return Err(OrchestratorError::ToleranceExceeded {
                    failures: failures.len(),
                    tolerated: self.config.policy.max_round_failures,
                });
            }
        }

        Ok(RoundReport {
            round,
            time_us: self.time_us,
            advanced,
            responses,
            failures,
            stale_drained,
        })
    }

    /// Close every channel.
    pub fn shutdown(&mut self) {
        tracing::info!(time_us = self.time_us, rounds = self.round, "orchestrator shutting down");
        self.registry.close_all();
    }
}
