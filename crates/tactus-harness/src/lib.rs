//! In-process integration harness for Tactus.
//!
//! Spins up a real orchestrator and real unit runners inside one test
//! process, over the same channels production uses: QUIC on loopback and
//! shared regions on a temp directory. The backend double is observable
//! (step counter exposed as an output) and scriptable (failure at a chosen
//! step), so end-to-end tests can assert lockstep invariants from the
//! round reports alone.

use std::path::PathBuf;

use tactus_client::{ClientConfig, RetrySettings, RunnerError, RunnerSummary, UnitRunner};
use tactus_core::{
    BackendError, Causality, ModelBackend, UnitAdapter, VariableSpec,
};
use tactus_proto::{Value, ValueKind};
use tactus_server::UnitEntry;
use tactus_transport::TransportKind;
use tokio::task::JoinHandle;

/// The bench unit's variable set: two inputs, two outputs.
///
/// Reference 2 exposes the completed-step count, reference 3 echoes the
/// last reference-0 input applied before an `advance`.
pub fn bench_variables() -> Vec<VariableSpec> {
    vec![
        VariableSpec { reference: 0, kind: ValueKind::Real, causality: Causality::Input },
        VariableSpec { reference: 1, kind: ValueKind::Integer, causality: Causality::Input },
        VariableSpec { reference: 2, kind: ValueKind::Integer, causality: Causality::Output },
        VariableSpec { reference: 3, kind: ValueKind::Real, causality: Causality::Output },
    ]
}

/// Observable, scriptable backend for the bench unit.
#[derive(Debug, Clone, Default)]
pub struct CountingBackend {
    steps: u64,
    drive: f64,
    gear: i32,
    echo: f64,
    fail_at_step: Option<u64>,
}

impl CountingBackend {
    /// A backend that never fails.
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend whose `advance` fails on the given (1-based) step.
    pub fn failing_at(step: u64) -> Self {
        Self { fail_at_step: Some(step), ..Self::default() }
    }
}

impl ModelBackend for CountingBackend {
    fn set_value(&mut self, reference: u32, value: &Value) -> Result<(), BackendError> {
        match (reference, value) {
            (0, Value::Real(v)) => {
                self.drive = *v;
                Ok(())
            },
            (1, Value::Integer(v)) => {
                self.gear = *v;
                Ok(())
            },
            (0 | 1, other) => Err(BackendError::Rejected {
                reason: format!("reference {reference} refuses {}", other.kind()),
            }),
            _ => Err(BackendError::UnknownReference { reference }),
        }
    }

    fn get_value(&self, reference: u32) -> Result<Value, BackendError> {
        match reference {
            0 => Ok(Value::Real(self.drive)),
            1 => Ok(Value::Integer(self.gear)),
            2 => Ok(Value::Integer(i32::try_from(self.steps).unwrap_or(i32::MAX))),
            3 => Ok(Value::Real(self.echo)),
            _ => Err(BackendError::UnknownReference { reference }),
        }
    }

    fn advance(&mut self, _timestep_us: u64) -> Result<(), BackendError> {
        if self.fail_at_step == Some(self.steps + 1) {
            return Err(BackendError::Rejected { reason: "scripted failure".to_owned() });
        }
        self.steps += 1;
        self.echo = self.drive;
        Ok(())
    }
}

/// Orchestrator-side entry for a shared-memory bench unit.
pub fn local_unit_entry(unit_id: u32, region: PathBuf) -> UnitEntry {
    UnitEntry {
        unit_id,
        transport: TransportKind::Local,
        region: Some(region),
        variables: bench_variables(),
    }
}

/// Orchestrator-side entry for a QUIC bench unit.
pub fn remote_unit_entry(unit_id: u32) -> UnitEntry {
    UnitEntry {
        unit_id,
        transport: TransportKind::Remote,
        region: None,
        variables: bench_variables(),
    }
}

/// Runner configuration for a shared-memory bench unit.
pub fn local_client_config(unit_id: u32, region: PathBuf) -> ClientConfig {
    ClientConfig {
        unit_id,
        transport: TransportKind::Local,
        endpoint: None,
        server_name: "localhost".to_owned(),
        ca_certificate: None,
        region: Some(region),
        connect_timeout_ms: 5000,
        retry: RetrySettings::default(),
        idle_limit_ms: Some(1000),
        variables: bench_variables(),
    }
}

/// Runner configuration for a QUIC bench unit.
pub fn remote_client_config(unit_id: u32, endpoint: String) -> ClientConfig {
    ClientConfig {
        unit_id,
        transport: TransportKind::Remote,
        endpoint: Some(endpoint),
        server_name: "localhost".to_owned(),
        ca_certificate: None,
        region: None,
        connect_timeout_ms: 5000,
        retry: RetrySettings::default(),
        idle_limit_ms: Some(1000),
        variables: bench_variables(),
    }
}

/// Spawn a unit runner task over the given backend.
pub fn spawn_unit(
    config: ClientConfig,
    backend: CountingBackend,
) -> JoinHandle<Result<RunnerSummary, RunnerError>> {
    tokio::spawn(async move {
        let adapter = UnitAdapter::new(config.unit_id, &config.variables, backend)?;
        let channel = tactus_client::connect_channel(&config).await?;
        UnitRunner::start(adapter, channel, config.idle_limit())?.run().await
    })
}
