//! Tactus unit runner.
//!
//! ```text
//! tactus-client
//!   ├─ ClientConfig   (JSON configuration: transport + variables)
//!   ├─ connect_channel (QUIC connect + Attach, or region mapping, with retry)
//!   └─ UnitRunner     (receive loop around a UnitAdapter)
//! ```
//!
//! The bundled binary drives a [`tactus_core::TableBackend`]; embedders
//! with a real model plug any [`tactus_core::ModelBackend`] into
//! [`UnitRunner`] directly.

pub mod config;
pub mod runner;

use tactus_core::{TableBackend, VariableSpec};
use tactus_proto::Value;

pub use config::{ClientConfig, ConfigError, RetrySettings};
pub use runner::{RunnerError, RunnerSummary, UnitRunner, connect_channel};

/// Build a [`TableBackend`] exposing every declared variable at its zero
/// value.
pub fn table_backend(variables: &[VariableSpec]) -> TableBackend {
    let mut backend = TableBackend::new();
    for spec in variables {
        backend.register(spec.reference, Value::zero(spec.kind));
    }
    backend
}
