//! Model backend contract.
//!
//! The numerical model executor is an external collaborator: the adapter
//! only needs get/set-by-reference and a single-step advance. FMU loaders,
//! co-simulation wrappers, and test doubles all fit behind this trait.

use std::collections::HashMap;

use tactus_proto::Value;
use thiserror::Error;

/// Errors surfaced by a model backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The backend does not expose the reference.
    #[error("backend does not expose reference {reference}")]
    UnknownReference {
        /// The missing reference.
        reference: u32,
    },

    /// The backend refused the operation.
    #[error("backend rejected operation: {reason}")]
    Rejected {
        /// Backend-specific failure description.
        reason: String,
    },
}

/// External model executor: get/set by reference plus single-step advance.
pub trait ModelBackend {
    /// Push one input value into the model.
    fn set_value(&mut self, reference: u32, value: &Value) -> Result<(), BackendError>;

    /// Read the current value of one variable.
    fn get_value(&self, reference: u32) -> Result<Value, BackendError>;

    /// Advance the model state by `timestep_us` microseconds.
    fn advance(&mut self, timestep_us: u64) -> Result<(), BackendError>;
}

/// In-memory backend holding a plain value table.
///
/// Values persist across steps and `advance` only accumulates time, which
/// is exactly what the runner binary and the integration tests need.
#[derive(Debug, Clone, Default)]
pub struct TableBackend {
    values: HashMap<u32, Value>,
    steps: u64,
    elapsed_us: u64,
}

impl TableBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a variable with its initial value.
    ///
    /// Re-registering a reference replaces the value and its kind.
    pub fn register(&mut self, reference: u32, initial: Value) {
        self.values.insert(reference, initial);
    }

    /// Number of completed steps.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Accumulated simulated time in microseconds.
    pub fn elapsed_us(&self) -> u64 {
        self.elapsed_us
    }
}

impl ModelBackend for TableBackend {
    fn set_value(&mut self, reference: u32, value: &Value) -> Result<(), BackendError> {
        let slot = self
            .values
            .get_mut(&reference)
            .ok_or(BackendError::UnknownReference { reference })?;

        if slot.kind() != value.kind() {
            return Err(BackendError::Rejected {
                reason: format!(
                    "reference {reference} holds {}, refusing {}",
                    slot.kind(),
                    value.kind()
                ),
            });
        }

        *slot = value.clone();
        Ok(())
    }

    fn get_value(&self, reference: u32) -> Result<Value, BackendError> {
        self.values
            .get(&reference)
            .cloned()
            .ok_or(BackendError::UnknownReference { reference })
    }

    fn advance(&mut self, timestep_us: u64) -> Result<(), BackendError> {
        self.steps += 1;
        self.elapsed_us += timestep_us;
        Ok(())
    }
}
