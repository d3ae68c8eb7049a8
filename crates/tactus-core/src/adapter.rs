//! Simulation unit adapter.
//!
//! The adapter sits between a transport channel and a model backend. It is
//! a sans-IO state machine: the runner decodes a `StepRequest`, hands it to
//! [`UnitAdapter::handle_request`], and sends whatever report comes back.
//!
//! ```text
//! Detached → Attached → Ready → Stepping → Ready → … → Detached
//!                                   └────→ Faulted (terminal)
//! ```
//!
//! Lockstep semantics allow exactly one outstanding step per unit: a
//! request arriving while a step is in flight is rejected, never queued.

use tactus_proto::{StepRequest, StepResponse, ValueKind};
use thiserror::Error;

use crate::{
    backend::{BackendError, ModelBackend},
    cache::{CacheError, Causality, VariableCache, VariableSpec},
};

/// Adapter lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    /// No backend attached.
    Detached,
    /// Cache built and validated against the backend.
    Attached,
    /// Waiting for a step request.
    Ready,
    /// A step is in flight.
    Stepping,
    /// The backend failed a step; terminal for this unit.
    Faulted,
}

/// Why an input variable was skipped rather than applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No slot exists for the reference.
    UnknownReference,
    /// The reference exists but is not an input.
    NotAnInput,
    /// The supplied value kind does not match the slot's fixed kind.
    KindMismatch {
        /// The slot's fixed kind.
        expected: ValueKind,
        /// The supplied kind.
        actual: ValueKind,
    },
}

/// One input variable the adapter skipped during a step.
///
/// Skips are warning-class: the step still completes, but the outcome is
/// distinguishable from a clean one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkippedInput {
    /// The offending reference.
    pub reference: u32,
    /// Why it was skipped.
    pub reason: SkipReason,
}

/// Outcome of a successfully completed step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    /// Outputs in cache registration order.
    pub response: StepResponse,
    /// Inputs that could not be applied.
    pub skipped: Vec<SkippedInput>,
}

impl StepReport {
    /// Whether every input was applied cleanly.
    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty()
    }
}

/// Errors from driving the adapter.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The adapter is not in a state that accepts the operation.
    #[error("unit is {state:?}, operation requires a different state")]
    NotReady {
        /// Observed state.
        state: UnitState,
    },

    /// A step is already in flight; lockstep forbids queueing.
    #[error("unit busy: a step is already in flight")]
    Busy,

    /// Step requests must carry a positive timestep.
    #[error("step request carries a zero timestep")]
    ZeroTimestep,

    /// The backend does not expose a declared variable.
    #[error("attach validation failed")]
    AttachFailed {
        /// The backend's complaint.
        #[source]
        source: BackendError,
    },

    /// The backend failed the step; the unit is now faulted.
    #[error("step failed")]
    StepFailed {
        /// The backend's complaint.
        #[source]
        source: BackendError,
    },
}

/// State machine driving one simulation unit.
pub struct UnitAdapter<B: ModelBackend> {
    unit_id: u32,
    state: UnitState,
    cache: VariableCache,
    backend: B,
}

impl<B: ModelBackend> UnitAdapter<B> {
    /// Create a detached adapter with its cache built from `specs`.
    pub fn new(unit_id: u32, specs: &[VariableSpec], backend: B) -> Result<Self, CacheError> {
        Ok(Self { unit_id, state: UnitState::Detached, cache: VariableCache::build(specs)?, backend })
    }

    /// The unit's configured id.
    pub fn unit_id(&self) -> u32 {
        self.unit_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> UnitState {
        self.state
    }

    /// The unit's variable cache.
    pub fn cache(&self) -> &VariableCache {
        &self.cache
    }

    /// Validate every declared reference against the backend.
    ///
    /// Probes each slot with a read so missing references and kind drift
    /// surface at attach time, not in the middle of round one.
    pub fn attach(&mut self) -> Result<(), AdapterError> {
        if self.state != UnitState::Detached {
            return Err(AdapterError::NotReady { state: self.state });
        }

        for slot in self.cache.slots() {
            let value = self
                .backend
                .get_value(slot.reference)
                .map_err(|source| AdapterError::AttachFailed { source })?;
            if value.kind() != slot.kind {
                return Err(AdapterError::AttachFailed {
                    source: BackendError::Rejected {
                        reason: format!(
                            "reference {} declared {}, backend holds {}",
                            slot.reference,
                            slot.kind,
                            value.kind()
                        ),
                    },
                });
            }
        }

        self.state = UnitState::Attached;
        Ok(())
    }

    /// Enter the `Ready` state.
    pub fn start(&mut self) -> Result<(), AdapterError> {
        if self.state != UnitState::Attached {
            return Err(AdapterError::NotReady { state: self.state });
        }
        self.state = UnitState::Ready;
        Ok(())
    }

    /// Apply inputs, advance the backend by one step, and assemble the
    /// response.
    ///
    /// Unresolvable inputs are skipped and reported; a backend failure
    /// faults the unit permanently.
    pub fn handle_request(&mut self, request: &StepRequest) -> Result<StepReport, AdapterError> {
        match self.state {
            UnitState::Ready => {},
            UnitState::Stepping => return Err(AdapterError::Busy),
            state => return Err(AdapterError::NotReady { state }),
        }
        if request.timestep_us == 0 {
            return Err(AdapterError::ZeroTimestep);
        }

        self.state = UnitState::Stepping;

        let mut skipped = Vec::new();
        for input in &request.inputs {
            match self.resolve_input(input.reference, input.value.kind()) {
                Ok(()) => {
                    // Cache update cannot fail after resolution succeeded.
                    let _ = self.cache.set_value(input.reference, input.value.clone());
                    if let Err(source) = self.backend.set_value(input.reference, &input.value) {
                        return self.fault(source);
                    }
                },
                Err(reason) => {
                    tracing::warn!(
                        unit_id = self.unit_id,
                        reference = input.reference,
                        ?reason,
                        "skipping unresolved input"
                    );
                    skipped.push(SkippedInput { reference: input.reference, reason });
                },
            }
        }

        if let Err(source) = self.backend.advance(request.timestep_us) {
            return self.fault(source);
        }

        let output_references: Vec<u32> =
            self.cache.outputs().map(|variable| variable.reference).collect();
        for reference in output_references {
            match self.backend.get_value(reference) {
                Ok(value) => {
                    if let Err(cache_error) = self.cache.set_value(reference, value) {
                        return self.fault(BackendError::Rejected {
                            reason: cache_error.to_string(),
                        });
                    }
                },
                Err(source) => return self.fault(source),
            }
        }

        let response = StepResponse { outputs: self.cache.outputs().collect() };
        self.state = UnitState::Ready;
        Ok(StepReport { response, skipped })
    }

    /// Leave the step loop and release the backend association.
    pub fn detach(&mut self) {
        self.state = UnitState::Detached;
    }

    fn resolve_input(&self, reference: u32, actual: ValueKind) -> Result<(), SkipReason> {
        let Some(slot) = self.cache.lookup(reference) else {
            return Err(SkipReason::UnknownReference);
        };
        if slot.causality != Causality::Input {
            return Err(SkipReason::NotAnInput);
        }
        if slot.kind != actual {
            return Err(SkipReason::KindMismatch { expected: slot.kind, actual });
        }
        Ok(())
    }

    fn fault(&mut self, source: BackendError) -> Result<StepReport, AdapterError> {
        tracing::error!(unit_id = self.unit_id, error = %source, "backend failed, unit faulted");
        self.state = UnitState::Faulted;
        Err(AdapterError::StepFailed { source })
    }
}
