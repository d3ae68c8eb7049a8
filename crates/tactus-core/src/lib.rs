//! Unit-side core of the Tactus lockstep protocol.
//!
//! ```text
//! tactus-core
//!   ├─ VariableCache   (reference → typed slot, stable output order)
//!   ├─ ModelBackend    (external model executor contract)
//!   ├─ TableBackend    (in-memory backend for tests and demos)
//!   └─ UnitAdapter     (sans-IO step state machine)
//! ```
//!
//! The adapter is a pure state machine: it consumes a decoded
//! [`tactus_proto::StepRequest`], drives the backend, and produces a
//! [`tactus_proto::StepResponse`]. All I/O lives in the transport and the
//! runner binaries.

pub mod adapter;
pub mod backend;
pub mod cache;

pub use adapter::{AdapterError, SkipReason, SkippedInput, StepReport, UnitAdapter, UnitState};
pub use backend::{BackendError, ModelBackend, TableBackend};
pub use cache::{CacheError, Causality, Slot, VariableCache, VariableSpec};
