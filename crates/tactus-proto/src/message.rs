//! Protocol messages.
//!
//! One round of the lockstep protocol is a `StepRequest` fanned out by the
//! orchestrator and a `StepResponse` returned by each unit. `Attach` and
//! `AttachAck` run once per remote unit when its connection is established;
//! shared-memory units are attached out-of-band by configuration.

use crate::value::Variable;

/// Outer message kind byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    /// Orchestrator → unit: advance by one timestep.
    StepRequest = 1,
    /// Unit → orchestrator: outputs after a completed step.
    StepResponse = 2,
    /// Unit → orchestrator: identify this connection.
    Attach = 3,
    /// Orchestrator → unit: attach verdict.
    AttachAck = 4,
}

impl MessageKind {
    /// Wire byte for this kind.
    pub const fn byte(self) -> u8 {
        self as u8
    }
}

/// Orchestrator request to advance a unit by `timestep_us`.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRequest {
    /// Step duration in microseconds; always greater than zero.
    pub timestep_us: u64,
    /// Input values to apply before stepping. May be empty.
    pub inputs: Vec<Variable>,
}

/// Unit response carrying every output variable after a completed step.
///
/// Outputs appear in the unit's cache registration order, exactly one entry
/// per output-causality reference.
#[derive(Debug, Clone, PartialEq)]
pub struct StepResponse {
    /// Output values in cache order.
    pub outputs: Vec<Variable>,
}

/// First message a remote unit sends after opening its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attach {
    /// The configured id of the attaching unit.
    pub unit_id: u32,
}

/// Orchestrator verdict on an [`Attach`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachAck {
    /// Echo of the attaching unit's id.
    pub unit_id: u32,
    /// Whether the orchestrator accepted the unit.
    pub accepted: bool,
}

/// Outer protocol envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Advance by one timestep.
    StepRequest(StepRequest),
    /// Outputs of a completed step.
    StepResponse(StepResponse),
    /// Connection identification.
    Attach(Attach),
    /// Attach verdict.
    AttachAck(AttachAck),
}

impl Message {
    /// The kind byte of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::StepRequest(_) => MessageKind::StepRequest,
            Self::StepResponse(_) => MessageKind::StepResponse,
            Self::Attach(_) => MessageKind::Attach,
            Self::AttachAck(_) => MessageKind::AttachAck,
        }
    }
}

impl From<StepRequest> for Message {
    fn from(request: StepRequest) -> Self {
        Self::StepRequest(request)
    }
}

impl From<StepResponse> for Message {
    fn from(response: StepResponse) -> Self {
        Self::StepResponse(response)
    }
}
