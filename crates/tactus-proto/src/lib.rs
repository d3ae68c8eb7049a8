//! Wire protocol for Tactus lockstep co-simulation.
//!
//! This crate defines the messages exchanged between the orchestrator and
//! its simulation units, and the two binary forms they travel in:
//!
//! ```text
//! tactus-proto
//!   ├─ Message        (envelope: StepRequest / StepResponse / Attach / AttachAck)
//!   ├─ Variable       (value reference + typed value)
//!   ├─ codec          (deterministic binary encode/decode + length framing)
//!   └─ shm            (fixed-layout header + 16-byte records for shared memory)
//! ```
//!
//! The codec is a pure transform: the same logical message always encodes to
//! byte-identical output, and decoding never mutates state. Network channels
//! carry length-prefix framed codec output; shared-memory channels carry the
//! fixed record layout from [`shm`].

mod codec;
mod error;
mod message;
pub mod shm;
mod value;

pub use codec::{LENGTH_PREFIX_SIZE, MAX_MESSAGE_SIZE, encode_framed};
pub use error::DecodeError;
pub use message::{Attach, AttachAck, Message, MessageKind, StepRequest, StepResponse};
pub use value::{Value, ValueKind, Variable};
