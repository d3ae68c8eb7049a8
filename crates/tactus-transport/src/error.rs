//! Transport error taxonomy.

use tactus_proto::DecodeError;
use thiserror::Error;

/// Errors from either channel variant.
///
/// Connect, listen, and send failures are retryable with capped backoff
/// (see [`crate::RetryPolicy`]); exhausting retries is the caller's cue to
/// mark the connection inactive. A [`TransportError::Timeout`] is scoped to
/// the one awaited message and does not poison the channel.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection establishment failed or timed out.
    #[error("connect failed: {detail}")]
    Connect {
        /// What went wrong.
        detail: String,
    },

    /// Binding or accepting on the listening side failed.
    #[error("listen failed: {detail}")]
    Listen {
        /// What went wrong.
        detail: String,
    },

    /// The channel is not in the `Connected` state.
    #[error("channel is not connected")]
    NotConnected,

    /// Writing a message failed.
    #[error("send failed: {detail}")]
    Send {
        /// What went wrong.
        detail: String,
    },

    /// The peer closed the channel.
    #[error("channel closed by peer")]
    Closed,

    /// No message arrived within the deadline.
    #[error("deadline elapsed while awaiting a message")]
    Timeout,

    /// The peer sent malformed messages beyond the tolerated threshold.
    #[error("too many malformed messages ({faults}), channel failed")]
    TooManyDecodeFaults {
        /// Consecutive decode failures observed.
        faults: u32,
    },

    /// A shared-memory region could not be created, opened, or trusted.
    #[error("shared region error: {detail}")]
    Region {
        /// What went wrong.
        detail: String,
    },

    /// More variables than the region capacity agreed at creation.
    #[error("message carries {count} variables, region capacity is {capacity}")]
    CapacityExceeded {
        /// Variables in the refused message.
        count: usize,
        /// Agreed region capacity.
        capacity: usize,
    },

    /// A value not representable on this transport (strings over shared
    /// memory).
    #[error(transparent)]
    UnsupportedValue(#[from] tactus_proto::shm::UnrepresentableValue),

    /// A message failed to decode.
    #[error("decode failed")]
    Decode(#[from] DecodeError),

    /// TLS material could not be built or loaded.
    #[error("tls configuration error: {detail}")]
    Tls {
        /// What went wrong.
        detail: String,
    },

    /// Underlying I/O error.
    #[error("transport i/o error")]
    Io(#[from] std::io::Error),
}
