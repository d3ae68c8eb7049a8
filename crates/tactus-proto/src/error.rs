//! Decode error taxonomy.

use thiserror::Error;

/// Errors from decoding a wire message.
///
/// A decode failure never tears down the connection by itself: the caller
/// discards the offending buffer and decides whether repeated failures
/// escalate (see the transport layer's fault counter).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Fewer bytes were available than the message declares.
    #[error("truncated message: needed {expected} bytes, got {actual}")]
    Truncated {
        /// Total bytes the message needs up to the failing field.
        expected: usize,
        /// Bytes actually available.
        actual: usize,
    },

    /// Unrecognized variable type tag.
    #[error("unknown variable type tag: {tag:#04x}")]
    UnknownType {
        /// The offending tag byte.
        tag: u8,
    },

    /// The declared message kind does not match the payload present.
    #[error("schema mismatch: {detail}")]
    SchemaMismatch {
        /// What was inconsistent.
        detail: String,
    },
}

impl DecodeError {
    /// Shorthand for a [`DecodeError::SchemaMismatch`].
    pub(crate) fn mismatch(detail: impl Into<String>) -> Self {
        Self::SchemaMismatch { detail: detail.into() }
    }
}
