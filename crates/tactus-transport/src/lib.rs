//! Transport layer for the Tactus lockstep protocol.
//!
//! One point-to-point duplex channel per attached unit, behind a single
//! message-level contract:
//!
//! ```text
//! tactus-transport
//!   ├─ Channel          (enum dispatch over the two variants)
//!   ├─ NetworkChannel   (QUIC via quinn: one connection, one bi stream)
//!   ├─ SharedChannel    (file-backed region pair, release/acquire commit)
//!   └─ RetryPolicy      (capped exponential backoff for recoverable ops)
//! ```
//!
//! Both variants deliver messages in send order within one channel; no
//! ordering exists across channels. The orchestrator owns each channel
//! exclusively and correlates responses by channel identity, not arrival
//! order.

pub mod quic;
pub mod retry;
pub mod shm;

mod error;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tactus_proto::Message;

pub use error::TransportError;
pub use quic::{ConnectOptions, MAX_DECODE_FAULTS, NetworkChannel, NetworkListener};
pub use retry::RetryPolicy;
pub use shm::{SharedChannel, SharedRole};

/// Lifecycle of a channel.
///
/// `Failed` is terminal and reachable from any non-terminal state on a
/// transport-level error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Constructed, nothing initiated.
    Idle,
    /// Handshake in flight.
    Connecting,
    /// Ready to send and receive.
    Connected,
    /// Close initiated locally.
    Closing,
    /// Closed cleanly.
    Closed,
    /// Dead after a transport error.
    Failed,
}

/// How a unit is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Co-located process, shared-memory channel.
    Local,
    /// Network peer, QUIC channel.
    Remote,
}

/// A point-to-point duplex channel to one simulation unit.
///
/// Tagged variant over the two concrete transports, selected per connection
/// at attach time.
pub enum Channel {
    /// QUIC-backed channel.
    Network(NetworkChannel),
    /// Shared-memory channel.
    Shared(SharedChannel),
}

impl Channel {
    /// Which transport this channel uses.
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Network(_) => TransportKind::Remote,
            Self::Shared(_) => TransportKind::Local,
        }
    }

    /// Current channel state.
    pub fn state(&self) -> ChannelState {
        match self {
            Self::Network(channel) => channel.state(),
            Self::Shared(channel) => channel.state(),
        }
    }

    /// Send one message.
    pub async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        match self {
            Self::Network(channel) => channel.send(message).await,
            Self::Shared(channel) => channel.send(message),
        }
    }

    /// Await the next message, bounded by `deadline`.
    pub async fn next_message(&mut self, deadline: Duration) -> Result<Message, TransportError> {
        match self {
            Self::Network(channel) => channel.next_message(deadline).await,
            Self::Shared(channel) => channel.next_message(deadline).await,
        }
    }

    /// Discard already-received messages; returns how many were dropped.
    pub fn drain(&mut self) -> usize {
        match self {
            Self::Network(channel) => channel.drain(),
            Self::Shared(channel) => channel.drain(),
        }
    }

    /// Close the channel.
    pub fn close(&mut self) {
        match self {
            Self::Network(channel) => channel.close(),
            Self::Shared(channel) => channel.close(),
        }
    }
}

impl From<NetworkChannel> for Channel {
    fn from(channel: NetworkChannel) -> Self {
        Self::Network(channel)
    }
}

impl From<SharedChannel> for Channel {
    fn from(channel: SharedChannel) -> Self {
        Self::Shared(channel)
    }
}
