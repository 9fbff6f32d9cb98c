use thiserror::Error;

use crate::connection::ConnectionId;

/// Failures the relay core reports. None of them are fatal: callers log the
/// error and move on to the next message, recipient or tick.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("remote state fetch failed: {0}")]
    TransientFetch(String),

    #[error("malformed device message: {0}")]
    MalformedMessage(String),

    #[error("delivery to connection {connection} failed: {reason}")]
    DeliveryFailure {
        connection: ConnectionId,
        reason: DeliveryFailureReason,
    },

    #[error("device {0} not found")]
    UnresolvedTarget(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFailureReason {
    /// The socket writer for this connection has gone away.
    Closed,
    /// The outbound buffer is full; the message was dropped.
    Backpressure,
}

impl std::fmt::Display for DeliveryFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryFailureReason::Closed => f.write_str("connection closed"),
            DeliveryFailureReason::Backpressure => f.write_str("outbound buffer full"),
        }
    }
}
