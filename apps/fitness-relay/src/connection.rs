use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::error::{DeliveryFailureReason, RelayError};
use crate::protocol::RelayMessage;

pub const DEFAULT_OUTBOUND_BUFFER: usize = 64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Sending half of a live device connection.
///
/// The socket writer task owns the matching receiver; once it exits (socket
/// closed or write error) the handle reports itself as no longer open and
/// every further send fails fast.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<RelayMessage>,
}

impl ConnectionHandle {
    /// Allocate a fresh connection id and its bounded outbound queue.
    pub fn open(buffer: usize) -> (Self, mpsc::Receiver<RelayMessage>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            Self {
                id: ConnectionId::next(),
                tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queue a message without waiting; a slow peer loses the message rather
    /// than stalling the caller.
    pub fn try_send(&self, message: RelayMessage) -> Result<(), RelayError> {
        self.tx.try_send(message).map_err(|err| {
            let reason = match err {
                TrySendError::Full(_) => DeliveryFailureReason::Backpressure,
                TrySendError::Closed(_) => DeliveryFailureReason::Closed,
            };
            RelayError::DeliveryFailure {
                connection: self.id,
                reason,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SystemCommand;

    #[test_timeout::timeout]
    fn ids_are_unique() {
        let (a, _rx_a) = ConnectionHandle::open(4);
        let (b, _rx_b) = ConnectionHandle::open(4);
        assert_ne!(a.id(), b.id());
    }

    #[test_timeout::timeout]
    fn dropped_receiver_closes_handle() {
        let (handle, rx) = ConnectionHandle::open(4);
        assert!(handle.is_open());
        drop(rx);
        assert!(!handle.is_open());
        let err = handle
            .try_send(RelayMessage::SystemCommand(SystemCommand::StartWorkout))
            .unwrap_err();
        assert!(matches!(
            err,
            RelayError::DeliveryFailure {
                reason: DeliveryFailureReason::Closed,
                ..
            }
        ));
    }

    #[test_timeout::timeout]
    fn full_buffer_reports_backpressure() {
        let (handle, _rx) = ConnectionHandle::open(1);
        handle
            .try_send(RelayMessage::SystemCommand(SystemCommand::StartWorkout))
            .expect("first message fits");
        let err = handle
            .try_send(RelayMessage::SystemCommand(SystemCommand::StopWorkout))
            .unwrap_err();
        assert!(matches!(
            err,
            RelayError::DeliveryFailure {
                reason: DeliveryFailureReason::Backpressure,
                ..
            }
        ));
    }
}
