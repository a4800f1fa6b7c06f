//! Session mailboxes: the seam between the relay core and the transport.
//!
//! The registry holds one `SessionHandle` per connected session -- the
//! sending half of a bounded `mpsc` mailbox. The transport (the WebSocket
//! gateway, or a test harness) holds the receiving half and pumps events to
//! the peer. Pushes never block: a full mailbox is a delivery failure for
//! that one recipient, not backpressure on the publisher.

use chatwire_types::event::ServerEvent;
use thiserror::Error;
use tokio::sync::mpsc;

/// Failure to push an event into a session mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PushError {
    /// The mailbox is full (slow consumer).
    #[error("session mailbox full")]
    Full,

    /// The receiving half is gone (transport already closed).
    #[error("session mailbox closed")]
    Closed,
}

/// Sending half of a session's outbound mailbox.
///
/// Cloning shares the same mailbox.
#[derive(Clone)]
pub struct SessionHandle {
    sender: mpsc::Sender<ServerEvent>,
}

impl SessionHandle {
    /// Push an event without waiting.
    ///
    /// Full and closed mailboxes are distinct failures: a full mailbox may
    /// drain and accept a retry, a closed one never will.
    pub fn push(&self, event: ServerEvent) -> Result<(), PushError> {
        self.sender.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PushError::Full,
            mpsc::error::TrySendError::Closed(_) => PushError::Closed,
        })
    }

    /// Whether the receiving half has been dropped.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

/// Create a session mailbox pair with the given capacity.
pub fn session_mailbox(capacity: usize) -> (SessionHandle, mpsc::Receiver<ServerEvent>) {
    let (tx, rx) = mpsc::channel(capacity);
    (SessionHandle { sender: tx }, rx)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn connected_event() -> ServerEvent {
        ServerEvent::Connected {
            session_id: Uuid::now_v7(),
        }
    }

    #[tokio::test]
    async fn push_and_receive() {
        let (handle, mut rx) = session_mailbox(4);
        handle.push(connected_event()).unwrap();

        let received = rx.recv().await.unwrap();
        assert!(matches!(received, ServerEvent::Connected { .. }));
    }

    #[tokio::test]
    async fn full_mailbox_reports_full() {
        let (handle, _rx) = session_mailbox(1);
        handle.push(connected_event()).unwrap();

        let result = handle.push(connected_event());
        assert!(matches!(result, Err(PushError::Full)));
    }

    #[tokio::test]
    async fn dropped_receiver_reports_closed() {
        let (handle, rx) = session_mailbox(4);
        drop(rx);

        let result = handle.push(connected_event());
        assert!(matches!(result, Err(PushError::Closed)));
        assert!(handle.is_closed());
    }

    #[test]
    fn debug_impl() {
        let (handle, _rx) = session_mailbox(4);
        let debug = format!("{handle:?}");
        assert!(debug.contains("SessionHandle"));
    }
}
