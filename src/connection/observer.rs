//! Connection lifecycle observers.
//!
//! Every transport (server, client, bridge) reports the same three events.
//! Subscribers implement [`ConnectionObserver`] and are called synchronously,
//! in registration order, by [`Observers`].

use std::fmt;
use std::sync::Arc;

use super::ConnectionHandle;
use crate::core::Frame;

/// Why a connection went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Peer closed the stream
    Closed,
    /// Malformed or oversized header
    Framing(String),
    /// Socket-level failure
    Transport(String),
    /// Owning server or pool stopped
    Shutdown,
    /// Closed locally through [`ConnectionHandle::close`]
    Local,
}

impl DisconnectReason {
    /// Whether the connection ended because of an error.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            DisconnectReason::Framing(_) | DisconnectReason::Transport(_)
        )
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Closed => write!(f, "closed by peer"),
            DisconnectReason::Framing(e) => write!(f, "framing error: {e}"),
            DisconnectReason::Transport(e) => write!(f, "transport error: {e}"),
            DisconnectReason::Shutdown => write!(f, "shutdown"),
            DisconnectReason::Local => write!(f, "closed locally"),
        }
    }
}

/// Receives connection events. All methods default to no-ops.
///
/// Calls for one connection never overlap and arrive in order:
/// `on_connected`, then frames in send order, then exactly one
/// `on_disconnected`.
pub trait ConnectionObserver: Send + Sync {
    fn on_connected(&self, _conn: &Arc<ConnectionHandle>) {}

    fn on_frame(&self, _conn: &Arc<ConnectionHandle>, _frame: Frame) {}

    fn on_disconnected(&self, _conn: &Arc<ConnectionHandle>, _reason: &DisconnectReason) {}
}

/// Ordered list of observers.
#[derive(Clone, Default)]
pub struct Observers {
    list: Vec<Arc<dyn ConnectionObserver>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, observer: Arc<dyn ConnectionObserver>) {
        self.list.push(observer);
    }

    /// Builder form of [`Observers::push`].
    pub fn with(mut self, observer: Arc<dyn ConnectionObserver>) -> Self {
        self.push(observer);
        self
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn notify_connected(&self, conn: &Arc<ConnectionHandle>) {
        for observer in &self.list {
            observer.on_connected(conn);
        }
    }

    pub fn notify_frame(&self, conn: &Arc<ConnectionHandle>, frame: Frame) {
        // Frames are cheap to clone (payload is refcounted); skip it for the last observer.
        if let Some((last, rest)) = self.list.split_last() {
            for observer in rest {
                observer.on_frame(conn, frame.clone());
            }
            last.on_frame(conn, frame);
        }
    }

    pub fn notify_disconnected(&self, conn: &Arc<ConnectionHandle>, reason: &DisconnectReason) {
        for observer in &self.list {
            observer.on_disconnected(conn, reason);
        }
    }
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("count", &self.list.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_support::{loopback_handle, EventLog};

    #[tokio::test]
    async fn test_observers_called_in_registration_order() {
        let first = Arc::new(EventLog::default());
        let second = Arc::new(EventLog::default());
        let observers = Observers::new()
            .with(first.clone())
            .with(second.clone());

        let (conn, _peer) = loopback_handle(1).await;
        observers.notify_connected(&conn);
        observers.notify_frame(&conn, Frame::new(5, &b"x"[..]));
        observers.notify_disconnected(&conn, &DisconnectReason::Closed);

        for log in [first, second] {
            assert_eq!(
                log.events(),
                vec!["connect conn-1", "frame conn-1 5", "disconnect conn-1"]
            );
        }
    }

    #[test]
    fn test_reason_classification() {
        assert!(DisconnectReason::Framing("bad".into()).is_error());
        assert!(DisconnectReason::Transport("reset".into()).is_error());
        assert!(!DisconnectReason::Closed.is_error());
        assert!(!DisconnectReason::Shutdown.is_error());
        assert_eq!(DisconnectReason::Shutdown.to_string(), "shutdown");
    }
}
