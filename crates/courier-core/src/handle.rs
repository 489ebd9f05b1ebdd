//! Connection handles: the engine's view of one live client channel.
//!
//! A [`ConnectionHandle`] is an opaque, comparable reference to a
//! connection's outbound mailbox. The engine never performs socket I/O;
//! it pushes [`Event`]s into the mailbox and the transport's writer task
//! drains it onto the wire. Mailbox writes are non-blocking and preserve
//! order, which is what gives the router its per-sender ordering guarantee.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::message::Message;

/// A user identity: the unique username of a logged-in user.
pub type UserId = String;

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        Self(format!("conn_{:x}", timestamp))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// An event pushed from the engine to a connection.
///
/// Payloads are shared via `Arc` so a single roster or message is encoded
/// once per connection, not cloned per fan-out target.
#[derive(Debug, Clone)]
pub enum Event {
    /// The sorted list of currently-online users.
    Roster(Arc<Vec<UserId>>),
    /// A direct message: recipient delivery or sender echo.
    Delivery(Arc<Message>),
    /// The engine is done with this connection; the writer task should
    /// close the underlying socket.
    Closed,
}

/// The connection's mailbox is gone; its writer task has shut down.
#[derive(Debug, Error)]
#[error("Connection {0} is gone")]
pub struct SendFailure(pub ConnectionId);

/// A live, comparable handle to one client connection.
///
/// Handles are cheap to clone and compare equal by connection ID only.
/// The directory holds them by value but never creates or destroys the
/// underlying channel; that belongs to the transport.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<Event>,
}

impl ConnectionHandle {
    /// Create a handle together with the receiving end of its mailbox.
    ///
    /// The transport's writer task owns the receiver; tests use it as a
    /// mock transport.
    #[must_use]
    pub fn attached(id: ConnectionId) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id, outbound: tx }, rx)
    }

    /// Get the connection's unique identifier.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Push an event into the connection's mailbox.
    ///
    /// # Errors
    ///
    /// Fails only when the writer task has dropped the receiver, i.e. the
    /// connection is dead.
    pub fn send(&self, event: Event) -> Result<(), SendFailure> {
        self.outbound
            .send(event)
            .map_err(|_| SendFailure(self.id.clone()))
    }

    /// Ask the writer task to close the connection. Best effort: a handle
    /// that is already dead is silently ignored.
    pub fn close(&self) {
        let _ = self.outbound.send(Event::Closed);
    }

    /// Check whether the mailbox still has a receiver.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionHandle {}

impl Hash for ConnectionHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
    }

    #[test]
    fn test_handle_equality_by_id() {
        let (h1, _rx1) = ConnectionHandle::attached(ConnectionId::new("c1"));
        let (h2, _rx2) = ConnectionHandle::attached(ConnectionId::new("c1"));
        let (h3, _rx3) = ConnectionHandle::attached(ConnectionId::new("c2"));

        // Different mailboxes, same identity
        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
    }

    #[test]
    fn test_send_fails_after_receiver_dropped() {
        let (handle, rx) = ConnectionHandle::attached(ConnectionId::new("c1"));
        assert!(handle.is_open());

        drop(rx);
        assert!(!handle.is_open());
        assert!(handle.send(Event::Closed).is_err());
    }

    #[test]
    fn test_close_delivers_closed_event() {
        let (handle, mut rx) = ConnectionHandle::attached(ConnectionId::new("c1"));
        handle.close();

        assert!(matches!(rx.try_recv(), Ok(Event::Closed)));
    }
}
