//! Direct-message routing.
//!
//! The router resolves a recipient through the directory and delivers the
//! message to every one of their live connections, echoing the canonical
//! message (server-assigned id and timestamp) back to the sender exactly
//! once. Delivery to an offline recipient is fire-and-forget: the send
//! still succeeds, and the caller learns the recipient was away.

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::broadcaster::PresenceBroadcaster;
use crate::directory::Directory;
use crate::handle::{ConnectionHandle, Event};
use crate::message::Message;

/// Routing errors. Surfaced synchronously to the sender for user-facing
/// feedback; delivery failures are not errors (see [`MessageRouter::route`]).
#[derive(Debug, Error)]
pub enum RouteError {
    /// Content was empty after trimming whitespace.
    #[error("Message content is empty")]
    EmptyMessage,
}

/// How a routed message fared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Delivered to this many of the recipient's live sessions.
    Delivered {
        /// Number of sessions that accepted the message.
        sessions: usize,
    },
    /// The recipient had no live connections; the message was not queued.
    RecipientOffline,
}

/// Result of a successful route: the canonical message plus its outcome.
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    /// The constructed message, as echoed to the sender.
    pub message: Arc<Message>,
    /// Delivery outcome.
    pub outcome: RouteOutcome,
}

/// Read-only archival hook, notified after each successful route.
///
/// The surrounding system's history store implements this; routing
/// correctness never depends on it.
pub trait MessageArchive: Send + Sync {
    /// Called once per routed message, online or offline recipient alike.
    fn on_message_routed(&self, message: &Message);
}

/// Routes direct messages between live connections.
pub struct MessageRouter {
    directory: Arc<Directory>,
    broadcaster: Arc<PresenceBroadcaster>,
    archive: Option<Arc<dyn MessageArchive>>,
}

impl MessageRouter {
    /// Create a router over the given directory and broadcaster.
    #[must_use]
    pub fn new(directory: Arc<Directory>, broadcaster: Arc<PresenceBroadcaster>) -> Self {
        Self {
            directory,
            broadcaster,
            archive: None,
        }
    }

    /// Attach an archival hook.
    #[must_use]
    pub fn with_archive(mut self, archive: Arc<dyn MessageArchive>) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Route a direct message from a sender connection to a recipient.
    ///
    /// Delivery is attempted independently per recipient session; one dead
    /// session never aborts the others. Dead sessions are removed from the
    /// directory (implicit leave) and a presence broadcast is issued when
    /// that takes an identity offline. The sender receives the canonical
    /// message exactly once, whatever the recipient's state.
    ///
    /// Not idempotent: every call constructs a distinct message.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::EmptyMessage`] when the trimmed content is
    /// empty. No directory lookup happens in that case.
    pub fn route(
        &self,
        sender_handle: &ConnectionHandle,
        sender: &str,
        recipient: &str,
        content: &str,
    ) -> Result<DeliveryResult, RouteError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(RouteError::EmptyMessage);
        }

        let message = Arc::new(Message::new(sender, recipient, content));

        // Snapshot the destination set, then deliver outside any lock.
        let targets = self.directory.lookup(recipient);
        let recipient_online = !targets.is_empty();

        let mut delivered = 0;
        let mut dead: Vec<ConnectionHandle> = Vec::new();

        for target in targets {
            match target.send(Event::Delivery(Arc::clone(&message))) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(recipient, connection = %target.id(), %err, "Delivery failed");
                    dead.push(target);
                }
            }
        }

        // Exactly one echo per route call, even with zero or many targets.
        if sender_handle
            .send(Event::Delivery(Arc::clone(&message)))
            .is_err()
        {
            debug!(sender, connection = %sender_handle.id(), "Echo failed, sender gone");
            dead.push(sender_handle.clone());
        }

        self.heal(dead);

        if let Some(archive) = &self.archive {
            archive.on_message_routed(&message);
        }

        let outcome = if recipient_online {
            trace!(sender, recipient, id = message.id, sessions = delivered, "Routed");
            RouteOutcome::Delivered {
                sessions: delivered,
            }
        } else {
            trace!(sender, recipient, id = message.id, "Recipient offline");
            RouteOutcome::RecipientOffline
        };

        Ok(DeliveryResult { message, outcome })
    }

    /// Treat failed sends as implicit leaves so the directory never
    /// accumulates dead handles.
    fn heal(&self, dead: Vec<ConnectionHandle>) {
        let mut membership_changed = false;
        for handle in dead {
            if let Some((user, went_offline)) = self.directory.remove_connection(handle.id()) {
                debug!(user = %user, connection = %handle.id(), "Removed dead connection");
                membership_changed |= went_offline;
            }
        }
        if membership_changed {
            self.broadcaster.notify_changed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::mpsc::UnboundedReceiver;

    use crate::directory::SessionPolicy;
    use crate::handle::ConnectionId;

    fn handle(id: &str) -> (ConnectionHandle, UnboundedReceiver<Event>) {
        ConnectionHandle::attached(ConnectionId::new(id))
    }

    fn setup(policy: SessionPolicy) -> (Arc<Directory>, MessageRouter) {
        let directory = Arc::new(Directory::with_policy(policy));
        let broadcaster = Arc::new(PresenceBroadcaster::new(Arc::clone(&directory)));
        let router = MessageRouter::new(Arc::clone(&directory), broadcaster);
        (directory, router)
    }

    fn deliveries(rx: &mut UnboundedReceiver<Event>) -> Vec<Arc<Message>> {
        let mut messages = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let Event::Delivery(msg) = event {
                messages.push(msg);
            }
        }
        messages
    }

    #[test]
    fn test_delivery_to_all_sessions_exactly_once() {
        let (directory, router) = setup(SessionPolicy::MultiDevice);

        let (alice, mut alice_rx) = handle("a1");
        let (bob1, mut bob1_rx) = handle("b1");
        let (bob2, mut bob2_rx) = handle("b2");
        directory.join("alice", alice.clone()).unwrap();
        directory.join("bob", bob1).unwrap();
        directory.join("bob", bob2).unwrap();

        let result = router.route(&alice, "alice", "bob", "hi").unwrap();
        assert_eq!(result.outcome, RouteOutcome::Delivered { sessions: 2 });

        for rx in [&mut bob1_rx, &mut bob2_rx] {
            let msgs = deliveries(rx);
            assert_eq!(msgs.len(), 1);
            assert_eq!(msgs[0].sender, "alice");
            assert_eq!(msgs[0].content, "hi");
        }

        // Sender gets the same canonical message as the echo
        let echoes = deliveries(&mut alice_rx);
        assert_eq!(echoes.len(), 1);
        assert_eq!(echoes[0].id, result.message.id);
    }

    #[test]
    fn test_offline_fire_and_forget_with_echo() {
        let (directory, router) = setup(SessionPolicy::default());

        let (alice, mut alice_rx) = handle("a1");
        directory.join("alice", alice.clone()).unwrap();

        let result = router.route(&alice, "alice", "bob", "anyone there?").unwrap();
        assert_eq!(result.outcome, RouteOutcome::RecipientOffline);

        // Exactly one echo, nothing queued for bob
        assert_eq!(deliveries(&mut alice_rx).len(), 1);
        assert!(directory.lookup("bob").is_empty());
    }

    #[test]
    fn test_empty_message_rejected_before_lookup() {
        let (directory, router) = setup(SessionPolicy::default());

        let (alice, mut alice_rx) = handle("a1");
        directory.join("alice", alice.clone()).unwrap();

        assert!(matches!(
            router.route(&alice, "alice", "bob", "   "),
            Err(RouteError::EmptyMessage)
        ));
        // No echo either
        assert!(deliveries(&mut alice_rx).is_empty());
    }

    #[test]
    fn test_content_is_trimmed() {
        let (directory, router) = setup(SessionPolicy::default());

        let (alice, _alice_rx) = handle("a1");
        let (bob, mut bob_rx) = handle("b1");
        directory.join("alice", alice.clone()).unwrap();
        directory.join("bob", bob).unwrap();

        router.route(&alice, "alice", "bob", "  hi  ").unwrap();
        assert_eq!(deliveries(&mut bob_rx)[0].content, "hi");
    }

    #[test]
    fn test_self_healing_on_dead_session() {
        let (directory, router) = setup(SessionPolicy::MultiDevice);

        let (alice, mut alice_rx) = handle("a1");
        let (bob1, bob1_rx) = handle("b1");
        let (bob2, mut bob2_rx) = handle("b2");
        directory.join("alice", alice.clone()).unwrap();
        directory.join("bob", bob1).unwrap();
        directory.join("bob", bob2).unwrap();

        // b1's writer task died
        drop(bob1_rx);

        let result = router.route(&alice, "alice", "bob", "hi").unwrap();
        // Partial delivery is success
        assert_eq!(result.outcome, RouteOutcome::Delivered { sessions: 1 });
        assert_eq!(deliveries(&mut bob2_rx).len(), 1);

        // The dead session was removed, bob stays online through b2
        let live = directory.lookup("bob");
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id().as_str(), "b2");
        // Sender got the echo despite the partial failure
        assert_eq!(deliveries(&mut alice_rx).len(), 1);
    }

    #[test]
    fn test_dead_last_session_takes_identity_offline_and_broadcasts() {
        let (directory, router) = setup(SessionPolicy::default());

        let (alice, mut alice_rx) = handle("a1");
        let (bob, bob_rx) = handle("b1");
        directory.join("alice", alice.clone()).unwrap();
        directory.join("bob", bob).unwrap();
        drop(bob_rx);

        router.route(&alice, "alice", "bob", "hi").unwrap();

        assert!(!directory.is_online("bob"));
        assert_eq!(directory.snapshot(), vec!["alice".to_string()]);

        // Alice observed the echo and then a roster without bob
        let mut saw_roster_without_bob = false;
        while let Ok(event) = alice_rx.try_recv() {
            if let Event::Roster(users) = event {
                saw_roster_without_bob = users.as_ref() == &vec!["alice".to_string()];
            }
        }
        assert!(saw_roster_without_bob);
    }

    #[test]
    fn test_per_sender_ordering() {
        let (directory, router) = setup(SessionPolicy::default());

        let (alice, _alice_rx) = handle("a1");
        let (bob, mut bob_rx) = handle("b1");
        directory.join("alice", alice.clone()).unwrap();
        directory.join("bob", bob).unwrap();

        for i in 0..10 {
            router.route(&alice, "alice", "bob", &format!("msg-{i}")).unwrap();
        }

        let contents: Vec<String> = deliveries(&mut bob_rx)
            .iter()
            .map(|m| m.content.clone())
            .collect();
        let expected: Vec<String> = (0..10).map(|i| format!("msg-{i}")).collect();
        assert_eq!(contents, expected);
    }

    #[test]
    fn test_archive_hook_fires_for_online_and_offline() {
        struct Recorder(Mutex<Vec<MessageId>>);
        impl MessageArchive for Recorder {
            fn on_message_routed(&self, message: &Message) {
                self.0.lock().unwrap().push(message.id);
            }
        }
        use crate::message::MessageId;

        let directory = Arc::new(Directory::new());
        let broadcaster = Arc::new(PresenceBroadcaster::new(Arc::clone(&directory)));
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let router = MessageRouter::new(Arc::clone(&directory), broadcaster)
            .with_archive(Arc::clone(&recorder) as Arc<dyn MessageArchive>);

        let (alice, _alice_rx) = handle("a1");
        let (bob, _bob_rx) = handle("b1");
        directory.join("alice", alice.clone()).unwrap();
        directory.join("bob", bob).unwrap();

        router.route(&alice, "alice", "bob", "online").unwrap();
        router.route(&alice, "alice", "carol", "offline").unwrap();

        assert_eq!(recorder.0.lock().unwrap().len(), 2);
    }
}
