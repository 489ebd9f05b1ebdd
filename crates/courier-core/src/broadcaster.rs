//! Presence broadcasting.
//!
//! Whenever directory membership changes, every live connection receives
//! the fresh sorted roster. Fan-out happens under a single mutex so racing
//! broadcasts cannot interleave: each connection's mailbox observes rosters
//! in monotonic order, and the last one written always reflects the final
//! directory state. The critical section is bounded - a snapshot plus
//! non-blocking mailbox writes - so a slow socket can never stall presence.

use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

use crate::directory::Directory;
use crate::handle::{ConnectionHandle, Event};

/// Fans the online-user list out to every live connection.
pub struct PresenceBroadcaster {
    directory: Arc<Directory>,
    fanout: Mutex<()>,
}

impl PresenceBroadcaster {
    /// Create a broadcaster over the given directory.
    #[must_use]
    pub fn new(directory: Arc<Directory>) -> Self {
        Self {
            directory,
            fanout: Mutex::new(()),
        }
    }

    /// Push the current roster to every live connection.
    ///
    /// Dead mailboxes discovered during fan-out are removed from the
    /// directory; if that itself changes membership, the fan-out runs
    /// again with a fresh snapshot so no connection is left holding a
    /// roster that still lists the dead user.
    pub fn notify_changed(&self) {
        let mut rebroadcast = true;
        while rebroadcast {
            rebroadcast = false;

            let dead = {
                // The critical section performs no I/O and cannot panic.
                let _guard = self.fanout.lock().unwrap();
                let roster = Arc::new(self.directory.snapshot());
                let handles = self.directory.all_handles();
                trace!(users = roster.len(), connections = handles.len(), "Roster fan-out");

                let mut dead = Vec::new();
                for handle in handles {
                    if handle.send(Event::Roster(Arc::clone(&roster))).is_err() {
                        dead.push(handle);
                    }
                }
                dead
            };

            for handle in dead {
                if let Some((user, went_offline)) = self.directory.remove_connection(handle.id()) {
                    debug!(
                        user = %user,
                        connection = %handle.id(),
                        "Pruned dead connection during broadcast"
                    );
                    if went_offline {
                        rebroadcast = true;
                    }
                }
            }
        }
    }

    /// Push the current roster to a single connection.
    ///
    /// Used for joins that do not change membership (an additional device,
    /// a replacement session): no global broadcast is due, but the new
    /// connection must still observe a roster at least as fresh as its own
    /// join.
    pub fn send_roster_to(&self, handle: &ConnectionHandle) {
        let failed = {
            let _guard = self.fanout.lock().unwrap();
            let roster = Arc::new(self.directory.snapshot());
            handle.send(Event::Roster(roster)).is_err()
        };

        if failed {
            if let Some((user, went_offline)) = self.directory.remove_connection(handle.id()) {
                debug!(user = %user, connection = %handle.id(), "Joining connection already dead");
                if went_offline {
                    self.notify_changed();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    use crate::handle::{ConnectionId, UserId};

    fn handle(id: &str) -> (ConnectionHandle, UnboundedReceiver<Event>) {
        ConnectionHandle::attached(ConnectionId::new(id))
    }

    fn last_roster(rx: &mut UnboundedReceiver<Event>) -> Option<Vec<UserId>> {
        let mut latest = None;
        while let Ok(event) = rx.try_recv() {
            if let Event::Roster(users) = event {
                latest = Some(users.as_ref().clone());
            }
        }
        latest
    }

    #[test]
    fn test_broadcast_reaches_every_connection() {
        let directory = Arc::new(Directory::new());
        let broadcaster = PresenceBroadcaster::new(Arc::clone(&directory));

        let (h1, mut rx1) = handle("c1");
        let (h2, mut rx2) = handle("c2");
        directory.join("alice", h1).unwrap();
        directory.join("bob", h2).unwrap();

        broadcaster.notify_changed();

        let expected = vec!["alice".to_string(), "bob".to_string()];
        assert_eq!(last_roster(&mut rx1).unwrap(), expected);
        assert_eq!(last_roster(&mut rx2).unwrap(), expected);
    }

    #[test]
    fn test_dead_connection_pruned_and_rebroadcast() {
        let directory = Arc::new(Directory::new());
        let broadcaster = PresenceBroadcaster::new(Arc::clone(&directory));

        let (h1, mut rx1) = handle("c1");
        let (h2, rx2) = handle("c2");
        directory.join("alice", h1).unwrap();
        directory.join("bob", h2).unwrap();

        // Bob's writer task is gone
        drop(rx2);

        broadcaster.notify_changed();

        assert!(!directory.is_online("bob"));
        // Alice's final roster no longer lists bob
        assert_eq!(last_roster(&mut rx1).unwrap(), vec!["alice".to_string()]);
    }

    #[test]
    fn test_send_roster_to_single_connection() {
        let directory = Arc::new(Directory::new());
        let broadcaster = PresenceBroadcaster::new(Arc::clone(&directory));

        let (h1, _rx1) = handle("c1");
        let (h2, mut rx2) = handle("c2");
        directory.join("alice", h1).unwrap();
        directory.join("bob", h2.clone()).unwrap();

        broadcaster.send_roster_to(&h2);

        let roster = last_roster(&mut rx2).unwrap();
        assert_eq!(roster, vec!["alice".to_string(), "bob".to_string()]);
    }
}
