//! The engine's public surface.
//!
//! `PresenceEngine` is a thin composition root over the directory, the
//! broadcaster, and the router. The transport layer calls it on connect,
//! disconnect, and message-send events; all state lives in the directory.
//! The one piece of sequencing it owns: a join or leave mutates the
//! directory first and triggers the broadcast second, so a broadcast never
//! reflects a state older than the change that caused it.

use std::sync::Arc;
use tracing::{debug, info};

use crate::broadcaster::PresenceBroadcaster;
use crate::directory::{Directory, DirectoryError, SessionPolicy};
use crate::handle::{ConnectionHandle, ConnectionId, UserId};
use crate::router::{DeliveryResult, MessageArchive, MessageRouter, RouteError};

/// Engine configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineConfig {
    /// What happens when an already-online identity joins again.
    pub session_policy: SessionPolicy,
}

/// The presence-and-routing engine.
pub struct PresenceEngine {
    directory: Arc<Directory>,
    broadcaster: Arc<PresenceBroadcaster>,
    router: MessageRouter,
}

impl PresenceEngine {
    /// Create an engine with the given configuration.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self::build(config, None)
    }

    /// Create an engine with an archival hook for routed messages.
    #[must_use]
    pub fn with_archive(config: EngineConfig, archive: Arc<dyn MessageArchive>) -> Self {
        Self::build(config, Some(archive))
    }

    fn build(config: EngineConfig, archive: Option<Arc<dyn MessageArchive>>) -> Self {
        let directory = Arc::new(Directory::with_policy(config.session_policy));
        let broadcaster = Arc::new(PresenceBroadcaster::new(Arc::clone(&directory)));
        let mut router = MessageRouter::new(Arc::clone(&directory), Arc::clone(&broadcaster));
        if let Some(archive) = archive {
            router = router.with_archive(archive);
        }
        Self {
            directory,
            broadcaster,
            router,
        }
    }

    /// Register an authenticated connection under an identity.
    ///
    /// Sessions evicted under [`SessionPolicy::Replace`] are force-closed.
    /// A membership change triggers a full roster broadcast; a join that
    /// merely adds another session sends the roster to the new connection
    /// only, so no redundant broadcast goes out.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::Rejected`] under [`SessionPolicy::Reject`]
    /// when the identity is already online.
    pub fn join(&self, user: &str, handle: ConnectionHandle) -> Result<(), DirectoryError> {
        let outcome = self.directory.join(user, handle.clone())?;

        for evicted in &outcome.evicted {
            info!(user, connection = %evicted.id(), "Evicting replaced session");
            evicted.close();
        }

        if outcome.newly_online {
            info!(user, connection = %handle.id(), "User online");
            self.broadcaster.notify_changed();
        } else {
            debug!(user, connection = %handle.id(), "Additional session joined");
            self.broadcaster.send_roster_to(&handle);
        }

        Ok(())
    }

    /// Remove one of an identity's connections.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::NotFound`] for an unknown connection;
    /// callers treat this as non-fatal.
    pub fn leave(&self, user: &str, conn: &ConnectionId) -> Result<(), DirectoryError> {
        let outcome = self.directory.leave(user, conn)?;
        if outcome.went_offline {
            info!(user, connection = %conn, "User offline");
            self.broadcaster.notify_changed();
        } else {
            debug!(user, connection = %conn, "Session left");
        }
        Ok(())
    }

    /// Handle a transport-level disconnect for a bare connection ID.
    ///
    /// Safe to call for a connection that never completed a join; that is
    /// simply ignored.
    pub fn disconnect(&self, conn: &ConnectionId) {
        match self.directory.remove_connection(conn) {
            Some((user, true)) => {
                info!(user = %user, connection = %conn, "User offline");
                self.broadcaster.notify_changed();
            }
            Some((user, false)) => {
                debug!(user = %user, connection = %conn, "Session disconnected");
            }
            None => {
                debug!(connection = %conn, "Disconnect for unknown connection ignored");
            }
        }
    }

    /// Route a direct message. See [`MessageRouter::route`].
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::EmptyMessage`] for whitespace-only content.
    pub fn route(
        &self,
        sender_handle: &ConnectionHandle,
        sender: &str,
        recipient: &str,
        content: &str,
    ) -> Result<DeliveryResult, RouteError> {
        self.router.route(sender_handle, sender, recipient, content)
    }

    /// The current sorted list of online users.
    #[must_use]
    pub fn roster(&self) -> Vec<UserId> {
        self.directory.snapshot()
    }

    /// Number of online identities.
    #[must_use]
    pub fn online_count(&self) -> usize {
        self.directory.online_count()
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.directory.connection_count()
    }
}
