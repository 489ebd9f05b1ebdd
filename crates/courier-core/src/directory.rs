//! The presence directory: the authoritative identity-to-connections map.
//!
//! The directory is the only shared mutable state in the engine. It is
//! sharded by identity hash via `DashMap`, so joins and leaves for
//! unrelated users never contend. Every critical section is a plain
//! in-memory map operation; network I/O never happens under a map guard.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::handle::{ConnectionHandle, ConnectionId, UserId};

/// Directory errors.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// Identity already online under the reject session policy.
    #[error("Identity already online: {0}")]
    Rejected(UserId),

    /// Connection not registered for this identity. Non-fatal; leaves for
    /// unknown handles are expected during disconnect races.
    #[error("No such connection: {0}")]
    NotFound(ConnectionId),
}

/// What happens when an already-online identity joins again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionPolicy {
    /// Add the new connection alongside the existing ones.
    MultiDevice,
    /// Evict the prior connections and install the new one.
    #[default]
    Replace,
    /// Refuse the join.
    Reject,
}

/// Result of a successful join.
#[derive(Debug)]
pub struct JoinOutcome {
    /// Whether this join took the identity from offline to online.
    /// Only such transitions trigger a presence broadcast.
    pub newly_online: bool,
    /// Connections displaced under [`SessionPolicy::Replace`]; the caller
    /// must force-close them.
    pub evicted: Vec<ConnectionHandle>,
}

/// Result of a successful leave.
#[derive(Debug, Clone, Copy)]
pub struct LeaveOutcome {
    /// Whether this leave removed the identity's last connection.
    pub went_offline: bool,
}

/// Live connections for one identity. Never left empty: the entry is
/// deleted when its last connection leaves.
#[derive(Debug, Default)]
struct PresenceEntry {
    connections: Vec<ConnectionHandle>,
}

/// The authoritative map from user identity to live connections.
///
/// All presence mutation goes through the directory; handles are borrowed
/// from the transport, never created or destroyed here.
pub struct Directory {
    /// Online identities and their connections.
    entries: DashMap<UserId, PresenceEntry>,
    /// Reverse index so a bare connection ID can be resolved to its owner
    /// (disconnects arrive without an identity).
    owners: DashMap<ConnectionId, UserId>,
    /// Duplicate-join policy.
    policy: SessionPolicy,
}

impl Directory {
    /// Create a directory with the default session policy.
    #[must_use]
    pub fn new() -> Self {
        Self::with_policy(SessionPolicy::default())
    }

    /// Create a directory with an explicit session policy.
    #[must_use]
    pub fn with_policy(policy: SessionPolicy) -> Self {
        Self {
            entries: DashMap::new(),
            owners: DashMap::new(),
            policy,
        }
    }

    /// The configured session policy.
    #[must_use]
    pub fn policy(&self) -> SessionPolicy {
        self.policy
    }

    /// Register a connection under an identity.
    ///
    /// Atomic per identity: concurrent joins and leaves for the same user
    /// serialize on the entry lock. Re-joining with an already-registered
    /// connection ID refreshes the stored handle without duplicating it.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::Rejected`] when the identity is already
    /// online under [`SessionPolicy::Reject`].
    pub fn join(
        &self,
        user: &str,
        handle: ConnectionHandle,
    ) -> Result<JoinOutcome, DirectoryError> {
        match self.entries.entry(user.to_string()) {
            Entry::Vacant(vacant) => {
                self.owners.insert(handle.id().clone(), user.to_string());
                debug!(user, connection = %handle.id(), "Directory: identity online");
                vacant.insert(PresenceEntry {
                    connections: vec![handle],
                });
                Ok(JoinOutcome {
                    newly_online: true,
                    evicted: Vec::new(),
                })
            }
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                match self.policy {
                    SessionPolicy::Reject => Err(DirectoryError::Rejected(user.to_string())),
                    SessionPolicy::MultiDevice => {
                        self.owners.insert(handle.id().clone(), user.to_string());
                        if let Some(slot) = entry
                            .connections
                            .iter_mut()
                            .find(|h| h.id() == handle.id())
                        {
                            *slot = handle;
                        } else {
                            debug!(
                                user,
                                connection = %handle.id(),
                                sessions = entry.connections.len() + 1,
                                "Directory: additional session"
                            );
                            entry.connections.push(handle);
                        }
                        Ok(JoinOutcome {
                            newly_online: false,
                            evicted: Vec::new(),
                        })
                    }
                    SessionPolicy::Replace => {
                        let evicted =
                            std::mem::replace(&mut entry.connections, vec![handle.clone()]);
                        for old in &evicted {
                            if old.id() != handle.id() {
                                self.owners.remove(old.id());
                            }
                        }
                        self.owners.insert(handle.id().clone(), user.to_string());
                        debug!(
                            user,
                            connection = %handle.id(),
                            evicted = evicted.len(),
                            "Directory: session replaced"
                        );
                        Ok(JoinOutcome {
                            newly_online: false,
                            evicted,
                        })
                    }
                }
            }
        }
    }

    /// Remove a connection from an identity's entry. Deletes the entry
    /// when its connection set becomes empty.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::NotFound`] when the identity or the
    /// connection is not registered.
    pub fn leave(&self, user: &str, conn: &ConnectionId) -> Result<LeaveOutcome, DirectoryError> {
        match self.entries.entry(user.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                let before = entry.connections.len();
                entry.connections.retain(|h| h.id() != conn);
                if entry.connections.len() == before {
                    return Err(DirectoryError::NotFound(conn.clone()));
                }

                self.owners.remove(conn);

                if entry.connections.is_empty() {
                    occupied.remove();
                    debug!(user, connection = %conn, "Directory: identity offline");
                    Ok(LeaveOutcome { went_offline: true })
                } else {
                    debug!(user, connection = %conn, "Directory: session closed");
                    Ok(LeaveOutcome {
                        went_offline: false,
                    })
                }
            }
            Entry::Vacant(_) => Err(DirectoryError::NotFound(conn.clone())),
        }
    }

    /// Remove a connection by ID alone, resolving its owner through the
    /// reverse index.
    ///
    /// Returns the owning identity and whether it went offline, or `None`
    /// for a connection that never completed a join (a disconnect racing
    /// a slow handshake is a no-op).
    pub fn remove_connection(&self, conn: &ConnectionId) -> Option<(UserId, bool)> {
        let (_, user) = self.owners.remove(conn)?;
        match self.leave(&user, conn) {
            Ok(outcome) => Some((user, outcome.went_offline)),
            // The entry was already cleaned up by a racing leave.
            Err(DirectoryError::NotFound(_)) => Some((user, false)),
            Err(_) => None,
        }
    }

    /// Snapshot of an identity's live connections. Possibly empty;
    /// linearizable with respect to joins and leaves for that identity.
    #[must_use]
    pub fn lookup(&self, user: &str) -> Vec<ConnectionHandle> {
        self.entries
            .get(user)
            .map(|entry| entry.connections.clone())
            .unwrap_or_default()
    }

    /// Deterministic, sorted list of all online identities.
    #[must_use]
    pub fn snapshot(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.entries.iter().map(|e| e.key().clone()).collect();
        users.sort();
        users
    }

    /// All live connections across all identities, for presence fan-out.
    #[must_use]
    pub fn all_handles(&self) -> Vec<ConnectionHandle> {
        self.entries
            .iter()
            .flat_map(|entry| entry.connections.clone())
            .collect()
    }

    /// Check if an identity has at least one live connection.
    #[must_use]
    pub fn is_online(&self, user: &str) -> bool {
        self.entries.contains_key(user)
    }

    /// Number of online identities.
    #[must_use]
    pub fn online_count(&self) -> usize {
        self.entries.len()
    }

    /// Number of live connections across all identities.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.owners.len()
    }
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}
