//! Direct message construction.
//!
//! The engine, not the client, is the single source of truth for message
//! ids and timestamps, so spoofed or colliding ids cannot enter the system.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::handle::UserId;

/// A unique message identifier.
pub type MessageId = u64;

/// Atomic counter for ensuring unique IDs even within the same nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a unique message ID.
#[must_use]
pub fn generate_message_id() -> MessageId {
    // Combine timestamp with atomic counter for guaranteed uniqueness
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64;
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    timestamp.wrapping_add(counter)
}

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

/// A direct message. Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Unique message identifier.
    pub id: MessageId,
    /// Identity of the sender.
    pub sender: UserId,
    /// Identity of the recipient.
    pub recipient: UserId,
    /// Message text, already trimmed by the router.
    pub content: String,
    /// Creation time in milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl Message {
    /// Create a new message with a fresh id and the current timestamp.
    #[must_use]
    pub fn new(
        sender: impl Into<UserId>,
        recipient: impl Into<UserId>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: generate_message_id(),
            sender: sender.into(),
            recipient: recipient.into(),
            content: content.into(),
            timestamp: now_millis(),
        }
    }
}
