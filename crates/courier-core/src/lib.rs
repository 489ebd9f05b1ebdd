//! # courier-core
//!
//! The presence-and-routing engine behind Courier's direct messaging.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Directory** - Authoritative map from user identity to live connections
//! - **PresenceBroadcaster** - Push the online-user list on membership changes
//! - **MessageRouter** - Deliver direct messages to all of a user's sessions
//! - **PresenceEngine** - Composition root driven by the transport layer
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌────────────────┐     ┌─────────────┐
//! │  Transport  │────▶│ PresenceEngine │────▶│  Directory  │
//! └─────────────┘     └────────────────┘     └─────────────┘
//!                        │            │
//!                        ▼            ▼
//!               ┌───────────────┐  ┌─────────────────────┐
//!               │ MessageRouter │  │ PresenceBroadcaster │
//!               └───────────────┘  └─────────────────────┘
//! ```
//!
//! The engine owns no I/O. Transports hand it [`ConnectionHandle`]s, which
//! are order-preserving mailboxes; the actual socket writes happen in each
//! connection's writer task, never under a directory lock.

pub mod broadcaster;
pub mod directory;
pub mod engine;
pub mod handle;
pub mod message;
pub mod router;

pub use broadcaster::PresenceBroadcaster;
pub use directory::{Directory, DirectoryError, JoinOutcome, LeaveOutcome, SessionPolicy};
pub use engine::{EngineConfig, PresenceEngine};
pub use handle::{ConnectionHandle, ConnectionId, Event, UserId};
pub use message::{Message, MessageId};
pub use router::{DeliveryResult, MessageArchive, MessageRouter, RouteError, RouteOutcome};
