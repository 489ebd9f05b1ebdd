//! # courier-server
//!
//! Realtime direct-messaging server with presence, built on the
//! `courier-core` engine and the `courier-protocol` wire format.
//!
//! The binary lives in `main.rs`; the modules are exported as a library
//! so integration tests can serve the app on an ephemeral port.

pub mod config;
pub mod handlers;
pub mod metrics;
