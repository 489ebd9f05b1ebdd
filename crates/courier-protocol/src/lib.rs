//! # courier-protocol
//!
//! Wire protocol definitions for the Courier direct-messaging engine.
//!
//! This crate defines the binary protocol spoken between Courier clients
//! and servers: frame types, the length-prefixed MessagePack codec, and
//! the protocol version constant.
//!
//! ## Frame Types
//!
//! - `Hello` / `Welcome` - Connection handshake
//! - `Send` / `Deliver` - Direct messages
//! - `Roster` - Online-user list pushed on presence changes
//! - `Ack` / `Error` - Acknowledgments and errors
//!
//! ## Example
//!
//! ```rust
//! use courier_protocol::{Frame, codec};
//!
//! // Create a send frame using the helper method
//! let frame = Frame::send(1, "bob", "Hello, world!");
//!
//! // Encode and decode
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;

pub use codec::{decode, encode, ProtocolError};
pub use frames::{codes, Frame, FrameType, WireMessage, PROTOCOL_VERSION};
