//! Frame types for the Courier protocol.
//!
//! Frames are the fundamental unit of communication between a client and
//! the Courier server. Each frame is serialized using MessagePack.

use serde::{Deserialize, Serialize};

/// Current protocol version. Incompatible changes increment this.
pub const PROTOCOL_VERSION: u8 = 1;

/// Error codes carried by [`Frame::Error`].
pub mod codes {
    /// Malformed or out-of-sequence frame.
    pub const PROTOCOL: u16 = 1000;
    /// Missing or blank username, or incompatible protocol version.
    pub const BAD_HELLO: u16 = 1001;
    /// Username already online under the reject session policy.
    pub const NAME_IN_USE: u16 = 1002;
    /// Message content was empty after trimming.
    pub const EMPTY_MESSAGE: u16 = 1003;
}

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    Hello = 0x01,
    Send = 0x02,
    Ping = 0x03,
    Welcome = 0x04,
    Roster = 0x05,
    Deliver = 0x06,
    Ack = 0x07,
    Error = 0x08,
    Pong = 0x09,
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::Hello),
            0x02 => Ok(FrameType::Send),
            0x03 => Ok(FrameType::Ping),
            0x04 => Ok(FrameType::Welcome),
            0x05 => Ok(FrameType::Roster),
            0x06 => Ok(FrameType::Deliver),
            0x07 => Ok(FrameType::Ack),
            0x08 => Ok(FrameType::Error),
            0x09 => Ok(FrameType::Pong),
            _ => Err("Invalid frame type"),
        }
    }
}

/// A direct message as it appears on the wire.
///
/// The server is the single source of truth for `id` and `timestamp`;
/// clients never supply either.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Server-assigned unique message identifier.
    pub id: u64,
    /// Username of the sender.
    pub sender: String,
    /// Username of the recipient.
    pub recipient: String,
    /// Message text.
    pub content: String,
    /// Server-assigned creation time, milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// A protocol frame.
///
/// `Hello`, `Send`, and `Ping` travel client-to-server; the rest travel
/// server-to-client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// First frame after the WebSocket upgrade: identify the user.
    #[serde(rename = "hello")]
    Hello {
        /// Protocol version the client speaks.
        version: u8,
        /// Username to register under.
        username: String,
    },

    /// Send a direct message to another user.
    #[serde(rename = "send")]
    Send {
        /// Request ID, echoed in the `Ack` or `Error` response.
        id: u64,
        /// Recipient username.
        to: String,
        /// Message text.
        content: String,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        /// Optional timestamp.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Handshake accepted.
    #[serde(rename = "welcome")]
    Welcome {
        /// Server-assigned connection identifier.
        connection_id: String,
        /// Negotiated protocol version.
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat_ms: u32,
    },

    /// Full list of currently-online users, sorted by username.
    ///
    /// Pushed to every connection whenever presence membership changes.
    #[serde(rename = "roster")]
    Roster {
        /// Online usernames.
        users: Vec<String>,
    },

    /// A message delivered to this connection.
    ///
    /// Recipients receive the message itself; the sender receives the same
    /// frame as the canonical echo carrying the server-assigned id and
    /// timestamp.
    #[serde(rename = "deliver")]
    Deliver {
        /// The delivered message.
        message: WireMessage,
    },

    /// Acknowledgment of a `Send` request.
    #[serde(rename = "ack")]
    Ack {
        /// ID of the acknowledged request.
        id: u64,
        /// Whether the recipient was online; `false` means the message was
        /// delivered locally only.
        delivered: bool,
    },

    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        /// Error code from [`codes`].
        code: u16,
        /// Human-readable error message.
        message: String,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        /// Echoed timestamp from the ping.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Hello { .. } => FrameType::Hello,
            Frame::Send { .. } => FrameType::Send,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Welcome { .. } => FrameType::Welcome,
            Frame::Roster { .. } => FrameType::Roster,
            Frame::Deliver { .. } => FrameType::Deliver,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
            Frame::Pong { .. } => FrameType::Pong,
        }
    }

    /// Create a new Hello frame for the current protocol version.
    #[must_use]
    pub fn hello(username: impl Into<String>) -> Self {
        Frame::Hello {
            version: PROTOCOL_VERSION,
            username: username.into(),
        }
    }

    /// Create a new Send frame.
    #[must_use]
    pub fn send(id: u64, to: impl Into<String>, content: impl Into<String>) -> Self {
        Frame::Send {
            id,
            to: to.into(),
            content: content.into(),
        }
    }

    /// Create a new Ping frame.
    #[must_use]
    pub fn ping() -> Self {
        Frame::Ping { timestamp: None }
    }

    /// Create a new Welcome frame.
    #[must_use]
    pub fn welcome(connection_id: impl Into<String>, heartbeat_ms: u32) -> Self {
        Frame::Welcome {
            connection_id: connection_id.into(),
            version: PROTOCOL_VERSION,
            heartbeat_ms,
        }
    }

    /// Create a new Roster frame.
    #[must_use]
    pub fn roster(users: Vec<String>) -> Self {
        Frame::Roster { users }
    }

    /// Create a new Deliver frame.
    #[must_use]
    pub fn deliver(message: WireMessage) -> Self {
        Frame::Deliver { message }
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(id: u64, delivered: bool) -> Self {
        Frame::Ack { id, delivered }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a new Pong frame echoing the ping timestamp.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }
}
