//! Frame types for the presence protocol.
//!
//! Each frame is serialized using MessagePack. Field names are kept on the
//! wire so that clients in any language can decode frames as plain maps.

use serde::{Deserialize, Serialize};

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    Connect = 0x01,
    Connected = 0x02,
    Ping = 0x03,
    Pong = 0x04,
    Snapshot = 0x10,
    SnapshotResult = 0x11,
    RateLimited = 0x12,
    PresenceChanged = 0x20,
    Error = 0x7F,
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
            0x01 => Ok(FrameType::Connect),
            0x02 => Ok(FrameType::Connected),
            0x03 => Ok(FrameType::Ping),
            0x04 => Ok(FrameType::Pong),
            0x10 => Ok(FrameType::Snapshot),
            0x11 => Ok(FrameType::SnapshotResult),
            0x12 => Ok(FrameType::RateLimited),
            0x20 => Ok(FrameType::PresenceChanged),
            0x7F => Ok(FrameType::Error),
            _ => Err("Invalid frame type"),
        }
    }
}

/// Error codes carried by [`Frame::Error`].
pub mod codes {
    /// Malformed or unexpected frame.
    pub const PROTOCOL: u16 = 1002;
    /// First frame was not a valid `Connect`.
    pub const HANDSHAKE: u16 = 1003;
    /// Client major version is not supported.
    pub const UNSUPPORTED_VERSION: u16 = 1004;
    /// Request failed validation.
    pub const INVALID_REQUEST: u16 = 4000;
    /// Presence state could not be read or written.
    pub const UNAVAILABLE: u16 = 5003;
}

/// Online status of one account inside a snapshot result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub account_id: String,
    pub can_show_status: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_online: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_online_at: Option<u64>,
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Initial handshake; must be the first client frame.
    #[serde(rename = "connect")]
    Connect {
        /// Client protocol major version.
        version: u8,
        /// Account the connection belongs to.
        account_id: String,
        /// Optional authentication token.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    /// Handshake accepted.
    #[serde(rename = "connected")]
    Connected {
        /// Server-assigned connection identifier.
        connection_id: String,
        /// Negotiated protocol version.
        version: u8,
        /// Recommended ping interval in milliseconds.
        heartbeat: u32,
    },

    /// Keepalive ping; also extends the connection's heartbeat.
    #[serde(rename = "ping")]
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        /// Echoed timestamp from ping.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Snapshot query on behalf of the connection's account.
    #[serde(rename = "snapshot")]
    Snapshot {
        /// Request ID echoed in the response.
        id: u64,
        account_ids: Vec<String>,
    },

    /// Snapshot answer, one entry per distinct requested account.
    #[serde(rename = "snapshot_result")]
    SnapshotResult { id: u64, statuses: Vec<StatusEntry> },

    /// Snapshot rejected by the rate limiter.
    #[serde(rename = "rate_limited")]
    RateLimited {
        id: u64,
        /// Seconds until the viewer may retry.
        retry_after: u64,
    },

    /// Pushed when a watched account comes online or is finalized offline.
    #[serde(rename = "presence_changed")]
    PresenceChanged {
        account_id: String,
        online: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_online_at: Option<u64>,
    },

    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        /// See [`codes`].
        code: u16,
        message: String,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Connect { .. } => FrameType::Connect,
            Frame::Connected { .. } => FrameType::Connected,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
            Frame::Snapshot { .. } => FrameType::Snapshot,
            Frame::SnapshotResult { .. } => FrameType::SnapshotResult,
            Frame::RateLimited { .. } => FrameType::RateLimited,
            Frame::PresenceChanged { .. } => FrameType::PresenceChanged,
            Frame::Error { .. } => FrameType::Error,
        }
    }

    #[must_use]
    pub fn connect(version: u8, account_id: impl Into<String>, token: Option<String>) -> Self {
        Frame::Connect {
            version,
            account_id: account_id.into(),
            token,
        }
    }

    #[must_use]
    pub fn connected(connection_id: impl Into<String>, version: u8, heartbeat: u32) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            version,
            heartbeat,
        }
    }

    #[must_use]
    pub fn ping() -> Self {
        Frame::Ping { timestamp: None }
    }

    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }

    /// Create a snapshot query.
    #[must_use]
    pub fn snapshot<I, S>(id: u64, account_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Frame::Snapshot {
            id,
            account_ids: account_ids.into_iter().map(Into::into).collect(),
        }
    }

    #[must_use]
    pub fn rate_limited(id: u64, retry_after: u64) -> Self {
        Frame::RateLimited { id, retry_after }
    }

    #[must_use]
    pub fn presence_changed(
        account_id: impl Into<String>,
        online: bool,
        last_online_at: Option<u64>,
    ) -> Self {
        Frame::PresenceChanged {
            account_id: account_id.into(),
            online,
            last_online_at,
        }
    }

    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Request ID this frame answers, if any.
    #[must_use]
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Frame::Snapshot { id, .. }
            | Frame::SnapshotResult { id, .. }
            | Frame::RateLimited { id, .. }
            | Frame::Error { id, .. } => Some(*id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type() {
        assert_eq!(Frame::ping().frame_type(), FrameType::Ping);
        assert_eq!(
            Frame::snapshot(1, ["alice"]).frame_type(),
            FrameType::Snapshot
        );
        assert_eq!(
            Frame::presence_changed("alice", true, None).frame_type(),
            FrameType::PresenceChanged
        );
    }

    #[test]
    fn test_frame_type_conversion() {
        for ft in [FrameType::Connect, FrameType::RateLimited, FrameType::Error] {
            assert_eq!(FrameType::try_from(u8::from(ft)), Ok(ft));
        }
        assert!(FrameType::try_from(0x55).is_err());
    }

    #[test]
    fn test_request_id() {
        assert_eq!(Frame::rate_limited(7, 3).request_id(), Some(7));
        assert_eq!(Frame::pong(Some(1)).request_id(), None);
    }
}
