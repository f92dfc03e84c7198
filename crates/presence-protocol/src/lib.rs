//! # presence-protocol
//!
//! Wire protocol spoken between presence clients and `presenced`.
//!
//! ## Frame Types
//!
//! - `Connect` / `Connected` - Handshake binding a connection to an account
//! - `Ping` / `Pong` - Keepalive; each ping extends the heartbeat
//! - `Snapshot` / `SnapshotResult` / `RateLimited` - Bulk status queries
//! - `PresenceChanged` - Server push for watched accounts
//! - `Error` - Request failures
//!
//! ## Example
//!
//! ```rust
//! use presence_protocol::{codec, Frame};
//!
//! let frame = Frame::snapshot(1, ["alice", "bob"]);
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;
pub mod version;

pub use codec::{decode, encode, ProtocolError};
pub use frames::{codes, Frame, FrameType, StatusEntry};
pub use version::{negotiate, PROTOCOL_VERSION};
