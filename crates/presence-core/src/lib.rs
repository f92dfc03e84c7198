//! # tenvis-presence-core
//!
//! Online presence tracking for multi-device accounts.
//!
//! This crate provides the building blocks:
//!
//! - **Registry** - Record per-connection heartbeats
//! - **Resolver** - Derive Online / PendingOffline / Offline
//! - **Sweep** - Finalize accounts whose grace period elapsed
//! - **Rate limit** - Per-viewer fixed-window throttling
//! - **Snapshot** - Privacy-filtered bulk status queries
//! - **Store** - Shared state, in-process or Redis-backed
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│  Registry   │────▶│             │
//! └─────────────┘     └─────────────┘     │             │
//!                     ┌─────────────┐     │    Store    │
//!                     │   Sweeper   │◀───▶│             │
//!                     └─────────────┘     │             │
//! ┌─────────────┐     ┌─────────────┐     │             │
//! │   Viewer    │────▶│  Snapshot   │────▶│             │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                       │  Resolver │
//!                       │  Limiter  │
//!                       └───────────┘
//! ```
//!
//! All operations take the current time as Unix seconds so that state
//! transitions are deterministic under test.

pub mod config;
pub mod directory;
pub mod error;
pub mod model;
pub mod notify;
pub mod rate_limit;
pub mod registry;
pub mod resolver;
pub mod snapshot;
pub mod store;
pub mod sweep;

pub use config::{PresenceConfig, PresenceOptions};
pub use directory::{ContactStore, InMemoryDirectory, Visibility, VisibilityStore};
pub use error::PresenceError;
pub use model::{unix_now, AccountId, ConnectionHeartbeat, ConnectionId, PresenceChange, PresenceState, PresenceStatus};
pub use notify::{BroadcastNotifier, NoopNotifier, PresenceNotifier};
pub use rate_limit::{RateLimitDecision, SnapshotRateLimiter};
pub use registry::ConnectionRegistry;
pub use resolver::PresenceResolver;
pub use snapshot::{SnapshotEntry, SnapshotResponse, SnapshotService};
pub use store::{MemoryStore, PresenceStore, SharedStore};
#[cfg(feature = "redis")]
pub use store::RedisStore;
pub use sweep::{OfflineSweeper, SweepReport};
