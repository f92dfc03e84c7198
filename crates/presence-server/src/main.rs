//! # presenced
//!
//! Online presence service: ingests device heartbeats over WebSocket,
//! finalizes offline accounts in the background and answers snapshot
//! queries over WebSocket and HTTP.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (in-memory store)
//! presenced
//!
//! # Share state across instances
//! PRESENCE__STORAGE__BACKEND=redis PRESENCE__STORAGE__REDIS_URL=redis://cache:6379 presenced
//!
//! # Override presence tuning
//! PRESENCE__PRESENCE__OFFLINE_GRACE_SECONDS=30 presenced
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "presenced=debug,tenvis_presence_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!(
        storage = ?config.storage.backend,
        "Starting presence server on {}:{}",
        config.host,
        config.port
    );

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
