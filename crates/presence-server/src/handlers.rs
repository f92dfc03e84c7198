//! Connection handlers for the presence server.
//!
//! This module wires the WebSocket connection lifecycle and the HTTP
//! snapshot endpoint to the presence components, and runs the sweep worker
//! for the lifetime of the server.

use crate::config::{Config, StorageBackend};
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::BytesMut;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use presence_protocol::{codec, codes, negotiate, Frame, FrameType, ProtocolError, StatusEntry};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tenvis_presence_core::error::with_deadline;
use tenvis_presence_core::model::generate_id;
use tenvis_presence_core::{
    unix_now, BroadcastNotifier, ConnectionRegistry, InMemoryDirectory, MemoryStore,
    OfflineSweeper, PresenceChange, PresenceConfig, PresenceError, PresenceResolver, RedisStore,
    SharedStore, SnapshotEntry, SnapshotRateLimiter, SnapshotResponse, SnapshotService,
};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type WsSender = SplitSink<WebSocket, Message>;

/// Shared server state.
pub struct AppState {
    pub config: Config,
    pub registry: ConnectionRegistry,
    pub snapshots: SnapshotService,
    /// Source of presence-changed pushes.
    pub notifier: Arc<BroadcastNotifier>,
    pub sweeper: Arc<OfflineSweeper>,
}

impl AppState {
    /// Connect the configured store and build the presence components.
    ///
    /// # Errors
    ///
    /// Returns an error if the store backend cannot be reached.
    pub async fn new(config: Config) -> Result<Self> {
        let presence = config.presence.normalize();
        let store = connect_store(&config, &presence).await?;
        Ok(Self::with_store(
            config,
            store,
            Arc::new(InMemoryDirectory::new()),
        ))
    }

    /// Build the presence components over an existing store.
    #[must_use]
    pub fn with_store(config: Config, store: SharedStore, directory: Arc<InMemoryDirectory>) -> Self {
        let presence = config.presence.normalize();
        let notifier = Arc::new(BroadcastNotifier::new());

        let registry = ConnectionRegistry::new(
            store.clone(),
            notifier.clone(),
            presence.heartbeat_ttl_seconds,
        );
        let snapshots = SnapshotService::new(
            PresenceResolver::new(store.clone(), presence.offline_grace_seconds),
            SnapshotRateLimiter::new(
                store.clone(),
                presence.snapshot_rate_limit_window_seconds,
                presence.snapshot_rate_limit_max_requests,
            ),
            directory.clone(),
            directory,
            presence.snapshot_max_account_ids,
        );
        let sweeper = Arc::new(OfflineSweeper::new(store, notifier.clone(), presence));

        Self {
            config,
            registry,
            snapshots,
            notifier,
            sweeper,
        }
    }
}

async fn connect_store(config: &Config, presence: &PresenceConfig) -> Result<SharedStore> {
    match config.storage.backend {
        StorageBackend::Memory => {
            warn!("Using in-memory presence store; state is not shared between instances");
            Ok(Arc::new(MemoryStore::new()))
        }
        StorageBackend::Redis => {
            // Connection index entries outlive any heartbeat plus its grace.
            let index_ttl = presence.heartbeat_ttl_seconds + presence.offline_grace_seconds;
            let store = RedisStore::connect(
                &config.storage.redis_url,
                config.storage.key_prefix.clone(),
                index_ttl,
            )
            .await
            .with_context(|| format!("Failed to connect to {}", config.storage.redis_url))?;
            Ok(Arc::new(store))
        }
    }
}

/// Build the HTTP router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.clone();

    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/presence/snapshot", post(snapshot_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server and the sweep worker until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let addr = config.bind_addr()?;
    let state = Arc::new(AppState::new(config.clone()).await?);

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let shutdown = CancellationToken::new();
    let sweeper = {
        let sweeper = state.sweeper.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { sweeper.run(shutdown, metrics::record_sweep).await })
    };

    let app = build_router(state);
    let listener = TcpListener::bind(addr).await?;

    info!("Presence server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    sweeper.await.context("Sweep worker panicked")?;

    info!("Presence server stopped");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    }
    shutdown.cancel();
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "storage": state.config.storage.backend,
    }))
}

/// HTTP snapshot request body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRequest {
    pub viewer_id: String,
    pub account_ids: Vec<String>,
}

/// `POST /presence/snapshot`.
async fn snapshot_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SnapshotRequest>,
) -> Response {
    let start = Instant::now();
    let result = with_deadline(
        state.config.operation_timeout(),
        state
            .snapshots
            .get_snapshot(&request.viewer_id, &request.account_ids, unix_now()),
    )
    .await;

    let (label, response) = match result {
        Ok(SnapshotResponse::Statuses(statuses)) => (
            "ok",
            (
                StatusCode::OK,
                Json(serde_json::json!({ "statuses": statuses })),
            )
                .into_response(),
        ),
        Ok(SnapshotResponse::RateLimited {
            retry_after_seconds,
        }) => (
            "rate_limited",
            (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, retry_after_seconds.to_string())],
                Json(serde_json::json!({
                    "error": "rate_limited",
                    "retryAfterSeconds": retry_after_seconds,
                })),
            )
                .into_response(),
        ),
        Err(PresenceError::Validation(message)) => (
            "invalid",
            (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": "invalid_request", "message": message })),
            )
                .into_response(),
        ),
        Err(e) => {
            warn!(viewer = %request.viewer_id, error = %e, "Snapshot failed");
            metrics::record_error("snapshot");
            (
                "unavailable",
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(serde_json::json!({ "error": "unavailable" })),
                )
                    .into_response(),
            )
        }
    };

    metrics::record_snapshot(label, start.elapsed().as_secs_f64());
    response
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let max_message_size = state.config.limits.max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state))
}

#[derive(Debug, Error)]
enum HandshakeError {
    #[error("connection closed before handshake")]
    Closed,
    #[error("handshake timed out")]
    TimedOut,
    #[error("expected connect frame, got {0:?}")]
    UnexpectedFrame(FrameType),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("account id cannot be empty")]
    MissingAccount,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl HandshakeError {
    fn code(&self) -> u16 {
        match self {
            HandshakeError::UnsupportedVersion(_) => codes::UNSUPPORTED_VERSION,
            HandshakeError::Protocol(_) => codes::PROTOCOL,
            _ => codes::HANDSHAKE,
        }
    }
}

struct Handshake {
    account_id: String,
    version: u8,
}

/// Wait for the client's `Connect` frame.
async fn read_handshake(receiver: &mut SplitStream<WebSocket>) -> Result<Handshake, HandshakeError> {
    loop {
        let data = match receiver.next().await {
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_)) | Err(_)) | None => return Err(HandshakeError::Closed),
        };

        return match codec::decode(&data)? {
            Frame::Connect {
                version,
                account_id,
                token,
            } => {
                let version = negotiate(version)
                    .ok_or(HandshakeError::UnsupportedVersion(version))?;
                if account_id.is_empty() {
                    return Err(HandshakeError::MissingAccount);
                }
                debug!(account = %account_id, has_token = token.is_some(), "Connect frame");
                Ok(Handshake {
                    account_id,
                    version,
                })
            }
            other => Err(HandshakeError::UnexpectedFrame(other.frame_type())),
        };
    }
}

/// Handle a WebSocket connection from upgrade to close.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    let handshake = tokio::time::timeout(state.config.connect_timeout(), read_handshake(&mut receiver))
        .await
        .unwrap_or(Err(HandshakeError::TimedOut));

    let Handshake {
        account_id,
        version,
    } = match handshake {
        Ok(handshake) => handshake,
        Err(HandshakeError::Closed) => {
            debug!("Connection closed before handshake");
            return;
        }
        Err(e) => {
            debug!(error = %e, "Handshake rejected");
            metrics::record_error("handshake");
            let _ = send_frame(&mut sender, &Frame::error(0, e.code(), e.to_string())).await;
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };

    let connection_id = generate_id("conn");
    let timeout = state.config.operation_timeout();

    // Subscribe before registering so our own online transition is not missed.
    let changes = state.notifier.subscribe();

    if let Err(e) = with_deadline(
        timeout,
        state
            .registry
            .mark_connected(&account_id, &connection_id, unix_now()),
    )
    .await
    {
        warn!(account = %account_id, connection = %connection_id, error = %e, "Failed to register connection");
        metrics::record_error("register");
        let _ = send_frame(&mut sender, &Frame::error(0, codes::UNAVAILABLE, e.to_string())).await;
        return;
    }
    metrics::record_heartbeat();
    let _metrics_guard = ConnectionMetricsGuard::new();

    debug!(account = %account_id, connection = %connection_id, "WebSocket connected");

    let ping_interval = u32::try_from(state.config.transport.ping_interval_ms).unwrap_or(u32::MAX);
    let connected = Frame::connected(&connection_id, version, ping_interval);

    if send_frame(&mut sender, &connected).await.is_ok() {
        let mut session = Session {
            state: &state,
            account_id: &account_id,
            connection_id: &connection_id,
            sender,
            watched: HashSet::new(),
        };
        session.run(receiver, changes).await;
    }

    match with_deadline(
        timeout,
        state
            .registry
            .mark_disconnected(Some(&account_id), &connection_id, unix_now()),
    )
    .await
    {
        Ok(_) => debug!(account = %account_id, connection = %connection_id, "WebSocket disconnected"),
        Err(e) => {
            // The heartbeat expires on its own; offline is only delayed.
            warn!(account = %account_id, connection = %connection_id, error = %e, "Failed to deregister connection");
            metrics::record_error("disconnect");
        }
    }
}

/// One handshaken connection.
struct Session<'a> {
    state: &'a AppState,
    account_id: &'a str,
    connection_id: &'a str,
    sender: WsSender,
    /// Other accounts this connection was allowed to see in its latest
    /// snapshot.
    watched: HashSet<String>,
}

impl Session<'_> {
    async fn run(
        &mut self,
        mut receiver: SplitStream<WebSocket>,
        mut changes: broadcast::Receiver<Arc<PresenceChange>>,
    ) {
        let mut read_buffer = BytesMut::with_capacity(4096);

        loop {
            let outcome: Result<()> = tokio::select! {
                change = changes.recv() => match change {
                    Ok(change) => self.forward_change(&change).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(connection = %self.connection_id, skipped, "Presence changes dropped");
                        Ok(())
                    }
                    Err(RecvError::Closed) => break,
                },

                msg = receiver.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        read_buffer.extend_from_slice(&data);
                        self.drain_frames(&mut read_buffer).await
                    }
                    Some(Ok(Message::Text(text))) => {
                        read_buffer.extend_from_slice(text.as_bytes());
                        self.drain_frames(&mut read_buffer).await
                    }
                    Some(Ok(Message::Ping(data))) => {
                        self.touch().await;
                        self.sender.send(Message::Pong(data)).await.map_err(Into::into)
                    }
                    Some(Ok(Message::Pong(_))) => Ok(()),
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %self.connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %self.connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %self.connection_id, "WebSocket stream ended");
                        break;
                    }
                },
            };

            if let Err(e) = outcome {
                debug!(connection = %self.connection_id, error = %e, "Send failed, closing");
                break;
            }
        }
    }

    /// Decode and handle every complete frame in `buf`.
    async fn drain_frames(&mut self, buf: &mut BytesMut) -> Result<()> {
        if buf.len() > self.state.config.limits.max_message_size {
            buf.clear();
            metrics::record_error("protocol");
            return self
                .send(&Frame::error(0, codes::PROTOCOL, "message too large"))
                .await;
        }

        loop {
            match codec::decode_from(buf) {
                Ok(Some(frame)) => self.handle_frame(frame).await?,
                Ok(None) => return Ok(()),
                Err(e) => {
                    debug!(connection = %self.connection_id, error = %e, "Undecodable frame");
                    metrics::record_error("protocol");
                    buf.clear();
                    return self.send(&Frame::error(0, codes::PROTOCOL, e.to_string())).await;
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<()> {
        match frame {
            Frame::Ping { timestamp } => {
                self.touch().await;
                self.send(&Frame::pong(timestamp)).await
            }
            Frame::Pong { .. } => {
                self.touch().await;
                Ok(())
            }
            Frame::Snapshot { id, account_ids } => self.snapshot(id, &account_ids).await,
            Frame::Connect { .. } => {
                self.send(&Frame::error(0, codes::PROTOCOL, "already connected"))
                    .await
            }
            other => {
                warn!(connection = %self.connection_id, frame_type = ?other.frame_type(), "Unexpected frame type");
                self.send(&Frame::error(0, codes::PROTOCOL, "unexpected frame"))
                    .await
            }
        }
    }

    /// Extend this connection's heartbeat. Failures are logged; the next
    /// ping retries.
    async fn touch(&self) {
        let result = with_deadline(
            self.state.config.operation_timeout(),
            self.state
                .registry
                .touch_heartbeat(self.account_id, self.connection_id, unix_now()),
        )
        .await;

        match result {
            Ok(()) => metrics::record_heartbeat(),
            Err(e) => {
                warn!(account = %self.account_id, connection = %self.connection_id, error = %e, "Heartbeat failed");
                metrics::record_error("heartbeat");
            }
        }
    }

    async fn snapshot(&mut self, id: u64, account_ids: &[String]) -> Result<()> {
        let start = Instant::now();
        let result = with_deadline(
            self.state.config.operation_timeout(),
            self.state
                .snapshots
                .get_snapshot(self.account_id, account_ids, unix_now()),
        )
        .await;

        let (label, frame) = match result {
            Ok(SnapshotResponse::Statuses(entries)) => {
                self.watched = entries
                    .iter()
                    .filter(|entry| entry.can_show_status && entry.account_id != self.account_id)
                    .map(|entry| entry.account_id.clone())
                    .collect();
                let statuses = entries.into_iter().map(status_entry).collect();
                ("ok", Frame::SnapshotResult { id, statuses })
            }
            Ok(SnapshotResponse::RateLimited {
                retry_after_seconds,
            }) => ("rate_limited", Frame::rate_limited(id, retry_after_seconds)),
            Err(PresenceError::Validation(message)) => {
                ("invalid", Frame::error(id, codes::INVALID_REQUEST, message))
            }
            Err(e) => {
                warn!(viewer = %self.account_id, error = %e, "Snapshot failed");
                metrics::record_error("snapshot");
                ("unavailable", Frame::error(id, codes::UNAVAILABLE, e.to_string()))
            }
        };

        metrics::record_snapshot(label, start.elapsed().as_secs_f64());
        self.send(&frame).await
    }

    async fn forward_change(&mut self, change: &PresenceChange) -> Result<()> {
        if !self.watched.contains(&change.account_id) {
            return Ok(());
        }
        let frame =
            Frame::presence_changed(change.account_id.clone(), change.online, change.last_online_at);
        self.send(&frame).await
    }

    async fn send(&mut self, frame: &Frame) -> Result<()> {
        send_frame(&mut self.sender, frame).await
    }
}

fn status_entry(entry: SnapshotEntry) -> StatusEntry {
    StatusEntry {
        account_id: entry.account_id,
        can_show_status: entry.can_show_status,
        is_online: entry.is_online,
        last_online_at: entry.last_online_at,
    }
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut WsSender, frame: &Frame) -> Result<()> {
    let data = codec::encode(frame)?;
    sender.send(Message::Binary(data.to_vec())).await?;
    Ok(())
}
