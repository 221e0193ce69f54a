//! SSE push channel
//!
//! `GET /mcp` with `Accept: text/event-stream` opens a long-lived
//! server-to-client stream. On open the stream emits a connection
//! acknowledgment comment so the caller can distinguish "connected" from
//! "hung", then heartbeat comments on a fixed interval until the client
//! disconnects. The baseline carries no application payload; pushing real
//! events through a session's sender handle is additive.
//!
//! Connections live in an explicit [`PushRegistry`] owned by the gateway
//! process. Each connection's registry entry is removed exactly once on
//! disconnect by a drop guard, which also destroys the session.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_stream::stream;
use axum::response::sse::{Event, KeepAlive, Sse};
use dashmap::DashMap;
use futures::Stream;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::session::SessionRegistry;

/// Per-connection channel depth for pushed events
const PUSH_BUFFER: usize = 64;

struct Connection {
    /// Distinguishes this connection from a reconnect under the same
    /// session id, so a stale guard never tears down a live stream.
    epoch: u64,
    tx: mpsc::Sender<Event>,
}

/// Registry of open push connections, keyed by session id
#[derive(Default)]
pub struct PushRegistry {
    connections: DashMap<String, Connection>,
    epoch: AtomicU64,
}

impl PushRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for a session, replacing any previous one.
    /// Returns the receiver half and the connection epoch for the guard.
    fn register(&self, session_id: &str) -> (mpsc::Receiver<Event>, u64) {
        let (tx, rx) = mpsc::channel(PUSH_BUFFER);
        let epoch = self.epoch.fetch_add(1, Ordering::Relaxed);
        self.connections
            .insert(session_id.to_string(), Connection { epoch, tx });
        (rx, epoch)
    }

    /// Remove a connection, but only if it still belongs to `epoch`
    fn remove_if_current(&self, session_id: &str, epoch: u64) -> bool {
        self.connections
            .remove_if(session_id, |_, conn| conn.epoch == epoch)
            .is_some()
    }

    /// Push an event to a connected session. Returns `false` when the
    /// session has no open stream or its buffer is full.
    pub fn push(&self, session_id: &str, event: Event) -> bool {
        self.connections
            .get(session_id)
            .is_some_and(|conn| conn.tx.try_send(event).is_ok())
    }

    /// Whether a session has an open push connection
    #[must_use]
    pub fn is_connected(&self, session_id: &str) -> bool {
        self.connections.contains_key(session_id)
    }

    /// Number of open connections
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connections are open
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

/// Removes the connection and its session exactly once, when the stream
/// is dropped on client disconnect.
struct ConnectionGuard {
    registry: Arc<PushRegistry>,
    sessions: Arc<SessionRegistry>,
    session_id: String,
    epoch: u64,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.registry.remove_if_current(&self.session_id, self.epoch) {
            self.sessions.remove(&self.session_id);
            info!(session = %self.session_id, "Push channel closed");
        }
    }
}

/// Open the push channel for a session.
///
/// The heartbeat comes from axum's `KeepAlive`, whose timer is owned by the
/// response and dies with the stream, so abandoned connections leak nothing.
pub fn open_push_channel(
    registry: Arc<PushRegistry>,
    sessions: Arc<SessionRegistry>,
    session_id: String,
    heartbeat_interval: Duration,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (mut rx, epoch) = registry.register(&session_id);
    info!(session = %session_id, "Push channel opened");

    let guard = ConnectionGuard {
        registry,
        sessions,
        session_id,
        epoch,
    };

    let stream = stream! {
        let _guard = guard;

        // Acknowledge the connection before anything else so the caller
        // can tell "connected" from "hung".
        yield Ok(Event::default().comment("connected"));

        while let Some(event) = rx.recv().await {
            yield Ok(event);
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(heartbeat_interval)
            .text("heartbeat"),
    )
}

/// Push a tool-progress event to a session, if it has an open stream
pub fn push_progress(registry: &PushRegistry, session_id: &str, payload: &serde_json::Value) {
    let event = Event::default().event("progress").data(payload.to_string());
    if !registry.push(session_id, event) {
        debug!(session = %session_id, "No push connection for progress event");
    }
}
