//! Session registry
//!
//! Issues and tracks an opaque session identifier per logical connection.
//! A caller-supplied identifier is reused verbatim so a client can keep
//! affinity across requests that land on arbitrary instances; otherwise a
//! fresh identifier is minted. The identifier correlates RPC and SSE
//! traffic and is not a security boundary.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

/// A tracked session
#[derive(Debug, Clone)]
pub struct Session {
    /// Opaque session identifier
    pub id: String,
    /// When the session was first seen
    pub created_at: DateTime<Utc>,
}

/// Registry of live sessions, owned by the gateway process
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Session>,
}

impl SessionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the session for an incoming request: reuse the supplied
    /// identifier verbatim, or mint a fresh one.
    pub fn resolve(&self, incoming: Option<&str>) -> String {
        let id = match incoming {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => format!("cg-{}", Uuid::new_v4()),
        };

        self.sessions.entry(id.clone()).or_insert_with(|| Session {
            id: id.clone(),
            created_at: Utc::now(),
        });

        id
    }

    /// Remove a session. Idempotent; removing an unknown id is a no-op.
    pub fn remove(&self, id: &str) {
        if self.sessions.remove(id).is_some() {
            tracing::debug!(session = %id, "Session removed");
        }
    }

    /// Whether a session is currently tracked
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Number of live sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
