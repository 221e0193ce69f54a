//! Pre-flight gates for side-effecting tools
//!
//! A pre-flight check is a read-only verification whose failure must prevent
//! the side-effecting call from ever being issued. Two kinds exist here:
//! referential-integrity checks against the evidence store, and permission
//! checks against the trust-resolution service. The proof-job queue also
//! lives here because it shares the collaborator seam: it must never fail or
//! block a seal that already succeeded.

use async_trait::async_trait;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::upstream::UpstreamClient;

/// Outcome of a permission gate
#[derive(Debug, Clone)]
pub struct PermissionDecision {
    /// Whether the action is allowed
    pub allowed: bool,
    /// Denial reason when not allowed
    pub reason: Option<String>,
}

impl PermissionDecision {
    /// Allowed decision
    #[must_use]
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    /// Denied decision with a reason
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Trust/RBAC resolution collaborator
#[async_trait]
pub trait PermissionChecker: Send + Sync {
    /// Resolve whether `actor_id` may perform `action` in `env`
    async fn check(&self, actor_id: &str, action: &str, env: &str) -> PermissionDecision;
}

/// Permission checker backed by the trust-resolution service
pub struct HttpPermissionChecker {
    upstream: UpstreamClient,
    base_url: String,
}

impl HttpPermissionChecker {
    /// Create a checker against the given trust service base URL
    #[must_use]
    pub fn new(base_url: String, timeout_secs: u64) -> Self {
        Self {
            upstream: UpstreamClient::new(timeout_secs),
            base_url,
        }
    }
}

#[async_trait]
impl PermissionChecker for HttpPermissionChecker {
    async fn check(&self, actor_id: &str, action: &str, env: &str) -> PermissionDecision {
        let url = format!("{}/api/v1/permissions/check", self.base_url);
        let body = json!({ "actor_id": actor_id, "action": action, "env": env });

        // Fail closed: an unreachable trust service denies the action.
        match self.upstream.post(&url, None, &body).await {
            Ok(reply) if reply.status.is_success() => match reply.body {
                Ok(decision) => {
                    let allowed = decision
                        .get("allowed")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    let reason = decision
                        .get("reason")
                        .and_then(Value::as_str)
                        .map(String::from);
                    PermissionDecision { allowed, reason }
                }
                Err(_) => PermissionDecision::deny("trust service returned a malformed decision"),
            },
            Ok(reply) => {
                PermissionDecision::deny(format!("trust service returned {}", reply.status))
            }
            Err(e) => {
                warn!(actor = %actor_id, action = %action, error = %e, "Trust resolution failed");
                PermissionDecision::deny(format!("trust resolution unavailable: {e}"))
            }
        }
    }
}

/// Proof-generation job queue collaborator.
///
/// `send` must never block or fail the caller's success path; callers treat
/// an `Err` as a non-fatal warning.
#[async_trait]
pub trait ProofQueue: Send + Sync {
    /// Enqueue a proof-generation job
    async fn send(&self, payload: Value) -> Result<(), String>;
}

/// Proof queue backed by an HTTP enqueue endpoint; `None` means no queue
/// binding is configured and every send reports unavailability.
pub struct HttpProofQueue {
    upstream: UpstreamClient,
    endpoint: Option<String>,
}

impl HttpProofQueue {
    /// Create a queue client; `endpoint` absent means unbound
    #[must_use]
    pub fn new(endpoint: Option<String>, timeout_secs: u64) -> Self {
        Self {
            upstream: UpstreamClient::new(timeout_secs),
            endpoint,
        }
    }
}

#[async_trait]
impl ProofQueue for HttpProofQueue {
    async fn send(&self, payload: Value) -> Result<(), String> {
        let Some(endpoint) = &self.endpoint else {
            return Err("no proof queue binding configured".to_string());
        };

        match self.upstream.post(endpoint, None, &payload).await {
            Ok(reply) if reply.status.is_success() => Ok(()),
            Ok(reply) => Err(format!("proof queue returned {}", reply.status)),
            Err(e) => Err(format!("proof queue enqueue failed: {e}")),
        }
    }
}

/// Integrity anchor captured from an evidence record during pre-flight
#[derive(Debug, Clone)]
pub struct EvidenceAnchor {
    /// Evidence identifier
    pub id: String,
    /// Content hash observed at check time
    pub content_hash: String,
}

/// Verify that a cited evidence record exists upstream and capture its
/// content hash.
///
/// The hash is taken from the record's own `content_hash` field when the
/// evidence store provides one, otherwise computed over the record body as
/// observed, so that later disputes can be checked against the state the
/// actor actually saw.
pub async fn verify_evidence(
    upstream: &UpstreamClient,
    core_url: &str,
    evidence_id: &str,
    bearer: Option<&str>,
) -> Result<EvidenceAnchor, String> {
    let url = format!("{core_url}/api/v1/evidence/{evidence_id}");

    let reply = upstream
        .get(&url, bearer)
        .await
        .map_err(|e| format!("evidence check for '{evidence_id}' failed: {e}"))?;

    if reply.status == reqwest::StatusCode::NOT_FOUND {
        return Err(format!("evidence '{evidence_id}' does not exist"));
    }
    if !reply.status.is_success() {
        return Err(format!(
            "evidence check for '{evidence_id}' returned {}",
            reply.status
        ));
    }

    let record = reply
        .body
        .map_err(|_| format!("evidence record '{evidence_id}' is not valid JSON"))?;

    let content_hash = record
        .get("content_hash")
        .and_then(Value::as_str)
        .map_or_else(|| hash_record(&record), String::from);

    debug!(evidence = %evidence_id, hash = %content_hash, "Evidence pre-flight passed");

    Ok(EvidenceAnchor {
        id: evidence_id.to_string(),
        content_hash,
    })
}

/// SHA-256 over the serialized record, hex-encoded
fn hash_record(record: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(record.to_string().as_bytes());
    hex::encode(hasher.finalize())
}
