//! Identity resolution for the authorize step
//!
//! The authorize endpoint must associate a real upstream-authenticated
//! identity with the grant it mints. Resolution is delegated to a
//! collaborator so the production implementation can call the identity
//! service while tests substitute a fixed directory.

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::dispatch::UpstreamClient;

/// An identity the upstream provider vouched for
#[derive(Debug, Clone)]
pub struct ResolvedIdentity {
    /// Stable user identifier
    pub user_id: String,
}

/// Collaborator resolving the requesting identity at `/authorize`
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Resolve the caller's identity from their bearer credential.
    /// `Err` carries a human-readable reason and denies the authorization.
    async fn resolve(&self, bearer: Option<&str>) -> Result<ResolvedIdentity, String>;
}

/// Resolver backed by the identity service's introspection endpoint
pub struct HttpIdentityResolver {
    upstream: UpstreamClient,
    base_url: String,
}

impl HttpIdentityResolver {
    /// Create a resolver against the identity service base URL
    #[must_use]
    pub fn new(base_url: String, timeout_secs: u64) -> Self {
        Self {
            upstream: UpstreamClient::new(timeout_secs),
            base_url,
        }
    }
}

#[async_trait]
impl IdentityResolver for HttpIdentityResolver {
    async fn resolve(&self, bearer: Option<&str>) -> Result<ResolvedIdentity, String> {
        let Some(bearer) = bearer else {
            return Err("no credential presented".to_string());
        };

        let url = format!("{}/api/v1/whoami", self.base_url);
        match self.upstream.get(&url, Some(bearer)).await {
            Ok(reply) if reply.status.is_success() => {
                let user_id = reply
                    .body
                    .ok()
                    .as_ref()
                    .and_then(|body| body.get("user_id"))
                    .and_then(Value::as_str)
                    .map(String::from);
                user_id.map(|user_id| ResolvedIdentity { user_id }).ok_or_else(|| {
                    "identity service returned no user_id".to_string()
                })
            }
            Ok(reply) => Err(format!("identity service returned {}", reply.status)),
            Err(e) => {
                warn!(error = %e, "Identity resolution failed");
                Err(format!("identity service unreachable: {e}"))
            }
        }
    }
}

/// Fixed-directory resolver for tests: maps known bearers to identities
pub struct StaticIdentityResolver {
    entries: Vec<(String, String)>,
}

impl StaticIdentityResolver {
    /// Create a resolver from `(bearer, user_id)` pairs
    #[must_use]
    pub fn new(entries: &[(&str, &str)]) -> Self {
        Self {
            entries: entries
                .iter()
                .map(|(b, u)| ((*b).to_string(), (*u).to_string()))
                .collect(),
        }
    }
}

#[async_trait]
impl IdentityResolver for StaticIdentityResolver {
    async fn resolve(&self, bearer: Option<&str>) -> Result<ResolvedIdentity, String> {
        let Some(bearer) = bearer else {
            return Err("no credential presented".to_string());
        };
        self.entries
            .iter()
            .find(|(b, _)| b == bearer)
            .map(|(_, user_id)| ResolvedIdentity {
                user_id: user_id.clone(),
            })
            .ok_or_else(|| "unknown credential".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_resolver_maps_known_bearer() {
        let resolver = StaticIdentityResolver::new(&[("tok-1", "CH-USER-1")]);
        let identity = resolver.resolve(Some("tok-1")).await.unwrap();
        assert_eq!(identity.user_id, "CH-USER-1");
    }

    #[tokio::test]
    async fn static_resolver_rejects_unknown_and_absent() {
        let resolver = StaticIdentityResolver::new(&[("tok-1", "CH-USER-1")]);
        assert!(resolver.resolve(Some("other")).await.is_err());
        assert!(resolver.resolve(None).await.is_err());
    }
}
