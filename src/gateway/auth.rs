//! Authentication middleware
//!
//! Dual-mode routing keyed by hostname: requests to the one OAuth-protected
//! host must present a bearer token issued by the authorization bridge;
//! every other hostname keeps the legacy API-key check and never touches
//! the bridge. Public paths (health, the OAuth surface itself) bypass both.

use std::num::NonZeroU32;
use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};
use serde_json::json;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::config::{AuthConfig, OAuthConfig};
use crate::oauth::OAuthStore;

type ClientRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Authentication outcome attached to every request for downstream handlers
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Client name (API-key name, OAuth user id, or a pseudo-client)
    pub client: String,
    /// Granted scopes; legacy keys and open deployments get every tier
    pub scope: Vec<String>,
    /// Raw bearer credential, forwarded unchanged to proxy upstreams
    pub bearer: Option<String>,
}

impl AuthContext {
    fn open(name: &str, bearer: Option<String>) -> Self {
        Self {
            client: name.to_string(),
            scope: crate::oauth::SUPPORTED_SCOPES
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            bearer,
        }
    }
}

/// Legacy API key with its resolved value
#[derive(Debug, Clone)]
pub struct ResolvedApiKey {
    /// The actual key value
    pub key: String,
    /// Client name
    pub name: String,
    /// Rate limit in requests per minute (0 = unlimited)
    pub rate_limit: u32,
}

/// Resolved authentication state shared by the middleware
pub struct AuthGate {
    /// Whether legacy authentication is enforced on unprotected hosts
    pub legacy_enabled: bool,
    /// Resolved legacy API keys
    api_keys: Vec<ResolvedApiKey>,
    /// Paths that bypass authentication on every host
    public_paths: Vec<String>,
    /// The one hostname gated by the OAuth bridge
    protected_host: String,
    /// Token store the bridge issues into
    oauth: Arc<OAuthStore>,
    /// Per-client rate limiters, keyed by client name
    rate_limiters: DashMap<String, Arc<ClientRateLimiter>>,
}

impl AuthGate {
    /// Resolve the configured keys and wire up the token store
    #[must_use]
    pub fn new(auth: &AuthConfig, oauth_config: &OAuthConfig, oauth: Arc<OAuthStore>) -> Self {
        let api_keys: Vec<ResolvedApiKey> = auth
            .api_keys
            .iter()
            .map(|k| ResolvedApiKey {
                key: k.resolve_key(),
                name: k.name.clone(),
                rate_limit: k.rate_limit,
            })
            .collect();

        let rate_limiters = DashMap::new();
        for key in &api_keys {
            if let Some(quota) = NonZeroU32::new(key.rate_limit) {
                let limiter = RateLimiter::direct(Quota::per_minute(quota));
                rate_limiters.insert(key.name.clone(), Arc::new(limiter));
            }
        }

        Self {
            legacy_enabled: auth.enabled,
            api_keys,
            public_paths: auth.public_paths.clone(),
            protected_host: oauth_config.protected_host.clone(),
            oauth,
            rate_limiters,
        }
    }

    /// Whether a path bypasses authentication
    #[must_use]
    pub fn is_public_path(&self, path: &str) -> bool {
        self.public_paths.iter().any(|p| path.starts_with(p))
    }

    /// Whether a hostname is gated by the OAuth bridge
    #[must_use]
    pub fn is_protected_host(&self, host: &str) -> bool {
        // Host headers may carry a port
        let host = host.split(':').next().unwrap_or(host);
        host.eq_ignore_ascii_case(&self.protected_host)
    }

    /// Validate a legacy API key in constant time
    #[must_use]
    pub fn validate_api_key(&self, token: &str) -> Option<&ResolvedApiKey> {
        self.api_keys
            .iter()
            .find(|k| bool::from(token.as_bytes().ct_eq(k.key.as_bytes())))
    }

    /// Check the rate limit for a client; absent limiter means unlimited
    #[must_use]
    pub fn check_rate_limit(&self, client_name: &str) -> bool {
        self.rate_limiters
            .get(client_name)
            .is_none_or(|limiter| limiter.check().is_ok())
    }
}

/// Extract the bearer credential from an `Authorization` header
#[must_use]
pub fn bearer_from_headers(headers: &axum::http::HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.strip_prefix("Bearer ")
                .or_else(|| v.strip_prefix("bearer "))
        })
        .map(String::from)
}

/// Dual-mode authentication middleware
pub async fn auth_middleware(
    State(gate): State<Arc<AuthGate>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let bearer = bearer_from_headers(request.headers());

    if gate.is_public_path(&path) {
        debug!(path = %path, "Public path, skipping auth");
        request
            .extensions_mut()
            .insert(AuthContext::open("public", bearer));
        return next.run(request).await;
    }

    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    if gate.is_protected_host(&host) {
        // OAuth-gated host: only bridge-issued tokens are accepted
        let Some(token) = bearer else {
            warn!(host = %host, path = %path, "Missing bearer on protected host");
            return unauthorized("Missing Authorization header. Use: Authorization: Bearer <token>");
        };

        let Some(grant) = gate.oauth.validate_access(&token) else {
            warn!(host = %host, path = %path, "Invalid or expired access token");
            return unauthorized("Invalid or expired access token");
        };

        debug!(user = %grant.user_id, path = %path, "OAuth-authenticated request");
        request.extensions_mut().insert(AuthContext {
            client: grant.user_id,
            scope: grant.scope,
            bearer: Some(token),
        });
        return next.run(request).await;
    }

    // Legacy hosts fall through to the API-key check, bridge untouched
    if !gate.legacy_enabled {
        request
            .extensions_mut()
            .insert(AuthContext::open("anonymous", bearer));
        return next.run(request).await;
    }

    let Some(token) = bearer else {
        warn!(path = %path, "Missing Authorization header");
        return unauthorized("Missing Authorization header. Use: Authorization: Bearer <token>");
    };

    let Some(key) = gate.validate_api_key(&token) else {
        warn!(path = %path, "Invalid API key");
        return unauthorized("Invalid API key");
    };
    let client_name = key.name.clone();

    if !gate.check_rate_limit(&client_name) {
        warn!(client = %client_name, path = %path, "Rate limit exceeded");
        return rate_limited(&client_name);
    }

    debug!(client = %client_name, path = %path, "API-key-authenticated request");
    request
        .extensions_mut()
        .insert(AuthContext::open(&client_name, Some(token)));
    next.run(request).await
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Bearer")],
        Json(json!({
            "jsonrpc": "2.0",
            "error": { "code": -32000, "message": message },
            "id": null
        })),
    )
        .into_response()
}

fn rate_limited(client_name: &str) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, "60")],
        Json(json!({
            "jsonrpc": "2.0",
            "error": {
                "code": -32000,
                "message": format!("Rate limit exceeded for client '{client_name}'. Try again later.")
            },
            "id": null
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiKeyConfig;

    fn gate_with_keys(enabled: bool, keys: Vec<ApiKeyConfig>) -> AuthGate {
        let auth = AuthConfig {
            enabled,
            api_keys: keys,
            ..AuthConfig::default()
        };
        AuthGate::new(&auth, &OAuthConfig::default(), Arc::new(OAuthStore::new()))
    }

    #[test]
    fn public_path_prefix_match() {
        let gate = gate_with_keys(true, vec![]);
        assert!(gate.is_public_path("/health"));
        assert!(gate.is_public_path("/.well-known/oauth-authorization-server"));
        assert!(!gate.is_public_path("/mcp"));
    }

    #[test]
    fn protected_host_ignores_port_and_case() {
        let gate = gate_with_keys(false, vec![]);
        assert!(gate.is_protected_host("mcp.chitty.cc"));
        assert!(gate.is_protected_host("mcp.chitty.cc:443"));
        assert!(gate.is_protected_host("MCP.Chitty.CC"));
        assert!(!gate.is_protected_host("api.chitty.cc"));
    }

    #[test]
    fn api_key_validation() {
        let gate = gate_with_keys(
            true,
            vec![ApiKeyConfig {
                key: "ck_live_abc".to_string(),
                name: "claude".to_string(),
                rate_limit: 0,
            }],
        );
        assert_eq!(gate.validate_api_key("ck_live_abc").unwrap().name, "claude");
        assert!(gate.validate_api_key("ck_live_xyz").is_none());
    }

    #[test]
    fn rate_limit_trips_after_quota() {
        let gate = gate_with_keys(
            true,
            vec![ApiKeyConfig {
                key: "k".to_string(),
                name: "limited".to_string(),
                rate_limit: 2,
            }],
        );
        assert!(gate.check_rate_limit("limited"));
        assert!(gate.check_rate_limit("limited"));
        assert!(!gate.check_rate_limit("limited"));
        // Unknown clients are unlimited
        assert!(gate.check_rate_limit("other"));
    }

    #[test]
    fn oauth_token_accepted_on_protected_host() {
        let store = Arc::new(OAuthStore::new());
        let (access, _refresh) =
            store.issue_tokens("c-1", "CH-USER-1", vec!["read".to_string()], 3600, 30);

        let auth = AuthConfig::default();
        let gate = AuthGate::new(&auth, &OAuthConfig::default(), Arc::clone(&store));
        assert!(gate.oauth.validate_access(&access).is_some());
        assert!(gate.oauth.validate_access("forged").is_none());
    }
}
