//! Grant, client, and token stores for the authorization bridge
//!
//! All state is process-owned. Authorization codes are single-use and
//! short-lived; access tokens live for the configured TTL; refresh tokens
//! carry a 30-day horizon. Revocation is the identity provider's problem.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Lifetime of an authorization code before exchange
const CODE_TTL_SECS: i64 = 600;

/// Generate URL-safe random token material
#[must_use]
pub fn random_token() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Verify a PKCE S256 challenge against the presented verifier
#[must_use]
pub fn verify_s256(verifier: &str, challenge: &str) -> bool {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize()) == challenge
}

/// Registered client metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRecord {
    /// Issued client identifier
    pub client_id: String,
    /// Human-readable client name
    #[serde(default)]
    pub client_name: Option<String>,
    /// Registered redirect URIs
    #[serde(default)]
    pub redirect_uris: Vec<String>,
}

/// A pending authorization code, bound to everything the exchange must match
#[derive(Debug, Clone)]
pub struct AuthCode {
    /// Requesting client
    pub client_id: String,
    /// Identity resolved at authorization time
    pub user_id: String,
    /// Granted scopes
    pub scope: Vec<String>,
    /// Redirect URI the code was issued for
    pub redirect_uri: String,
    /// PKCE S256 challenge, when the client supplied one
    pub code_challenge: Option<String>,
    /// Expiry
    pub expires_at: DateTime<Utc>,
}

/// An issued access grant
#[derive(Debug, Clone)]
pub struct AccessGrant {
    /// Client the grant was issued to
    pub client_id: String,
    /// Authorizing identity
    pub user_id: String,
    /// Granted scopes
    pub scope: Vec<String>,
    /// Expiry
    pub expires_at: DateTime<Utc>,
}

/// A refresh grant with its 30-day horizon
#[derive(Debug, Clone)]
pub struct RefreshGrant {
    /// Client the grant was issued to
    pub client_id: String,
    /// Authorizing identity
    pub user_id: String,
    /// Granted scopes
    pub scope: Vec<String>,
    /// Expiry
    pub expires_at: DateTime<Utc>,
}

/// Scopes the bridge will grant, in tier order
pub const SUPPORTED_SCOPES: &[&str] = &["read", "write", "admin"];

/// Parse a space-separated scope string, keeping only supported tiers.
/// An absent or empty scope defaults to `read`.
#[must_use]
pub fn parse_scope(raw: Option<&str>) -> Vec<String> {
    let scopes: Vec<String> = raw
        .unwrap_or_default()
        .split_whitespace()
        .filter(|s| SUPPORTED_SCOPES.contains(s))
        .map(String::from)
        .collect();
    if scopes.is_empty() {
        vec!["read".to_string()]
    } else {
        scopes
    }
}

/// Process-owned store behind the authorize/token/registration surface
#[derive(Default)]
pub struct OAuthStore {
    clients: DashMap<String, ClientRecord>,
    codes: DashMap<String, AuthCode>,
    access_tokens: DashMap<String, AccessGrant>,
    refresh_tokens: DashMap<String, RefreshGrant>,
}

impl OAuthStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client, minting its identifier
    pub fn register_client(
        &self,
        client_name: Option<String>,
        redirect_uris: Vec<String>,
    ) -> ClientRecord {
        let record = ClientRecord {
            client_id: random_token(),
            client_name,
            redirect_uris,
        };
        self.clients.insert(record.client_id.clone(), record.clone());
        record
    }

    /// Look up registered client metadata. `None` is tolerated by the
    /// authorize flow; registration is not mandatory.
    #[must_use]
    pub fn client(&self, client_id: &str) -> Option<ClientRecord> {
        self.clients.get(client_id).map(|c| c.clone())
    }

    /// Mint an authorization code for a completed authorization
    pub fn mint_code(
        &self,
        client_id: &str,
        user_id: &str,
        scope: Vec<String>,
        redirect_uri: &str,
        code_challenge: Option<String>,
    ) -> String {
        let code = random_token();
        self.codes.insert(
            code.clone(),
            AuthCode {
                client_id: client_id.to_string(),
                user_id: user_id.to_string(),
                scope,
                redirect_uri: redirect_uri.to_string(),
                code_challenge,
                expires_at: Utc::now() + Duration::seconds(CODE_TTL_SECS),
            },
        );
        code
    }

    /// Consume an authorization code. Single use; a second take misses.
    pub fn take_code(&self, code: &str) -> Option<AuthCode> {
        let (_, auth_code) = self.codes.remove(code)?;
        (auth_code.expires_at > Utc::now()).then_some(auth_code)
    }

    /// Issue an access/refresh token pair for an authorized grant
    pub fn issue_tokens(
        &self,
        client_id: &str,
        user_id: &str,
        scope: Vec<String>,
        access_ttl_secs: u64,
        refresh_ttl_days: i64,
    ) -> (String, String) {
        let access_token = random_token();
        let refresh_token = random_token();
        let now = Utc::now();

        self.access_tokens.insert(
            access_token.clone(),
            AccessGrant {
                client_id: client_id.to_string(),
                user_id: user_id.to_string(),
                scope: scope.clone(),
                expires_at: now + Duration::seconds(i64::try_from(access_ttl_secs).unwrap_or(3600)),
            },
        );
        self.refresh_tokens.insert(
            refresh_token.clone(),
            RefreshGrant {
                client_id: client_id.to_string(),
                user_id: user_id.to_string(),
                scope,
                expires_at: now + Duration::days(refresh_ttl_days),
            },
        );

        (access_token, refresh_token)
    }

    /// Validate a bearer access token, returning its grant if live
    #[must_use]
    pub fn validate_access(&self, token: &str) -> Option<AccessGrant> {
        let grant = self.access_tokens.get(token)?.clone();
        (grant.expires_at > Utc::now()).then_some(grant)
    }

    /// Look up a live refresh grant
    #[must_use]
    pub fn refresh_grant(&self, token: &str) -> Option<RefreshGrant> {
        let grant = self.refresh_tokens.get(token)?.clone();
        (grant.expires_at > Utc::now()).then_some(grant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkce_s256_round_trip() {
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        let mut hasher = Sha256::new();
        hasher.update(verifier.as_bytes());
        let challenge = URL_SAFE_NO_PAD.encode(hasher.finalize());

        assert!(verify_s256(verifier, &challenge));
        assert!(!verify_s256("wrong-verifier", &challenge));
    }

    #[test]
    fn scope_parsing_filters_and_defaults() {
        assert_eq!(parse_scope(Some("read write")), vec!["read", "write"]);
        assert_eq!(parse_scope(Some("write bogus")), vec!["write"]);
        assert_eq!(parse_scope(Some("")), vec!["read"]);
        assert_eq!(parse_scope(None), vec!["read"]);
    }

    #[test]
    fn codes_are_single_use() {
        let store = OAuthStore::new();
        let code = store.mint_code("c-1", "u-1", vec!["read".into()], "https://cb", None);
        assert!(store.take_code(&code).is_some());
        assert!(store.take_code(&code).is_none());
    }

    #[test]
    fn expired_code_misses() {
        let store = OAuthStore::new();
        let code = store.mint_code("c-1", "u-1", vec!["read".into()], "https://cb", None);
        store.codes.get_mut(&code).unwrap().expires_at = Utc::now() - Duration::seconds(1);
        assert!(store.take_code(&code).is_none());
    }

    #[test]
    fn access_token_expiry_enforced() {
        let store = OAuthStore::new();
        let (access, refresh) = store.issue_tokens("c-1", "u-1", vec!["read".into()], 3600, 30);

        assert!(store.validate_access(&access).is_some());
        assert!(store.refresh_grant(&refresh).is_some());

        store.access_tokens.get_mut(&access).unwrap().expires_at =
            Utc::now() - Duration::seconds(1);
        assert!(store.validate_access(&access).is_none());
    }

    #[test]
    fn unregistered_client_lookup_is_none() {
        let store = OAuthStore::new();
        assert!(store.client("nobody").is_none());

        let record = store.register_client(Some("Claude".into()), vec!["https://cb".into()]);
        assert!(store.client(&record.client_id).is_some());
    }
}
