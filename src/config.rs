//! Configuration management

use std::{env, path::Path};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Legacy authentication configuration (API keys, non-OAuth hostnames)
    pub auth: AuthConfig,
    /// OAuth bridge configuration
    pub oauth: OAuthConfig,
    /// SSE push channel configuration
    pub streaming: StreamingConfig,
    /// Downstream service endpoints
    pub upstreams: UpstreamsConfig,
    /// Search tool configuration
    pub search: SearchConfig,
    /// Environment tag passed to collaborators (credential vault, trust resolution)
    pub service_env: String,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen host
    pub host: String,
    /// Listen port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
        }
    }
}

/// Legacy authentication configuration for non-OAuth hostnames
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Enable legacy API-key authentication (default: false, open gateway)
    pub enabled: bool,
    /// API keys for multi-client access
    pub api_keys: Vec<ApiKeyConfig>,
    /// Paths that bypass authentication
    pub public_paths: Vec<String>,
}

fn default_public_paths() -> Vec<String> {
    vec![
        "/health".to_string(),
        "/authorize".to_string(),
        "/token".to_string(),
        "/register".to_string(),
        "/.well-known".to_string(),
    ]
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_keys: Vec::new(),
            public_paths: default_public_paths(),
        }
    }
}

/// API key configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    /// The API key value (supports `env:VAR_NAME`)
    pub key: String,
    /// Human-readable name for this client
    pub name: String,
    /// Rate limit in requests per minute (0 = unlimited)
    #[serde(default)]
    pub rate_limit: u32,
}

impl ApiKeyConfig {
    /// Resolve the key value (expand `env:VAR_NAME` references)
    #[must_use]
    pub fn resolve_key(&self) -> String {
        if let Some(var_name) = self.key.strip_prefix("env:") {
            env::var(var_name).unwrap_or_else(|_| self.key.clone())
        } else {
            self.key.clone()
        }
    }
}

/// OAuth bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    /// The one external hostname whose protocol endpoint is gated by the
    /// OAuth bridge. All other hostnames use the legacy API-key path.
    pub protected_host: String,
    /// Issuer URL advertised in the AS metadata document
    pub issuer: String,
    /// Access token lifetime in seconds
    pub access_token_ttl_secs: u64,
    /// Refresh token horizon in days
    pub refresh_token_ttl_days: i64,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            protected_host: "mcp.chitty.cc".to_string(),
            issuer: "https://mcp.chitty.cc".to_string(),
            access_token_ttl_secs: 3600,
            refresh_token_ttl_days: 30,
        }
    }
}

/// SSE push channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Heartbeat comment interval in seconds
    pub heartbeat_interval_secs: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
        }
    }
}

/// Downstream service endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamsConfig {
    /// Identity service (ChittyID minting/validation)
    pub identity_url: String,
    /// Core platform base URL (cases, evidence, finance, sync)
    pub core_url: String,
    /// Fixed external ledger host (facts, chain reads)
    pub ledger_url: String,
    /// Trust/RBAC resolution service
    pub trust_url: String,
    /// Proof-generation job queue endpoint (absent = no queue binding)
    pub proof_queue_url: Option<String>,
    /// Search service base URL
    pub search_url: String,
    /// Per-request timeout for upstream calls, in seconds
    pub timeout_secs: u64,
}

impl Default for UpstreamsConfig {
    fn default() -> Self {
        Self {
            identity_url: "https://id.chitty.cc".to_string(),
            core_url: "https://core.chitty.cc".to_string(),
            ledger_url: "https://ledger.chitty.cc".to_string(),
            trust_url: "https://trust.chitty.cc".to_string(),
            proof_queue_url: None,
            search_url: "https://search.chitty.cc".to_string(),
            timeout_secs: 30,
        }
    }
}

/// Search tool configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Search account identifier; absent means the search tool is unconfigured
    pub account_id: Option<String>,
}

impl Config {
    /// Load configuration from a YAML file with environment overrides.
    ///
    /// Environment variables prefixed `CHITTY_GATEWAY_` override file values,
    /// e.g. `CHITTY_GATEWAY_SERVER__PORT=9000`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = Figment::new()
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed("CHITTY_GATEWAY_").split("__"))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        Ok(config)
    }

    /// Load configuration from environment only (no file)
    pub fn from_env() -> Result<Self> {
        let config: Self = Figment::new()
            .merge(Env::prefixed("CHITTY_GATEWAY_").split("__"))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        Ok(config)
    }

    /// Load configured env files into the process environment
    fn load_env_files(&self) {
        for file in &self.env_files {
            if let Err(e) = dotenvy::from_path(file) {
                tracing::debug!(file = %file, error = %e, "Skipped env file");
            }
        }
    }
}
