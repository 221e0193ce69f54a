//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use super::auth::AuthGate;
use super::router::{AppState, create_router};
use super::session::SessionRegistry;
use super::streaming::PushRegistry;
use crate::config::Config;
use crate::dispatch::{
    HttpPermissionChecker, HttpProofQueue, PermissionChecker, ProofQueue, ToolDispatcher,
};
use crate::oauth::{HttpIdentityResolver, IdentityResolver, OAuthStore};
use crate::secrets::{EnvTokenVault, TokenVault};
use crate::{Error, Result};

/// MCP protocol gateway
pub struct Gateway {
    config: Config,
    state: Arc<AppState>,
    gate: Arc<AuthGate>,
}

impl Gateway {
    /// Create a gateway with production collaborators resolved from config
    #[must_use]
    pub fn new(config: Config) -> Self {
        let timeout = config.upstreams.timeout_secs;
        let vault: Arc<dyn TokenVault> = Arc::new(EnvTokenVault::new());
        let permissions: Arc<dyn PermissionChecker> = Arc::new(HttpPermissionChecker::new(
            config.upstreams.trust_url.clone(),
            timeout,
        ));
        let proof_queue: Arc<dyn ProofQueue> = Arc::new(HttpProofQueue::new(
            config.upstreams.proof_queue_url.clone(),
            timeout,
        ));
        let identity: Arc<dyn IdentityResolver> = Arc::new(HttpIdentityResolver::new(
            config.upstreams.identity_url.clone(),
            timeout,
        ));

        Self::with_collaborators(config, vault, permissions, proof_queue, identity)
    }

    /// Create a gateway with explicit collaborators (used by tests and
    /// embedders that substitute in-process implementations)
    #[must_use]
    pub fn with_collaborators(
        config: Config,
        vault: Arc<dyn TokenVault>,
        permissions: Arc<dyn PermissionChecker>,
        proof_queue: Arc<dyn ProofQueue>,
        identity: Arc<dyn IdentityResolver>,
    ) -> Self {
        let oauth = Arc::new(OAuthStore::new());
        let dispatcher = Arc::new(ToolDispatcher::new(
            config.upstreams.clone(),
            config.search.clone(),
            vault,
            permissions,
            proof_queue,
        ));
        let gate = Arc::new(AuthGate::new(
            &config.auth,
            &config.oauth,
            Arc::clone(&oauth),
        ));
        let state = Arc::new(AppState {
            config: config.clone(),
            sessions: Arc::new(SessionRegistry::new()),
            push: Arc::new(PushRegistry::new()),
            dispatcher,
            oauth,
            identity,
        });

        Self {
            config,
            state,
            gate,
        }
    }

    /// The grant store behind the authorization bridge
    #[must_use]
    pub fn oauth_store(&self) -> Arc<OAuthStore> {
        Arc::clone(&self.state.oauth)
    }

    /// Build the router for this gateway
    #[must_use]
    pub fn router(&self) -> Router {
        create_router(Arc::clone(&self.state), Arc::clone(&self.gate))
    }

    /// Run the gateway until a shutdown signal arrives
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let app = self.router();
        let listener = TcpListener::bind(addr).await?;

        info!(
            host = %self.config.server.host,
            port = self.config.server.port,
            version = env!("CARGO_PKG_VERSION"),
            "ChittyOS gateway listening"
        );
        info!(
            protected_host = %self.config.oauth.protected_host,
            "OAuth bridge gating protocol endpoint"
        );
        if self.config.auth.enabled {
            info!(
                api_keys = self.config.auth.api_keys.len(),
                "Legacy API-key authentication enabled on other hosts"
            );
        } else {
            warn!("Legacy authentication disabled - unprotected hosts are open");
        }
        if self.config.upstreams.proof_queue_url.is_none() {
            warn!("No proof queue binding configured; seals will carry a warning");
        }

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Gateway shutdown complete");
        Ok(())
    }
}

/// Shutdown signal handler (ctrl-c or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
