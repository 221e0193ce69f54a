#![allow(dead_code)]

//! Shared test harness: in-process gateway instances and mock upstream
//! services bound to ephemeral ports, with call counters for asserting
//! that pre-flight failures short-circuit side-effecting calls.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use async_trait::async_trait;
use axum::Router;
use serde_json::Value;

use chitty_gateway::config::Config;
use chitty_gateway::dispatch::{PermissionChecker, PermissionDecision, ProofQueue};
use chitty_gateway::gateway::Gateway;
use chitty_gateway::oauth::{IdentityResolver, OAuthStore, StaticIdentityResolver};
use chitty_gateway::secrets::{StaticTokenVault, TokenVault};

/// Serve a router on an ephemeral port, returning its base URL
pub async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });
    format!("http://{addr}")
}

/// Permission checker with a fixed decision
pub struct StaticPermissions {
    denial: Option<String>,
}

impl StaticPermissions {
    pub fn allow_all() -> Self {
        Self { denial: None }
    }

    pub fn deny(reason: &str) -> Self {
        Self {
            denial: Some(reason.to_string()),
        }
    }
}

#[async_trait]
impl PermissionChecker for StaticPermissions {
    async fn check(&self, _actor_id: &str, _action: &str, _env: &str) -> PermissionDecision {
        match &self.denial {
            None => PermissionDecision::allow(),
            Some(reason) => PermissionDecision::deny(reason.clone()),
        }
    }
}

/// Proof queue that records sends and optionally fails every enqueue
pub struct RecordingProofQueue {
    pub sends: Arc<AtomicUsize>,
    failure: Option<String>,
}

impl RecordingProofQueue {
    pub fn working() -> (Self, Arc<AtomicUsize>) {
        let sends = Arc::new(AtomicUsize::new(0));
        (
            Self {
                sends: Arc::clone(&sends),
                failure: None,
            },
            sends,
        )
    }

    pub fn broken(reason: &str) -> Self {
        Self {
            sends: Arc::new(AtomicUsize::new(0)),
            failure: Some(reason.to_string()),
        }
    }
}

#[async_trait]
impl ProofQueue for RecordingProofQueue {
    async fn send(&self, _payload: Value) -> Result<(), String> {
        self.sends.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        match &self.failure {
            None => Ok(()),
            Some(reason) => Err(reason.clone()),
        }
    }
}

/// A running in-process gateway
pub struct TestGateway {
    pub base: String,
    pub oauth: Arc<OAuthStore>,
    pub client: reqwest::Client,
}

/// Spawn a gateway with the given config and test collaborators
pub async fn spawn_gateway(config: Config) -> TestGateway {
    let vault: Arc<dyn TokenVault> = Arc::new(StaticTokenVault::empty());
    let permissions: Arc<dyn PermissionChecker> = Arc::new(StaticPermissions::allow_all());
    let proof_queue: Arc<dyn ProofQueue> = Arc::new(RecordingProofQueue::broken("no queue"));
    let identity: Arc<dyn IdentityResolver> =
        Arc::new(StaticIdentityResolver::new(&[("id-token-1", "CH-USER-1")]));

    spawn_gateway_with(config, vault, permissions, proof_queue, identity).await
}

/// Spawn a gateway with explicit collaborators
pub async fn spawn_gateway_with(
    config: Config,
    vault: Arc<dyn TokenVault>,
    permissions: Arc<dyn PermissionChecker>,
    proof_queue: Arc<dyn ProofQueue>,
    identity: Arc<dyn IdentityResolver>,
) -> TestGateway {
    let gateway = Gateway::with_collaborators(config, vault, permissions, proof_queue, identity);
    let oauth = gateway.oauth_store();
    let base = serve(gateway.router()).await;

    TestGateway {
        base,
        oauth,
        client: reqwest::Client::new(),
    }
}
