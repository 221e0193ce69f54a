//! Tool dispatcher properties against mock upstream services: pre-flight
//! short-circuits (asserted via call counters), integrity anchors captured
//! at check time, seal/proof-queue semantics, and result normalization.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{
    Json, Router,
    extract::Path,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

use chitty_gateway::config::{SearchConfig, UpstreamsConfig};
use chitty_gateway::dispatch::{CallContext, PermissionChecker, ProofQueue, ToolDispatcher};
use chitty_gateway::secrets::StaticTokenVault;

use common::{RecordingProofQueue, StaticPermissions, serve};

/// Call counters for the mock core + ledger services
#[derive(Default)]
struct Counters {
    evidence_checks: AtomicUsize,
    fact_creates: AtomicUsize,
    fact_validates: AtomicUsize,
    fact_seals: AtomicUsize,
}

struct MockLedgerWorld {
    counters: Arc<Counters>,
    /// Body the ledger received for the last fact creation
    minted_body: Arc<Mutex<Option<Value>>>,
    upstreams: UpstreamsConfig,
}

/// Spawn a core service knowing the given evidence records, and a ledger
/// accepting fact operations, both counting every call.
async fn mock_world(evidence: &[(&str, &str)]) -> MockLedgerWorld {
    let counters = Arc::new(Counters::default());
    let minted_body = Arc::new(Mutex::new(None));

    let records: Vec<(String, String)> = evidence
        .iter()
        .map(|(id, hash)| ((*id).to_string(), (*hash).to_string()))
        .collect();

    let core = {
        let counters = Arc::clone(&counters);
        Router::new().route(
            "/api/v1/evidence/{id}",
            get(move |Path(id): Path<String>| {
                let counters = Arc::clone(&counters);
                let records = records.clone();
                async move {
                    counters.evidence_checks.fetch_add(1, Ordering::SeqCst);
                    match records.iter().find(|(rid, _)| *rid == id) {
                        Some((rid, hash)) => (
                            StatusCode::OK,
                            Json(json!({"id": rid, "content_hash": hash, "status": "persisted"})),
                        ),
                        None => (
                            StatusCode::NOT_FOUND,
                            Json(json!({"error": "no such evidence"})),
                        ),
                    }
                }
            }),
        )
    };

    let ledger = {
        let counters = Arc::clone(&counters);
        let minted = Arc::clone(&minted_body);
        let validate_counters = Arc::clone(&counters);
        let seal_counters = Arc::clone(&counters);
        Router::new()
            .route(
                "/api/v1/facts",
                post(move |Json(body): Json<Value>| {
                    let counters = Arc::clone(&counters);
                    let minted = Arc::clone(&minted);
                    async move {
                        counters.fact_creates.fetch_add(1, Ordering::SeqCst);
                        *minted.lock() = Some(body);
                        Json(json!({"ok": true, "fact_id": "F-100", "status": "MINTED"}))
                    }
                }),
            )
            .route(
                "/api/v1/facts/{id}/validate",
                post(move |Path(_id): Path<String>, Json(_body): Json<Value>| {
                    let counters = Arc::clone(&validate_counters);
                    async move {
                        counters.fact_validates.fetch_add(1, Ordering::SeqCst);
                        Json(json!({"ok": true, "status": "VALIDATED"}))
                    }
                }),
            )
            .route(
                "/api/v1/facts/{id}/seal",
                post(move |Path(id): Path<String>| {
                    let counters = Arc::clone(&seal_counters);
                    async move {
                        counters.fact_seals.fetch_add(1, Ordering::SeqCst);
                        Json(json!({"ok": true, "fact_id": id, "status": "SEALED"}))
                    }
                }),
            )
    };

    let core_url = serve(core).await;
    let ledger_url = serve(ledger).await;

    let upstreams = UpstreamsConfig {
        core_url,
        ledger_url,
        timeout_secs: 5,
        ..UpstreamsConfig::default()
    };

    MockLedgerWorld {
        counters,
        minted_body,
        upstreams,
    }
}

fn dispatcher(
    upstreams: UpstreamsConfig,
    permissions: Arc<dyn PermissionChecker>,
    proof_queue: Arc<dyn ProofQueue>,
) -> ToolDispatcher {
    ToolDispatcher::new(
        upstreams,
        SearchConfig::default(),
        Arc::new(StaticTokenVault::empty()),
        permissions,
        proof_queue,
    )
}

fn ctx() -> CallContext {
    CallContext::anonymous("test")
}

fn payload(result: &chitty_gateway::protocol::ToolResult) -> Value {
    serde_json::from_str(result.first_text().unwrap()).unwrap()
}

#[tokio::test]
async fn fact_mint_missing_evidence_never_reaches_ledger() {
    let world = mock_world(&[]).await;
    let d = dispatcher(
        world.upstreams.clone(),
        Arc::new(StaticPermissions::allow_all()),
        Arc::new(RecordingProofQueue::broken("unused")),
    );

    let result = d
        .dispatch(
            "chitty_fact_mint",
            json!({"statement": "the sky was green", "evidence_id": "E-404"}),
            &ctx(),
        )
        .await;

    assert!(result.is_err());
    assert!(result.first_text().unwrap().contains("E-404"));
    // Exactly one upstream call: the evidence-existence check
    assert_eq!(world.counters.evidence_checks.load(Ordering::SeqCst), 1);
    assert_eq!(world.counters.fact_creates.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn fact_mint_anchors_hash_observed_at_preflight() {
    let world = mock_world(&[("E-1", "sha256-at-check-time")]).await;
    let d = dispatcher(
        world.upstreams.clone(),
        Arc::new(StaticPermissions::allow_all()),
        Arc::new(RecordingProofQueue::broken("unused")),
    );

    let result = d
        .dispatch(
            "chitty_fact_mint",
            json!({"statement": "the deed was filed", "evidence_id": "E-1"}),
            &ctx(),
        )
        .await;

    assert!(!result.is_err(), "mint failed: {:?}", result.first_text());

    let body = world.minted_body.lock().clone().expect("ledger saw a mint");
    assert_eq!(body["evidence_hash_at_mint"], "sha256-at-check-time");
    assert_eq!(body["statement"], "the deed was filed");
    // The hash came from the pre-flight, never re-fetched afterwards
    assert_eq!(world.counters.evidence_checks.load(Ordering::SeqCst), 1);
    assert_eq!(world.counters.fact_creates.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn fact_validate_aborts_on_first_missing_corroboration() {
    let world = mock_world(&[("E-1", "h1")]).await;
    let d = dispatcher(
        world.upstreams.clone(),
        Arc::new(StaticPermissions::allow_all()),
        Arc::new(RecordingProofQueue::broken("unused")),
    );

    let result = d
        .dispatch(
            "chitty_fact_validate",
            json!({"fact_id": "F-1", "evidence_ids": ["E-1", "E-missing"]}),
            &ctx(),
        )
        .await;

    assert!(result.is_err());
    assert!(result.first_text().unwrap().contains("E-missing"));
    assert_eq!(world.counters.fact_validates.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn fact_seal_denied_never_touches_ledger() {
    let world = mock_world(&[]).await;
    let d = dispatcher(
        world.upstreams.clone(),
        Arc::new(StaticPermissions::deny("trust level below seal threshold")),
        Arc::new(RecordingProofQueue::broken("unused")),
    );

    let result = d
        .dispatch(
            "chitty_fact_seal",
            json!({"fact_id": "F-1", "actor_id": "CH-LOW-TRUST"}),
            &ctx(),
        )
        .await;

    assert!(result.is_err());
    let text = result.first_text().unwrap();
    assert!(text.contains("trust level below seal threshold"));
    assert!(text.contains("CH-LOW-TRUST"));
    assert_eq!(world.counters.fact_seals.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn seal_without_proof_queue_succeeds_with_warning() {
    let world = mock_world(&[]).await;
    let d = dispatcher(
        world.upstreams.clone(),
        Arc::new(StaticPermissions::allow_all()),
        Arc::new(RecordingProofQueue::broken(
            "no proof queue binding configured",
        )),
    );

    let result = d
        .dispatch("chitty_fact_seal", json!({"fact_id": "F-1"}), &ctx())
        .await;

    assert!(!result.is_err(), "seal must not fail on queue trouble");
    let body = payload(&result);
    assert_eq!(body["status"], "SEALED");
    assert!(
        body["proof_queue_warning"]
            .as_str()
            .unwrap()
            .contains("no proof queue binding")
    );
    assert_eq!(world.counters.fact_seals.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn seal_with_working_queue_enqueues_one_proof_job() {
    let world = mock_world(&[]).await;
    let (queue, sends) = RecordingProofQueue::working();
    let d = dispatcher(
        world.upstreams.clone(),
        Arc::new(StaticPermissions::allow_all()),
        Arc::new(queue),
    );

    let result = d
        .dispatch("chitty_fact_seal", json!({"fact_id": "F-1"}), &ctx())
        .await;

    assert!(!result.is_err());
    let body = payload(&result);
    assert!(body.get("proof_queue_warning").is_none());
    assert_eq!(sends.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn every_upstream_shape_lands_in_the_envelope() {
    // JSON object body
    let json_upstream = serve(Router::new().route(
        "/api/v1/chain/status",
        get(|| async { Json(json!({"height": 42, "healthy": true})) }),
    ))
    .await;

    // Plain-text success body
    let text_upstream = serve(Router::new().route(
        "/api/v1/chain/status",
        get(|| async { "OK - chain synced\n" }),
    ))
    .await;

    // Non-ok status with an HTML error page
    let failing_upstream = serve(Router::new().route(
        "/api/v1/chain/status",
        get(|| async { (StatusCode::BAD_GATEWAY, "<html>bad gateway</html>") }),
    ))
    .await;

    for (url, expect_error) in [
        (json_upstream, false),
        (text_upstream, false),
        (failing_upstream, true),
    ] {
        let upstreams = UpstreamsConfig {
            ledger_url: url,
            timeout_secs: 5,
            ..UpstreamsConfig::default()
        };
        let d = dispatcher(
            upstreams,
            Arc::new(StaticPermissions::allow_all()),
            Arc::new(RecordingProofQueue::broken("unused")),
        );

        let result = d.dispatch("chitty_chain_status", json!({}), &ctx()).await;

        // Always the uniform envelope: one text content item
        assert_eq!(result.content.len(), 1);
        assert!(result.first_text().is_some());
        assert_eq!(result.is_err(), expect_error);
    }
}

#[tokio::test]
async fn plain_text_success_is_wrapped_not_passed_through() {
    let upstream = serve(Router::new().route(
        "/api/v1/chain/status",
        get(|| async { "not json at all" }),
    ))
    .await;

    let upstreams = UpstreamsConfig {
        ledger_url: upstream,
        timeout_secs: 5,
        ..UpstreamsConfig::default()
    };
    let d = dispatcher(
        upstreams,
        Arc::new(StaticPermissions::allow_all()),
        Arc::new(RecordingProofQueue::broken("unused")),
    );

    let result = d.dispatch("chitty_chain_status", json!({}), &ctx()).await;
    assert!(!result.is_err());
    let body = payload(&result);
    assert!(body["error"].as_str().unwrap().contains("not json at all"));
}

#[tokio::test]
async fn unreachable_upstream_is_an_error_envelope_not_a_panic() {
    let upstreams = UpstreamsConfig {
        // Nothing listens here
        ledger_url: "http://127.0.0.1:1".to_string(),
        timeout_secs: 1,
        ..UpstreamsConfig::default()
    };
    let d = dispatcher(
        upstreams,
        Arc::new(StaticPermissions::allow_all()),
        Arc::new(RecordingProofQueue::broken("unused")),
    );

    let result = d.dispatch("chitty_chain_status", json!({}), &ctx()).await;
    assert!(result.is_err());
    assert!(result.first_text().unwrap().contains("upstream request failed"));
}

#[tokio::test]
async fn unknown_tool_names_itself_in_the_error() {
    let world = mock_world(&[]).await;
    let d = dispatcher(
        world.upstreams.clone(),
        Arc::new(StaticPermissions::allow_all()),
        Arc::new(RecordingProofQueue::broken("unused")),
    );

    let result = d.dispatch("chitty_fact_destroy", json!({}), &ctx()).await;
    assert!(result.is_err());
    assert!(result.first_text().unwrap().contains("chitty_fact_destroy"));
}

#[tokio::test]
async fn identity_tool_without_credential_makes_no_network_call() {
    let calls = Arc::new(AtomicUsize::new(0));
    let identity_calls = Arc::clone(&calls);
    let identity_upstream = serve(Router::new().route(
        "/api/v1/mint",
        post(move || {
            let calls = Arc::clone(&identity_calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Json(json!({"chitty_id": "CH-1"}))
            }
        }),
    ))
    .await;

    let upstreams = UpstreamsConfig {
        identity_url: identity_upstream,
        timeout_secs: 5,
        ..UpstreamsConfig::default()
    };
    // Empty vault and no CHITTYID_TOKEN in the test environment
    let d = dispatcher(
        upstreams,
        Arc::new(StaticPermissions::allow_all()),
        Arc::new(RecordingProofQueue::broken("unused")),
    );

    let result = d
        .dispatch("chitty_id_mint", json!({"entity_type": "person"}), &ctx())
        .await;

    assert!(result.is_err());
    assert!(
        result
            .first_text()
            .unwrap()
            .contains("authentication required")
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn proxy_tools_forward_the_callers_bearer() {
    let seen_auth = Arc::new(Mutex::new(None::<String>));
    let capture = Arc::clone(&seen_auth);
    let core = serve(Router::new().route(
        "/api/v1/cases",
        post(move |headers: HeaderMap, Json(_body): Json<Value>| {
            let capture = Arc::clone(&capture);
            async move {
                *capture.lock() = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .map(String::from);
                Json(json!({"case_id": "CASE-1"}))
            }
        }),
    ))
    .await;

    let upstreams = UpstreamsConfig {
        core_url: core,
        timeout_secs: 5,
        ..UpstreamsConfig::default()
    };
    let d = dispatcher(
        upstreams,
        Arc::new(StaticPermissions::allow_all()),
        Arc::new(RecordingProofQueue::broken("unused")),
    );

    let call_ctx = CallContext {
        bearer: Some("caller-token".to_string()),
        service_env: "test".to_string(),
    };
    let result = d
        .dispatch("chitty_case_create", json!({"title": "Estate of X"}), &call_ctx)
        .await;

    assert!(!result.is_err());
    assert_eq!(seen_auth.lock().as_deref(), Some("Bearer caller-token"));
}

#[tokio::test]
async fn search_distinguishes_unconfigured_from_empty_results() {
    let search_upstream = serve(Router::new().route(
        "/api/v1/query",
        post(|| async { Json(json!({"results": []})) }),
    ))
    .await;

    let upstreams = UpstreamsConfig {
        search_url: search_upstream,
        timeout_secs: 5,
        ..UpstreamsConfig::default()
    };

    // Unconfigured: no account id is a hard error
    let unconfigured = ToolDispatcher::new(
        upstreams.clone(),
        SearchConfig { account_id: None },
        Arc::new(StaticTokenVault::new(&[("test", "chittysearch", "tok")])),
        Arc::new(StaticPermissions::allow_all()),
        Arc::new(RecordingProofQueue::broken("unused")),
    );
    let result = unconfigured
        .dispatch("chitty_search", json!({"query": "deed"}), &ctx())
        .await;
    assert!(result.is_err());
    assert!(result.first_text().unwrap().contains("not configured"));

    // Configured with an empty result set: an explicit success
    let configured = ToolDispatcher::new(
        upstreams,
        SearchConfig {
            account_id: Some("acct-1".to_string()),
        },
        Arc::new(StaticTokenVault::new(&[("test", "chittysearch", "tok")])),
        Arc::new(StaticPermissions::allow_all()),
        Arc::new(RecordingProofQueue::broken("unused")),
    );
    let result = configured
        .dispatch("chitty_search", json!({"query": "deed"}), &ctx())
        .await;
    assert!(!result.is_err());
    let body = payload(&result);
    assert_eq!(body["message"], "no matching documents");
}
