//! HTTP router and JSON-RPC dispatch
//!
//! One logical endpoint, three verbs: `POST /mcp` carries JSON-RPC
//! requests, notifications, and batches; `GET /mcp` opens the SSE push
//! channel; `DELETE /mcp` terminates the session. The JSON-RPC method
//! handlers and the REST-style `/mcp/tools/*` and `/mcp/resources/*`
//! surface share one implementation on [`AppState`], so the router
//! delegates rather than re-implementing tool dispatch.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Request, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::future::join_all;
use serde_json::{Value, json};
use tower_http::{catch_panic::CatchPanicLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, warn};

use super::auth::{AuthContext, AuthGate, auth_middleware, bearer_from_headers};
use super::session::SessionRegistry;
use super::streaming::{PushRegistry, open_push_channel};
use crate::config::Config;
use crate::dispatch::{CallContext, ToolDispatcher};
use crate::error::{Error, Result, rpc_codes};
use crate::oauth::{self, IdentityResolver, OAuthStore};
use crate::protocol::{
    Info, InitializeResult, JsonRpcResponse, PROTOCOL_VERSION, PromptsListResult, RequestId,
    Resource, ResourceContents, ResourcesListResult, ResourcesReadResult, ServerCapabilities,
    ToolResult, ToolsCapability, ToolsListResult,
};

/// Maximum accepted request body
const BODY_LIMIT: usize = 10 * 1024 * 1024;

/// Session identifier header, round-tripped on every response
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Shared application state
pub struct AppState {
    /// Gateway configuration
    pub config: Config,
    /// Session registry
    pub sessions: Arc<SessionRegistry>,
    /// Push connection registry
    pub push: Arc<PushRegistry>,
    /// Tool dispatcher
    pub dispatcher: Arc<ToolDispatcher>,
    /// Grant/client/token store behind the authorization bridge
    pub oauth: Arc<OAuthStore>,
    /// Identity resolution collaborator for `/authorize`
    pub identity: Arc<dyn IdentityResolver>,
}

impl AppState {
    /// The tool catalog, as served by both RPC and REST listings
    #[must_use]
    pub fn tools_list(&self) -> ToolsListResult {
        ToolsListResult {
            tools: ToolDispatcher::catalog(),
        }
    }

    /// Invoke a tool with the caller's bearer forwarded unchanged
    pub async fn call_tool(&self, name: &str, arguments: Value, bearer: Option<&str>) -> ToolResult {
        let ctx = CallContext {
            bearer: bearer.map(String::from),
            service_env: self.config.service_env.clone(),
        };
        self.dispatcher.dispatch(name, arguments, &ctx).await
    }

    /// The resource catalog
    #[must_use]
    pub fn resources_list(&self) -> ResourcesListResult {
        ResourcesListResult {
            resources: vec![
                Resource {
                    uri: "chitty://services/directory".to_string(),
                    name: "Service Directory".to_string(),
                    description: Some("Downstream service endpoints this gateway routes to".to_string()),
                    mime_type: Some("application/json".to_string()),
                },
                Resource {
                    uri: "chitty://tools/catalog".to_string(),
                    name: "Tool Catalog".to_string(),
                    description: Some("Every dispatchable tool with its input schema".to_string()),
                    mime_type: Some("application/json".to_string()),
                },
            ],
        }
    }

    /// Read a resource by URI
    pub fn read_resource(&self, uri: &str) -> Result<ResourcesReadResult> {
        let text = match uri {
            "chitty://services/directory" => json!({
                "identity": self.config.upstreams.identity_url,
                "core": self.config.upstreams.core_url,
                "ledger": self.config.upstreams.ledger_url,
                "trust": self.config.upstreams.trust_url,
                "search": self.config.upstreams.search_url,
            })
            .to_string(),
            "chitty://tools/catalog" => serde_json::to_string(&self.tools_list())?,
            other => {
                return Err(Error::json_rpc(
                    rpc_codes::INVALID_PARAMS,
                    format!("unknown resource: {other}"),
                ));
            }
        };

        Ok(ResourcesReadResult {
            contents: vec![ResourceContents::Text {
                uri: uri.to_string(),
                mime_type: Some("application/json".to_string()),
                text,
            }],
        })
    }
}

/// Create the router with authentication and panic containment layers
pub fn create_router(state: Arc<AppState>, gate: Arc<AuthGate>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/mcp",
            post(mcp_post_handler)
                .get(mcp_sse_handler)
                .delete(mcp_delete_handler),
        )
        .route("/mcp/tools/list", get(rest_tools_list))
        .route("/mcp/tools/call", post(rest_tools_call))
        .route("/mcp/resources/list", get(rest_resources_list))
        .route("/mcp/resources/read", post(rest_resources_read))
        .merge(oauth::routes())
        .layer(middleware::from_fn_with_state(gate, auth_middleware))
        .layer(CatchPanicLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check handler (public path)
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "chitty-gateway",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Attach the session header and status to a response body
fn with_session(session_id: &str, status: StatusCode, body: Option<Value>) -> Response {
    let mut response = match body {
        Some(value) => (status, Json(value)).into_response(),
        None => status.into_response(),
    };
    if let Ok(value) = HeaderValue::from_str(session_id) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

fn session_header_value(headers: &HeaderMap) -> Option<&str> {
    headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok())
}

/// POST /mcp - JSON-RPC request/notification/batch
async fn mcp_post_handler(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
) -> Response {
    let headers = request.headers().clone();
    let bearer = request
        .extensions()
        .get::<AuthContext>()
        .and_then(|ctx| ctx.bearer.clone());
    let session_id = state.sessions.resolve(session_header_value(&headers));

    let body_bytes = match axum::body::to_bytes(request.into_body(), BODY_LIMIT).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return with_session(
                &session_id,
                StatusCode::BAD_REQUEST,
                Some(parse_error_body(&format!("Failed to read body: {e}"))),
            );
        }
    };

    // A malformed envelope is the one error whose HTTP status itself
    // reflects the failure; everything later is encoded in-band.
    let envelope: Value = match serde_json::from_slice(&body_bytes) {
        Ok(v) => v,
        Err(e) => {
            return with_session(
                &session_id,
                StatusCode::BAD_REQUEST,
                Some(parse_error_body(&format!("Invalid JSON: {e}"))),
            );
        }
    };

    match envelope {
        Value::Array(batch) => {
            if batch.is_empty() {
                let response =
                    JsonRpcResponse::error(None, rpc_codes::INVALID_REQUEST, "Empty batch");
                return with_session(
                    &session_id,
                    StatusCode::OK,
                    Some(serde_json::to_value(response).unwrap_or_default()),
                );
            }

            // Batch elements have no ordering requirement between them
            let futures = batch
                .iter()
                .map(|element| dispatch_envelope(&state, element, bearer.as_deref()));
            let responses: Vec<JsonRpcResponse> =
                join_all(futures).await.into_iter().flatten().collect();

            if responses.is_empty() {
                // Every element was a notification
                with_session(&session_id, StatusCode::ACCEPTED, None)
            } else {
                with_session(
                    &session_id,
                    StatusCode::OK,
                    Some(serde_json::to_value(responses).unwrap_or_default()),
                )
            }
        }
        single => match dispatch_envelope(&state, &single, bearer.as_deref()).await {
            Some(response) => with_session(
                &session_id,
                StatusCode::OK,
                Some(serde_json::to_value(response).unwrap_or_default()),
            ),
            None => with_session(&session_id, StatusCode::ACCEPTED, None),
        },
    }
}

fn parse_error_body(message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "error": { "code": rpc_codes::PARSE_ERROR, "message": message },
        "id": null
    })
}

/// GET /mcp - SSE push channel
async fn mcp_sse_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let accept = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let session_id = state.sessions.resolve(session_header_value(&headers));

    if !accept.contains("text/event-stream") {
        return with_session(
            &session_id,
            StatusCode::NOT_ACCEPTABLE,
            Some(json!({ "error": "Must accept text/event-stream for the push channel" })),
        );
    }

    let heartbeat = Duration::from_secs(state.config.streaming.heartbeat_interval_secs);
    let sse = open_push_channel(
        Arc::clone(&state.push),
        Arc::clone(&state.sessions),
        session_id.clone(),
        heartbeat,
    );

    let mut response = sse.into_response();
    if let Ok(value) = HeaderValue::from_str(&session_id) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

/// DELETE /mcp - session termination, always 204
async fn mcp_delete_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let session_id = match session_header_value(&headers) {
        Some(id) if !id.is_empty() => {
            state.sessions.remove(id);
            debug!(session = %id, "Session terminated by client");
            id.to_string()
        }
        _ => state.sessions.resolve(None),
    };

    with_session(&session_id, StatusCode::NO_CONTENT, None)
}

/// Dispatch one JSON-RPC envelope. Returns `None` for notifications,
/// which never produce a response, even on dispatch error.
async fn dispatch_envelope(
    state: &AppState,
    envelope: &Value,
    bearer: Option<&str>,
) -> Option<JsonRpcResponse> {
    let Some(object) = envelope.as_object() else {
        // Not classifiable as request or notification: always surfaced
        return Some(JsonRpcResponse::error(
            None,
            rpc_codes::INVALID_REQUEST,
            "Envelope is not an object",
        ));
    };

    let id = object.get("id").and_then(extract_request_id);

    if object.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return Some(JsonRpcResponse::error(
            id,
            rpc_codes::INVALID_REQUEST,
            "Invalid JSON-RPC version",
        ));
    }

    let Some(method) = object.get("method").and_then(Value::as_str) else {
        return Some(JsonRpcResponse::error(
            id,
            rpc_codes::INVALID_REQUEST,
            "Missing method",
        ));
    };

    let params = object.get("params").cloned();

    match id {
        Some(id) => {
            let response = match call_method(state, method, params, bearer).await {
                Ok(result) => JsonRpcResponse::success(id, result),
                Err(e) => JsonRpcResponse::error(Some(id), e.to_rpc_code(), e.to_string()),
            };
            Some(response)
        }
        None => {
            handle_notification(state, method, bearer, params).await;
            None
        }
    }
}

/// Handle a request method, producing its result payload
async fn call_method(
    state: &AppState,
    method: &str,
    params: Option<Value>,
    bearer: Option<&str>,
) -> Result<Value> {
    match method {
        "initialize" => to_result(&initialize_result()),
        "ping" => Ok(json!({})),
        "tools/list" => to_result(&state.tools_list()),
        "tools/call" => {
            let params = params.unwrap_or_else(|| json!({}));
            let name = params.get("name").and_then(Value::as_str).unwrap_or("");
            let arguments = params
                .get("arguments")
                .cloned()
                .unwrap_or_else(|| json!({}));

            let result = state.call_tool(name, arguments, bearer).await;
            to_result(&result)
        }
        "resources/list" => to_result(&state.resources_list()),
        "resources/read" => {
            let uri = params
                .as_ref()
                .and_then(|p| p.get("uri"))
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    Error::json_rpc(rpc_codes::INVALID_PARAMS, "Missing resource uri")
                })?;
            to_result(&state.read_resource(uri)?)
        }
        "prompts/list" => to_result(&PromptsListResult::default()),
        other => Err(Error::json_rpc(
            rpc_codes::METHOD_NOT_FOUND,
            format!("Method not found: {other}"),
        )),
    }
}

/// Handle a notification. Errors are logged and dropped, never surfaced.
async fn handle_notification(
    state: &AppState,
    method: &str,
    bearer: Option<&str>,
    params: Option<Value>,
) {
    match method {
        "notifications/initialized" => {
            debug!("Client initialization acknowledged");
        }
        "tools/call" => {
            // A notification-style invocation runs for its side effects;
            // the result has nowhere to go.
            let params = params.unwrap_or_else(|| json!({}));
            let name = params.get("name").and_then(Value::as_str).unwrap_or("");
            let arguments = params
                .get("arguments")
                .cloned()
                .unwrap_or_else(|| json!({}));
            let result = state.call_tool(name, arguments, bearer).await;
            if result.is_err() {
                warn!(tool = %name, "Notification tool call failed (dropped)");
            }
        }
        other => {
            debug!(method = %other, "Dropping unknown notification");
        }
    }
}

/// Serialize a result payload, mapping failure to an internal error
fn to_result<T: serde::Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| {
        Error::json_rpc(
            rpc_codes::INTERNAL_ERROR,
            format!("result not serializable: {e}"),
        )
    })
}

fn initialize_result() -> InitializeResult {
    InitializeResult {
        protocol_version: PROTOCOL_VERSION.to_string(),
        capabilities: ServerCapabilities {
            tools: Some(ToolsCapability {
                list_changed: Some(false),
            }),
            // Resource subscription and list-changed notifications are
            // not supported; the capability is omitted entirely.
            resources: None,
        },
        server_info: Info {
            name: "chitty-gateway".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    }
}

/// Extract a `RequestId` from a JSON value; string and integer only
fn extract_request_id(value: &Value) -> Option<RequestId> {
    match value {
        Value::String(s) => Some(RequestId::String(s.clone())),
        Value::Number(n) => n.as_i64().map(RequestId::Number),
        _ => None,
    }
}

// ============================================================================
// REST surface (same implementation the RPC methods delegate to)
// ============================================================================

async fn rest_tools_list(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.tools_list())
}

async fn rest_tools_call(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(params): Json<Value>,
) -> impl IntoResponse {
    let bearer = bearer_from_headers(&headers);
    let name = params.get("name").and_then(Value::as_str).unwrap_or("");
    let arguments = params
        .get("arguments")
        .cloned()
        .unwrap_or_else(|| json!({}));
    Json(state.call_tool(name, arguments, bearer.as_deref()).await)
}

async fn rest_resources_list(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.resources_list())
}

async fn rest_resources_read(
    State(state): State<Arc<AppState>>,
    Json(params): Json<Value>,
) -> Response {
    let Some(uri) = params.get("uri").and_then(Value::as_str) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Missing resource uri" })),
        )
            .into_response();
    };

    match state.read_resource(uri) {
        Ok(result) => Json(result).into_response(),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn request_id_extraction() {
        assert_eq!(
            extract_request_id(&json!("abc")),
            Some(RequestId::String("abc".to_string()))
        );
        assert_eq!(extract_request_id(&json!(7)), Some(RequestId::Number(7)));
        assert_eq!(extract_request_id(&json!(-1)), Some(RequestId::Number(-1)));
        assert!(extract_request_id(&json!(null)).is_none());
        assert!(extract_request_id(&json!(3.5)).is_none());
        assert!(extract_request_id(&json!({"id": 1})).is_none());
    }

    #[test]
    fn initialize_advertises_tools_but_not_resources() {
        let result = initialize_result();
        assert_eq!(result.protocol_version, PROTOCOL_VERSION);
        assert!(result.capabilities.tools.is_some());
        assert!(result.capabilities.resources.is_none());
        assert_eq!(result.server_info.name, "chitty-gateway");
    }

    #[test]
    fn parse_error_body_shape() {
        let body = parse_error_body("Invalid JSON: oops");
        assert_eq!(body["error"]["code"], rpc_codes::PARSE_ERROR);
        assert_eq!(body["id"], Value::Null);
    }
}
