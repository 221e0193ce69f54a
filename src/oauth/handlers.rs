//! Authorize/token/registration endpoints
//!
//! The client-facing OAuth 2.1 surface. `/authorize` resolves the caller's
//! identity through the [`IdentityResolver`](super::IdentityResolver)
//! collaborator and completes immediately with a redirect carrying an
//! authorization code; `/token` exchanges codes (PKCE S256) and refresh
//! tokens; `/register` performs dynamic client registration. The AS
//! metadata document advertises the surface for discovery.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use url::Url;

use super::store::{parse_scope, verify_s256, SUPPORTED_SCOPES};
use crate::gateway::auth::bearer_from_headers;
use crate::gateway::router::AppState;

/// OAuth bridge routes, mounted at the server root
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/authorize", get(authorize_handler))
        .route("/token", post(token_handler))
        .route("/register", post(register_handler))
        .route(
            "/.well-known/oauth-authorization-server",
            get(metadata_handler),
        )
}

#[derive(Debug, Deserialize)]
struct AuthorizeQuery {
    response_type: Option<String>,
    client_id: Option<String>,
    redirect_uri: Option<String>,
    scope: Option<String>,
    state: Option<String>,
    code_challenge: Option<String>,
    code_challenge_method: Option<String>,
}

/// GET /authorize
async fn authorize_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<AuthorizeQuery>,
) -> Response {
    let Some(redirect_uri) = query.redirect_uri.as_deref() else {
        return oauth_error(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "Missing redirect_uri",
        );
    };
    let Ok(mut location) = Url::parse(redirect_uri) else {
        return oauth_error(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "redirect_uri is not a valid URL",
        );
    };

    if query.response_type.as_deref() != Some("code") {
        return redirect_error(redirect_uri, "unsupported_response_type", query.state.as_deref());
    }

    let client_id = query.client_id.as_deref().unwrap_or_default();
    if client_id.is_empty() {
        return oauth_error(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "Missing client_id",
        );
    }

    // Registration is not mandatory; an unregistered client proceeds with
    // the redirect_uri it presented. A registered client must match.
    if let Some(client) = state.oauth.client(client_id) {
        if !client.redirect_uris.is_empty()
            && !client.redirect_uris.iter().any(|u| u == redirect_uri)
        {
            return oauth_error(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                "redirect_uri not registered for this client",
            );
        }
    }

    if query.code_challenge.is_some()
        && query.code_challenge_method.as_deref().unwrap_or("S256") != "S256"
    {
        return redirect_error(redirect_uri, "invalid_request", query.state.as_deref());
    }

    // The grant is bound to a real upstream-authenticated identity, not a
    // placeholder; an unresolvable caller is denied.
    let bearer = bearer_from_headers(&headers);
    let identity = match state.identity.resolve(bearer.as_deref()).await {
        Ok(identity) => identity,
        Err(reason) => {
            warn!(client = %client_id, reason = %reason, "Authorization denied");
            return redirect_error(redirect_uri, "access_denied", query.state.as_deref());
        }
    };

    let scope = parse_scope(query.scope.as_deref());
    let code = state.oauth.mint_code(
        client_id,
        &identity.user_id,
        scope,
        redirect_uri,
        query.code_challenge.clone(),
    );

    info!(client = %client_id, user = %identity.user_id, "Authorization code issued");

    location.query_pairs_mut().append_pair("code", &code);
    if let Some(client_state) = query.state.as_deref() {
        location.query_pairs_mut().append_pair("state", client_state);
    }
    Redirect::to(location.as_str()).into_response()
}

#[derive(Debug, Deserialize)]
struct TokenRequest {
    grant_type: String,
    code: Option<String>,
    redirect_uri: Option<String>,
    client_id: Option<String>,
    code_verifier: Option<String>,
    refresh_token: Option<String>,
}

/// POST /token (form-encoded)
async fn token_handler(
    State(state): State<Arc<AppState>>,
    axum::extract::Form(request): axum::extract::Form<TokenRequest>,
) -> Response {
    match request.grant_type.as_str() {
        "authorization_code" => exchange_code(&state, &request),
        "refresh_token" => exchange_refresh(&state, &request),
        other => oauth_error(
            StatusCode::BAD_REQUEST,
            "unsupported_grant_type",
            &format!("Unsupported grant_type: {other}"),
        ),
    }
}

fn exchange_code(state: &AppState, request: &TokenRequest) -> Response {
    let Some(code) = request.code.as_deref() else {
        return oauth_error(StatusCode::BAD_REQUEST, "invalid_request", "Missing code");
    };

    let Some(grant) = state.oauth.take_code(code) else {
        return oauth_error(
            StatusCode::BAD_REQUEST,
            "invalid_grant",
            "Unknown or expired authorization code",
        );
    };

    if request.client_id.as_deref() != Some(grant.client_id.as_str()) {
        return oauth_error(
            StatusCode::BAD_REQUEST,
            "invalid_grant",
            "client_id does not match the authorization",
        );
    }
    if request.redirect_uri.as_deref() != Some(grant.redirect_uri.as_str()) {
        return oauth_error(
            StatusCode::BAD_REQUEST,
            "invalid_grant",
            "redirect_uri does not match the authorization",
        );
    }

    if let Some(challenge) = grant.code_challenge.as_deref() {
        let verified = request
            .code_verifier
            .as_deref()
            .is_some_and(|verifier| verify_s256(verifier, challenge));
        if !verified {
            return oauth_error(
                StatusCode::BAD_REQUEST,
                "invalid_grant",
                "PKCE verification failed",
            );
        }
    }

    let (access_token, refresh_token) = state.oauth.issue_tokens(
        &grant.client_id,
        &grant.user_id,
        grant.scope.clone(),
        state.config.oauth.access_token_ttl_secs,
        state.config.oauth.refresh_token_ttl_days,
    );

    info!(client = %grant.client_id, user = %grant.user_id, "Access token issued");

    token_response(
        &access_token,
        &refresh_token,
        state.config.oauth.access_token_ttl_secs,
        &grant.scope,
    )
}

fn exchange_refresh(state: &AppState, request: &TokenRequest) -> Response {
    let Some(token) = request.refresh_token.as_deref() else {
        return oauth_error(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "Missing refresh_token",
        );
    };

    let Some(grant) = state.oauth.refresh_grant(token) else {
        return oauth_error(
            StatusCode::BAD_REQUEST,
            "invalid_grant",
            "Unknown or expired refresh token",
        );
    };

    let (access_token, refresh_token) = state.oauth.issue_tokens(
        &grant.client_id,
        &grant.user_id,
        grant.scope.clone(),
        state.config.oauth.access_token_ttl_secs,
        state.config.oauth.refresh_token_ttl_days,
    );

    token_response(
        &access_token,
        &refresh_token,
        state.config.oauth.access_token_ttl_secs,
        &grant.scope,
    )
}

fn token_response(
    access_token: &str,
    refresh_token: &str,
    expires_in: u64,
    scope: &[String],
) -> Response {
    Json(json!({
        "access_token": access_token,
        "token_type": "Bearer",
        "expires_in": expires_in,
        "refresh_token": refresh_token,
        "scope": scope.join(" "),
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    #[serde(default)]
    client_name: Option<String>,
    #[serde(default)]
    redirect_uris: Vec<String>,
}

/// POST /register - dynamic client registration
async fn register_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegisterRequest>,
) -> Response {
    let record = state
        .oauth
        .register_client(request.client_name, request.redirect_uris);

    info!(client = %record.client_id, "Client registered");

    (
        StatusCode::CREATED,
        Json(json!({
            "client_id": record.client_id,
            "client_name": record.client_name,
            "redirect_uris": record.redirect_uris,
            "token_endpoint_auth_method": "none",
        })),
    )
        .into_response()
}

/// GET /.well-known/oauth-authorization-server
async fn metadata_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let issuer = &state.config.oauth.issuer;
    Json(json!({
        "issuer": issuer,
        "authorization_endpoint": format!("{issuer}/authorize"),
        "token_endpoint": format!("{issuer}/token"),
        "registration_endpoint": format!("{issuer}/register"),
        "scopes_supported": SUPPORTED_SCOPES,
        "response_types_supported": ["code"],
        "grant_types_supported": ["authorization_code", "refresh_token"],
        "code_challenge_methods_supported": ["S256"],
        "token_endpoint_auth_methods_supported": ["none"],
    }))
}

fn oauth_error(status: StatusCode, error: &str, description: &str) -> Response {
    (
        status,
        Json(json!({ "error": error, "error_description": description })),
    )
        .into_response()
}

fn redirect_error(redirect_uri: &str, error: &str, client_state: Option<&str>) -> Response {
    let Ok(mut location) = Url::parse(redirect_uri) else {
        return oauth_error(StatusCode::BAD_REQUEST, "invalid_request", "Bad redirect_uri");
    };
    location.query_pairs_mut().append_pair("error", error);
    if let Some(s) = client_state {
        location.query_pairs_mut().append_pair("state", s);
    }
    Redirect::to(location.as_str()).into_response()
}
