//! Upstream HTTP call boundary
//!
//! Downstream services return wildly inconsistent shapes: JSON objects,
//! plain-text error pages, non-ok statuses with HTML bodies. Every call goes
//! through [`UpstreamClient`], which captures the outcome as an
//! [`UpstreamReply`] holding either a parsed JSON body or the raw text, and
//! a single [`envelope`] function converts any outcome into the uniform tool
//! result. No per-tool JSON parsing anywhere else.

use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use serde_json::{Value, json};
use tracing::debug;

use crate::protocol::ToolResult;

/// Maximum upstream body length carried into result messages
const SNIPPET_LIMIT: usize = 400;

/// Outcome of one upstream round-trip
#[derive(Debug)]
pub struct UpstreamReply {
    /// HTTP status
    pub status: StatusCode,
    /// Parsed JSON body, or the raw text when the body is not JSON
    pub body: Result<Value, String>,
}

impl UpstreamReply {
    /// Body rendered as text for diagnostics, truncated
    #[must_use]
    pub fn snippet(&self) -> String {
        match &self.body {
            Ok(v) => truncate_snippet(&v.to_string()),
            Err(raw) => truncate_snippet(raw),
        }
    }
}

/// Truncate an upstream body for inclusion in a result message
#[must_use]
pub fn truncate_snippet(s: &str) -> String {
    if s.len() <= SNIPPET_LIMIT {
        s.to_string()
    } else {
        let cut = s
            .char_indices()
            .take_while(|(i, _)| *i < SNIPPET_LIMIT)
            .last()
            .map_or(0, |(i, c)| i + c.len_utf8());
        format!("{}...", &s[..cut])
    }
}

/// HTTP client for downstream service calls
pub struct UpstreamClient {
    http: Client,
}

impl UpstreamClient {
    /// Create a client with the configured per-request timeout
    #[must_use]
    pub fn new(timeout_secs: u64) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();
        Self { http }
    }

    /// GET a URL, optionally with a bearer credential
    pub async fn get(&self, url: &str, bearer: Option<&str>) -> Result<UpstreamReply, String> {
        self.execute(Method::GET, url, bearer, None).await
    }

    /// POST a JSON body to a URL, optionally with a bearer credential
    pub async fn post(
        &self,
        url: &str,
        bearer: Option<&str>,
        body: &Value,
    ) -> Result<UpstreamReply, String> {
        self.execute(Method::POST, url, bearer, Some(body)).await
    }

    async fn execute(
        &self,
        method: Method,
        url: &str,
        bearer: Option<&str>,
        body: Option<&Value>,
    ) -> Result<UpstreamReply, String> {
        let mut request = self.http.request(method.clone(), url);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| format!("request to {url} failed: {e}"))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| format!("reading response from {url} failed: {e}"))?;

        debug!(%method, url = %url, status = %status, "Upstream call");

        let body = serde_json::from_str::<Value>(&text).map_err(|_| text);
        Ok(UpstreamReply { status, body })
    }
}

/// Normalize any upstream outcome into the uniform tool result envelope.
///
/// Network failures and non-ok statuses become error envelopes carrying a
/// truncated copy of whatever the service said; successful non-JSON bodies
/// are wrapped as `{"error": <raw text>}` rather than passed through raw.
#[must_use]
pub fn envelope(outcome: Result<UpstreamReply, String>) -> ToolResult {
    match outcome {
        Err(net) => ToolResult::error(format!("upstream request failed: {net}")),
        Ok(reply) if !reply.status.is_success() => ToolResult::error(format!(
            "upstream returned {}: {}",
            reply.status,
            reply.snippet()
        )),
        Ok(reply) => match reply.body {
            Ok(value) => ToolResult::json(&value),
            Err(raw) => ToolResult::json(&json!({ "error": truncate_snippet(&raw) })),
        },
    }
}
