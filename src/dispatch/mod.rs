//! Tool dispatcher
//!
//! Maps a `(tool name, arguments, call context)` triple to an upstream HTTP
//! call, applying pre-flight integrity and permission chains first, and
//! normalizing every outcome into the uniform result envelope. The
//! dispatcher never returns an `Err` at the function level: all failure
//! paths terminate in a `ToolResult` with `isError` set.

mod preflight;
mod upstream;

pub use preflight::{
    EvidenceAnchor, HttpPermissionChecker, HttpProofQueue, PermissionChecker, PermissionDecision,
    ProofQueue, verify_evidence,
};
pub use upstream::{UpstreamClient, UpstreamReply, envelope, truncate_snippet};

use std::str::FromStr;
use std::sync::Arc;

use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::config::{SearchConfig, UpstreamsConfig};
use crate::protocol::{Tool, ToolResult};
use crate::secrets::TokenVault;

/// Authentication context accompanying a tool invocation
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Caller-supplied bearer token, forwarded to proxy upstreams
    pub bearer: Option<String>,
    /// Environment tag handed to the credential vault and trust resolver
    pub service_env: String,
}

impl CallContext {
    /// Context with no caller credential
    #[must_use]
    pub fn anonymous(service_env: impl Into<String>) -> Self {
        Self {
            bearer: None,
            service_env: service_env.into(),
        }
    }
}

/// Closed set of dispatchable tools.
///
/// Adding a tool means adding a variant here and a match arm in
/// `ToolDispatcher::dispatch`; a typo in a tool name is an explicit
/// unknown-tool error, never a silent no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolName {
    /// Mint a ChittyID (direct service credential)
    IdMint,
    /// Validate a ChittyID (direct service credential)
    IdValidate,
    /// Create a case (proxy)
    CaseCreate,
    /// Fetch a case (proxy)
    CaseGet,
    /// Ingest an evidence record (proxy)
    EvidenceIngest,
    /// Fetch an evidence record (proxy)
    EvidenceGet,
    /// Record a finance ledger entry (proxy)
    FinanceEntry,
    /// Push a sync batch (proxy)
    SyncPush,
    /// Read sync status (proxy)
    SyncStatus,
    /// Read chain status from the ledger host
    ChainStatus,
    /// Read a fact from the ledger host
    FactGet,
    /// Mint a fact (integrity-gated)
    FactMint,
    /// Validate a fact against corroborating evidence (integrity-gated)
    FactValidate,
    /// Seal a fact (permission-gated, enqueues a proof job)
    FactSeal,
    /// Dispute a fact (permission-gated)
    FactDispute,
    /// Export a ledger section (permission-gated)
    LedgerExport,
    /// Full-text search over indexed documents
    Search,
}

impl ToolName {
    /// Wire name of this tool
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IdMint => "chitty_id_mint",
            Self::IdValidate => "chitty_id_validate",
            Self::CaseCreate => "chitty_case_create",
            Self::CaseGet => "chitty_case_get",
            Self::EvidenceIngest => "chitty_evidence_ingest",
            Self::EvidenceGet => "chitty_evidence_get",
            Self::FinanceEntry => "chitty_finance_entry",
            Self::SyncPush => "chitty_sync_push",
            Self::SyncStatus => "chitty_sync_status",
            Self::ChainStatus => "chitty_chain_status",
            Self::FactGet => "chitty_fact_get",
            Self::FactMint => "chitty_fact_mint",
            Self::FactValidate => "chitty_fact_validate",
            Self::FactSeal => "chitty_fact_seal",
            Self::FactDispute => "chitty_fact_dispute",
            Self::LedgerExport => "chitty_ledger_export",
            Self::Search => "chitty_search",
        }
    }

    /// All dispatchable tools, in catalog order
    #[must_use]
    pub fn all() -> &'static [Self] {
        &[
            Self::IdMint,
            Self::IdValidate,
            Self::CaseCreate,
            Self::CaseGet,
            Self::EvidenceIngest,
            Self::EvidenceGet,
            Self::FinanceEntry,
            Self::SyncPush,
            Self::SyncStatus,
            Self::ChainStatus,
            Self::FactGet,
            Self::FactMint,
            Self::FactValidate,
            Self::FactSeal,
            Self::FactDispute,
            Self::LedgerExport,
            Self::Search,
        ]
    }
}

impl FromStr for ToolName {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chitty_id_mint" => Ok(Self::IdMint),
            "chitty_id_validate" => Ok(Self::IdValidate),
            "chitty_case_create" => Ok(Self::CaseCreate),
            "chitty_case_get" => Ok(Self::CaseGet),
            "chitty_evidence_ingest" => Ok(Self::EvidenceIngest),
            "chitty_evidence_get" => Ok(Self::EvidenceGet),
            "chitty_finance_entry" => Ok(Self::FinanceEntry),
            "chitty_sync_push" => Ok(Self::SyncPush),
            "chitty_sync_status" => Ok(Self::SyncStatus),
            "chitty_chain_status" => Ok(Self::ChainStatus),
            "chitty_fact_get" => Ok(Self::FactGet),
            "chitty_fact_mint" => Ok(Self::FactMint),
            "chitty_fact_validate" => Ok(Self::FactValidate),
            "chitty_fact_seal" => Ok(Self::FactSeal),
            "chitty_fact_dispute" => Ok(Self::FactDispute),
            "chitty_ledger_export" => Ok(Self::LedgerExport),
            "chitty_search" => Ok(Self::Search),
            _ => Err(()),
        }
    }
}

/// Tool dispatcher
pub struct ToolDispatcher {
    upstream: UpstreamClient,
    upstreams: UpstreamsConfig,
    search: SearchConfig,
    vault: Arc<dyn TokenVault>,
    permissions: Arc<dyn PermissionChecker>,
    proof_queue: Arc<dyn ProofQueue>,
}

impl ToolDispatcher {
    /// Create a dispatcher with its collaborators statically injected
    #[must_use]
    pub fn new(
        upstreams: UpstreamsConfig,
        search: SearchConfig,
        vault: Arc<dyn TokenVault>,
        permissions: Arc<dyn PermissionChecker>,
        proof_queue: Arc<dyn ProofQueue>,
    ) -> Self {
        Self {
            upstream: UpstreamClient::new(upstreams.timeout_secs),
            upstreams,
            search,
            vault,
            permissions,
            proof_queue,
        }
    }

    /// The tool catalog served by `tools/list`
    #[must_use]
    pub fn catalog() -> Vec<Tool> {
        ToolName::all()
            .iter()
            .map(|tool| Tool {
                name: tool.as_str().to_string(),
                description: Some(describe(*tool).to_string()),
                input_schema: schema(*tool),
            })
            .collect()
    }

    /// Dispatch a tool invocation. Never errors at the function level.
    pub async fn dispatch(&self, name: &str, args: Value, ctx: &CallContext) -> ToolResult {
        let Ok(tool) = name.parse::<ToolName>() else {
            return ToolResult::error(format!("unknown tool: '{name}'"));
        };

        debug!(tool = %tool.as_str(), "Dispatching tool call");

        match tool {
            ToolName::IdMint => self.identity_call("mint", &args, ctx).await,
            ToolName::IdValidate => self.identity_call("validate", &args, ctx).await,
            ToolName::CaseCreate => self.proxy_post("/api/v1/cases", &args, ctx).await,
            ToolName::CaseGet => self.proxy_get("/api/v1/cases", "case_id", &args, ctx).await,
            ToolName::EvidenceIngest => self.proxy_post("/api/v1/evidence", &args, ctx).await,
            ToolName::EvidenceGet => {
                self.proxy_get("/api/v1/evidence", "evidence_id", &args, ctx)
                    .await
            }
            ToolName::FinanceEntry => self.proxy_post("/api/v1/finance/entries", &args, ctx).await,
            ToolName::SyncPush => self.proxy_post("/api/v1/sync", &args, ctx).await,
            ToolName::SyncStatus => {
                let url = format!("{}/api/v1/sync/status", self.upstreams.core_url);
                envelope(self.upstream.get(&url, ctx.bearer.as_deref()).await)
            }
            ToolName::ChainStatus => {
                let url = format!("{}/api/v1/chain/status", self.upstreams.ledger_url);
                envelope(self.upstream.get(&url, ctx.bearer.as_deref()).await)
            }
            ToolName::FactGet => {
                let Some(fact_id) = required_str(&args, "fact_id") else {
                    return missing_arg(tool, "fact_id");
                };
                let url = format!("{}/api/v1/facts/{fact_id}", self.upstreams.ledger_url);
                envelope(self.upstream.get(&url, ctx.bearer.as_deref()).await)
            }
            ToolName::FactMint => self.fact_mint(&args, ctx).await,
            ToolName::FactValidate => self.fact_validate(&args, ctx).await,
            ToolName::FactSeal => self.fact_seal(&args, ctx).await,
            ToolName::FactDispute => self.fact_dispute(&args, ctx).await,
            ToolName::LedgerExport => self.ledger_export(&args, ctx).await,
            ToolName::Search => self.search(&args, ctx).await,
        }
    }

    /// Direct-credential call to the identity service. The service token is
    /// resolved before anything touches the network; a missing credential is
    /// an immediate authentication error.
    async fn identity_call(&self, operation: &str, args: &Value, ctx: &CallContext) -> ToolResult {
        let token = self
            .vault
            .service_token(&ctx.service_env, "chittyid")
            .or_else(|| std::env::var("CHITTYID_TOKEN").ok());

        let Some(token) = token else {
            return ToolResult::error(format!(
                "authentication required: no ChittyID service credential provisioned for env '{}'",
                ctx.service_env
            ));
        };

        let url = format!("{}/api/v1/{operation}", self.upstreams.identity_url);
        envelope(self.upstream.post(&url, Some(token.as_str()), args).await)
    }

    /// Forward a create-style call to the core platform
    async fn proxy_post(&self, path: &str, args: &Value, ctx: &CallContext) -> ToolResult {
        let url = format!("{}{path}", self.upstreams.core_url);
        envelope(self.upstream.post(&url, ctx.bearer.as_deref(), args).await)
    }

    /// Forward a fetch-style call to the core platform
    async fn proxy_get(
        &self,
        path: &str,
        id_arg: &str,
        args: &Value,
        ctx: &CallContext,
    ) -> ToolResult {
        let Some(id) = required_str(args, id_arg) else {
            return ToolResult::error(format!("missing required argument '{id_arg}'"));
        };
        let url = format!("{}{path}/{id}", self.upstreams.core_url);
        envelope(self.upstream.get(&url, ctx.bearer.as_deref()).await)
    }

    /// Mint a fact. The cited evidence must already be persisted; its hash is
    /// captured during the pre-flight and anchored into the mint body so the
    /// fact records the state the actor actually observed.
    async fn fact_mint(&self, args: &Value, ctx: &CallContext) -> ToolResult {
        let Some(evidence_id) = required_str(args, "evidence_id") else {
            return missing_arg(ToolName::FactMint, "evidence_id");
        };

        let anchor = match verify_evidence(
            &self.upstream,
            &self.upstreams.core_url,
            evidence_id,
            ctx.bearer.as_deref(),
        )
        .await
        {
            Ok(anchor) => anchor,
            Err(msg) => return ToolResult::error(format!("fact not minted: {msg}")),
        };

        let mut body = as_object(args);
        body.insert(
            "evidence_hash_at_mint".to_string(),
            json!(anchor.content_hash),
        );

        let url = format!("{}/api/v1/facts", self.upstreams.ledger_url);
        envelope(
            self.upstream
                .post(&url, ctx.bearer.as_deref(), &Value::Object(body))
                .await,
        )
    }

    /// Validate a fact against corroborating evidence. Every cited record is
    /// verified before the validate endpoint sees a single byte.
    async fn fact_validate(&self, args: &Value, ctx: &CallContext) -> ToolResult {
        let Some(fact_id) = required_str(args, "fact_id") else {
            return missing_arg(ToolName::FactValidate, "fact_id");
        };
        let Some(ids) = args.get("evidence_ids").and_then(Value::as_array) else {
            return missing_arg(ToolName::FactValidate, "evidence_ids");
        };

        let mut hashes = Map::new();
        for id in ids {
            let Some(id) = id.as_str() else {
                return ToolResult::error("evidence_ids must be an array of strings");
            };
            match verify_evidence(
                &self.upstream,
                &self.upstreams.core_url,
                id,
                ctx.bearer.as_deref(),
            )
            .await
            {
                Ok(anchor) => {
                    hashes.insert(anchor.id, json!(anchor.content_hash));
                }
                Err(msg) => return ToolResult::error(format!("fact not validated: {msg}")),
            }
        }

        let mut body = as_object(args);
        body.insert("evidence_hashes".to_string(), Value::Object(hashes));

        let url = format!(
            "{}/api/v1/facts/{fact_id}/validate",
            self.upstreams.ledger_url
        );
        envelope(
            self.upstream
                .post(&url, ctx.bearer.as_deref(), &Value::Object(body))
                .await,
        )
    }

    /// Seal a fact. Trust is resolved first; a denial never reaches the
    /// ledger. A successful seal enqueues a proof job, and a queue failure is
    /// reported as a warning on the success payload, never as an error.
    async fn fact_seal(&self, args: &Value, ctx: &CallContext) -> ToolResult {
        let Some(fact_id) = required_str(args, "fact_id") else {
            return missing_arg(ToolName::FactSeal, "fact_id");
        };
        let actor = actor_id(args);

        let decision = self
            .permissions
            .check(actor, "fact.seal", &ctx.service_env)
            .await;
        if !decision.allowed {
            return ToolResult::error(format!(
                "seal denied for actor '{actor}': {}",
                decision
                    .reason
                    .unwrap_or_else(|| "insufficient trust level".to_string())
            ));
        }

        let url = format!("{}/api/v1/facts/{fact_id}/seal", self.upstreams.ledger_url);
        let result = envelope(self.upstream.post(&url, ctx.bearer.as_deref(), args).await);
        if result.is_err() {
            return result;
        }

        // The seal already succeeded; queue trouble is a warning, not a rollback.
        match self
            .proof_queue
            .send(json!({ "fact_id": fact_id, "action": "seal", "actor_id": actor }))
            .await
        {
            Ok(()) => result,
            Err(e) => {
                warn!(fact = %fact_id, error = %e, "Proof job enqueue failed after seal");
                attach_warning(result, "proof_queue_warning", &e)
            }
        }
    }

    async fn fact_dispute(&self, args: &Value, ctx: &CallContext) -> ToolResult {
        let Some(fact_id) = required_str(args, "fact_id") else {
            return missing_arg(ToolName::FactDispute, "fact_id");
        };
        let actor = actor_id(args);

        let decision = self
            .permissions
            .check(actor, "fact.dispute", &ctx.service_env)
            .await;
        if !decision.allowed {
            return ToolResult::error(format!(
                "dispute denied for actor '{actor}': {}",
                decision
                    .reason
                    .unwrap_or_else(|| "insufficient trust level".to_string())
            ));
        }

        let url = format!(
            "{}/api/v1/facts/{fact_id}/dispute",
            self.upstreams.ledger_url
        );
        envelope(self.upstream.post(&url, ctx.bearer.as_deref(), args).await)
    }

    async fn ledger_export(&self, args: &Value, ctx: &CallContext) -> ToolResult {
        let actor = actor_id(args);

        let decision = self
            .permissions
            .check(actor, "ledger.export", &ctx.service_env)
            .await;
        if !decision.allowed {
            return ToolResult::error(format!(
                "export denied for actor '{actor}': {}",
                decision
                    .reason
                    .unwrap_or_else(|| "insufficient trust level".to_string())
            ));
        }

        let url = format!("{}/api/v1/export", self.upstreams.ledger_url);
        envelope(self.upstream.post(&url, ctx.bearer.as_deref(), args).await)
    }

    /// Search indexed documents. Missing configuration is a hard error,
    /// distinct from the explicit empty-result success.
    async fn search(&self, args: &Value, ctx: &CallContext) -> ToolResult {
        let Some(account_id) = self.search.account_id.as_deref() else {
            return ToolResult::error("search is not configured: missing search account id");
        };
        let token = self
            .vault
            .service_token(&ctx.service_env, "chittysearch")
            .or_else(|| std::env::var("CHITTYSEARCH_TOKEN").ok());
        let Some(token) = token else {
            return ToolResult::error("search is not configured: missing search token");
        };

        let Some(query) = required_str(args, "query") else {
            return missing_arg(ToolName::Search, "query");
        };

        let url = format!("{}/api/v1/query", self.upstreams.search_url);
        let body = json!({ "account_id": account_id, "query": query });

        match self.upstream.post(&url, Some(token.as_str()), &body).await {
            Ok(reply) if reply.status.is_success() => match reply.body {
                Ok(results) => {
                    let empty = results
                        .get("results")
                        .and_then(Value::as_array)
                        .is_some_and(Vec::is_empty);
                    if empty {
                        ToolResult::json(&json!({
                            "message": "no matching documents",
                            "results": [],
                        }))
                    } else {
                        ToolResult::json(&results)
                    }
                }
                Err(raw) => ToolResult::json(&json!({ "error": truncate_snippet(&raw) })),
            },
            other => envelope(other),
        }
    }
}

/// Attach a non-fatal warning field to a success payload.
///
/// The payload text is re-parsed so the warning lands inside the JSON body;
/// a non-object payload is wrapped rather than discarded.
fn attach_warning(result: ToolResult, field: &str, message: &str) -> ToolResult {
    let text = result.first_text().unwrap_or_default();
    let payload = match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(mut map)) => {
            map.insert(field.to_string(), json!(message));
            Value::Object(map)
        }
        Ok(other) => json!({ "result": other, field: message }),
        Err(_) => json!({ "result": text, field: message }),
    };
    ToolResult::json(&payload)
}

fn required_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn actor_id(args: &Value) -> &str {
    args.get("actor_id")
        .and_then(Value::as_str)
        .unwrap_or("anonymous")
}

fn as_object(args: &Value) -> Map<String, Value> {
    args.as_object().cloned().unwrap_or_default()
}

fn missing_arg(tool: ToolName, arg: &str) -> ToolResult {
    ToolResult::error(format!(
        "{}: missing required argument '{arg}'",
        tool.as_str()
    ))
}

fn describe(tool: ToolName) -> &'static str {
    match tool {
        ToolName::IdMint => "Mint a new ChittyID for a person, place, thing, or event",
        ToolName::IdValidate => "Validate a ChittyID's format and registry status",
        ToolName::CaseCreate => "Create a case record",
        ToolName::CaseGet => "Fetch a case record by id",
        ToolName::EvidenceIngest => "Ingest an evidence record into the evidence store",
        ToolName::EvidenceGet => "Fetch an evidence record by id",
        ToolName::FinanceEntry => "Record a finance ledger entry",
        ToolName::SyncPush => "Push a sync batch to the core platform",
        ToolName::SyncStatus => "Read sync pipeline status",
        ToolName::ChainStatus => "Read chain status from the ledger",
        ToolName::FactGet => "Fetch a fact from the ledger by id",
        ToolName::FactMint => {
            "Mint a fact citing persisted evidence; the evidence hash is anchored at mint time"
        }
        ToolName::FactValidate => "Validate a fact against corroborating evidence records",
        ToolName::FactSeal => "Seal a fact on the ledger and enqueue proof generation",
        ToolName::FactDispute => "Open a dispute against a sealed fact",
        ToolName::LedgerExport => "Export a ledger section for offline audit",
        ToolName::Search => "Search indexed documents",
    }
}

fn schema(tool: ToolName) -> Value {
    match tool {
        ToolName::IdMint => object_schema(&[
            ("entity_type", "string", true),
            ("display_name", "string", false),
        ]),
        ToolName::IdValidate => object_schema(&[("chitty_id", "string", true)]),
        ToolName::CaseCreate => object_schema(&[
            ("title", "string", true),
            ("jurisdiction", "string", false),
        ]),
        ToolName::CaseGet => object_schema(&[("case_id", "string", true)]),
        ToolName::EvidenceIngest => object_schema(&[
            ("case_id", "string", true),
            ("content", "string", true),
            ("content_type", "string", false),
        ]),
        ToolName::EvidenceGet => object_schema(&[("evidence_id", "string", true)]),
        ToolName::FinanceEntry => object_schema(&[
            ("case_id", "string", true),
            ("amount", "number", true),
            ("memo", "string", false),
        ]),
        ToolName::SyncPush => object_schema(&[("batch", "object", true)]),
        ToolName::SyncStatus => object_schema(&[]),
        ToolName::ChainStatus => object_schema(&[]),
        ToolName::FactGet => object_schema(&[("fact_id", "string", true)]),
        ToolName::FactMint => object_schema(&[
            ("statement", "string", true),
            ("evidence_id", "string", true),
            ("actor_id", "string", false),
        ]),
        ToolName::FactValidate => object_schema(&[
            ("fact_id", "string", true),
            ("evidence_ids", "array", true),
        ]),
        ToolName::FactSeal | ToolName::FactDispute => object_schema(&[
            ("fact_id", "string", true),
            ("actor_id", "string", false),
        ]),
        ToolName::LedgerExport => object_schema(&[
            ("range", "string", false),
            ("actor_id", "string", false),
        ]),
        ToolName::Search => object_schema(&[("query", "string", true)]),
    }
}

fn object_schema(fields: &[(&str, &str, bool)]) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for (name, ty, req) in fields {
        properties.insert((*name).to_string(), json!({ "type": ty }));
        if *req {
            required.push(json!(name));
        }
    }
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn tool_names_round_trip() {
        for tool in ToolName::all() {
            assert_eq!(tool.as_str().parse::<ToolName>().unwrap(), *tool);
        }
    }

    #[test]
    fn unknown_tool_name_fails_to_parse() {
        assert!("chitty_fact_destroy".parse::<ToolName>().is_err());
        assert!("".parse::<ToolName>().is_err());
    }

    #[test]
    fn catalog_covers_every_tool() {
        let catalog = ToolDispatcher::catalog();
        assert_eq!(catalog.len(), ToolName::all().len());
        for tool in &catalog {
            assert!(tool.description.is_some());
            assert_eq!(tool.input_schema["type"], "object");
        }
    }

    #[test]
    fn catalog_is_idempotent() {
        let a = serde_json::to_value(ToolDispatcher::catalog()).unwrap();
        let b = serde_json::to_value(ToolDispatcher::catalog()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn attach_warning_augments_json_object() {
        let result = ToolResult::json(&json!({"sealed": true}));
        let warned = attach_warning(result, "proof_queue_warning", "queue offline");
        assert!(!warned.is_err());
        let parsed: Value = serde_json::from_str(warned.first_text().unwrap()).unwrap();
        assert_eq!(parsed["sealed"], true);
        assert_eq!(parsed["proof_queue_warning"], "queue offline");
    }

    #[test]
    fn attach_warning_wraps_non_object_payload() {
        let result = ToolResult::text("sealed");
        let warned = attach_warning(result, "proof_queue_warning", "queue offline");
        let parsed: Value = serde_json::from_str(warned.first_text().unwrap()).unwrap();
        assert_eq!(parsed["result"], "sealed");
        assert_eq!(parsed["proof_queue_warning"], "queue offline");
    }

    #[test]
    fn actor_defaults_to_anonymous() {
        assert_eq!(actor_id(&json!({})), "anonymous");
        assert_eq!(actor_id(&json!({"actor_id": "CH-123"})), "CH-123");
    }
}
