//! ChittyOS MCP Protocol Gateway
//!
//! Single external endpoint implementing the MCP JSON-RPC tool-invocation
//! protocol, bridged to an OAuth 2.1 authorization flow and a fleet of
//! downstream ChittyOS services.
//!
//! # Features
//!
//! - **JSON-RPC Router**: initialize/ping/tools/resources over POST, with
//!   batch dispatch and notification semantics
//! - **Tool Dispatcher**: pre-flight integrity and permission checks, uniform
//!   result envelopes over heterogeneous upstream response shapes
//! - **SSE Push Channel**: long-lived server->client stream with heartbeats
//! - **OAuth Bridge**: authorize/token/registration surface, hostname-keyed
//!   dual-mode authentication alongside legacy API keys

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod oauth;
pub mod protocol;
pub mod secrets;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
