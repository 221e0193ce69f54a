//! OAuth 2.1 authorization bridge
//!
//! Server-side authorize/token/registration surface for the one
//! OAuth-protected hostname. Grants are process-owned; credential
//! verification is delegated to the identity upstream.

mod handlers;
mod identity;
mod store;

pub use handlers::routes;
pub use identity::{HttpIdentityResolver, IdentityResolver, ResolvedIdentity, StaticIdentityResolver};
pub use store::{
    AccessGrant, AuthCode, ClientRecord, OAuthStore, RefreshGrant, SUPPORTED_SCOPES, parse_scope,
    random_token, verify_s256,
};
