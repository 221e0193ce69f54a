//! Service-token resolution
//!
//! The gateway consumes a `service_token(env, service)` capability for
//! direct-credential tools. The production resolver reads process
//! environment variables (seeded from env files at startup) and caches
//! hits for the life of the process; callers remain responsible for their
//! own fallback when resolution returns `None`.

use dashmap::DashMap;

/// Credential resolution capability consumed by the tool dispatcher.
pub trait TokenVault: Send + Sync {
    /// Resolve a service credential for the given environment.
    ///
    /// Returns `None` when no credential is provisioned; the caller decides
    /// whether a fallback exists.
    fn service_token(&self, env: &str, service: &str) -> Option<String>;
}

/// Environment-variable name for a vault entry, e.g.
/// `CHITTY_CHITTYID_TOKEN__PRODUCTION`.
#[must_use]
pub fn vault_var_name(env: &str, service: &str) -> String {
    let normalize = |s: &str| s.to_uppercase().replace('-', "_");
    format!("CHITTY_{}_TOKEN__{}", normalize(service), normalize(env))
}

/// Token vault backed by process environment variables, with caching
pub struct EnvTokenVault {
    cache: DashMap<String, String>,
}

impl EnvTokenVault {
    /// Create a new vault
    #[must_use]
    pub fn new() -> Self {
        Self {
            cache: DashMap::new(),
        }
    }
}

impl Default for EnvTokenVault {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenVault for EnvTokenVault {
    fn service_token(&self, env: &str, service: &str) -> Option<String> {
        let var = vault_var_name(env, service);

        if let Some(cached) = self.cache.get(&var) {
            return Some(cached.clone());
        }

        match std::env::var(&var) {
            Ok(token) if !token.is_empty() => {
                self.cache.insert(var, token.clone());
                Some(token)
            }
            _ => None,
        }
    }
}

/// Fixed-content vault for tests and static deployments
pub struct StaticTokenVault {
    entries: DashMap<String, String>,
}

impl StaticTokenVault {
    /// Create a vault from `(env, service, token)` triples
    #[must_use]
    pub fn new(entries: &[(&str, &str, &str)]) -> Self {
        let map = DashMap::new();
        for (env, service, token) in entries {
            map.insert(vault_var_name(env, service), (*token).to_string());
        }
        Self { entries: map }
    }

    /// Empty vault (every lookup misses)
    #[must_use]
    pub fn empty() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl TokenVault for StaticTokenVault {
    fn service_token(&self, env: &str, service: &str) -> Option<String> {
        self.entries
            .get(&vault_var_name(env, service))
            .map(|t| t.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vault_var_name_normalizes() {
        assert_eq!(
            vault_var_name("production", "chittyid"),
            "CHITTY_CHITTYID_TOKEN__PRODUCTION"
        );
        assert_eq!(
            vault_var_name("staging", "chitty-search"),
            "CHITTY_CHITTY_SEARCH_TOKEN__STAGING"
        );
    }

    #[test]
    fn static_vault_resolves_seeded_entries() {
        let vault = StaticTokenVault::new(&[("production", "chittyid", "tok-1")]);
        assert_eq!(
            vault.service_token("production", "chittyid").as_deref(),
            Some("tok-1")
        );
        assert!(vault.service_token("staging", "chittyid").is_none());
        assert!(vault.service_token("production", "other").is_none());
    }

    #[test]
    fn empty_vault_always_misses() {
        let vault = StaticTokenVault::empty();
        assert!(vault.service_token("production", "chittyid").is_none());
    }
}
