//! Credential providers for the primary API adapter.
//!
//! Token acquisition happens elsewhere; adapters only ask for the current
//! token and treat `None` as "do not even try".

use std::sync::RwLock;

/// Supplies the bearer token for authenticated sources.
pub trait CredentialProvider: Send + Sync {
    /// Returns the current token, or `None` when no valid token exists.
    fn current_token(&self) -> Option<String>;
}

/// Reads the token from an environment variable on every call, so a token
/// rotated by an outside process is picked up without a restart.
pub struct EnvCredentials {
    var: String,
}

impl EnvCredentials {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }

    pub fn var(&self) -> &str {
        &self.var
    }
}

impl CredentialProvider for EnvCredentials {
    fn current_token(&self) -> Option<String> {
        std::env::var(&self.var)
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    }
}

/// In-memory token that can be replaced or revoked at runtime.
#[derive(Default)]
pub struct StaticCredentials {
    token: RwLock<Option<String>>,
}

impl StaticCredentials {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token),
        }
    }

    pub fn set(&self, token: Option<String>) {
        let mut guard = self.token.write().unwrap_or_else(|e| e.into_inner());
        *guard = token;
    }
}

impl CredentialProvider for StaticCredentials {
    fn current_token(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
