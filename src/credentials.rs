//! Credential lookup is an opaque collaborator: the sync core is handed a
//! `CredentialStore` and only ever reads from it. Writes (storing a new
//! password or OAuth token after account setup) happen upstream of this
//! crate, per `spec.md` §1 ("scope").

use async_trait::async_trait;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub secret: String,
}

#[derive(Debug)]
pub enum CredentialError {
    NotFound(String),
    Backend(String),
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialError::NotFound(account_id) => write!(f, "no credential stored for account {account_id}"),
            CredentialError::Backend(msg) => write!(f, "credential backend error: {msg}"),
        }
    }
}

impl std::error::Error for CredentialError {}

/// Read-only from `SyncEngine`'s perspective. A host implements this over
/// whatever secret store it already has (OS keyring, encrypted file, vault
/// service); the sync core never persists a credential itself.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, account_id: &str) -> Result<Credential, CredentialError>;
}

/// An in-memory `CredentialStore`, useful for tests and for hosts that keep
/// credentials elsewhere and just want to hand the engine a fixed map for
/// the duration of one sync pass.
pub struct StaticCredentialStore {
    entries: std::collections::HashMap<String, Credential>,
}

impl StaticCredentialStore {
    pub fn new() -> Self {
        Self { entries: std::collections::HashMap::new() }
    }

    pub fn with(mut self, account_id: impl Into<String>, username: impl Into<String>, secret: impl Into<String>) -> Self {
        self.entries.insert(account_id.into(), Credential { username: username.into(), secret: secret.into() });
        self
    }
}

impl Default for StaticCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialStore for StaticCredentialStore {
    async fn get(&self, account_id: &str) -> Result<Credential, CredentialError> {
        self.entries.get(account_id).cloned().ok_or_else(|| CredentialError::NotFound(account_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_store_returns_not_found_for_unknown_account() {
        let store = StaticCredentialStore::new();
        let err = store.get("missing").await.unwrap_err();
        assert!(matches!(err, CredentialError::NotFound(id) if id == "missing"));
    }

    #[tokio::test]
    async fn static_store_returns_configured_credential() {
        let store = StaticCredentialStore::new().with("acct-1", "user@example.com", "hunter2");
        let cred = store.get("acct-1").await.unwrap();
        assert_eq!(cred.username, "user@example.com");
        assert_eq!(cred.secret, "hunter2");
    }
}
