//! Credential resolution seam. The on-disk vault itself is an
//! out-of-scope external collaborator; this module only defines the trait
//! boundary CM calls through plus an in-memory implementation usable in
//! tests and as the default when no vault is configured.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use uuid::Uuid;

use crate::adapter::Credential;

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Resolve the credential for `connection_id`, or a default/empty one
    /// if the store holds nothing for it. Never fails observably: a vault
    /// outage should not block a connect attempt that doesn't need secrets.
    async fn resolve(&self, connection_id: Uuid) -> Credential;
}

/// Default store used when no vault is configured, and throughout tests.
#[derive(Default)]
pub struct InMemoryCredentialStore {
    entries: RwLock<HashMap<Uuid, Credential>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, connection_id: Uuid, credential: Credential) {
        self.entries.write().unwrap().insert(connection_id, credential);
    }

    pub fn remove(&self, connection_id: Uuid) {
        self.entries.write().unwrap().remove(&connection_id);
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn resolve(&self, connection_id: Uuid) -> Credential {
        self.entries.read().unwrap().get(&connection_id).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_entry_resolves_to_default() {
        let store = InMemoryCredentialStore::new();
        let cred = store.resolve(Uuid::new_v4()).await;
        assert!(cred.username.is_none());
        assert!(cred.password.is_none());
    }

    #[tokio::test]
    async fn set_entry_is_returned_by_resolve() {
        let store = InMemoryCredentialStore::new();
        let id = Uuid::new_v4();
        store.set(id, Credential { username: Some("u".into()), password: Some("p".into()) });
        let cred = store.resolve(id).await;
        assert_eq!(cred.username.as_deref(), Some("u"));
    }
}
