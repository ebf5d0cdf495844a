use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::identity::LocalId;
use crate::store::lock;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VaultError {
    #[error("credential store is unavailable on this platform")]
    Unavailable,
    #[error("credential store failed: {0}")]
    Backend(String),
}

/// Where connection passwords live. The cache file never holds them.
pub trait CredentialVault: Send + Sync {
    fn store(&self, id: &LocalId, secret: &str) -> Result<(), VaultError>;
    fn load(&self, id: &LocalId) -> Result<Option<String>, VaultError>;
    fn remove(&self, id: &LocalId) -> Result<(), VaultError>;
}

pub type SharedVault = Arc<dyn CredentialVault>;

/// Process-lifetime vault, used in mock mode and tests.
#[derive(Debug, Default)]
pub struct MemoryVault {
    secrets: Mutex<HashMap<LocalId, String>>,
}

impl MemoryVault {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialVault for MemoryVault {
    fn store(&self, id: &LocalId, secret: &str) -> Result<(), VaultError> {
        lock(&self.secrets).insert(id.clone(), secret.to_string());
        Ok(())
    }

    fn load(&self, id: &LocalId) -> Result<Option<String>, VaultError> {
        Ok(lock(&self.secrets).get(id).cloned())
    }

    fn remove(&self, id: &LocalId) -> Result<(), VaultError> {
        lock(&self.secrets).remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{CredentialVault, MemoryVault};
    use crate::identity::LocalId;

    #[test]
    fn memory_vault_round_trips_and_forgets() {
        let vault = MemoryVault::new();
        let id = LocalId::new("local-pg");

        vault.store(&id, "hunter2").expect("store");
        assert_eq!(vault.load(&id).expect("load").as_deref(), Some("hunter2"));

        vault.remove(&id).expect("remove");
        assert_eq!(vault.load(&id).expect("load"), None);
    }
}
