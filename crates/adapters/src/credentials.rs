//! Connection passwords in the operating system's keychain.

use repdash_core::credentials::{CredentialVault, VaultError};
use repdash_core::identity::LocalId;

pub const DEFAULT_SERVICE: &str = "repdash";

/// Secrets are keyed by the connection's local id so they survive renames
/// and backend id backfills.
#[derive(Debug, Clone)]
pub struct KeyringVault {
    service: String,
}

impl KeyringVault {
    #[must_use]
    pub fn new(service: impl Into<String>) -> Self {
        let service = service.into();
        let service = if service.trim().is_empty() {
            DEFAULT_SERVICE.to_string()
        } else {
            service.trim().to_string()
        };
        Self { service }
    }

    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }
}

impl Default for KeyringVault {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE)
    }
}

impl CredentialVault for KeyringVault {
    fn store(&self, id: &LocalId, secret: &str) -> Result<(), VaultError> {
        if secret.is_empty() {
            return self.remove(id);
        }
        store_keyring_password(&self.service, id, secret)
    }

    fn load(&self, id: &LocalId) -> Result<Option<String>, VaultError> {
        load_keyring_password(&self.service, id)
    }

    fn remove(&self, id: &LocalId) -> Result<(), VaultError> {
        remove_keyring_password(&self.service, id)
    }
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
fn keyring_entry(service: &str, id: &LocalId) -> Result<keyring::Entry, VaultError> {
    keyring::Entry::new(service, id.as_str()).map_err(backend_error)
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
fn backend_error(error: keyring::Error) -> VaultError {
    match error {
        keyring::Error::PlatformFailure(_) | keyring::Error::NoStorageAccess(_) => {
            tracing::warn!(%error, "keychain is not reachable");
            VaultError::Unavailable
        }
        other => VaultError::Backend(other.to_string()),
    }
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
fn load_keyring_password(service: &str, id: &LocalId) -> Result<Option<String>, VaultError> {
    match keyring_entry(service, id)?.get_password() {
        Ok(password) => Ok(Some(password).filter(|pw| !pw.is_empty())),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(error) => Err(backend_error(error)),
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn load_keyring_password(_service: &str, _id: &LocalId) -> Result<Option<String>, VaultError> {
    Err(VaultError::Unavailable)
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
fn store_keyring_password(service: &str, id: &LocalId, password: &str) -> Result<(), VaultError> {
    keyring_entry(service, id)?
        .set_password(password)
        .map_err(backend_error)
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn store_keyring_password(_service: &str, _id: &LocalId, _password: &str) -> Result<(), VaultError> {
    Err(VaultError::Unavailable)
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
fn remove_keyring_password(service: &str, id: &LocalId) -> Result<(), VaultError> {
    match keyring_entry(service, id)?.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(error) => Err(backend_error(error)),
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn remove_keyring_password(_service: &str, _id: &LocalId) -> Result<(), VaultError> {
    Err(VaultError::Unavailable)
}
