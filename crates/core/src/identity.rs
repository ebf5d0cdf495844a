use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Which backend the coordinators talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiMode {
    #[default]
    Live,
    Mock,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(String);

impl LocalId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn generate() -> Self {
        Self(format!("local-{}", Uuid::new_v4()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(String);

impl RemoteId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("connection `{0}` has no server identity yet; save it before using it")]
    Unresolved(LocalId),
}

/// Local UI identity plus the id the backend assigned, once known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionIdentity {
    #[serde(rename = "id")]
    pub local: LocalId,
    #[serde(
        rename = "backend_connection_id",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub remote: Option<RemoteId>,
}

impl ConnectionIdentity {
    #[must_use]
    pub fn new(local: LocalId) -> Self {
        Self {
            local,
            remote: None,
        }
    }

    #[must_use]
    pub fn with_remote(mut self, remote: RemoteId) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Id to address this connection with on the backend.
    ///
    /// The backend id always wins. The local id is only meaningful to the
    /// mock backend, which keys its records by it.
    pub fn resolve(&self, mode: ApiMode) -> Result<&str, IdentityError> {
        match (&self.remote, mode) {
            (Some(remote), _) => Ok(remote.as_str()),
            (None, ApiMode::Mock) => Ok(self.local.as_str()),
            (None, ApiMode::Live) => Err(IdentityError::Unresolved(self.local.clone())),
        }
    }

    /// Records a backend id learned from a test or save. Returns whether the
    /// identity changed.
    pub fn backfill(&mut self, remote: RemoteId) -> bool {
        if self.remote.as_ref() == Some(&remote) {
            return false;
        }
        self.remote = Some(remote);
        true
    }

    #[must_use]
    pub fn is_saved(&self) -> bool {
        self.remote.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::{ApiMode, ConnectionIdentity, IdentityError, LocalId, RemoteId};

    #[test]
    fn backend_id_wins_in_every_mode() {
        let identity =
            ConnectionIdentity::new(LocalId::new("local-1")).with_remote(RemoteId::new("42"));

        assert_eq!(identity.resolve(ApiMode::Live), Ok("42"));
        assert_eq!(identity.resolve(ApiMode::Mock), Ok("42"));
    }

    #[test]
    fn unsaved_identity_fails_fast_against_live_backend() {
        let identity = ConnectionIdentity::new(LocalId::new("local-1"));

        assert_eq!(
            identity.resolve(ApiMode::Live),
            Err(IdentityError::Unresolved(LocalId::new("local-1")))
        );
        assert_eq!(identity.resolve(ApiMode::Mock), Ok("local-1"));
    }

    #[test]
    fn backfill_reports_only_real_changes() {
        let mut identity = ConnectionIdentity::new(LocalId::generate());

        assert!(identity.backfill(RemoteId::new("7")));
        assert!(!identity.backfill(RemoteId::new("7")));
        assert!(identity.backfill(RemoteId::new("8")));
        assert_eq!(identity.remote, Some(RemoteId::new("8")));
    }

    #[test]
    fn serializes_with_wire_field_names() {
        let identity =
            ConnectionIdentity::new(LocalId::new("local-1")).with_remote(RemoteId::new("9"));
        let value = serde_json::to_value(&identity).expect("identity should serialize");

        assert_eq!(value["id"], "local-1");
        assert_eq!(value["backend_connection_id"], "9");
    }
}
