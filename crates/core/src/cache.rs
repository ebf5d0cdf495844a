use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::{config_dir, ConfigError};
use crate::store::{StoreSnapshot, StoreSubscriber};

/// Fixed application key; the cache file is named after it.
pub const CACHE_KEY: &str = "repdash.state.v1";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to resolve config directory: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to read cache file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse cache file at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to create cache directory at {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize cache snapshot: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write cache file at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The durable mirror of connections, templates and the last-used pointer.
#[derive(Debug, Clone)]
pub struct FileCache {
    path: PathBuf,
}

impl FileCache {
    pub fn load_default() -> Result<Self, CacheError> {
        Ok(Self::from_path(default_cache_path()?))
    }

    #[must_use]
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the blob written last; a missing or empty file is an empty
    /// snapshot.
    pub fn read(&self) -> Result<StoreSnapshot, CacheError> {
        if !self.path.exists() {
            return Ok(StoreSnapshot::default());
        }

        let raw = fs::read_to_string(&self.path).map_err(|source| CacheError::Read {
            path: self.path.clone(),
            source,
        })?;
        if raw.trim().is_empty() {
            return Ok(StoreSnapshot::default());
        }

        let snapshot: StoreSnapshot =
            serde_json::from_str(&raw).map_err(|source| CacheError::Parse {
                path: self.path.clone(),
                source,
            })?;
        Ok(snapshot.normalized())
    }

    /// Overwrites the blob with a full normalized snapshot.
    pub fn write(&self, snapshot: &StoreSnapshot) -> Result<(), CacheError> {
        if let Some(parent_dir) = self.path.parent() {
            fs::create_dir_all(parent_dir).map_err(|source| CacheError::CreateDir {
                path: parent_dir.to_path_buf(),
                source,
            })?;
        }

        let normalized = snapshot.clone().normalized();
        let rendered = serde_json::to_string_pretty(&normalized)
            .map_err(|source| CacheError::Serialize { source })?;

        fs::write(&self.path, rendered).map_err(|source| CacheError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

/// Store subscriber that mirrors every change to the cache file. Failures
/// are logged and otherwise ignored.
#[derive(Debug, Clone)]
pub struct CacheWriter {
    cache: FileCache,
}

impl CacheWriter {
    #[must_use]
    pub fn new(cache: FileCache) -> Self {
        Self { cache }
    }
}

impl StoreSubscriber for CacheWriter {
    fn on_change(&mut self, snapshot: &StoreSnapshot) {
        match self.cache.write(snapshot) {
            Ok(()) => tracing::debug!(
                path = %self.cache.path().display(),
                connections = snapshot.connections.len(),
                templates = snapshot.templates.len(),
                "cache snapshot written"
            ),
            Err(error) => tracing::warn!(%error, "cache snapshot write failed"),
        }
    }
}

pub fn default_cache_path() -> Result<PathBuf, CacheError> {
    Ok(config_dir()?.join(format!("{CACHE_KEY}.json")))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tempfile::TempDir;

    use super::{CacheWriter, FileCache};
    use crate::connections::{ConnectionRecord, ConnectionStatus, DbType};
    use crate::identity::{ConnectionIdentity, LocalId, RemoteId};
    use crate::reports::ReportTemplate;
    use crate::store::{AppStore, LastUsed, StoreAction, StoreSnapshot};

    fn temp_cache_path(temp_dir: &TempDir) -> PathBuf {
        temp_dir.path().join("repdash.state.v1.json")
    }

    fn postgres_record() -> ConnectionRecord {
        ConnectionRecord {
            identity: ConnectionIdentity::new(LocalId::new("local-pg"))
                .with_remote(RemoteId::new("31")),
            name: "Prod DB".to_string(),
            db_type: DbType::Postgres,
            host: Some("db.internal".to_string()),
            port: None,
            database: "reports".to_string(),
            username: Some("reporter".to_string()),
            password: Some("secret".to_string()),
            url: String::new(),
            status: ConnectionStatus::Connected,
            last_latency_ms: Some(8),
            last_connected: None,
        }
    }

    #[test]
    fn missing_cache_file_reads_empty_snapshot() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let cache = FileCache::from_path(temp_cache_path(&temp_dir));

        let snapshot = cache.read().expect("failed to read cache");
        assert_eq!(snapshot, StoreSnapshot::default());
    }

    #[test]
    fn write_then_read_keeps_records_but_not_passwords() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let cache = FileCache::from_path(temp_cache_path(&temp_dir));
        let snapshot = StoreSnapshot {
            connections: vec![postgres_record()],
            templates: vec![ReportTemplate::new("monthly", "Monthly Sales")],
            last_used: LastUsed {
                connection: Some(LocalId::new("local-pg")),
                template: Some("monthly".to_string()),
            },
        };

        cache.write(&snapshot).expect("failed to write cache");
        let raw = std::fs::read_to_string(cache.path()).expect("failed to read raw cache");
        assert!(raw.contains("lastUsed"));
        assert!(!raw.contains("secret"));

        let reloaded = cache.read().expect("failed to reload cache");
        let record = &reloaded.connections[0];
        assert_eq!(record.identity.remote, Some(RemoteId::new("31")));
        assert_eq!(record.port, Some(5432));
        assert_eq!(record.url, "postgresql://reporter@db.internal:5432/reports");
        assert_eq!(record.password, None);
        assert_eq!(reloaded.templates.len(), 1);
        assert_eq!(reloaded.last_used.template.as_deref(), Some("monthly"));
    }

    #[test]
    fn writer_mirrors_store_mutations_with_last_write_winning() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let cache = FileCache::from_path(temp_cache_path(&temp_dir));
        let mut store = AppStore::new(StoreSnapshot::default());
        store.subscribe(Box::new(CacheWriter::new(cache.clone())));

        store.dispatch(StoreAction::UpsertConnection(postgres_record()));
        assert_eq!(cache.read().expect("read after upsert").connections.len(), 1);

        store.dispatch(StoreAction::RemoveConnections(vec![LocalId::new("local-pg")]));
        assert!(cache
            .read()
            .expect("read after delete")
            .connections
            .is_empty());
    }

    #[test]
    fn write_failure_is_swallowed() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let blocker = temp_dir.path().join("not-a-dir");
        std::fs::write(&blocker, "file").expect("failed to create blocker file");
        let cache = FileCache::from_path(blocker.join("cache.json"));
        let mut store = AppStore::new(StoreSnapshot::default());
        store.subscribe(Box::new(CacheWriter::new(cache)));

        assert!(store.dispatch(StoreAction::UpsertConnection(postgres_record())));
    }

    #[test]
    fn corrupt_cache_reports_parse_error() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let path = temp_cache_path(&temp_dir);
        std::fs::write(&path, "{not json").expect("failed to write corrupt cache");

        let error = FileCache::from_path(&path)
            .read()
            .expect_err("corrupt cache should fail");
        assert!(matches!(error, super::CacheError::Parse { .. }));
    }
}
