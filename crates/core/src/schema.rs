use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::api::{ApiError, SharedApi};
use crate::connections::ConnectionRecord;
use crate::fencing::RequestFence;
use crate::identity::{ApiMode, IdentityError, LocalId};
use crate::notices::Notifier;
use crate::store::lock;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    #[serde(default)]
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    #[serde(default)]
    pub columns: Vec<ColumnSchema>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SchemaCatalog {
    #[serde(default)]
    pub tables: Vec<TableSchema>,
}

impl SchemaCatalog {
    #[must_use]
    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|table| table.name == name)
    }

    #[must_use]
    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|table| table.name.clone()).collect()
    }

    #[must_use]
    pub fn columns(&self, table_name: &str) -> Vec<ColumnSchema> {
        self.table(table_name)
            .map(|table| table.columns.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("schema fetch failed: {0}")]
    Api(#[from] ApiError),
}

#[derive(Debug)]
struct CachedSchema {
    fetched_at: Instant,
    schema: Arc<SchemaCatalog>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedSchema {
    pub connection: LocalId,
    pub schema: Arc<SchemaCatalog>,
}

#[derive(Debug, Default)]
struct LoaderState {
    fence: RequestFence,
    loading: bool,
    current: Option<LoadedSchema>,
    cache: HashMap<String, CachedSchema>,
}

/// Loads the schema of the selected connection. Only the latest selection's
/// result is displayed; results are cached per backend id for `ttl`.
#[derive(Clone)]
pub struct SchemaLoader {
    api: SharedApi,
    notifier: Notifier,
    mode: ApiMode,
    ttl: Duration,
    state: Arc<Mutex<LoaderState>>,
}

impl SchemaLoader {
    #[must_use]
    pub fn new(api: SharedApi, notifier: Notifier, mode: ApiMode, ttl: Duration) -> Self {
        Self {
            api,
            notifier,
            mode,
            ttl,
            state: Arc::new(Mutex::new(LoaderState::default())),
        }
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    #[must_use]
    pub fn current(&self) -> Option<LoadedSchema> {
        lock(&self.state).current.clone()
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        lock(&self.state).loading
    }

    /// Drops the displayed schema and fences out any fetch in flight.
    pub fn clear(&self) {
        let mut state = lock(&self.state);
        state.fence.invalidate();
        state.loading = false;
        state.current = None;
    }

    pub fn invalidate(&self, remote_id: &str) {
        lock(&self.state).cache.remove(remote_id);
    }

    /// Returns `Ok(None)` when a newer load superseded this one.
    pub async fn load(
        &self,
        connection: &ConnectionRecord,
    ) -> Result<Option<Arc<SchemaCatalog>>, SchemaError> {
        let local = connection.local_id().clone();
        let remote_id = match connection.identity.resolve(self.mode) {
            Ok(remote_id) => remote_id.to_string(),
            Err(error) => {
                self.clear();
                self.notifier
                    .error(format!("Cannot load schema for {}: {error}", connection.name));
                return Err(error.into());
            }
        };

        let token = {
            let mut state = lock(&self.state);
            let token = state.fence.issue();
            let now = Instant::now();
            let cached = state
                .cache
                .get(&remote_id)
                .filter(|cached| now.duration_since(cached.fetched_at) <= self.ttl)
                .map(|cached| Arc::clone(&cached.schema));
            if let Some(schema) = cached {
                tracing::debug!(remote_id, "schema served from cache");
                state.loading = false;
                state.current = Some(LoadedSchema {
                    connection: local,
                    schema: Arc::clone(&schema),
                });
                return Ok(Some(schema));
            }
            state.loading = true;
            token
        };

        let result = self.api.fetch_schema(&remote_id).await;

        let mut state = lock(&self.state);
        let Some(result) = state.fence.admit(token, result) else {
            tracing::debug!(remote_id, "discarding superseded schema response");
            return Ok(None);
        };
        state.loading = false;
        match result {
            Ok(schema) => {
                let schema = Arc::new(schema);
                state.cache.insert(
                    remote_id,
                    CachedSchema {
                        fetched_at: Instant::now(),
                        schema: Arc::clone(&schema),
                    },
                );
                state.current = Some(LoadedSchema {
                    connection: local,
                    schema: Arc::clone(&schema),
                });
                Ok(Some(schema))
            }
            Err(error) => {
                state.current = None;
                drop(state);
                self.notifier
                    .error(format!("Could not load schema: {error}"));
                Err(error.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::{ColumnSchema, SchemaCatalog, SchemaError, SchemaLoader, TableSchema};
    use crate::identity::{ApiMode, LocalId};
    use crate::notices::notice_channel;
    use crate::test_support::{saved_postgres_record, ScriptedApi};

    fn catalog(table: &str) -> SchemaCatalog {
        SchemaCatalog {
            tables: vec![TableSchema {
                name: table.to_string(),
                columns: vec![ColumnSchema {
                    name: "id".to_string(),
                    data_type: "bigint".to_string(),
                    nullable: false,
                }],
            }],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn late_response_for_previous_selection_is_discarded() {
        let api = Arc::new(ScriptedApi::default());
        api.set_schema("ra", catalog("orders"), Duration::from_millis(500));
        api.set_schema("rb", catalog("invoices"), Duration::from_millis(50));
        let (notifier, _feed) = notice_channel();
        let loader = SchemaLoader::new(api.clone(), notifier, ApiMode::Live, Duration::from_secs(60));
        let a = saved_postgres_record("local-a", "A", "ra");
        let b = saved_postgres_record("local-b", "B", "rb");

        let (first, second) = tokio::join!(loader.load(&a), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            loader.load(&b).await
        });

        assert_eq!(first.expect("stale load should not error"), None);
        assert!(second.expect("latest load should succeed").is_some());
        let current = loader.current().expect("schema should be displayed");
        assert_eq!(current.connection, LocalId::new("local-b"));
        assert_eq!(current.schema.table_names(), vec!["invoices".to_string()]);
        assert!(!loader.is_loading());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_error_is_swallowed() {
        let api = Arc::new(ScriptedApi::default());
        api.set_schema("ra", catalog("orders"), Duration::from_millis(500));
        api.fail_next("fetch_schema", "connection refused");
        api.set_schema("rb", catalog("invoices"), Duration::ZERO);
        let (notifier, mut feed) = notice_channel();
        let loader = SchemaLoader::new(api.clone(), notifier, ApiMode::Live, Duration::from_secs(60));
        let a = saved_postgres_record("local-a", "A", "ra");
        let b = saved_postgres_record("local-b", "B", "rb");

        let (first, second) = tokio::join!(loader.load(&a), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            loader.load(&b).await
        });

        assert!(first.expect("stale failure is not surfaced").is_none());
        assert!(second.expect("second load").is_some());
        assert!(feed.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cache_is_reused_within_ttl() {
        let api = Arc::new(ScriptedApi::default());
        api.set_schema("ra", catalog("orders"), Duration::ZERO);
        let (notifier, _feed) = notice_channel();
        let loader = SchemaLoader::new(api.clone(), notifier, ApiMode::Live, Duration::from_secs(60));
        let a = saved_postgres_record("local-a", "A", "ra");

        loader.load(&a).await.expect("first load");
        loader.load(&a).await.expect("cached load");
        assert_eq!(api.call_count("fetch_schema"), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        loader.load(&a).await.expect("expired load");
        assert_eq!(api.call_count("fetch_schema"), 2);

        loader.invalidate("ra");
        loader.load(&a).await.expect("invalidated load");
        assert_eq!(api.call_count("fetch_schema"), 3);
    }

    #[tokio::test]
    async fn unsaved_connection_fails_fast_in_live_mode() {
        let api = Arc::new(ScriptedApi::default());
        let (notifier, mut feed) = notice_channel();
        let loader = SchemaLoader::new(api.clone(), notifier, ApiMode::Live, Duration::from_secs(60));
        let mut record = saved_postgres_record("local-a", "A", "ra");
        record.identity.remote = None;

        let error = loader.load(&record).await.expect_err("load should fail");
        assert!(matches!(error, SchemaError::Identity(_)));
        assert_eq!(api.call_count("fetch_schema"), 0);
        assert_eq!(feed.drain().len(), 1);
    }

    #[tokio::test]
    async fn mock_mode_falls_back_to_local_id() {
        let api = Arc::new(ScriptedApi::default());
        api.set_schema("local-a", catalog("orders"), Duration::ZERO);
        let (notifier, _feed) = notice_channel();
        let loader = SchemaLoader::new(api.clone(), notifier, ApiMode::Mock, Duration::from_secs(60));
        let mut record = saved_postgres_record("local-a", "A", "ra");
        record.identity.remote = None;

        let schema = loader.load(&record).await.expect("mock load").expect("current");
        assert_eq!(schema.columns("orders").len(), 1);
        assert!(schema.columns("missing").is_empty());
    }
}
