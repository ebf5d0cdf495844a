//! Natural-language query builder: prompt to SQL, then execute or save.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::api::{ApiError, SharedApi};
use crate::fencing::RequestFence;
use crate::identity::{ApiMode, IdentityError, LocalId};
use crate::notices::Notifier;
use crate::store::{lock, SharedStore};

pub const DEFAULT_ROW_LIMIT: u32 = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlGenerationRequest {
    pub connection_id: String,
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedSql {
    pub sql: String,
    #[serde(default)]
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlExecutionRequest {
    pub connection_id: String,
    pub sql: String,
    pub limit: u32,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<Value>>,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default)]
    pub elapsed_ms: Option<u64>,
}

impl QueryResult {
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Text form of one cell; strings lose their quotes and null is empty.
    #[must_use]
    pub fn cell_text(value: &Value) -> String {
        match value {
            Value::Null => String::new(),
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveQueryRequest {
    pub name: String,
    pub connection_id: String,
    pub prompt: String,
    pub sql: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedQuery {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Error)]
pub enum QueryBuilderError {
    #[error("select a connection first")]
    NoConnection,
    #[error("describe the data you want first")]
    EmptyPrompt,
    #[error("generate or enter SQL first")]
    NoSql,
    #[error("a saved query needs a name")]
    EmptyName,
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("backend request failed: {0}")]
    Api(#[from] ApiError),
}

#[derive(Debug, Default)]
struct BuilderState {
    prompt: String,
    sql: Option<String>,
    explanation: Option<String>,
    result: Option<QueryResult>,
    generate_fence: RequestFence,
    execute_fence: RequestFence,
    generating: bool,
    executing: bool,
}

#[derive(Clone)]
pub struct QueryBuilder {
    api: SharedApi,
    store: SharedStore,
    notifier: Notifier,
    mode: ApiMode,
    state: Arc<Mutex<BuilderState>>,
}

impl QueryBuilder {
    #[must_use]
    pub fn new(api: SharedApi, store: SharedStore, notifier: Notifier, mode: ApiMode) -> Self {
        Self {
            api,
            store,
            notifier,
            mode,
            state: Arc::new(Mutex::new(BuilderState::default())),
        }
    }

    #[must_use]
    pub fn prompt(&self) -> String {
        lock(&self.state).prompt.clone()
    }

    #[must_use]
    pub fn sql(&self) -> Option<String> {
        lock(&self.state).sql.clone()
    }

    #[must_use]
    pub fn explanation(&self) -> Option<String> {
        lock(&self.state).explanation.clone()
    }

    #[must_use]
    pub fn result(&self) -> Option<QueryResult> {
        lock(&self.state).result.clone()
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        let state = lock(&self.state);
        state.generating || state.executing
    }

    /// Manual edit of the generated statement.
    pub fn set_sql(&self, sql: impl Into<String>) {
        let sql = sql.into();
        let mut state = lock(&self.state);
        state.sql = (!sql.trim().is_empty()).then_some(sql);
    }

    /// Clears everything tied to the previous connection and fences out
    /// requests still in flight.
    pub fn reset(&self) {
        let mut state = lock(&self.state);
        state.generate_fence.invalidate();
        state.execute_fence.invalidate();
        state.generating = false;
        state.executing = false;
        state.sql = None;
        state.explanation = None;
        state.result = None;
    }

    fn selected_target(&self) -> Result<(LocalId, String), QueryBuilderError> {
        self.store.read(|store| {
            let record = store
                .selected_connection()
                .ok_or(QueryBuilderError::NoConnection)?;
            let remote = record.identity.resolve(self.mode)?.to_string();
            Ok((record.local_id().clone(), remote))
        })
    }

    fn still_selected(&self, local: &LocalId) -> bool {
        self.store.read(|store| {
            store
                .selected_connection()
                .is_some_and(|record| record.local_id() == local)
        })
    }

    /// Returns `Ok(None)` when a newer request or a connection switch
    /// superseded this one.
    pub async fn generate(
        &self,
        prompt: &str,
    ) -> Result<Option<GeneratedSql>, QueryBuilderError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(QueryBuilderError::EmptyPrompt);
        }
        let (local, connection_id) = self
            .selected_target()
            .inspect_err(|error| self.notifier.error(error.to_string()))?;

        let token = {
            let mut state = lock(&self.state);
            state.prompt = prompt.to_string();
            state.generating = true;
            state.generate_fence.issue()
        };

        let request = SqlGenerationRequest {
            connection_id,
            prompt: prompt.to_string(),
        };
        let result = self.api.generate_sql(&request).await;

        let mut state = lock(&self.state);
        if !self.still_selected(&local) {
            state.generate_fence.invalidate();
        }
        let Some(result) = state.generate_fence.admit(token, result) else {
            tracing::debug!("discarding superseded SQL generation");
            return Ok(None);
        };
        state.generating = false;
        match result {
            Ok(generated) => {
                state.sql = Some(generated.sql.clone());
                state.explanation = generated.explanation.clone();
                state.result = None;
                Ok(Some(generated))
            }
            Err(error) => {
                drop(state);
                self.notifier
                    .error(format!("SQL generation failed: {error}"));
                Err(error.into())
            }
        }
    }

    pub async fn execute(&self) -> Result<Option<QueryResult>, QueryBuilderError> {
        let sql = self.sql().ok_or(QueryBuilderError::NoSql)?;
        let (local, connection_id) = self
            .selected_target()
            .inspect_err(|error| self.notifier.error(error.to_string()))?;

        let token = {
            let mut state = lock(&self.state);
            state.executing = true;
            state.execute_fence.issue()
        };

        let request = SqlExecutionRequest {
            connection_id,
            sql,
            limit: DEFAULT_ROW_LIMIT,
        };
        let result = self.api.execute_sql(&request).await;

        let mut state = lock(&self.state);
        if !self.still_selected(&local) {
            state.execute_fence.invalidate();
        }
        let Some(result) = state.execute_fence.admit(token, result) else {
            tracing::debug!("discarding superseded query result");
            return Ok(None);
        };
        state.executing = false;
        match result {
            Ok(result) => {
                state.result = Some(result.clone());
                drop(state);
                if result.truncated {
                    self.notifier.warning(format!(
                        "Showing the first {} rows",
                        result.row_count()
                    ));
                }
                Ok(Some(result))
            }
            Err(error) => {
                drop(state);
                self.notifier.error(format!("Query failed: {error}"));
                Err(error.into())
            }
        }
    }

    pub async fn save(&self, name: &str) -> Result<SavedQuery, QueryBuilderError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(QueryBuilderError::EmptyName);
        }
        let (prompt, sql) = {
            let state = lock(&self.state);
            (
                state.prompt.clone(),
                state.sql.clone().ok_or(QueryBuilderError::NoSql)?,
            )
        };
        let (_, connection_id) = self
            .selected_target()
            .inspect_err(|error| self.notifier.error(error.to_string()))?;

        let request = SaveQueryRequest {
            name: name.to_string(),
            connection_id,
            prompt,
            sql,
        };
        match self.api.save_query(&request).await {
            Ok(saved) => {
                self.notifier.success(format!("Saved query {}", saved.name));
                Ok(saved)
            }
            Err(error) => {
                self.notifier
                    .error(format!("Could not save query: {error}"));
                Err(error.into())
            }
        }
    }
}
