use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connections::ConnectionPayload;
use crate::dashboard::{Widget, WidgetPlacement, WidgetSuggestion, WidgetSuggestionRequest};
use crate::history::{BulkDeleteOutcome, HistoryRecord};
use crate::query_builder::{
    GeneratedSql, QueryResult, SaveQueryRequest, SavedQuery, SqlExecutionRequest,
    SqlGenerationRequest,
};
use crate::reports::{Batch, DiscoveryRequest, KeyOption, ReportTemplate, RunReceipt, RunRequest};
use crate::schema::SchemaCatalog;

/// Failure of a remote call, carrying the human-readable message to show.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ApiError {
    message: String,
    status: Option<u16>,
}

impl ApiError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
        }
    }

    #[must_use]
    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: Some(status),
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn status(&self) -> Option<u16> {
        self.status
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTestOutcome {
    pub ok: bool,
    #[serde(default)]
    pub latency_ms: Option<u64>,
    /// Present when the backend already knows this connection.
    #[serde(default)]
    pub backend_connection_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedConnection {
    pub backend_connection_id: String,
}

/// Everything the client asks of the backend.
#[async_trait]
pub trait ReportingApi: Send + Sync {
    async fn test_connection(
        &self,
        payload: &ConnectionPayload,
    ) -> Result<ConnectionTestOutcome, ApiError>;
    /// Creates when `remote_id` is `None`, updates otherwise.
    async fn save_connection(
        &self,
        payload: &ConnectionPayload,
        remote_id: Option<&str>,
    ) -> Result<SavedConnection, ApiError>;
    async fn delete_connection(&self, remote_id: &str) -> Result<(), ApiError>;
    async fn healthcheck(&self, remote_id: &str) -> Result<ConnectionTestOutcome, ApiError>;
    async fn fetch_schema(&self, remote_id: &str) -> Result<SchemaCatalog, ApiError>;

    async fn list_templates(&self) -> Result<Vec<ReportTemplate>, ApiError>;
    async fn delete_template(&self, template_id: &str) -> Result<(), ApiError>;
    async fn fetch_key_options(&self, template_id: &str) -> Result<Vec<KeyOption>, ApiError>;
    async fn discover_batches(&self, request: &DiscoveryRequest) -> Result<Vec<Batch>, ApiError>;
    async fn run_report(&self, request: &RunRequest) -> Result<RunReceipt, ApiError>;
    async fn job_status(&self, job_id: &str) -> Result<RunReceipt, ApiError>;

    async fn list_history(&self) -> Result<Vec<HistoryRecord>, ApiError>;
    async fn delete_history(&self, ids: &[String]) -> Result<BulkDeleteOutcome, ApiError>;

    async fn generate_sql(&self, request: &SqlGenerationRequest)
        -> Result<GeneratedSql, ApiError>;
    async fn execute_sql(&self, request: &SqlExecutionRequest) -> Result<QueryResult, ApiError>;
    async fn save_query(&self, request: &SaveQueryRequest) -> Result<SavedQuery, ApiError>;

    async fn suggest_widgets(
        &self,
        request: &WidgetSuggestionRequest,
    ) -> Result<Vec<WidgetSuggestion>, ApiError>;
    async fn layout_widgets(&self, widgets: &[Widget]) -> Result<Vec<WidgetPlacement>, ApiError>;

    /// Cheap reachability probe used by the periodic health poll.
    async fn probe(&self) -> Result<(), ApiError>;
}

pub type SharedApi = Arc<dyn ReportingApi>;
