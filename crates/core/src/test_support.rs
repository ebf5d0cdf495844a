//! Scripted in-process backend for coordinator tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::api::{ApiError, ConnectionTestOutcome, ReportingApi, SavedConnection};
use crate::connections::{ConnectionPayload, ConnectionRecord, ConnectionStatus, DbType};
use crate::dashboard::{Widget, WidgetPlacement, WidgetSuggestion, WidgetSuggestionRequest};
use crate::history::{BulkDeleteOutcome, HistoryRecord};
use crate::identity::{ConnectionIdentity, LocalId, RemoteId};
use crate::query_builder::{
    GeneratedSql, QueryResult, SaveQueryRequest, SavedQuery, SqlExecutionRequest,
    SqlGenerationRequest,
};
use crate::reports::{
    Batch, DiscoveryRequest, JobStatus, KeyOption, ReportTemplate, RunReceipt, RunRequest,
};
use crate::schema::SchemaCatalog;

pub(crate) fn saved_postgres_record(local: &str, name: &str, remote: &str) -> ConnectionRecord {
    let mut record = ConnectionRecord {
        identity: ConnectionIdentity::new(LocalId::new(local)).with_remote(RemoteId::new(remote)),
        name: name.to_string(),
        db_type: DbType::Postgres,
        host: Some("db.internal".to_string()),
        port: Some(5432),
        database: "reports".to_string(),
        username: Some("reporter".to_string()),
        password: None,
        url: String::new(),
        status: ConnectionStatus::Unknown,
        last_latency_ms: None,
        last_connected: None,
    };
    record.normalize();
    record
}

#[derive(Default)]
struct Script {
    calls: Vec<(String, String)>,
    failures: HashMap<String, VecDeque<ApiError>>,
    test_outcome: Option<ConnectionTestOutcome>,
    test_payloads: Vec<ConnectionPayload>,
    saves: u64,
    health: HashMap<String, Result<ConnectionTestOutcome, ApiError>>,
    schemas: HashMap<String, (SchemaCatalog, Duration)>,
    templates: Vec<ReportTemplate>,
    key_options: HashMap<String, (Vec<KeyOption>, Duration)>,
    batches: Vec<Batch>,
    run_receipt: Option<RunReceipt>,
    job_statuses: HashMap<String, VecDeque<RunReceipt>>,
    runs: Vec<RunRequest>,
    history: Vec<HistoryRecord>,
    delete_history_outcome: Option<Result<BulkDeleteOutcome, ApiError>>,
    delete_history_calls: Vec<Vec<String>>,
    delete_history_delay: Duration,
    generated: HashMap<String, (GeneratedSql, Duration)>,
    query_result: QueryResult,
    saved_queries: Vec<SaveQueryRequest>,
    suggestions: (Vec<WidgetSuggestion>, Duration),
    layout: (Vec<WidgetPlacement>, Duration),
}

impl Script {
    fn enter(&mut self, method: &str, arg: impl Into<String>) -> Option<ApiError> {
        self.calls.push((method.to_string(), arg.into()));
        self.failures
            .get_mut(method)
            .and_then(VecDeque::pop_front)
    }
}

/// Records every call; answers come from whatever the test scripted. A
/// failure queued with `fail_next` is claimed when the call starts and
/// returned after the call's delay.
#[derive(Default)]
pub(crate) struct ScriptedApi {
    script: Mutex<Script>,
}

async fn settle<T>(failure: Option<ApiError>, delay: Duration, value: T) -> Result<T, ApiError> {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    match failure {
        Some(error) => Err(error),
        None => Ok(value),
    }
}

impl ScriptedApi {
    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().expect("script lock")
    }

    pub(crate) fn fail_next(&self, method: &str, message: &str) {
        self.script()
            .failures
            .entry(method.to_string())
            .or_default()
            .push_back(ApiError::new(message));
    }

    pub(crate) fn call_count(&self, method: &str) -> usize {
        self.script()
            .calls
            .iter()
            .filter(|(name, _)| name == method)
            .count()
    }

    pub(crate) fn calls_with_arg(&self, method: &str, arg: &str) -> usize {
        self.script()
            .calls
            .iter()
            .filter(|(name, recorded)| name == method && recorded == arg)
            .count()
    }

    pub(crate) fn set_test_outcome(&self, outcome: ConnectionTestOutcome) {
        self.script().test_outcome = Some(outcome);
    }

    pub(crate) fn last_test_payload(&self) -> Option<ConnectionPayload> {
        self.script().test_payloads.last().cloned()
    }

    pub(crate) fn set_healthcheck(
        &self,
        remote_id: &str,
        outcome: Result<ConnectionTestOutcome, ApiError>,
    ) {
        self.script().health.insert(remote_id.to_string(), outcome);
    }

    pub(crate) fn set_schema(&self, remote_id: &str, schema: SchemaCatalog, delay: Duration) {
        self.script()
            .schemas
            .insert(remote_id.to_string(), (schema, delay));
    }

    pub(crate) fn set_key_options(&self, template_id: &str, options: Vec<KeyOption>, delay: Duration) {
        self.script()
            .key_options
            .insert(template_id.to_string(), (options, delay));
    }

    pub(crate) fn set_batches(&self, batches: Vec<Batch>) {
        self.script().batches = batches;
    }

    pub(crate) fn set_run_receipt(&self, receipt: RunReceipt) {
        self.script().run_receipt = Some(receipt);
    }

    /// Queues the answers for successive status polls of `job_id`.
    pub(crate) fn push_job_status(&self, job_id: &str, receipt: RunReceipt) {
        self.script()
            .job_statuses
            .entry(job_id.to_string())
            .or_default()
            .push_back(receipt);
    }

    pub(crate) fn last_run_batches(&self) -> Vec<String> {
        self.script()
            .runs
            .last()
            .map(|run| run.batch_ids.clone())
            .unwrap_or_default()
    }

    pub(crate) fn set_history(&self, records: Vec<HistoryRecord>) {
        self.script().history = records;
    }

    pub(crate) fn set_delete_history_outcome(&self, outcome: Result<BulkDeleteOutcome, ApiError>) {
        self.script().delete_history_outcome = Some(outcome);
    }

    pub(crate) fn set_delete_history_delay(&self, delay: Duration) {
        self.script().delete_history_delay = delay;
    }

    pub(crate) fn delete_history_calls(&self) -> Vec<Vec<String>> {
        self.script().delete_history_calls.clone()
    }

    pub(crate) fn set_generated_sql(&self, connection_id: &str, sql: GeneratedSql, delay: Duration) {
        self.script()
            .generated
            .insert(connection_id.to_string(), (sql, delay));
    }

    pub(crate) fn set_query_result(&self, result: QueryResult) {
        self.script().query_result = result;
    }

    pub(crate) fn last_saved_query_sql(&self) -> Option<String> {
        self.script()
            .saved_queries
            .last()
            .map(|request| request.sql.clone())
    }

    pub(crate) fn set_suggestions(&self, suggestions: Vec<WidgetSuggestion>, delay: Duration) {
        self.script().suggestions = (suggestions, delay);
    }

    pub(crate) fn set_layout(&self, placements: Vec<WidgetPlacement>, delay: Duration) {
        self.script().layout = (placements, delay);
    }
}

#[async_trait]
impl ReportingApi for ScriptedApi {
    async fn test_connection(
        &self,
        payload: &ConnectionPayload,
    ) -> Result<ConnectionTestOutcome, ApiError> {
        let (failure, outcome) = {
            let mut script = self.script();
            let failure = script.enter("test_connection", payload.name.clone());
            script.test_payloads.push(payload.clone());
            let outcome = script.test_outcome.clone().unwrap_or(ConnectionTestOutcome {
                ok: true,
                latency_ms: Some(5),
                backend_connection_id: None,
                message: None,
            });
            (failure, outcome)
        };
        settle(failure, Duration::ZERO, outcome).await
    }

    async fn save_connection(
        &self,
        payload: &ConnectionPayload,
        remote_id: Option<&str>,
    ) -> Result<SavedConnection, ApiError> {
        let (failure, saved) = {
            let mut script = self.script();
            let failure = script.enter("save_connection", payload.name.clone());
            script.saves += 1;
            let id = remote_id.map_or_else(|| format!("rid-{}", script.saves), str::to_string);
            (failure, SavedConnection { backend_connection_id: id })
        };
        settle(failure, Duration::ZERO, saved).await
    }

    async fn delete_connection(&self, remote_id: &str) -> Result<(), ApiError> {
        let failure = self.script().enter("delete_connection", remote_id);
        settle(failure, Duration::ZERO, ()).await
    }

    async fn healthcheck(&self, remote_id: &str) -> Result<ConnectionTestOutcome, ApiError> {
        let (failure, scripted) = {
            let mut script = self.script();
            let failure = script.enter("healthcheck", remote_id);
            (failure, script.health.get(remote_id).cloned())
        };
        match scripted {
            Some(Err(error)) => Err(failure.unwrap_or(error)),
            Some(Ok(outcome)) => settle(failure, Duration::ZERO, outcome).await,
            None => {
                settle(
                    failure,
                    Duration::ZERO,
                    ConnectionTestOutcome {
                        ok: true,
                        latency_ms: Some(3),
                        backend_connection_id: None,
                        message: None,
                    },
                )
                .await
            }
        }
    }

    async fn fetch_schema(&self, remote_id: &str) -> Result<SchemaCatalog, ApiError> {
        let (failure, (schema, delay)) = {
            let mut script = self.script();
            let failure = script.enter("fetch_schema", remote_id);
            (
                failure,
                script.schemas.get(remote_id).cloned().unwrap_or_default(),
            )
        };
        settle(failure, delay, schema).await
    }

    async fn list_templates(&self) -> Result<Vec<ReportTemplate>, ApiError> {
        let (failure, templates) = {
            let mut script = self.script();
            (script.enter("list_templates", ""), script.templates.clone())
        };
        settle(failure, Duration::ZERO, templates).await
    }

    async fn delete_template(&self, template_id: &str) -> Result<(), ApiError> {
        let failure = self.script().enter("delete_template", template_id);
        settle(failure, Duration::ZERO, ()).await
    }

    async fn fetch_key_options(&self, template_id: &str) -> Result<Vec<KeyOption>, ApiError> {
        let (failure, (options, delay)) = {
            let mut script = self.script();
            let failure = script.enter("fetch_key_options", template_id);
            (
                failure,
                script.key_options.get(template_id).cloned().unwrap_or_default(),
            )
        };
        settle(failure, delay, options).await
    }

    async fn discover_batches(&self, request: &DiscoveryRequest) -> Result<Vec<Batch>, ApiError> {
        let (failure, batches) = {
            let mut script = self.script();
            (
                script.enter("discover_batches", request.template_id.clone()),
                script.batches.clone(),
            )
        };
        settle(failure, Duration::ZERO, batches).await
    }

    async fn run_report(&self, request: &RunRequest) -> Result<RunReceipt, ApiError> {
        let (failure, receipt) = {
            let mut script = self.script();
            let failure = script.enter("run_report", request.template_id.clone());
            script.runs.push(request.clone());
            let receipt = script.run_receipt.clone().unwrap_or(RunReceipt {
                job_id: "remote-job".to_string(),
                status: JobStatus::Running,
                progress: Some(10),
                artifacts: crate::reports::ArtifactUrls::default(),
                message: None,
            });
            (failure, receipt)
        };
        settle(failure, Duration::ZERO, receipt).await
    }

    async fn job_status(&self, job_id: &str) -> Result<RunReceipt, ApiError> {
        let (failure, receipt) = {
            let mut script = self.script();
            let failure = script.enter("job_status", job_id);
            let receipt = script
                .job_statuses
                .get_mut(job_id)
                .and_then(VecDeque::pop_front);
            (failure, receipt)
        };
        match receipt {
            Some(receipt) => settle(failure, Duration::ZERO, receipt).await,
            None => Err(failure.unwrap_or_else(|| ApiError::with_status(404, "unknown job"))),
        }
    }

    async fn list_history(&self) -> Result<Vec<HistoryRecord>, ApiError> {
        let (failure, history) = {
            let mut script = self.script();
            (script.enter("list_history", ""), script.history.clone())
        };
        settle(failure, Duration::ZERO, history).await
    }

    async fn delete_history(&self, ids: &[String]) -> Result<BulkDeleteOutcome, ApiError> {
        let (failure, outcome, delay) = {
            let mut script = self.script();
            let failure = script.enter("delete_history", ids.join(","));
            script.delete_history_calls.push(ids.to_vec());
            let outcome = script.delete_history_outcome.clone().unwrap_or_else(|| {
                Ok(BulkDeleteOutcome {
                    deleted: ids.to_vec(),
                    failed: Vec::new(),
                })
            });
            (failure, outcome, script.delete_history_delay)
        };
        match outcome {
            Ok(outcome) => settle(failure, delay, outcome).await,
            Err(error) => {
                let failure = Some(failure.unwrap_or(error));
                settle(failure, delay, BulkDeleteOutcome::default()).await
            }
        }
    }

    async fn generate_sql(
        &self,
        request: &SqlGenerationRequest,
    ) -> Result<GeneratedSql, ApiError> {
        let (failure, (generated, delay)) = {
            let mut script = self.script();
            let failure = script.enter("generate_sql", request.connection_id.clone());
            let scripted = script
                .generated
                .get(&request.connection_id)
                .cloned()
                .unwrap_or_else(|| {
                    (
                        GeneratedSql {
                            sql: "select 1".to_string(),
                            explanation: None,
                        },
                        Duration::ZERO,
                    )
                });
            (failure, scripted)
        };
        settle(failure, delay, generated).await
    }

    async fn execute_sql(&self, request: &SqlExecutionRequest) -> Result<QueryResult, ApiError> {
        let (failure, result) = {
            let mut script = self.script();
            (
                script.enter("execute_sql", request.sql.clone()),
                script.query_result.clone(),
            )
        };
        settle(failure, Duration::ZERO, result).await
    }

    async fn save_query(&self, request: &SaveQueryRequest) -> Result<SavedQuery, ApiError> {
        let failure = {
            let mut script = self.script();
            let failure = script.enter("save_query", request.name.clone());
            script.saved_queries.push(request.clone());
            failure
        };
        settle(
            failure,
            Duration::ZERO,
            SavedQuery {
                id: "q-1".to_string(),
                name: request.name.clone(),
            },
        )
        .await
    }

    async fn suggest_widgets(
        &self,
        request: &WidgetSuggestionRequest,
    ) -> Result<Vec<WidgetSuggestion>, ApiError> {
        let (failure, (suggestions, delay)) = {
            let mut script = self.script();
            (
                script.enter("suggest_widgets", request.goal.clone()),
                script.suggestions.clone(),
            )
        };
        settle(failure, delay, suggestions).await
    }

    async fn layout_widgets(&self, widgets: &[Widget]) -> Result<Vec<WidgetPlacement>, ApiError> {
        let (failure, (placements, delay)) = {
            let mut script = self.script();
            (
                script.enter("layout_widgets", widgets.len().to_string()),
                script.layout.clone(),
            )
        };
        settle(failure, delay, placements).await
    }

    async fn probe(&self) -> Result<(), ApiError> {
        let failure = self.script().enter("probe", "");
        settle(failure, Duration::ZERO, ()).await
    }
}
