//! In-memory backend for offline use and end-to-end tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use uuid::Uuid;

use repdash_core::api::{ApiError, ConnectionTestOutcome, ReportingApi, SavedConnection};
use repdash_core::connections::ConnectionPayload;
use repdash_core::dashboard::{
    GridRect, Widget, WidgetKind, WidgetPlacement, WidgetSuggestion, WidgetSuggestionRequest,
    GRID_COLUMNS,
};
use repdash_core::history::{BulkDeleteOutcome, HistoryRecord, HistoryStatus};
use repdash_core::query_builder::{
    GeneratedSql, QueryResult, SaveQueryRequest, SavedQuery, SqlExecutionRequest,
    SqlGenerationRequest,
};
use repdash_core::reports::{
    ArtifactUrls, Batch, DiscoveryRequest, JobStatus, KeyOption, ReportTemplate, RunReceipt,
    RunRequest,
};
use repdash_core::schema::{ColumnSchema, SchemaCatalog, TableSchema};

/// Host name the mock treats as unreachable in connection tests.
pub const UNREACHABLE_HOST: &str = "unreachable.invalid";

const SIMULATED_LATENCY_MS: u64 = 12;

#[derive(Debug, Default)]
struct MockState {
    connections: BTreeMap<String, ConnectionPayload>,
    templates: Vec<ReportTemplate>,
    history: Vec<HistoryRecord>,
    saved_queries: Vec<SavedQuery>,
    undeletable_history: HashSet<String>,
    /// Status polls a new run stays `running` for.
    render_polls: u32,
    rendering: HashMap<String, u32>,
    offline: bool,
    next_id: u64,
}

impl MockState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }
}

#[derive(Debug, Default)]
pub struct MockReportingApi {
    state: Mutex<MockState>,
    latency: Duration,
}

impl MockReportingApi {
    /// Empty backend with no templates or history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend with a few templates and history rows to click through.
    #[must_use]
    pub fn seeded() -> Self {
        let api = Self::new();
        {
            let mut state = api.state();
            state.templates = vec![
                ReportTemplate {
                    description: Some("Monthly revenue by region".to_string()),
                    key_field: Some("region".to_string()),
                    ..ReportTemplate::new("tpl-revenue", "Revenue summary")
                },
                ReportTemplate {
                    description: Some("Open invoices past due".to_string()),
                    key_field: Some("customer".to_string()),
                    ..ReportTemplate::new("tpl-aging", "Receivables aging")
                },
                ReportTemplate::new("tpl-inventory", "Inventory snapshot"),
            ];
            let now = Utc::now();
            state.history = [
                ("run-1003", "Revenue summary", HistoryStatus::Completed, 1),
                ("run-1002", "Receivables aging", HistoryStatus::Failed, 3),
                ("run-1001", "Inventory snapshot", HistoryStatus::Completed, 26),
            ]
            .into_iter()
            .map(|(id, name, status, hours_ago)| HistoryRecord {
                id: id.to_string(),
                template_name: name.to_string(),
                status,
                created_at: Some(now - ChronoDuration::hours(hours_ago)),
                artifacts: if status == HistoryStatus::Completed {
                    artifact_urls(id)
                } else {
                    ArtifactUrls::default()
                },
                error: (status == HistoryStatus::Failed)
                    .then(|| "template query timed out".to_string()),
            })
            .collect();
        }
        api
    }

    /// Delays every call, so loading states are visible.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Makes new runs report `running` until they have been polled `polls`
    /// times.
    pub fn set_render_polls(&self, polls: u32) {
        self.state().render_polls = polls;
    }

    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// History ids the backend will refuse to delete.
    pub fn refuse_history_delete(&self, id: impl Into<String>) {
        self.state().undeletable_history.insert(id.into());
    }

    #[must_use]
    pub fn connection(&self, id: &str) -> Option<ConnectionPayload> {
        self.state().connections.get(id).cloned()
    }

    #[must_use]
    pub fn history_ids(&self) -> Vec<String> {
        self.state()
            .history
            .iter()
            .map(|record| record.id.clone())
            .collect()
    }

    #[must_use]
    pub fn template_ids(&self) -> Vec<String> {
        self.state()
            .templates
            .iter()
            .map(|template| template.id.clone())
            .collect()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn pause(&self) -> Result<(), ApiError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.state().offline {
            return Err(ApiError::new("mock backend is offline"));
        }
        Ok(())
    }

    fn template(&self, template_id: &str) -> Result<ReportTemplate, ApiError> {
        self.state()
            .templates
            .iter()
            .find(|template| template.id == template_id)
            .cloned()
            .ok_or_else(|| not_found("template", template_id))
    }
}

fn not_found(kind: &str, id: &str) -> ApiError {
    ApiError::with_status(404, format!("{kind} `{id}` not found"))
}

fn artifact_urls(job_id: &str) -> ArtifactUrls {
    ArtifactUrls {
        pdf: Some(format!("mock://reports/{job_id}/report.pdf")),
        html: Some(format!("mock://reports/{job_id}/report.html")),
        docx: None,
        xlsx: Some(format!("mock://reports/{job_id}/report.xlsx")),
    }
}

fn sample_catalog() -> SchemaCatalog {
    let column = |name: &str, data_type: &str, nullable: bool| ColumnSchema {
        name: name.to_string(),
        data_type: data_type.to_string(),
        nullable,
    };
    SchemaCatalog {
        tables: vec![
            TableSchema {
                name: "customers".to_string(),
                columns: vec![
                    column("id", "integer", false),
                    column("name", "text", false),
                    column("region", "text", true),
                ],
            },
            TableSchema {
                name: "orders".to_string(),
                columns: vec![
                    column("id", "integer", false),
                    column("customer_id", "integer", false),
                    column("total", "numeric", false),
                    column("placed_at", "timestamp", false),
                ],
            },
        ],
    }
}

#[async_trait]
impl ReportingApi for MockReportingApi {
    async fn test_connection(
        &self,
        payload: &ConnectionPayload,
    ) -> Result<ConnectionTestOutcome, ApiError> {
        self.pause().await?;
        if payload.host.as_deref() == Some(UNREACHABLE_HOST) {
            return Ok(ConnectionTestOutcome {
                ok: false,
                latency_ms: None,
                backend_connection_id: None,
                message: Some(format!("could not reach {UNREACHABLE_HOST}")),
            });
        }
        let known = self
            .state()
            .connections
            .iter()
            .find(|(_, saved)| saved.name == payload.name && saved.url == payload.url)
            .map(|(id, _)| id.clone());
        Ok(ConnectionTestOutcome {
            ok: true,
            latency_ms: Some(SIMULATED_LATENCY_MS),
            backend_connection_id: known,
            message: None,
        })
    }

    async fn save_connection(
        &self,
        payload: &ConnectionPayload,
        remote_id: Option<&str>,
    ) -> Result<SavedConnection, ApiError> {
        self.pause().await?;
        let mut state = self.state();
        let id = match remote_id {
            Some(id) => id.to_string(),
            None => state.next_id("mock-conn"),
        };
        state.connections.insert(id.clone(), payload.clone());
        Ok(SavedConnection {
            backend_connection_id: id,
        })
    }

    async fn delete_connection(&self, remote_id: &str) -> Result<(), ApiError> {
        self.pause().await?;
        // Unsaved connections resolve to their local id here; treat as gone.
        self.state().connections.remove(remote_id);
        Ok(())
    }

    async fn healthcheck(&self, remote_id: &str) -> Result<ConnectionTestOutcome, ApiError> {
        self.pause().await?;
        let unreachable = self
            .state()
            .connections
            .get(remote_id)
            .is_some_and(|saved| saved.host.as_deref() == Some(UNREACHABLE_HOST));
        Ok(ConnectionTestOutcome {
            ok: !unreachable,
            latency_ms: (!unreachable).then_some(SIMULATED_LATENCY_MS),
            backend_connection_id: Some(remote_id.to_string()),
            message: unreachable.then(|| format!("could not reach {UNREACHABLE_HOST}")),
        })
    }

    async fn fetch_schema(&self, _remote_id: &str) -> Result<SchemaCatalog, ApiError> {
        self.pause().await?;
        Ok(sample_catalog())
    }

    async fn list_templates(&self) -> Result<Vec<ReportTemplate>, ApiError> {
        self.pause().await?;
        Ok(self.state().templates.clone())
    }

    async fn delete_template(&self, template_id: &str) -> Result<(), ApiError> {
        self.pause().await?;
        let mut state = self.state();
        let before = state.templates.len();
        state.templates.retain(|template| template.id != template_id);
        if state.templates.len() == before {
            return Err(not_found("template", template_id));
        }
        Ok(())
    }

    async fn fetch_key_options(&self, template_id: &str) -> Result<Vec<KeyOption>, ApiError> {
        self.pause().await?;
        let template = self.template(template_id)?;
        let Some(field) = template.key_field else {
            return Ok(Vec::new());
        };
        Ok(["north", "south", "west"]
            .into_iter()
            .map(|value| KeyOption {
                value: format!("{field}:{value}"),
                label: value.to_string(),
            })
            .collect())
    }

    async fn discover_batches(&self, request: &DiscoveryRequest) -> Result<Vec<Batch>, ApiError> {
        self.pause().await?;
        self.template(&request.template_id)?;
        let days = u64::try_from((request.range.end - request.range.start).num_days())
            .unwrap_or(0)
            + 1;
        let batches = days.div_ceil(7).clamp(1, 8);
        Ok((1..=batches)
            .map(|index| Batch {
                id: format!("{}-w{index}", request.template_id),
                row_count: 40 * index + days,
                parent_count: index + 1,
                selected: false,
            })
            .collect())
    }

    async fn run_report(&self, request: &RunRequest) -> Result<RunReceipt, ApiError> {
        self.pause().await?;
        let template = self.template(&request.template_id)?;
        if request.batch_ids.is_empty() {
            return Err(ApiError::with_status(422, "no batches selected"));
        }
        let job_id = format!("job-{}", Uuid::new_v4().simple());
        let mut state = self.state();
        if state.render_polls > 0 {
            let polls = state.render_polls;
            state.rendering.insert(job_id.clone(), polls);
            state.history.insert(
                0,
                HistoryRecord {
                    id: job_id.clone(),
                    template_name: template.name,
                    status: HistoryStatus::Running,
                    created_at: Some(Utc::now()),
                    artifacts: ArtifactUrls::default(),
                    error: None,
                },
            );
            return Ok(RunReceipt {
                job_id,
                status: JobStatus::Running,
                progress: Some(0),
                artifacts: ArtifactUrls::default(),
                message: None,
            });
        }

        let artifacts = artifact_urls(&job_id);
        state.history.insert(
            0,
            HistoryRecord {
                id: job_id.clone(),
                template_name: template.name,
                status: HistoryStatus::Completed,
                created_at: Some(Utc::now()),
                artifacts: artifacts.clone(),
                error: None,
            },
        );
        Ok(RunReceipt {
            job_id,
            status: JobStatus::Complete,
            progress: Some(100),
            artifacts,
            message: None,
        })
    }

    async fn job_status(&self, job_id: &str) -> Result<RunReceipt, ApiError> {
        self.pause().await?;
        let mut state = self.state();
        let remaining = state.rendering.get(job_id).map(|polls| polls.saturating_sub(1));
        let record = state
            .history
            .iter_mut()
            .find(|record| record.id == job_id)
            .ok_or_else(|| not_found("job", job_id))?;
        if remaining == Some(0) {
            record.status = HistoryStatus::Completed;
            record.artifacts = artifact_urls(job_id);
        }
        let record = record.clone();
        match remaining {
            Some(0) => {
                state.rendering.remove(job_id);
            }
            Some(polls) => {
                state.rendering.insert(job_id.to_string(), polls);
            }
            None => {}
        }

        let status = match record.status {
            HistoryStatus::Completed => JobStatus::Complete,
            HistoryStatus::Failed | HistoryStatus::Cancelled => JobStatus::Failed,
            HistoryStatus::Running | HistoryStatus::Pending => JobStatus::Running,
        };
        Ok(RunReceipt {
            job_id: record.id,
            status,
            progress: (status == JobStatus::Complete).then_some(100),
            artifacts: record.artifacts,
            message: record.error,
        })
    }

    async fn list_history(&self) -> Result<Vec<HistoryRecord>, ApiError> {
        self.pause().await?;
        Ok(self.state().history.clone())
    }

    async fn delete_history(&self, ids: &[String]) -> Result<BulkDeleteOutcome, ApiError> {
        self.pause().await?;
        let mut state = self.state();
        let mut outcome = BulkDeleteOutcome::default();
        for id in ids {
            let present = state.history.iter().any(|record| &record.id == id);
            if present && !state.undeletable_history.contains(id) {
                state.history.retain(|record| &record.id != id);
                outcome.deleted.push(id.clone());
            } else {
                outcome.failed.push(id.clone());
            }
        }
        Ok(outcome)
    }

    async fn generate_sql(
        &self,
        request: &SqlGenerationRequest,
    ) -> Result<GeneratedSql, ApiError> {
        self.pause().await?;
        let prompt = request.prompt.to_lowercase();
        let sql = if prompt.contains("customer") {
            "SELECT c.region, COUNT(*) AS customers\nFROM customers c\nGROUP BY c.region\nORDER BY customers DESC"
        } else {
            "SELECT date_trunc('month', o.placed_at) AS month, SUM(o.total) AS revenue\nFROM orders o\nGROUP BY 1\nORDER BY 1"
        };
        Ok(GeneratedSql {
            sql: sql.to_string(),
            explanation: Some(format!("Generated from: {}", request.prompt.trim())),
        })
    }

    async fn execute_sql(&self, request: &SqlExecutionRequest) -> Result<QueryResult, ApiError> {
        self.pause().await?;
        if request.sql.trim().is_empty() {
            return Err(ApiError::with_status(400, "query is empty"));
        }
        let all_rows = vec![
            vec![json!("north"), json!(1240.5)],
            vec![json!("south"), json!(980)],
            vec![json!("west"), json!(null)],
        ];
        let limit = usize::try_from(request.limit).unwrap_or(usize::MAX);
        let truncated = all_rows.len() > limit;
        Ok(QueryResult {
            columns: vec!["region".to_string(), "revenue".to_string()],
            rows: all_rows.into_iter().take(limit).collect(),
            truncated,
            elapsed_ms: Some(SIMULATED_LATENCY_MS),
        })
    }

    async fn save_query(&self, request: &SaveQueryRequest) -> Result<SavedQuery, ApiError> {
        self.pause().await?;
        let mut state = self.state();
        let saved = SavedQuery {
            id: state.next_id("query"),
            name: request.name.clone(),
        };
        state.saved_queries.push(saved.clone());
        Ok(saved)
    }

    async fn suggest_widgets(
        &self,
        request: &WidgetSuggestionRequest,
    ) -> Result<Vec<WidgetSuggestion>, ApiError> {
        self.pause().await?;
        let candidates = [
            (
                "Total revenue",
                WidgetKind::Metric,
                "SELECT SUM(total) FROM orders",
            ),
            (
                "Revenue by month",
                WidgetKind::Line,
                "SELECT date_trunc('month', placed_at), SUM(total) FROM orders GROUP BY 1",
            ),
            (
                "Customers by region",
                WidgetKind::Bar,
                "SELECT region, COUNT(*) FROM customers GROUP BY region",
            ),
        ];
        Ok(candidates
            .into_iter()
            .filter(|(_, kind, _)| !request.existing.contains(kind))
            .map(|(title, kind, sql)| WidgetSuggestion {
                title: title.to_string(),
                kind,
                sql: Some(sql.to_string()),
                rationale: Some(format!("Fits the goal \"{}\"", request.goal.trim())),
            })
            .collect())
    }

    async fn layout_widgets(&self, widgets: &[Widget]) -> Result<Vec<WidgetPlacement>, ApiError> {
        self.pause().await?;
        // Row packing: fill left to right, wrap when the next widget overflows.
        let mut placements = Vec::with_capacity(widgets.len());
        let (mut x, mut y, mut row_height) = (0_u16, 0_u16, 0_u16);
        for widget in widgets {
            let (w, h) = widget.kind.default_size();
            if x + w > GRID_COLUMNS {
                x = 0;
                y += row_height;
                row_height = 0;
            }
            placements.push(WidgetPlacement {
                widget_id: widget.id.clone(),
                rect: GridRect { x, y, w, h },
            });
            x += w;
            row_height = row_height.max(h);
        }
        Ok(placements)
    }

    async fn probe(&self) -> Result<(), ApiError> {
        self.pause().await
    }
}
