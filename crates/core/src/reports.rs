use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::api::{ApiError, SharedApi};
use crate::fencing::{KeyedFence, RequestFence};
use crate::identity::{ApiMode, IdentityError};
use crate::notices::Notifier;
use crate::store::{lock, SharedStore, StoreAction};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportTemplate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Label of the key the discovery filter narrows on (e.g. "Store").
    #[serde(default)]
    pub key_field: Option<String>,
}

impl ReportTemplate {
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            key_field: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyOption {
    pub value: String,
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, ReportError> {
        if start > end {
            return Err(ReportError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    pub template_id: String,
    pub connection_id: String,
    pub range: DateRange,
    #[serde(default)]
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub id: String,
    pub row_count: u64,
    pub parent_count: u64,
    #[serde(default)]
    pub selected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactFormat {
    Pdf,
    Html,
    Docx,
    Xlsx,
}

impl fmt::Display for ArtifactFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pdf => "pdf",
            Self::Html => "html",
            Self::Docx => "docx",
            Self::Xlsx => "xlsx",
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactUrls {
    #[serde(default)]
    pub pdf: Option<String>,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub docx: Option<String>,
    #[serde(default)]
    pub xlsx: Option<String>,
}

impl ArtifactUrls {
    pub fn iter(&self) -> impl Iterator<Item = (ArtifactFormat, &str)> {
        [
            (ArtifactFormat::Pdf, self.pdf.as_deref()),
            (ArtifactFormat::Html, self.html.as_deref()),
            (ArtifactFormat::Docx, self.docx.as_deref()),
            (ArtifactFormat::Xlsx, self.xlsx.as_deref()),
        ]
        .into_iter()
        .filter_map(|(format, url)| url.map(|url| (format, url)))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    pub template_id: String,
    pub connection_id: String,
    pub range: DateRange,
    pub batch_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReceipt {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub progress: Option<u8>,
    #[serde(default)]
    pub artifacts: ArtifactUrls,
    #[serde(default)]
    pub message: Option<String>,
}

/// Session-only progress record for a report run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationJob {
    pub id: String,
    /// Id the backend assigned, used to poll a run that is still going.
    pub backend_id: Option<String>,
    pub name: String,
    pub status: JobStatus,
    pub progress: u8,
    pub artifacts: ArtifactUrls,
    pub error: Option<String>,
}

/// A finished run's artifacts, kept in the store for the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    pub job_id: String,
    pub name: String,
    pub artifacts: ArtifactUrls,
}

#[derive(Debug, Clone, Default)]
pub struct JobList {
    jobs: Vec<GenerationJob>,
}

impl JobList {
    pub fn start(&mut self, name: impl Into<String>) -> String {
        let id = format!("job-{}", Uuid::new_v4());
        self.jobs.push(GenerationJob {
            id: id.clone(),
            backend_id: None,
            name: name.into(),
            status: JobStatus::Running,
            progress: 0,
            artifacts: ArtifactUrls::default(),
            error: None,
        });
        id
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&GenerationJob> {
        self.jobs.iter().find(|job| job.id == id)
    }

    #[must_use]
    pub fn jobs(&self) -> &[GenerationJob] {
        &self.jobs
    }

    fn attach_backend(&mut self, id: &str, backend_id: &str) {
        if let Some(job) = self.jobs.iter_mut().find(|job| job.id == id) {
            job.backend_id = Some(backend_id.to_string());
        }
    }

    /// Folds a backend receipt into the job. Returns `true` when the job
    /// reached a terminal state because of it.
    fn apply(&mut self, id: &str, receipt: &RunReceipt) -> bool {
        match receipt.status {
            JobStatus::Running => {
                self.set_progress(id, receipt.progress.unwrap_or(0));
                false
            }
            JobStatus::Complete => self.complete(id, receipt.artifacts.clone()),
            JobStatus::Failed => self.fail(
                id,
                receipt
                    .message
                    .clone()
                    .unwrap_or_else(|| "report generation failed".to_string()),
            ),
        }
    }

    fn running_mut(&mut self, id: &str) -> Option<&mut GenerationJob> {
        self.jobs
            .iter_mut()
            .find(|job| job.id == id && job.status == JobStatus::Running)
    }

    pub fn set_progress(&mut self, id: &str, progress: u8) -> bool {
        let Some(job) = self.running_mut(id) else {
            return false;
        };
        job.progress = progress.min(100).max(job.progress);
        true
    }

    pub fn complete(&mut self, id: &str, artifacts: ArtifactUrls) -> bool {
        let Some(job) = self.running_mut(id) else {
            return false;
        };
        job.status = JobStatus::Complete;
        job.progress = 100;
        job.artifacts = artifacts;
        true
    }

    pub fn fail(&mut self, id: &str, error: impl Into<String>) -> bool {
        let Some(job) = self.running_mut(id) else {
            return false;
        };
        job.status = JobStatus::Failed;
        job.error = Some(error.into());
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryResult {
    pub request: DiscoveryRequest,
    pub batches: Vec<Batch>,
}

impl DiscoveryResult {
    pub fn toggle(&mut self, batch_id: &str) -> bool {
        let Some(batch) = self.batches.iter_mut().find(|batch| batch.id == batch_id) else {
            return false;
        };
        batch.selected = !batch.selected;
        true
    }

    pub fn select_all(&mut self, selected: bool) {
        for batch in &mut self.batches {
            batch.selected = selected;
        }
    }

    #[must_use]
    pub fn selected_ids(&self) -> Vec<String> {
        self.batches
            .iter()
            .filter(|batch| batch.selected)
            .map(|batch| batch.id.clone())
            .collect()
    }

    #[must_use]
    pub fn selected_rows(&self) -> u64 {
        self.batches
            .iter()
            .filter(|batch| batch.selected)
            .map(|batch| batch.row_count)
            .sum()
    }
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("select a connection first")]
    NoConnection,
    #[error("select a report template first")]
    NoTemplate,
    #[error("unknown report template `{0}`")]
    UnknownTemplate(String),
    #[error("start date {start} is after end date {end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },
    #[error("run discovery before starting a report")]
    NoDiscovery,
    #[error("select at least one batch")]
    NothingSelected,
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("backend request failed: {0}")]
    Api(#[from] ApiError),
}

#[derive(Debug, Default)]
struct RunnerState {
    templates_fence: RequestFence,
    loading_templates: bool,
    key_fence: KeyedFence<String>,
    key_options: HashMap<String, Vec<KeyOption>>,
    discovery_fence: RequestFence,
    discovering: bool,
    discovery: Option<DiscoveryResult>,
    jobs: JobList,
}

/// Template selection, batch discovery and report runs.
#[derive(Clone)]
pub struct ReportRunner {
    api: SharedApi,
    store: SharedStore,
    notifier: Notifier,
    mode: ApiMode,
    state: Arc<Mutex<RunnerState>>,
}

impl ReportRunner {
    #[must_use]
    pub fn new(api: SharedApi, store: SharedStore, notifier: Notifier, mode: ApiMode) -> Self {
        Self {
            api,
            store,
            notifier,
            mode,
            state: Arc::new(Mutex::new(RunnerState::default())),
        }
    }

    /// Refreshes the template list. Returns `None` when a newer load
    /// superseded this one.
    pub async fn load_templates(&self) -> Result<Option<usize>, ReportError> {
        let token = {
            let mut state = lock(&self.state);
            state.loading_templates = true;
            state.templates_fence.issue()
        };

        let result = self.api.list_templates().await;

        let mut state = lock(&self.state);
        let Some(result) = state.templates_fence.admit(token, result) else {
            tracing::debug!("discarding superseded template list");
            return Ok(None);
        };
        state.loading_templates = false;
        drop(state);

        match result {
            Ok(templates) => {
                let count = templates.len();
                self.store.dispatch(StoreAction::ReplaceTemplates(templates));
                Ok(Some(count))
            }
            Err(error) => {
                self.notifier
                    .error(format!("Could not load templates: {error}"));
                Err(error.into())
            }
        }
    }

    /// Selects a template and loads its key options. Returns `None` when a
    /// newer selection of the same template superseded this fetch.
    pub async fn select_template(
        &self,
        template_id: &str,
    ) -> Result<Option<Vec<KeyOption>>, ReportError> {
        let known = self.store.read(|store| {
            store
                .templates()
                .iter()
                .any(|template| template.id == template_id)
        });
        if !known {
            return Err(ReportError::UnknownTemplate(template_id.to_string()));
        }
        self.store
            .dispatch(StoreAction::SelectTemplate(Some(template_id.to_string())));

        let token = {
            let mut state = lock(&self.state);
            state.discovery_fence.invalidate();
            state.discovering = false;
            state.discovery = None;
            state.key_fence.issue(template_id.to_string())
        };

        let result = self.api.fetch_key_options(template_id).await;

        let key = template_id.to_string();
        let mut state = lock(&self.state);
        let Some(result) = state.key_fence.admit(&key, token, result) else {
            tracing::debug!(template_id, "discarding superseded key options");
            return Ok(None);
        };
        match result {
            Ok(options) => {
                state.key_options.insert(key, options.clone());
                Ok(Some(options))
            }
            Err(error) => {
                drop(state);
                self.notifier
                    .error(format!("Could not load key options: {error}"));
                Err(error.into())
            }
        }
    }

    #[must_use]
    pub fn key_options(&self, template_id: &str) -> Vec<KeyOption> {
        lock(&self.state)
            .key_options
            .get(template_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Removes the template locally, then confirms with the backend; the
    /// list is restored if the backend refuses. Callers confirm with the user
    /// before invoking this.
    pub async fn delete_template(&self, template_id: &str) -> Result<(), ReportError> {
        let snapshot = self.store.read(|store| store.templates().to_vec());
        if !snapshot.iter().any(|template| template.id == template_id) {
            return Err(ReportError::UnknownTemplate(template_id.to_string()));
        }

        self.store
            .dispatch(StoreAction::RemoveTemplate(template_id.to_string()));

        match self.api.delete_template(template_id).await {
            Ok(()) => {
                self.notifier.success("Template deleted");
                Ok(())
            }
            Err(error) => {
                self.store.dispatch(StoreAction::RestoreTemplates(snapshot));
                self.notifier
                    .error(format!("Could not delete template: {error}"));
                Err(error.into())
            }
        }
    }

    /// Finds candidate batches for the selected template and connection.
    /// Returns `None` when superseded by a newer discovery or selection.
    pub async fn discover(
        &self,
        range: DateRange,
        keys: Vec<String>,
    ) -> Result<Option<usize>, ReportError> {
        let (template_id, connection_id) = self.store.read(|store| {
            let template = store
                .selected_template()
                .map(|template| template.id.clone())
                .ok_or(ReportError::NoTemplate)?;
            let connection = store
                .selected_connection()
                .ok_or(ReportError::NoConnection)?
                .identity
                .resolve(self.mode)?
                .to_string();
            Ok::<_, ReportError>((template, connection))
        })
        .inspect_err(|error| self.notifier.error(error.to_string()))?;

        let request = DiscoveryRequest {
            template_id,
            connection_id,
            range,
            keys,
        };
        let token = {
            let mut state = lock(&self.state);
            state.discovering = true;
            state.discovery_fence.issue()
        };

        let result = self.api.discover_batches(&request).await;

        let mut state = lock(&self.state);
        let Some(result) = state.discovery_fence.admit(token, result) else {
            tracing::debug!("discarding superseded discovery result");
            return Ok(None);
        };
        state.discovering = false;
        match result {
            Ok(mut batches) => {
                for batch in &mut batches {
                    batch.selected = true;
                }
                let count = batches.len();
                state.discovery = Some(DiscoveryResult { request, batches });
                Ok(Some(count))
            }
            Err(error) => {
                state.discovery = None;
                drop(state);
                self.notifier.error(format!("Discovery failed: {error}"));
                Err(error.into())
            }
        }
    }

    #[must_use]
    pub fn discovery(&self) -> Option<DiscoveryResult> {
        lock(&self.state).discovery.clone()
    }

    #[must_use]
    pub fn is_discovering(&self) -> bool {
        lock(&self.state).discovering
    }

    #[must_use]
    pub fn is_loading_templates(&self) -> bool {
        lock(&self.state).loading_templates
    }

    pub fn toggle_batch(&self, batch_id: &str) -> bool {
        lock(&self.state)
            .discovery
            .as_mut()
            .is_some_and(|discovery| discovery.toggle(batch_id))
    }

    pub fn select_all(&self, selected: bool) {
        if let Some(discovery) = lock(&self.state).discovery.as_mut() {
            discovery.select_all(selected);
        }
    }

    /// Starts a run over the selected batches and tracks it as a job.
    pub async fn run(&self, name: Option<String>) -> Result<GenerationJob, ReportError> {
        let (request, job_id) = {
            let mut state = lock(&self.state);
            let discovery = state.discovery.as_ref().ok_or(ReportError::NoDiscovery)?;
            let batch_ids = discovery.selected_ids();
            if batch_ids.is_empty() {
                return Err(ReportError::NothingSelected);
            }
            let request = RunRequest {
                template_id: discovery.request.template_id.clone(),
                connection_id: discovery.request.connection_id.clone(),
                range: discovery.request.range,
                batch_ids,
            };
            let label = name.unwrap_or_else(|| {
                self.store
                    .read(|store| store.selected_template().map(|t| t.name.clone()))
                    .unwrap_or_else(|| request.template_id.clone())
            });
            let job_id = state.jobs.start(label);
            (request, job_id)
        };

        let result = self.api.run_report(&request).await;

        let mut state = lock(&self.state);
        match result {
            Ok(receipt) => {
                state.jobs.attach_backend(&job_id, &receipt.job_id);
                state.jobs.apply(&job_id, &receipt);
            }
            Err(error) => {
                state.jobs.fail(&job_id, error.message());
            }
        }
        let job = state
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or(ReportError::NoDiscovery)?;
        drop(state);

        if job.status == JobStatus::Running {
            self.notifier.info(format!("{} started", job.name));
        } else {
            self.announce(&job);
        }
        Ok(job)
    }

    fn announce(&self, job: &GenerationJob) {
        match job.status {
            JobStatus::Complete => {
                self.store.dispatch(StoreAction::RecordDownload(Download {
                    job_id: job.id.clone(),
                    name: job.name.clone(),
                    artifacts: job.artifacts.clone(),
                }));
                self.notifier.success(format!("{} is ready", job.name));
            }
            JobStatus::Failed => {
                self.notifier.error(format!(
                    "{} failed: {}",
                    job.name,
                    job.error.as_deref().unwrap_or("unknown error")
                ));
            }
            JobStatus::Running => {}
        }
    }

    /// Applies a later status update for a job that was still running.
    pub fn apply_receipt(&self, job_id: &str, receipt: &RunReceipt) -> Option<GenerationJob> {
        let (job, finished) = {
            let mut state = lock(&self.state);
            let finished = state.jobs.apply(job_id, receipt);
            (state.jobs.get(job_id).cloned()?, finished)
        };
        if finished {
            self.announce(&job);
        }
        Some(job)
    }

    #[must_use]
    pub fn has_running_jobs(&self) -> bool {
        lock(&self.state)
            .jobs
            .jobs()
            .iter()
            .any(|job| job.status == JobStatus::Running && job.backend_id.is_some())
    }

    /// Asks the backend about every running job once. Returns how many of the
    /// polled jobs have finished. A failed poll leaves the job running for
    /// the next round.
    pub async fn poll_jobs(&self) -> usize {
        let running: Vec<(String, String)> = lock(&self.state)
            .jobs
            .jobs()
            .iter()
            .filter(|job| job.status == JobStatus::Running)
            .filter_map(|job| Some((job.id.clone(), job.backend_id.clone()?)))
            .collect();

        let mut finished = 0;
        for (job_id, backend_id) in running {
            match self.api.job_status(&backend_id).await {
                Ok(receipt) => {
                    if self
                        .apply_receipt(&job_id, &receipt)
                        .is_some_and(|job| job.status != JobStatus::Running)
                    {
                        finished += 1;
                    }
                }
                Err(error) => {
                    tracing::warn!(%error, job = %backend_id, "job status poll failed");
                }
            }
        }
        finished
    }

    #[must_use]
    pub fn jobs(&self) -> Vec<GenerationJob> {
        lock(&self.state).jobs.jobs().to_vec()
    }
}
