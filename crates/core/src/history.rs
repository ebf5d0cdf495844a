//! Report run history with deferred, undoable bulk deletion.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::api::{ApiError, SharedApi};
use crate::fencing::RequestFence;
use crate::notices::Notifier;
use crate::optimistic::{wait_grace, GraceOutcome, MutationSlot};
use crate::reports::ArtifactUrls;
use crate::store::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    Completed,
    Failed,
    Running,
    Pending,
    Cancelled,
}

impl HistoryStatus {
    #[must_use]
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for HistoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Running => "running",
            Self::Pending => "pending",
            Self::Cancelled => "cancelled",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: String,
    #[serde(alias = "name")]
    pub template_name: String,
    pub status: HistoryStatus,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub artifacts: ArtifactUrls,
    #[serde(default)]
    pub error: Option<String>,
}

/// Per-id result of a bulk delete, as reported by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkDeleteOutcome {
    #[serde(default)]
    pub deleted: Vec<String>,
    #[serde(default)]
    pub failed: Vec<String>,
}

/// How a scheduled bulk delete ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Undone, or folded into a newer batch before the window elapsed.
    Cancelled,
    Committed { deleted: usize, failed: usize },
    Failed(ApiError),
}

#[derive(Debug, Default)]
struct HistoryState {
    records: Vec<HistoryRecord>,
    fence: RequestFence,
    loading: bool,
    pending: MutationSlot<HistoryRecord>,
}

impl HistoryState {
    fn pending_ids(&self) -> HashSet<String> {
        self.pending
            .current()
            .map(|pending| pending.ids().iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Puts records a failed commit hands back into the list and into the
    /// undo snapshot of any batch staged while that commit was running.
    fn put_back(&mut self, snapshot: &[HistoryRecord], ids: &HashSet<String>) {
        reinstate(&mut self.records, snapshot, ids);
        if let Some(staged) = self.pending.staged_snapshot_mut() {
            reinstate(staged, snapshot, ids);
        }
    }
}

/// Puts `ids` back from `snapshot`, keeping snapshot order and any records
/// that arrived since.
fn reinstate(records: &mut Vec<HistoryRecord>, snapshot: &[HistoryRecord], ids: &HashSet<String>) {
    let merged = {
        let present: HashSet<&str> = records.iter().map(|r| r.id.as_str()).collect();
        let known: HashSet<&str> = snapshot.iter().map(|r| r.id.as_str()).collect();

        let mut merged: Vec<HistoryRecord> = snapshot
            .iter()
            .filter(|record| present.contains(record.id.as_str()) || ids.contains(&record.id))
            .cloned()
            .collect();
        merged.extend(
            records
                .iter()
                .filter(|record| !known.contains(record.id.as_str()))
                .cloned(),
        );
        merged
    };
    *records = merged;
}

#[derive(Clone)]
pub struct HistoryCoordinator {
    api: SharedApi,
    notifier: Notifier,
    undo_window: Duration,
    state: Arc<Mutex<HistoryState>>,
}

impl HistoryCoordinator {
    #[must_use]
    pub fn new(api: SharedApi, notifier: Notifier, undo_window: Duration) -> Self {
        Self {
            api,
            notifier,
            undo_window,
            state: Arc::new(Mutex::new(HistoryState::default())),
        }
    }

    #[must_use]
    pub fn records(&self) -> Vec<HistoryRecord> {
        lock(&self.state).records.clone()
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        lock(&self.state).loading
    }

    #[must_use]
    pub fn has_undoable(&self) -> bool {
        lock(&self.state).pending.has_undoable()
    }

    /// Reloads the list from the backend. Records with a delete still pending
    /// stay hidden. Returns `false` when a newer refresh superseded this one.
    pub async fn refresh(&self) -> Result<bool, ApiError> {
        let token = {
            let mut state = lock(&self.state);
            state.loading = true;
            state.fence.issue()
        };

        let result = self.api.list_history().await;

        let mut state = lock(&self.state);
        let Some(result) = state.fence.admit(token, result) else {
            tracing::debug!("discarding superseded history list");
            return Ok(false);
        };
        state.loading = false;
        match result {
            Ok(records) => {
                let hidden = state.pending_ids();
                state.records = records
                    .into_iter()
                    .filter(|record| !hidden.contains(&record.id))
                    .collect();
                Ok(true)
            }
            Err(error) => {
                drop(state);
                self.notifier
                    .error(format!("Could not load history: {error}"));
                Err(error)
            }
        }
    }

    /// Removes the records locally and schedules the remote delete after the
    /// undo window. Returns `None` when none of the ids are listed.
    pub fn delete_records(&self, ids: &[String]) -> Option<JoinHandle<CommitOutcome>> {
        let (batch, token, count) = {
            let mut state = lock(&self.state);
            let ids: Vec<String> = ids
                .iter()
                .filter(|id| state.records.iter().any(|record| &record.id == *id))
                .cloned()
                .collect();
            if ids.is_empty() {
                return None;
            }

            let snapshot = state.records.clone();
            let removing: HashSet<&String> = ids.iter().collect();
            state.records.retain(|record| !removing.contains(&record.id));
            let count = ids.len();
            let pending = state.pending.stage(ids, snapshot);
            (pending.batch(), pending.token(), count)
        };

        tracing::debug!(batch = batch.value(), count, "history delete staged");
        self.notifier.undoable(format!(
            "Removed {count} {}",
            if count == 1 { "report" } else { "reports" }
        ));

        let coordinator = self.clone();
        Some(tokio::spawn(async move {
            if wait_grace(coordinator.undo_window, &token).await == GraceOutcome::Cancelled {
                return CommitOutcome::Cancelled;
            }
            coordinator.commit(batch).await
        }))
    }

    async fn commit(&self, batch: crate::optimistic::BatchId) -> CommitOutcome {
        let (ids, snapshot) = {
            let mut state = lock(&self.state);
            let Some(snapshot) = state.pending.snapshot_of(batch).map(<[_]>::to_vec) else {
                return CommitOutcome::Cancelled;
            };
            let Some(ids) = state.pending.begin_commit(batch) else {
                return CommitOutcome::Cancelled;
            };
            (ids, snapshot)
        };

        let result = self.api.delete_history(&ids).await;

        let mut state = lock(&self.state);
        match result {
            Ok(outcome) if outcome.deleted.is_empty() && !outcome.failed.is_empty() => {
                state.pending.finish_commit(batch, false);
                let failed: HashSet<String> = ids.iter().cloned().collect();
                state.put_back(&snapshot, &failed);
                drop(state);
                tracing::warn!(failed = outcome.failed.len(), "history delete rejected");
                self.notifier
                    .error(format!("Could not delete {} reports", outcome.failed.len()));
                CommitOutcome::Committed {
                    deleted: 0,
                    failed: outcome.failed.len(),
                }
            }
            Ok(outcome) => {
                state.pending.finish_commit(batch, true);
                let deleted = outcome.deleted.len();
                let failed = outcome.failed.len();
                if failed == 0 {
                    drop(state);
                    tracing::info!(deleted, "history delete committed");
                    self.notifier.success(format!("Deleted {deleted}"));
                } else {
                    let failed_ids: HashSet<String> = outcome.failed.into_iter().collect();
                    state.put_back(&snapshot, &failed_ids);
                    drop(state);
                    tracing::warn!(deleted, failed, "history delete partially failed");
                    self.notifier
                        .warning(format!("Deleted {deleted}, failed {failed}"));
                }
                CommitOutcome::Committed { deleted, failed }
            }
            Err(error) => {
                state.pending.finish_commit(batch, false);
                let all: HashSet<String> = ids.iter().cloned().collect();
                state.put_back(&snapshot, &all);
                drop(state);
                tracing::warn!(%error, "history delete failed");
                self.notifier
                    .error(format!("Could not delete reports: {error}"));
                CommitOutcome::Failed(error)
            }
        }
    }

    /// Cancels the pending delete and restores the list exactly as it was.
    pub fn undo(&self) -> bool {
        let mut state = lock(&self.state);
        let Some(snapshot) = state.pending.undo() else {
            return false;
        };
        state.records = snapshot;
        drop(state);
        self.notifier.info("Reports restored");
        true
    }
}
