use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::connections::{ConnectionRecord, ConnectionStatus};
use crate::identity::{LocalId, RemoteId};
use crate::reports::{Download, ReportTemplate};

/// Locks a coordinator mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastUsed {
    #[serde(default)]
    pub connection: Option<LocalId>,
    #[serde(default)]
    pub template: Option<String>,
}

/// The persisted part of the store; also the cache blob layout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    #[serde(default)]
    pub connections: Vec<ConnectionRecord>,
    #[serde(default)]
    pub templates: Vec<ReportTemplate>,
    #[serde(default)]
    pub last_used: LastUsed,
}

impl StoreSnapshot {
    /// Dedupes by id (first occurrence wins), normalizes each record and drops
    /// dangling last-used pointers.
    pub fn normalize(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.connections
            .retain(|record| seen.insert(record.identity.local.clone()));
        for record in &mut self.connections {
            record.normalize();
        }

        let mut seen = std::collections::HashSet::new();
        self.templates.retain(|template| seen.insert(template.id.clone()));

        if let Some(connection) = &self.last_used.connection {
            if !self
                .connections
                .iter()
                .any(|record| &record.identity.local == connection)
            {
                self.last_used.connection = None;
            }
        }
        if let Some(template) = &self.last_used.template {
            if !self.templates.iter().any(|known| &known.id == template) {
                self.last_used.template = None;
            }
        }
    }

    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.normalize();
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreAction {
    UpsertConnection(ConnectionRecord),
    RemoveConnections(Vec<LocalId>),
    /// Replaces the whole list; used to roll back optimistic removals.
    RestoreConnections(Vec<ConnectionRecord>),
    BackfillRemoteId {
        local: LocalId,
        remote: RemoteId,
    },
    RecordHealth {
        local: LocalId,
        status: ConnectionStatus,
        latency_ms: Option<u64>,
        at: Option<DateTime<Utc>>,
    },
    SelectConnection(Option<LocalId>),
    ReplaceTemplates(Vec<ReportTemplate>),
    RemoveTemplate(String),
    RestoreTemplates(Vec<ReportTemplate>),
    SelectTemplate(Option<String>),
    RecordDownload(Download),
}

impl StoreAction {
    fn touches_persisted_state(&self) -> bool {
        !matches!(self, Self::RecordDownload(_))
    }
}

/// Receives the full snapshot after every persisted-state change.
pub trait StoreSubscriber: Send {
    fn on_change(&mut self, snapshot: &StoreSnapshot);
}

pub struct AppStore {
    state: StoreSnapshot,
    downloads: Vec<Download>,
    subscribers: Vec<Box<dyn StoreSubscriber>>,
}

impl std::fmt::Debug for AppStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppStore")
            .field("state", &self.state)
            .field("downloads", &self.downloads)
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

impl AppStore {
    #[must_use]
    pub fn new(initial: StoreSnapshot) -> Self {
        Self {
            state: initial.normalized(),
            downloads: Vec::new(),
            subscribers: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, subscriber: Box<dyn StoreSubscriber>) {
        self.subscribers.push(subscriber);
    }

    #[must_use]
    pub fn snapshot(&self) -> &StoreSnapshot {
        &self.state
    }

    #[must_use]
    pub fn connections(&self) -> &[ConnectionRecord] {
        &self.state.connections
    }

    #[must_use]
    pub fn connection(&self, local: &LocalId) -> Option<&ConnectionRecord> {
        self.state
            .connections
            .iter()
            .find(|record| &record.identity.local == local)
    }

    #[must_use]
    pub fn selected_connection(&self) -> Option<&ConnectionRecord> {
        self.state
            .last_used
            .connection
            .as_ref()
            .and_then(|local| self.connection(local))
    }

    #[must_use]
    pub fn templates(&self) -> &[ReportTemplate] {
        &self.state.templates
    }

    #[must_use]
    pub fn selected_template(&self) -> Option<&ReportTemplate> {
        let selected = self.state.last_used.template.as_ref()?;
        self.state
            .templates
            .iter()
            .find(|template| &template.id == selected)
    }

    #[must_use]
    pub fn downloads(&self) -> &[Download] {
        &self.downloads
    }

    /// Applies the action and notifies subscribers if persisted state
    /// changed. Returns whether anything changed.
    pub fn dispatch(&mut self, action: StoreAction) -> bool {
        let persists = action.touches_persisted_state();
        let changed = self.reduce(action);
        if changed && persists {
            for subscriber in &mut self.subscribers {
                subscriber.on_change(&self.state);
            }
        }
        changed
    }

    fn reduce(&mut self, action: StoreAction) -> bool {
        let state = &mut self.state;
        match action {
            StoreAction::UpsertConnection(mut record) => {
                record.normalize();
                if let Some(existing) = state
                    .connections
                    .iter_mut()
                    .find(|existing| existing.identity.local == record.identity.local)
                {
                    if *existing == record {
                        return false;
                    }
                    *existing = record;
                } else {
                    state.connections.push(record);
                }
                true
            }
            StoreAction::RemoveConnections(ids) => {
                let before = state.connections.len();
                state
                    .connections
                    .retain(|record| !ids.contains(&record.identity.local));
                if state
                    .last_used
                    .connection
                    .as_ref()
                    .is_some_and(|selected| ids.contains(selected))
                {
                    state.last_used.connection = None;
                }
                state.connections.len() != before
            }
            StoreAction::RestoreConnections(records) => {
                if state.connections == records {
                    return false;
                }
                state.connections = records;
                true
            }
            StoreAction::BackfillRemoteId { local, remote } => state
                .connections
                .iter_mut()
                .find(|record| record.identity.local == local)
                .is_some_and(|record| record.identity.backfill(remote)),
            StoreAction::RecordHealth {
                local,
                status,
                latency_ms,
                at,
            } => {
                let Some(record) = state
                    .connections
                    .iter_mut()
                    .find(|record| record.identity.local == local)
                else {
                    return false;
                };
                record.status = status;
                if latency_ms.is_some() {
                    record.last_latency_ms = latency_ms;
                }
                if at.is_some() {
                    record.last_connected = at;
                }
                true
            }
            StoreAction::SelectConnection(local) => {
                if local.as_ref().is_some_and(|id| {
                    !state
                        .connections
                        .iter()
                        .any(|record| &record.identity.local == id)
                }) {
                    return false;
                }
                if state.last_used.connection == local {
                    return false;
                }
                state.last_used.connection = local;
                true
            }
            StoreAction::ReplaceTemplates(templates) => {
                if state.templates == templates {
                    return false;
                }
                state.templates = templates;
                if let Some(selected) = &state.last_used.template {
                    if !state.templates.iter().any(|template| &template.id == selected) {
                        state.last_used.template = None;
                    }
                }
                true
            }
            StoreAction::RemoveTemplate(id) => {
                let before = state.templates.len();
                state.templates.retain(|template| template.id != id);
                if state.last_used.template.as_deref() == Some(id.as_str()) {
                    state.last_used.template = None;
                }
                state.templates.len() != before
            }
            StoreAction::RestoreTemplates(templates) => {
                if state.templates == templates {
                    return false;
                }
                state.templates = templates;
                true
            }
            StoreAction::SelectTemplate(id) => {
                if state.last_used.template == id {
                    return false;
                }
                state.last_used.template = id;
                true
            }
            StoreAction::RecordDownload(download) => {
                self.downloads.push(download);
                true
            }
        }
    }
}

/// Cloneable handle to the one store every coordinator shares.
#[derive(Debug, Clone)]
pub struct SharedStore {
    inner: Arc<Mutex<AppStore>>,
}

impl SharedStore {
    #[must_use]
    pub fn new(store: AppStore) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    pub fn dispatch(&self, action: StoreAction) -> bool {
        lock(&self.inner).dispatch(action)
    }

    pub fn read<R>(&self, reader: impl FnOnce(&AppStore) -> R) -> R {
        reader(&lock(&self.inner))
    }

    #[must_use]
    pub fn snapshot(&self) -> StoreSnapshot {
        self.read(|store| store.snapshot().clone())
    }

    pub fn subscribe(&self, subscriber: Box<dyn StoreSubscriber>) {
        lock(&self.inner).subscribe(subscriber);
    }
}
