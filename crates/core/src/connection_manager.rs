use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;

use crate::api::{ApiError, ConnectionTestOutcome, SharedApi};
use crate::connections::{ConnectionDraft, ConnectionRecord, ConnectionStatus, DbType, SaveGate};
use crate::credentials::SharedVault;
use crate::debounce::Debouncer;
use crate::fencing::KeyedFence;
use crate::identity::{ApiMode, ConnectionIdentity, IdentityError, LocalId, RemoteId};
use crate::notices::Notifier;
use crate::schema::{SchemaCatalog, SchemaError, SchemaLoader};
use crate::store::{lock, SharedStore, StoreAction};
use crate::validation::{
    is_duplicate_name, validate_draft, Field, FieldError, FieldErrorKind, ValidationReport,
};

#[derive(Debug, Error)]
pub enum ConnectionManagerError {
    #[error("unknown connection `{0}`")]
    UnknownConnection(LocalId),
    #[error("{} field(s) need attention", .0.len())]
    Invalid(ValidationReport),
    #[error("test the current settings successfully before saving")]
    NotTested,
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("backend request failed: {0}")]
    Api(#[from] ApiError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Read-only picture of the connection form for rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormView {
    pub draft: ConnectionDraft,
    pub editing: Option<LocalId>,
    pub errors: Vec<FieldError>,
    pub focus: Option<Field>,
    pub status: ConnectionStatus,
    pub latency_ms: Option<u64>,
    pub can_save: bool,
    pub testing: bool,
    pub saving: bool,
}

#[derive(Debug)]
struct FormState {
    draft: ConnectionDraft,
    editing: Option<LocalId>,
    /// Saved name of the record being edited.
    original_name: Option<String>,
    duplicate: bool,
    report: ValidationReport,
    focus: Option<Field>,
    gate: SaveGate,
    latency_ms: Option<u64>,
    /// Backend id reported by a test before the record was ever saved.
    learned_remote: Option<RemoteId>,
    testing: bool,
    saving: bool,
    name_check: Debouncer,
}

impl FormState {
    fn new(name_debounce: Duration) -> Self {
        Self {
            draft: ConnectionDraft::default(),
            editing: None,
            original_name: None,
            duplicate: false,
            report: ValidationReport::default(),
            focus: None,
            gate: SaveGate::default(),
            latency_ms: None,
            learned_remote: None,
            testing: false,
            saving: false,
            name_check: Debouncer::new(name_debounce),
        }
    }

    fn load(&mut self, draft: ConnectionDraft, editing: Option<LocalId>) {
        self.name_check.cancel();
        self.original_name = editing.as_ref().map(|_| draft.name.clone());
        self.draft = draft;
        self.editing = editing;
        self.duplicate = false;
        self.focus = None;
        self.gate.reset();
        self.latency_ms = None;
        self.learned_remote = None;
        self.revalidate();
    }

    fn revalidate(&mut self) {
        self.report = validate_draft(&self.draft).err().unwrap_or_default();
        if self.duplicate {
            self.report.insert(Field::Name, FieldErrorKind::Duplicate);
        }
    }

    /// Full report for a submit attempt; moves focus to the first bad field.
    fn check_submit(&mut self) -> Result<(), ValidationReport> {
        self.revalidate();
        if self.report.is_valid() {
            self.focus = None;
            Ok(())
        } else {
            self.focus = self.report.first_invalid();
            Err(self.report.clone())
        }
    }
}

/// Connection form plus the list-level actions on saved connections.
#[derive(Clone)]
pub struct ConnectionManager {
    api: SharedApi,
    store: SharedStore,
    vault: SharedVault,
    schema: SchemaLoader,
    notifier: Notifier,
    mode: ApiMode,
    form: Arc<Mutex<FormState>>,
    health_fence: Arc<Mutex<KeyedFence<LocalId>>>,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(
        api: SharedApi,
        store: SharedStore,
        vault: SharedVault,
        schema: SchemaLoader,
        notifier: Notifier,
        mode: ApiMode,
        name_debounce: Duration,
    ) -> Self {
        Self {
            api,
            store,
            vault,
            schema,
            notifier,
            mode,
            form: Arc::new(Mutex::new(FormState::new(name_debounce))),
            health_fence: Arc::new(Mutex::new(KeyedFence::new())),
        }
    }

    #[must_use]
    pub fn schema(&self) -> &SchemaLoader {
        &self.schema
    }

    #[must_use]
    pub fn form_view(&self) -> FormView {
        let form = lock(&self.form);
        let signature = form.draft.signature();
        FormView {
            draft: form.draft.clone(),
            editing: form.editing.clone(),
            errors: form.report.errors().collect(),
            focus: form.focus,
            status: form.gate.status(),
            latency_ms: form.latency_ms,
            can_save: form.report.is_valid() && form.gate.can_save(&signature),
            testing: form.testing,
            saving: form.saving,
        }
    }

    pub fn new_connection(&self) {
        lock(&self.form).load(ConnectionDraft::default(), None);
    }

    /// Loads a saved record into the form. The password comes from the vault.
    pub fn edit_connection(&self, local: &LocalId) -> Result<(), ConnectionManagerError> {
        let mut record = self
            .store
            .read(|store| store.connection(local).cloned())
            .ok_or_else(|| ConnectionManagerError::UnknownConnection(local.clone()))?;
        if record.password.is_none() && !record.db_type.is_file_based() {
            match self.vault.load(local) {
                Ok(secret) => record.password = secret,
                Err(error) => tracing::warn!(%error, id = %local, "password lookup failed"),
            }
        }
        lock(&self.form).load(ConnectionDraft::from_record(&record), Some(local.clone()));
        Ok(())
    }

    pub fn set_db_type(&self, db_type: Option<DbType>) {
        let mut form = lock(&self.form);
        if form.draft.db_type == db_type {
            return;
        }
        form.draft.db_type = db_type;
        form.revalidate();
    }

    /// Updates one text field and re-validates. Name changes schedule the
    /// debounced duplicate check.
    pub fn set_field(&self, field: Field, value: impl Into<String>) {
        let value = value.into();
        let mut form = lock(&self.form);
        match field {
            Field::Name => form.draft.name = value,
            Field::DbType => {
                let parsed = value.parse::<DbType>().ok();
                form.draft.db_type = parsed;
            }
            Field::Host => form.draft.host = value,
            Field::Port => form.draft.port = value,
            Field::Database => form.draft.database = value,
            Field::Username => form.draft.username = value,
            Field::Password => form.draft.password = value,
        }
        form.revalidate();

        if field == Field::Name {
            let manager = self.clone();
            form.name_check.schedule(async move {
                manager.check_duplicate_name();
            });
        }
    }

    fn name_taken(&self, form: &FormState) -> bool {
        let editing = form
            .editing
            .as_ref()
            .zip(form.original_name.as_deref());
        self.store.read(|store| {
            is_duplicate_name(
                &form.draft.name,
                store
                    .connections()
                    .iter()
                    .map(|record| (record.local_id(), record.name.as_str())),
                editing,
            )
        })
    }

    fn check_duplicate_name(&self) {
        let mut form = lock(&self.form);
        let duplicate = self.name_taken(&form);
        if form.duplicate != duplicate {
            tracing::debug!(duplicate, "duplicate-name check settled");
            form.duplicate = duplicate;
            form.revalidate();
        }
    }

    /// Runs the pending duplicate-name check now so a submit never races the
    /// debounce.
    fn settle_name_check(&self, form: &mut FormState) {
        form.name_check.cancel();
        form.duplicate = self.name_taken(form);
    }

    fn blocked(&self, report: ValidationReport) -> ConnectionManagerError {
        if let Some(field) = report.first_invalid() {
            self.notifier.error(format!(
                "Fix {} before continuing",
                field.label().to_lowercase()
            ));
        }
        ConnectionManagerError::Invalid(report)
    }

    /// Tests the current form. Only the configuration captured here becomes
    /// saveable; later edits invalidate it.
    pub async fn test(&self) -> Result<ConnectionTestOutcome, ConnectionManagerError> {
        let (payload, signature, editing) = {
            let mut form = lock(&self.form);
            self.settle_name_check(&mut form);
            if let Err(report) = form.check_submit() {
                drop(form);
                return Err(self.blocked(report));
            }
            let payload = validate_draft(&form.draft).map_err(ConnectionManagerError::Invalid)?;
            form.testing = true;
            (payload, form.draft.signature(), form.editing.clone())
        };

        let result = self.api.test_connection(&payload).await;

        let mut form = lock(&self.form);
        form.testing = false;
        match result {
            Ok(outcome) => {
                form.gate.record_test(signature, outcome.ok);
                form.latency_ms = outcome.latency_ms;
                let remote = outcome
                    .backend_connection_id
                    .as_deref()
                    .map(RemoteId::new);
                if editing.is_none() {
                    if let Some(remote) = &remote {
                        form.learned_remote = Some(remote.clone());
                    }
                }
                drop(form);

                if let Some(local) = editing {
                    if let Some(remote) = remote {
                        self.store
                            .dispatch(StoreAction::BackfillRemoteId {
                                local: local.clone(),
                                remote,
                            });
                    }
                    self.store.dispatch(StoreAction::RecordHealth {
                        local,
                        status: if outcome.ok {
                            ConnectionStatus::Connected
                        } else {
                            ConnectionStatus::Failed
                        },
                        latency_ms: outcome.latency_ms,
                        at: outcome.ok.then(Utc::now),
                    });
                }

                if outcome.ok {
                    self.notifier.success(match outcome.latency_ms {
                        Some(ms) => format!("Connection OK ({ms} ms)"),
                        None => "Connection OK".to_string(),
                    });
                } else {
                    self.notifier.error(format!(
                        "Connection failed: {}",
                        outcome.message.as_deref().unwrap_or("no details")
                    ));
                }
                Ok(outcome)
            }
            Err(error) => {
                form.gate.record_test(signature, false);
                form.latency_ms = None;
                drop(form);
                self.notifier
                    .error(format!("Connection test failed: {error}"));
                Err(error.into())
            }
        }
    }

    /// Saves the tested configuration, selects it and stores the password in
    /// the vault.
    pub async fn save(&self) -> Result<LocalId, ConnectionManagerError> {
        let (payload, editing, remote, latency_ms) = {
            let mut form = lock(&self.form);
            self.settle_name_check(&mut form);
            if let Err(report) = form.check_submit() {
                drop(form);
                return Err(self.blocked(report));
            }
            let signature = form.draft.signature();
            if !form.gate.can_save(&signature) {
                drop(form);
                self.notifier.error("Test the connection before saving");
                return Err(ConnectionManagerError::NotTested);
            }
            let payload = validate_draft(&form.draft).map_err(ConnectionManagerError::Invalid)?;
            let existing_remote = form.editing.as_ref().and_then(|local| {
                self.store
                    .read(|store| store.connection(local).and_then(|r| r.identity.remote.clone()))
            });
            form.saving = true;
            (
                payload,
                form.editing.clone(),
                existing_remote.or_else(|| form.learned_remote.clone()),
                form.latency_ms,
            )
        };

        let result = self
            .api
            .save_connection(&payload, remote.as_ref().map(RemoteId::as_str))
            .await;

        let saved = match result {
            Ok(saved) => saved,
            Err(error) => {
                lock(&self.form).saving = false;
                self.notifier
                    .error(format!("Could not save connection: {error}"));
                return Err(error.into());
            }
        };

        let local = editing.unwrap_or_else(LocalId::generate);
        let identity = ConnectionIdentity::new(local.clone())
            .with_remote(RemoteId::new(saved.backend_connection_id));
        let mut record = ConnectionRecord::from_payload(identity, &payload);
        record.status = ConnectionStatus::Connected;
        record.last_latency_ms = latency_ms;
        record.last_connected = Some(Utc::now());

        if let Some(password) = payload.password.as_deref().filter(|pw| !pw.is_empty()) {
            if let Err(error) = self.vault.store(&local, password) {
                tracing::warn!(%error, id = %local, "password not stored");
                self.notifier
                    .warning(format!("Password kept for this session only: {error}"));
            }
        }

        self.store.dispatch(StoreAction::UpsertConnection(record));
        self.store
            .dispatch(StoreAction::SelectConnection(Some(local.clone())));
        {
            let mut form = lock(&self.form);
            form.saving = false;
            form.editing = Some(local.clone());
            form.original_name = Some(payload.name.clone());
            form.learned_remote = None;
        }
        tracing::info!(id = %local, "connection saved");
        self.notifier.success(format!("Saved {}", payload.name));
        Ok(local)
    }

    /// Removes the record immediately and confirms with the backend; the list
    /// is put back if the backend refuses. Callers confirm with the user
    /// before invoking this.
    pub async fn delete(&self, local: &LocalId) -> Result<(), ConnectionManagerError> {
        let (record, snapshot, selected) = self
            .store
            .read(|store| {
                store.connection(local).cloned().map(|record| {
                    (
                        record,
                        store.connections().to_vec(),
                        store.snapshot().last_used.connection.clone(),
                    )
                })
            })
            .ok_or_else(|| ConnectionManagerError::UnknownConnection(local.clone()))?;
        let remote_id = match record.identity.resolve(self.mode) {
            Ok(remote_id) => remote_id.to_string(),
            Err(error) => {
                self.notifier.error(error.to_string());
                return Err(error.into());
            }
        };

        self.store
            .dispatch(StoreAction::RemoveConnections(vec![local.clone()]));

        match self.api.delete_connection(&remote_id).await {
            Ok(()) => {
                lock(&self.health_fence).forget(local);
                if let Err(error) = self.vault.remove(local) {
                    tracing::warn!(%error, id = %local, "password cleanup failed");
                }
                if selected.as_ref() == Some(local) {
                    self.schema.clear();
                }
                let mut form = lock(&self.form);
                if form.editing.as_ref() == Some(local) {
                    form.load(ConnectionDraft::default(), None);
                }
                drop(form);
                tracing::info!(id = %local, "connection deleted");
                self.notifier.success(format!("Deleted {}", record.name));
                Ok(())
            }
            Err(error) => {
                self.store.dispatch(StoreAction::RestoreConnections(snapshot));
                self.store.dispatch(StoreAction::SelectConnection(selected));
                self.notifier
                    .error(format!("Could not delete {}: {error}", record.name));
                Err(error.into())
            }
        }
    }

    /// Re-probes a saved connection. Status reads `unknown` while the probe
    /// is in flight.
    pub async fn healthcheck(
        &self,
        local: &LocalId,
    ) -> Result<Option<ConnectionTestOutcome>, ConnectionManagerError> {
        let record = self
            .store
            .read(|store| store.connection(local).cloned())
            .ok_or_else(|| ConnectionManagerError::UnknownConnection(local.clone()))?;
        let remote_id = match record.identity.resolve(self.mode) {
            Ok(remote_id) => remote_id.to_string(),
            Err(error) => {
                self.notifier.error(error.to_string());
                return Err(error.into());
            }
        };

        let token = lock(&self.health_fence).issue(local.clone());
        self.store.dispatch(StoreAction::RecordHealth {
            local: local.clone(),
            status: ConnectionStatus::Unknown,
            latency_ms: None,
            at: None,
        });

        let result = self.api.healthcheck(&remote_id).await;

        if !lock(&self.health_fence).is_current(local, token) {
            tracing::debug!(id = %local, "discarding superseded healthcheck");
            return Ok(None);
        }
        match result {
            Ok(outcome) => {
                self.store.dispatch(StoreAction::RecordHealth {
                    local: local.clone(),
                    status: if outcome.ok {
                        ConnectionStatus::Connected
                    } else {
                        ConnectionStatus::Failed
                    },
                    latency_ms: outcome.latency_ms,
                    at: outcome.ok.then(Utc::now),
                });
                if !outcome.ok {
                    self.notifier.warning(format!(
                        "{} is unreachable: {}",
                        record.name,
                        outcome.message.as_deref().unwrap_or("no details")
                    ));
                }
                Ok(Some(outcome))
            }
            Err(error) => {
                self.store.dispatch(StoreAction::RecordHealth {
                    local: local.clone(),
                    status: ConnectionStatus::Failed,
                    latency_ms: None,
                    at: None,
                });
                self.notifier
                    .error(format!("Healthcheck for {} failed: {error}", record.name));
                Err(error.into())
            }
        }
    }

    /// Makes `local` the active connection and loads its schema. A later
    /// selection wins over a slower earlier one.
    pub async fn select(
        &self,
        local: &LocalId,
    ) -> Result<Option<Arc<SchemaCatalog>>, ConnectionManagerError> {
        let record = self
            .store
            .read(|store| store.connection(local).cloned())
            .ok_or_else(|| ConnectionManagerError::UnknownConnection(local.clone()))?;
        self.store
            .dispatch(StoreAction::SelectConnection(Some(local.clone())));
        Ok(self.schema.load(&record).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::{ConnectionManager, ConnectionManagerError};
    use crate::api::{ApiError, ConnectionTestOutcome};
    use crate::connections::{ConnectionStatus, DbType};
    use crate::credentials::{CredentialVault, MemoryVault};
    use crate::identity::{ApiMode, LocalId, RemoteId};
    use crate::notices::{notice_channel, NoticeFeed};
    use crate::schema::{SchemaCatalog, SchemaLoader, TableSchema};
    use crate::store::{lock, AppStore, SharedStore, StoreSnapshot};
    use crate::test_support::{saved_postgres_record, ScriptedApi};
    use crate::validation::{Field, FieldErrorKind};

    struct Harness {
        api: Arc<ScriptedApi>,
        store: SharedStore,
        vault: Arc<MemoryVault>,
        manager: ConnectionManager,
        feed: NoticeFeed,
    }

    fn harness(snapshot: StoreSnapshot) -> Harness {
        let api = Arc::new(ScriptedApi::default());
        let store = SharedStore::new(AppStore::new(snapshot));
        let vault = Arc::new(MemoryVault::new());
        let (notifier, feed) = notice_channel();
        let schema = SchemaLoader::new(
            api.clone(),
            notifier.clone(),
            ApiMode::Live,
            Duration::from_secs(60),
        );
        let manager = ConnectionManager::new(
            api.clone(),
            store.clone(),
            vault.clone(),
            schema,
            notifier,
            ApiMode::Live,
            Duration::from_millis(200),
        );
        Harness {
            api,
            store,
            vault,
            manager,
            feed,
        }
    }

    fn fill_postgres(manager: &ConnectionManager, name: &str) {
        manager.new_connection();
        manager.set_db_type(Some(DbType::Postgres));
        manager.set_field(Field::Name, name);
        manager.set_field(Field::Host, "db.internal");
        manager.set_field(Field::Database, "reports");
        manager.set_field(Field::Username, "reporter");
        manager.set_field(Field::Password, "secret");
    }

    fn two_prod_records() -> StoreSnapshot {
        StoreSnapshot {
            connections: vec![
                saved_postgres_record("local-1", "Prod DB", "r1"),
                saved_postgres_record("local-2", "prod db", "r2"),
            ],
            ..StoreSnapshot::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn case_variant_name_is_flagged_after_debounce() {
        let mut h = harness(two_prod_records());
        fill_postgres(&h.manager, "PROD DB");
        assert!(h.manager.form_view().errors.is_empty());

        tokio::time::sleep(Duration::from_millis(250)).await;
        let view = h.manager.form_view();
        assert_eq!(view.errors.len(), 1);
        assert_eq!(view.errors[0].field, Field::Name);
        assert_eq!(view.errors[0].kind, FieldErrorKind::Duplicate);

        let error = h.manager.test().await.expect_err("duplicate blocks test");
        assert!(matches!(error, ConnectionManagerError::Invalid(_)));
        assert_eq!(h.manager.form_view().focus, Some(Field::Name));
        assert_eq!(h.api.call_count("test_connection"), 0);
        assert!(!h.feed.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn submit_inside_debounce_window_still_rejects_duplicate() {
        let mut h = harness(two_prod_records());
        fill_postgres(&h.manager, "PROD DB");

        let error = h.manager.test().await.expect_err("duplicate blocks test");
        assert!(matches!(error, ConnectionManagerError::Invalid(_)));
        let error = h.manager.save().await.expect_err("duplicate blocks save");
        assert!(matches!(error, ConnectionManagerError::Invalid(_)));

        assert_eq!(h.api.call_count("test_connection"), 0);
        assert_eq!(h.api.call_count("save_connection"), 0);
        assert_eq!(h.store.read(|store| store.connections().len()), 2);
        let view = h.manager.form_view();
        assert_eq!(view.focus, Some(Field::Name));
        assert!(view
            .errors
            .iter()
            .any(|error| error.kind == FieldErrorKind::Duplicate));
        assert!(!h.feed.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn editing_own_record_is_not_a_duplicate() {
        let h = harness(two_prod_records());
        h.vault
            .store(&LocalId::new("local-1"), "secret")
            .expect("vault");
        h.manager
            .edit_connection(&LocalId::new("local-1"))
            .expect("record exists");
        h.manager.set_field(Field::Name, "Prod DB");

        tokio::time::sleep(Duration::from_millis(250)).await;
        let view = h.manager.form_view();
        assert!(view
            .errors
            .iter()
            .all(|error| error.kind != FieldErrorKind::Duplicate));

        h.manager.test().await.expect("own name passes the submit check");
        assert_eq!(h.api.call_count("test_connection"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_typing_runs_one_check() {
        let h = harness(two_prod_records());
        fill_postgres(&h.manager, "P");
        for partial in ["Pr", "Pro", "Prod", "Prod ", "Prod D", "Prod DB"] {
            h.manager.set_field(Field::Name, partial);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(h.manager.form_view().errors.is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.manager.form_view().errors.len(), 1);

        h.manager.set_field(Field::Name, "Staging");
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(h.manager.form_view().errors.is_empty());
    }

    #[tokio::test]
    async fn edit_after_test_invalidates_save() {
        let h = harness(StoreSnapshot::default());
        fill_postgres(&h.manager, "Warehouse");

        h.manager.test().await.expect("test should pass");
        assert!(h.manager.form_view().can_save);

        h.manager.set_field(Field::Host, "db2.internal");
        assert!(!h.manager.form_view().can_save);
        let error = h.manager.save().await.expect_err("save must be blocked");
        assert!(matches!(error, ConnectionManagerError::NotTested));

        h.manager.set_field(Field::Host, "db.internal");
        assert!(h.manager.form_view().can_save);
    }

    #[tokio::test]
    async fn failed_test_never_enables_save() {
        let h = harness(StoreSnapshot::default());
        h.api.set_test_outcome(ConnectionTestOutcome {
            ok: false,
            latency_ms: None,
            backend_connection_id: None,
            message: Some("password authentication failed".to_string()),
        });
        fill_postgres(&h.manager, "Warehouse");

        let outcome = h.manager.test().await.expect("call succeeds");
        assert!(!outcome.ok);
        let view = h.manager.form_view();
        assert_eq!(view.status, ConnectionStatus::Failed);
        assert!(!view.can_save);
    }

    #[tokio::test]
    async fn sqlite_test_sends_no_server_fields() {
        let h = harness(StoreSnapshot::default());
        h.manager.new_connection();
        h.manager.set_db_type(Some(DbType::Sqlite));
        h.manager.set_field(Field::Name, "Local file");
        h.manager.set_field(Field::Database, "C:/data/app.db");
        h.manager.set_field(Field::Host, "ignored");
        h.manager.set_field(Field::Password, "ignored");

        h.manager.test().await.expect("test should pass");
        let payload = h.api.last_test_payload().expect("payload sent");
        assert_eq!(payload.host, None);
        assert_eq!(payload.port, None);
        assert_eq!(payload.username, None);
        assert_eq!(payload.password, None);
        assert_eq!(payload.url, "sqlite:///C:/data/app.db");
    }

    #[tokio::test]
    async fn save_persists_record_with_backend_id_and_vaults_password() {
        let h = harness(StoreSnapshot::default());
        fill_postgres(&h.manager, "Warehouse");
        h.manager.test().await.expect("test");

        let local = h.manager.save().await.expect("save");

        let record = h
            .store
            .read(|store| store.connection(&local).cloned())
            .expect("record stored");
        assert!(record.identity.remote.is_some());
        assert_eq!(record.status, ConnectionStatus::Connected);
        assert_eq!(record.port, Some(5432));
        assert_eq!(
            h.store
                .read(|store| store.selected_connection().map(|r| r.local_id().clone())),
            Some(local.clone())
        );
        assert_eq!(
            h.vault.load(&local).expect("vault").as_deref(),
            Some("secret")
        );
        assert_eq!(h.manager.form_view().editing, Some(local));
    }

    #[tokio::test]
    async fn test_of_saved_record_backfills_backend_id() {
        let mut record = saved_postgres_record("local-1", "Prod DB", "unused");
        record.identity.remote = None;
        let h = harness(StoreSnapshot {
            connections: vec![record],
            ..StoreSnapshot::default()
        });
        h.vault
            .store(&LocalId::new("local-1"), "secret")
            .expect("vault");
        h.api.set_test_outcome(ConnectionTestOutcome {
            ok: true,
            latency_ms: Some(9),
            backend_connection_id: Some("r-77".to_string()),
            message: None,
        });

        h.manager
            .edit_connection(&LocalId::new("local-1"))
            .expect("edit");
        h.manager.test().await.expect("test");

        let stored = h
            .store
            .read(|store| store.connection(&LocalId::new("local-1")).cloned())
            .expect("record");
        assert_eq!(stored.identity.remote, Some(RemoteId::new("r-77")));
        assert_eq!(stored.last_latency_ms, Some(9));
        assert!(stored.last_connected.is_some());
    }

    #[tokio::test]
    async fn failed_delete_restores_list_and_selection() {
        let h = harness(two_prod_records());
        h.store.dispatch(crate::store::StoreAction::SelectConnection(Some(
            LocalId::new("local-2"),
        )));
        h.api.fail_next("delete_connection", "in use by a schedule");
        let before = h.store.snapshot();

        let error = h
            .manager
            .delete(&LocalId::new("local-2"))
            .await
            .expect_err("delete fails");
        assert!(matches!(error, ConnectionManagerError::Api(_)));
        assert_eq!(h.store.snapshot(), before);
        assert_eq!(h.api.calls_with_arg("delete_connection", "r2"), 1);
    }

    #[tokio::test]
    async fn delete_uses_backend_id_and_forgets_password() {
        let h = harness(two_prod_records());
        h.vault.store(&LocalId::new("local-1"), "pw").expect("vault");

        h.manager
            .delete(&LocalId::new("local-1"))
            .await
            .expect("delete");

        assert_eq!(h.api.calls_with_arg("delete_connection", "r1"), 1);
        assert_eq!(h.store.read(|store| store.connections().len()), 1);
        assert_eq!(h.vault.load(&LocalId::new("local-1")).expect("vault"), None);
    }

    #[tokio::test]
    async fn delete_drops_the_healthcheck_fence() {
        let h = harness(two_prod_records());
        for id in ["local-1", "local-2"] {
            h.manager
                .healthcheck(&LocalId::new(id))
                .await
                .expect("healthcheck");
        }
        assert_eq!(lock(&h.manager.health_fence).len(), 2);

        h.manager
            .delete(&LocalId::new("local-1"))
            .await
            .expect("delete");
        assert_eq!(lock(&h.manager.health_fence).len(), 1);
    }

    #[tokio::test]
    async fn healthcheck_without_backend_id_fails_fast() {
        let mut record = saved_postgres_record("local-x", "Never saved", "unused");
        record.identity.remote = None;
        let mut h = harness(StoreSnapshot {
            connections: vec![record],
            ..StoreSnapshot::default()
        });

        let error = h
            .manager
            .healthcheck(&LocalId::new("local-x"))
            .await
            .expect_err("must fail fast");
        assert!(matches!(error, ConnectionManagerError::Identity(_)));
        assert_eq!(h.api.call_count("healthcheck"), 0);
        assert_eq!(h.feed.drain().len(), 1);
    }

    #[tokio::test]
    async fn healthcheck_records_status_latency_and_time() {
        let h = harness(two_prod_records());
        h.api.set_healthcheck(
            "r1",
            Ok(ConnectionTestOutcome {
                ok: true,
                latency_ms: Some(21),
                backend_connection_id: None,
                message: None,
            }),
        );
        h.api
            .set_healthcheck("r2", Err(ApiError::with_status(502, "bad gateway")));

        h.manager
            .healthcheck(&LocalId::new("local-1"))
            .await
            .expect("healthcheck");
        h.manager
            .healthcheck(&LocalId::new("local-2"))
            .await
            .expect_err("second fails");

        let (first, second) = h.store.read(|store| {
            (
                store.connection(&LocalId::new("local-1")).cloned(),
                store.connection(&LocalId::new("local-2")).cloned(),
            )
        });
        let first = first.expect("first");
        assert_eq!(first.status, ConnectionStatus::Connected);
        assert_eq!(first.last_latency_ms, Some(21));
        assert!(first.last_connected.is_some());
        assert_eq!(second.expect("second").status, ConnectionStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn selecting_b_after_a_shows_only_b_schema() {
        let h = harness(two_prod_records());
        let catalog = |table: &str| SchemaCatalog {
            tables: vec![TableSchema {
                name: table.to_string(),
                columns: Vec::new(),
            }],
        };
        h.api
            .set_schema("r1", catalog("from_a"), Duration::from_millis(400));
        h.api
            .set_schema("r2", catalog("from_b"), Duration::from_millis(20));

        let a_id = LocalId::new("local-1");
        let b_id = LocalId::new("local-2");
        let (a, b) = tokio::join!(h.manager.select(&a_id), async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            h.manager.select(&b_id).await
        });
        assert!(a.expect("a").is_none());
        assert!(b.expect("b").is_some());

        let shown = h.manager.schema().current().expect("schema shown");
        assert_eq!(shown.connection, LocalId::new("local-2"));
        assert_eq!(shown.schema.table_names(), vec!["from_b".to_string()]);
        assert_eq!(
            h.store
                .read(|store| store.selected_connection().map(|r| r.name.clone())),
            Some("prod db".to_string())
        );
    }
}
