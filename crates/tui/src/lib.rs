use std::collections::BTreeSet;
use std::future::Future;
use std::io::{self, Stdout};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{Days, Local};
use crossterm::event::{
    self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEvent, KeyEventKind,
    KeyModifiers,
};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Clear, Paragraph};
use ratatui::{Frame, Terminal};
use repdash_adapters::export::export_result;
use repdash_core::connection_manager::ConnectionManager;
use repdash_core::connections::{ConnectionDraft, ConnectionStatus, DbType};
use repdash_core::dashboard::DashboardComposer;
use repdash_core::health::{HealthMonitor, Reachability};
use repdash_core::history::HistoryCoordinator;
use repdash_core::notices::{NoticeFeed, NoticeLevel};
use repdash_core::query_builder::{QueryBuilder, QueryResult};
use repdash_core::reports::{DateRange, JobStatus, ReportRunner};
use repdash_core::store::SharedStore;
use repdash_core::validation::Field;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

const TICK_RATE: Duration = Duration::from_millis(120);
const JOB_POLL_INTERVAL: Duration = Duration::from_secs(2);
const DISCOVERY_LOOKBACK_DAYS: u64 = 30;
const RESULT_PREVIEW_ROWS: usize = 12;
const EXPORT_FILE_NAME: &str = "repdash-result.csv";

#[derive(Debug, Error)]
pub enum TuiError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Coordinators the front-end drives, plus the runtime their work runs on.
pub struct Services {
    pub runtime: Handle,
    pub store: SharedStore,
    pub connections: ConnectionManager,
    pub reports: ReportRunner,
    pub history: HistoryCoordinator,
    pub query: QueryBuilder,
    pub dashboard: DashboardComposer,
    pub health: HealthMonitor,
    pub notices: NoticeFeed,
    pub export_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pane {
    Connections,
    Reports,
    History,
    Query,
    Dashboard,
}

impl Pane {
    fn next(self) -> Self {
        match self {
            Self::Connections => Self::Reports,
            Self::Reports => Self::History,
            Self::History => Self::Query,
            Self::Query => Self::Dashboard,
            Self::Dashboard => Self::Connections,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Connections => "Connections",
            Self::Reports => "Reports",
            Self::History => "History",
            Self::Query => "Query Builder",
            Self::Dashboard => "Dashboard",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputMode {
    Normal,
    Editing,
}

/// Which list owns the cursor in two-list panes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListFocus {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirectionKey {
    Up,
    Down,
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    New,
    Test,
    Save,
    Delete,
    Check,
    CycleDbType,
    Refresh,
    ToggleMark,
    SelectAll,
    Undo,
    Discover,
    Run,
    Execute,
    Export,
    Suggest,
    Layout,
    MoveWidget(DirectionKey),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Msg {
    Quit,
    ToggleHelp,
    NextPane,
    Submit,
    Navigate(DirectionKey),
    StartEditing,
    StopEditing,
    Input(char),
    Backspace,
    NextField,
    PreviousField,
    Command(Command),
    Tick,
}

struct TuiApp {
    services: Services,
    pane: Pane,
    mode: InputMode,
    show_help: bool,
    should_quit: bool,
    status_line: String,
    status_level: NoticeLevel,
    in_flight: Vec<JoinHandle<()>>,
    last_job_poll: Option<Instant>,
    connection_cursor: usize,
    form_field: Field,
    reports_focus: ListFocus,
    template_cursor: usize,
    batch_cursor: usize,
    history_cursor: usize,
    marked: BTreeSet<String>,
    prompt_input: String,
    dashboard_focus: ListFocus,
    goal_input: String,
    suggestion_cursor: usize,
    widget_cursor: usize,
}

impl TuiApp {
    fn new(services: Services) -> Self {
        Self {
            services,
            pane: Pane::Connections,
            mode: InputMode::Normal,
            show_help: false,
            should_quit: false,
            status_line: "n: new connection, Enter: select, ?: help".to_string(),
            status_level: NoticeLevel::Info,
            in_flight: Vec::new(),
            last_job_poll: None,
            connection_cursor: 0,
            form_field: Field::Name,
            reports_focus: ListFocus::Primary,
            template_cursor: 0,
            batch_cursor: 0,
            history_cursor: 0,
            marked: BTreeSet::new(),
            prompt_input: String::new(),
            dashboard_focus: ListFocus::Primary,
            goal_input: String::new(),
            suggestion_cursor: 0,
            widget_cursor: 0,
        }
    }

    /// Loads the lists a fresh session shows.
    fn bootstrap(&mut self) {
        let reports = self.services.reports.clone();
        self.spawn(async move {
            if let Err(error) = reports.load_templates().await {
                tracing::debug!(%error, "initial template load failed");
            }
        });
        let history = self.services.history.clone();
        self.spawn(async move {
            if let Err(error) = history.refresh().await {
                tracing::debug!(%error, "initial history load failed");
            }
        });
    }

    fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.in_flight.retain(|handle| !handle.is_finished());
        self.in_flight.push(self.services.runtime.spawn(task));
    }

    fn set_status(&mut self, message: impl Into<String>) {
        self.status_line = message.into();
        self.status_level = NoticeLevel::Info;
    }

    fn handle(&mut self, msg: Msg) {
        match msg {
            Msg::Quit => self.should_quit = true,
            Msg::ToggleHelp => self.show_help = !self.show_help,
            Msg::NextPane => {
                self.pane = self.pane.next();
                self.set_status(format!("Switched pane to {}", self.pane.name()));
            }
            Msg::Submit => self.submit(),
            Msg::Navigate(direction) => self.navigate(direction),
            Msg::StartEditing => self.start_editing(),
            Msg::StopEditing => self.mode = InputMode::Normal,
            Msg::Input(character) => self.input(Some(character)),
            Msg::Backspace => self.input(None),
            Msg::NextField => self.form_field = self.form_field.next(),
            Msg::PreviousField => self.form_field = self.form_field.previous(),
            Msg::Command(command) => self.command(command),
            Msg::Tick => self.on_tick(),
        }
    }

    fn on_tick(&mut self) {
        self.in_flight.retain(|handle| !handle.is_finished());
        if let Some(notice) = self.services.notices.drain().pop() {
            self.status_line = if notice.undoable {
                format!("{} (u: undo)", notice.message)
            } else {
                notice.message
            };
            self.status_level = notice.level;
        }
        self.poll_jobs();
        self.clamp_cursors();
    }

    /// Report runs the backend answered with `running` are re-checked until
    /// they finish.
    fn poll_jobs(&mut self) {
        if self
            .last_job_poll
            .is_some_and(|at| at.elapsed() < JOB_POLL_INTERVAL)
            || !self.services.reports.has_running_jobs()
        {
            return;
        }
        self.last_job_poll = Some(Instant::now());
        let reports = self.services.reports.clone();
        self.spawn(async move {
            let finished = reports.poll_jobs().await;
            if finished > 0 {
                tracing::debug!(finished, "report jobs finished");
            }
        });
    }

    fn clamp_cursors(&mut self) {
        let connections = self.services.store.read(|store| store.connections().len());
        self.connection_cursor = clamp(self.connection_cursor, connections);
        let templates = self.services.store.read(|store| store.templates().len());
        self.template_cursor = clamp(self.template_cursor, templates);
        let batches = self
            .services
            .reports
            .discovery()
            .map_or(0, |discovery| discovery.batches.len());
        self.batch_cursor = clamp(self.batch_cursor, batches);
        let records = self.services.history.records();
        self.history_cursor = clamp(self.history_cursor, records.len());
        self.marked
            .retain(|id| records.iter().any(|record| &record.id == id));
        self.suggestion_cursor = clamp(
            self.suggestion_cursor,
            self.services.dashboard.suggestions().len(),
        );
        self.widget_cursor = clamp(self.widget_cursor, self.services.dashboard.widgets().len());
    }

    fn start_editing(&mut self) {
        match self.pane {
            Pane::Connections => {
                if let Some(local) = self.cursor_connection() {
                    if let Err(error) = self.services.connections.edit_connection(&local) {
                        self.set_status(format!("Cannot edit: {error}"));
                        return;
                    }
                }
                self.form_field = Field::Name;
                self.mode = InputMode::Editing;
            }
            Pane::Query | Pane::Dashboard => self.mode = InputMode::Editing,
            Pane::Reports | Pane::History => self.set_status("Nothing to edit in this view"),
        }
    }

    /// Appends a character, or removes the last one when `None`.
    fn input(&mut self, character: Option<char>) {
        let edit = |text: &mut String| match character {
            Some(character) => text.push(character),
            None => {
                text.pop();
            }
        };
        match self.pane {
            Pane::Connections => {
                if self.form_field == Field::DbType {
                    if character.is_some() {
                        self.command(Command::CycleDbType);
                    }
                    return;
                }
                let mut value = draft_value(&self.services.connections.form_view().draft, self.form_field);
                edit(&mut value);
                self.services.connections.set_field(self.form_field, value);
            }
            Pane::Query => edit(&mut self.prompt_input),
            Pane::Dashboard => edit(&mut self.goal_input),
            Pane::Reports | Pane::History => {}
        }
    }

    fn submit(&mut self) {
        self.mode = InputMode::Normal;
        match self.pane {
            Pane::Connections => self.select_connection(),
            Pane::Reports => match self.reports_focus {
                ListFocus::Primary => self.select_template(),
                ListFocus::Secondary => self.command(Command::ToggleMark),
            },
            Pane::History => self.command(Command::ToggleMark),
            Pane::Query => {
                let query = self.services.query.clone();
                let prompt = self.prompt_input.clone();
                self.set_status("Generating SQL...");
                self.spawn(async move {
                    if let Err(error) = query.generate(&prompt).await {
                        tracing::debug!(%error, "sql generation failed");
                    }
                });
            }
            Pane::Dashboard => match self.dashboard_focus {
                ListFocus::Primary => match self
                    .services
                    .dashboard
                    .add_suggestion(self.suggestion_cursor)
                {
                    Ok(widget) => self.set_status(format!("Added widget `{}`", widget.title)),
                    Err(error) => self.set_status(error.to_string()),
                },
                ListFocus::Secondary => self.set_status("Use H/J/K/L to move the widget"),
            },
        }
    }

    fn navigate(&mut self, direction: DirectionKey) {
        let vertical = match direction {
            DirectionKey::Up => -1,
            DirectionKey::Down => 1,
            DirectionKey::Left | DirectionKey::Right => {
                match self.pane {
                    Pane::Reports => self.reports_focus = toggle_focus(self.reports_focus),
                    Pane::Dashboard => self.dashboard_focus = toggle_focus(self.dashboard_focus),
                    _ => {}
                }
                return;
            }
        };
        let cursor = match (self.pane, self.reports_focus, self.dashboard_focus) {
            (Pane::Connections, _, _) => &mut self.connection_cursor,
            (Pane::Reports, ListFocus::Primary, _) => &mut self.template_cursor,
            (Pane::Reports, ListFocus::Secondary, _) => &mut self.batch_cursor,
            (Pane::History, _, _) => &mut self.history_cursor,
            (Pane::Dashboard, _, ListFocus::Primary) => &mut self.suggestion_cursor,
            (Pane::Dashboard, _, ListFocus::Secondary) => &mut self.widget_cursor,
            (Pane::Query, _, _) => return,
        };
        *cursor = if vertical < 0 {
            cursor.saturating_sub(1)
        } else {
            cursor.saturating_add(1)
        };
        self.clamp_cursors();
    }

    fn command(&mut self, command: Command) {
        match (self.pane, command) {
            (_, Command::Undo) => {
                if !self.services.history.undo() {
                    self.set_status("Nothing to undo");
                }
            }
            (Pane::Connections, _) => self.connection_command(command),
            (Pane::Reports, _) => self.reports_command(command),
            (Pane::History, _) => self.history_command(command),
            (Pane::Query, _) => self.query_command(command),
            (Pane::Dashboard, _) => self.dashboard_command(command),
        }
    }

    fn connection_command(&mut self, command: Command) {
        let manager = self.services.connections.clone();
        match command {
            Command::New => {
                manager.new_connection();
                self.form_field = Field::Name;
                self.mode = InputMode::Editing;
                self.set_status("New connection");
            }
            Command::CycleDbType => {
                let current = manager.form_view().draft.db_type;
                manager.set_db_type(Some(next_db_type(current)));
            }
            Command::Test => {
                self.set_status("Testing connection...");
                self.spawn(async move {
                    if let Err(error) = manager.test().await {
                        tracing::debug!(%error, "connection test failed");
                    }
                });
            }
            Command::Save => {
                if !manager.form_view().can_save {
                    self.set_status("Test the connection before saving");
                    return;
                }
                self.spawn(async move {
                    if let Err(error) = manager.save().await {
                        tracing::debug!(%error, "connection save failed");
                    }
                });
            }
            Command::Delete => {
                let Some(local) = self.cursor_connection() else {
                    self.set_status("No connection selected");
                    return;
                };
                self.spawn(async move {
                    if let Err(error) = manager.delete(&local).await {
                        tracing::debug!(%error, "connection delete failed");
                    }
                });
            }
            Command::Check => {
                let Some(local) = self.cursor_connection() else {
                    self.set_status("No connection selected");
                    return;
                };
                self.spawn(async move {
                    if let Err(error) = manager.healthcheck(&local).await {
                        tracing::debug!(%error, "healthcheck failed");
                    }
                });
            }
            _ => self.set_status("Not available in Connections"),
        }
    }

    fn select_connection(&mut self) {
        let Some(local) = self.cursor_connection() else {
            self.set_status("No saved connections yet");
            return;
        };
        let manager = self.services.connections.clone();
        self.spawn(async move {
            if let Err(error) = manager.select(&local).await {
                tracing::debug!(%error, "connection select failed");
            }
        });
    }

    fn cursor_connection(&self) -> Option<repdash_core::identity::LocalId> {
        self.services.store.read(|store| {
            store
                .connections()
                .get(self.connection_cursor)
                .map(|record| record.local_id().clone())
        })
    }

    fn cursor_template(&self) -> Option<String> {
        self.services.store.read(|store| {
            store
                .templates()
                .get(self.template_cursor)
                .map(|template| template.id.clone())
        })
    }

    fn select_template(&mut self) {
        let Some(template_id) = self.cursor_template() else {
            self.set_status("No templates loaded");
            return;
        };
        let reports = self.services.reports.clone();
        self.spawn(async move {
            if let Err(error) = reports.select_template(&template_id).await {
                tracing::debug!(%error, "template select failed");
            }
        });
    }

    fn reports_command(&mut self, command: Command) {
        let reports = self.services.reports.clone();
        match command {
            Command::Refresh => self.spawn(async move {
                if let Err(error) = reports.load_templates().await {
                    tracing::debug!(%error, "template reload failed");
                }
            }),
            Command::Delete => {
                let Some(template_id) = self.cursor_template() else {
                    self.set_status("No template selected");
                    return;
                };
                self.spawn(async move {
                    if let Err(error) = reports.delete_template(&template_id).await {
                        tracing::debug!(%error, "template delete failed");
                    }
                });
            }
            Command::Discover => {
                let end = Local::now().date_naive();
                let start = end
                    .checked_sub_days(Days::new(DISCOVERY_LOOKBACK_DAYS))
                    .unwrap_or(end);
                let range = match DateRange::new(start, end) {
                    Ok(range) => range,
                    Err(error) => {
                        self.set_status(error.to_string());
                        return;
                    }
                };
                self.reports_focus = ListFocus::Secondary;
                self.set_status(format!("Discovering batches since {start}..."));
                self.spawn(async move {
                    if let Err(error) = reports.discover(range, Vec::new()).await {
                        tracing::debug!(%error, "discovery failed");
                    }
                });
            }
            Command::ToggleMark => {
                let batch_id = reports
                    .discovery()
                    .and_then(|discovery| discovery.batches.get(self.batch_cursor).cloned())
                    .map(|batch| batch.id);
                if let Some(batch_id) = batch_id {
                    reports.toggle_batch(&batch_id);
                }
            }
            Command::SelectAll => {
                let all_selected = reports.discovery().is_some_and(|discovery| {
                    discovery.batches.iter().all(|batch| batch.selected)
                });
                reports.select_all(!all_selected);
            }
            Command::Run => {
                self.set_status("Starting report run...");
                self.spawn(async move {
                    if let Err(error) = reports.run(None).await {
                        tracing::debug!(%error, "report run failed");
                    }
                });
            }
            _ => self.set_status("Not available in Reports"),
        }
    }

    fn history_command(&mut self, command: Command) {
        let history = self.services.history.clone();
        match command {
            Command::Refresh => self.spawn(async move {
                if let Err(error) = history.refresh().await {
                    tracing::debug!(%error, "history refresh failed");
                }
            }),
            Command::ToggleMark => {
                if let Some(record) = history.records().get(self.history_cursor) {
                    if !self.marked.remove(&record.id) {
                        self.marked.insert(record.id.clone());
                    }
                }
            }
            Command::SelectAll => {
                let records = history.records();
                if self.marked.len() == records.len() {
                    self.marked.clear();
                } else {
                    self.marked = records.into_iter().map(|record| record.id).collect();
                }
            }
            Command::Delete => {
                let ids: Vec<String> = if self.marked.is_empty() {
                    history
                        .records()
                        .get(self.history_cursor)
                        .map(|record| vec![record.id.clone()])
                        .unwrap_or_default()
                } else {
                    self.marked.iter().cloned().collect()
                };
                // The commit runs detached; its outcome arrives as a notice.
                if history.delete_records(&ids).is_some() {
                    self.marked.clear();
                } else {
                    self.set_status("Nothing to delete");
                }
            }
            _ => self.set_status("Not available in History"),
        }
    }

    fn query_command(&mut self, command: Command) {
        let query = self.services.query.clone();
        match command {
            Command::Execute => self.spawn(async move {
                if let Err(error) = query.execute().await {
                    tracing::debug!(%error, "query execution failed");
                }
            }),
            Command::Save => {
                let name = self.prompt_input.trim().chars().take(60).collect::<String>();
                self.spawn(async move {
                    if let Err(error) = query.save(&name).await {
                        tracing::debug!(%error, "query save failed");
                    }
                });
            }
            Command::Export => {
                let Some(result) = query.result() else {
                    self.set_status("Run a query before exporting");
                    return;
                };
                let path = self.services.export_dir.join(EXPORT_FILE_NAME);
                match export_result(&path, &result) {
                    Ok(rows) => {
                        tracing::info!(path = %path.display(), rows, "query result exported");
                        self.set_status(format!("Exported {rows} rows to {}", path.display()));
                    }
                    Err(error) => {
                        self.status_line = format!("Export failed: {error}");
                        self.status_level = NoticeLevel::Error;
                    }
                }
            }
            Command::New => {
                query.reset();
                self.prompt_input.clear();
            }
            _ => self.set_status("Not available in Query Builder"),
        }
    }

    fn dashboard_command(&mut self, command: Command) {
        let dashboard = self.services.dashboard.clone();
        match command {
            Command::Suggest => {
                let goal = self.goal_input.clone();
                self.dashboard_focus = ListFocus::Primary;
                self.spawn(async move {
                    if let Err(error) = dashboard.suggest(&goal).await {
                        tracing::debug!(%error, "widget suggestion failed");
                    }
                });
            }
            Command::Layout => self.spawn(async move {
                if let Err(error) = dashboard.auto_layout().await {
                    tracing::debug!(%error, "auto layout failed");
                }
            }),
            Command::Delete => {
                if let Some(widget) = dashboard.widgets().get(self.widget_cursor) {
                    dashboard.remove_widget(&widget.id);
                }
            }
            Command::MoveWidget(direction) => {
                let Some(widget) = dashboard.widgets().get(self.widget_cursor).cloned() else {
                    self.set_status("No widget selected");
                    return;
                };
                let (x, y) = shifted(widget.rect.x, widget.rect.y, direction);
                if let Err(error) = dashboard.move_widget(&widget.id, x, y) {
                    self.set_status(error.to_string());
                }
            }
            _ => self.set_status("Not available in Dashboard"),
        }
    }

    fn is_busy(&self) -> bool {
        self.services.connections.form_view().testing
            || self.services.connections.schema().is_loading()
            || self.services.reports.is_discovering()
            || self.services.reports.is_loading_templates()
            || self.services.history.is_loading()
            || self.services.query.is_busy()
            || self.services.dashboard.is_busy()
    }
}

fn clamp(cursor: usize, len: usize) -> usize {
    cursor.min(len.saturating_sub(1))
}

fn toggle_focus(focus: ListFocus) -> ListFocus {
    match focus {
        ListFocus::Primary => ListFocus::Secondary,
        ListFocus::Secondary => ListFocus::Primary,
    }
}

fn next_db_type(current: Option<DbType>) -> DbType {
    let index = current
        .and_then(|db_type| DbType::ALL.iter().position(|candidate| *candidate == db_type))
        .map_or(0, |index| (index + 1) % DbType::ALL.len());
    DbType::ALL[index]
}

fn shifted(x: u16, y: u16, direction: DirectionKey) -> (u16, u16) {
    match direction {
        DirectionKey::Up => (x, y.saturating_sub(1)),
        DirectionKey::Down => (x, y.saturating_add(1)),
        DirectionKey::Left => (x.saturating_sub(1), y),
        DirectionKey::Right => (x.saturating_add(1), y),
    }
}

fn draft_value(draft: &ConnectionDraft, field: Field) -> String {
    match field {
        Field::Name => draft.name.clone(),
        Field::DbType => draft
            .db_type
            .map(|db_type| db_type.to_string())
            .unwrap_or_default(),
        Field::Host => draft.host.clone(),
        Field::Port => draft.port.clone(),
        Field::Database => draft.database.clone(),
        Field::Username => draft.username.clone(),
        Field::Password => draft.password.clone(),
    }
}

#[must_use]
pub fn ui_name() -> &'static str {
    "repdash-tui"
}

/// Runs the terminal UI until the user quits. Call from inside the
/// runtime's context (`Runtime::enter`), not from an async task.
pub fn run(services: Services) -> Result<(), TuiError> {
    let mut terminal = setup_terminal()?;
    let run_result = run_loop(&mut terminal, services);
    let restore_result = restore_terminal(&mut terminal);

    if let Err(error) = run_result {
        restore_result?;
        return Err(error);
    }

    restore_result?;
    Ok(())
}

fn setup_terminal() -> Result<Terminal<CrosstermBackend<Stdout>>, TuiError> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    terminal.clear()?;
    Ok(terminal)
}

fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<(), TuiError> {
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;
    Ok(())
}

fn run_loop(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    services: Services,
) -> Result<(), TuiError> {
    let mut app = TuiApp::new(services);
    app.bootstrap();
    let mut last_tick = Instant::now();

    loop {
        terminal.draw(|frame| render(frame, &app))?;

        let timeout = TICK_RATE
            .checked_sub(last_tick.elapsed())
            .unwrap_or(Duration::ZERO);
        if event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    if let Some(message) = map_key_event(key, app.mode) {
                        app.handle(message);
                    }
                }
            }
        }

        if last_tick.elapsed() >= TICK_RATE {
            app.handle(Msg::Tick);
            last_tick = Instant::now();
        }

        if app.should_quit {
            break;
        }
    }

    Ok(())
}

fn render(frame: &mut Frame<'_>, app: &TuiApp) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(8),
            Constraint::Length(3),
        ])
        .split(frame.area());

    let connection = app
        .services
        .store
        .read(|store| store.selected_connection().map(|record| record.name.clone()));
    let backend = match app.services.health.reachability() {
        Reachability::Unknown => "checking",
        Reachability::Reachable => "online",
        Reachability::Unreachable => "offline",
    };
    let header = Paragraph::new(Line::from(vec![
        Span::styled(
            format!(" Pane: {} ", app.pane.name()),
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        ),
        Span::raw(" | "),
        Span::raw(format!(
            "Connection: {}",
            connection.as_deref().unwrap_or("none")
        )),
        Span::raw(" | "),
        Span::raw(format!("Backend: {backend}")),
        Span::raw(" | "),
        Span::raw(if app.is_busy() { "working..." } else { "idle" }),
        Span::raw(" | "),
        Span::raw(match app.mode {
            InputMode::Normal => "NORMAL",
            InputMode::Editing => "EDIT",
        }),
    ]))
    .block(Block::default().borders(Borders::ALL).title("repdash"));
    frame.render_widget(header, chunks[0]);

    let body_text = match app.pane {
        Pane::Connections => connection_lines(app),
        Pane::Reports => report_lines(app),
        Pane::History => history_lines(app),
        Pane::Query => query_lines(app),
        Pane::Dashboard => dashboard_lines(app),
    };
    let body = Paragraph::new(body_text)
        .block(Block::default().borders(Borders::ALL).title("Workspace"))
        .alignment(Alignment::Left);
    frame.render_widget(body, chunks[1]);

    let status_color = match app.status_level {
        NoticeLevel::Info => Color::Reset,
        NoticeLevel::Success => Color::Green,
        NoticeLevel::Warning => Color::Yellow,
        NoticeLevel::Error => Color::Red,
    };
    let footer = Paragraph::new(Line::from(Span::styled(
        app.status_line.as_str(),
        Style::default().fg(status_color),
    )))
    .block(Block::default().borders(Borders::ALL).title("Status"));
    frame.render_widget(footer, chunks[2]);

    if app.show_help {
        render_help_popup(frame);
    }
}

fn marker(selected: bool) -> &'static str {
    if selected {
        ">"
    } else {
        " "
    }
}

fn connection_lines(app: &TuiApp) -> Vec<Line<'static>> {
    let records = app.services.store.read(|store| store.connections().to_vec());
    let selected = app
        .services
        .store
        .read(|store| store.selected_connection().map(|record| record.local_id().clone()));
    let mut lines = vec![Line::from("Saved connections (Enter: select, e: edit, d: delete, c: check)")];
    if records.is_empty() {
        lines.push(Line::from("  none yet, press n to add one"));
    }
    for (index, record) in records.iter().enumerate() {
        let active = if selected.as_ref() == Some(record.local_id()) {
            "*"
        } else {
            " "
        };
        let status = match record.status {
            ConnectionStatus::Unknown => "unknown".to_string(),
            ConnectionStatus::Connected => record
                .last_latency_ms
                .map_or_else(|| "connected".to_string(), |ms| format!("connected {ms} ms")),
            ConnectionStatus::Failed => "failed".to_string(),
        };
        lines.push(Line::from(format!(
            "{}{active} {} [{}] {} ({status})",
            marker(index == app.connection_cursor),
            record.name,
            record.db_type,
            record.display_target(),
        )));
    }

    if let Some(loaded) = app.services.connections.schema().current() {
        lines.push(Line::from(format!(
            "  schema: {}",
            loaded.schema.table_names().join(", ")
        )));
    }

    let form = app.services.connections.form_view();
    lines.push(Line::from(""));
    lines.push(Line::from(match &form.editing {
        Some(local) => format!("Editing {local} (t: test, s: save, y: type, Esc: done)"),
        None => "New connection (t: test, s: save, y: type, Esc: done)".to_string(),
    }));
    for field in Field::ALL {
        let value = match field {
            Field::Password => "*".repeat(form.draft.password.chars().count()),
            other => draft_value(&form.draft, other),
        };
        let error = form
            .errors
            .iter()
            .find(|error| error.field == field)
            .map(|error| format!("  <- {}", error.kind))
            .unwrap_or_default();
        let active = app.mode == InputMode::Editing && app.form_field == field;
        lines.push(Line::from(format!(
            "{} {}: {value}{error}",
            marker(active),
            field.label()
        )));
    }
    let test_state = if form.testing {
        "testing...".to_string()
    } else {
        match (form.status, form.latency_ms) {
            (ConnectionStatus::Connected, Some(ms)) => format!("passed in {ms} ms"),
            (ConnectionStatus::Connected, None) => "passed".to_string(),
            (ConnectionStatus::Failed, _) => "failed".to_string(),
            (ConnectionStatus::Unknown, _) => "not tested".to_string(),
        }
    };
    lines.push(Line::from(format!(
        "  Test: {test_state} | Save: {}",
        if form.saving {
            "saving..."
        } else if form.can_save {
            "ready"
        } else {
            "blocked"
        }
    )));
    lines
}

fn report_lines(app: &TuiApp) -> Vec<Line<'static>> {
    let templates = app.services.store.read(|store| store.templates().to_vec());
    let selected = app
        .services
        .store
        .read(|store| store.selected_template().map(|template| template.id.clone()));
    let mut lines = vec![Line::from(
        "Templates (Enter: select, f: discover, g: run, d: delete, r: reload)",
    )];
    for (index, template) in templates.iter().enumerate() {
        let active = if selected.as_deref() == Some(template.id.as_str()) {
            "*"
        } else {
            " "
        };
        let focused = app.reports_focus == ListFocus::Primary && index == app.template_cursor;
        lines.push(Line::from(format!(
            "{}{active} {}{}",
            marker(focused),
            template.name,
            template
                .description
                .as_deref()
                .map(|description| format!(" - {description}"))
                .unwrap_or_default()
        )));
    }
    if let Some(template_id) = &selected {
        let options = app.services.reports.key_options(template_id);
        if !options.is_empty() {
            let labels: Vec<&str> = options.iter().map(|option| option.label.as_str()).collect();
            lines.push(Line::from(format!("  keys: {}", labels.join(", "))));
        }
    }

    lines.push(Line::from(""));
    if app.services.reports.is_discovering() {
        lines.push(Line::from("Batches: discovering..."));
    } else if let Some(discovery) = app.services.reports.discovery() {
        lines.push(Line::from(format!(
            "Batches {} to {} (space: toggle, a: all) - {} rows selected",
            discovery.request.range.start,
            discovery.request.range.end,
            discovery.selected_rows()
        )));
        for (index, batch) in discovery.batches.iter().enumerate() {
            let focused = app.reports_focus == ListFocus::Secondary && index == app.batch_cursor;
            lines.push(Line::from(format!(
                "{} [{}] {} rows={} parents={}",
                marker(focused),
                if batch.selected { "x" } else { " " },
                batch.id,
                batch.row_count,
                batch.parent_count
            )));
        }
    } else {
        lines.push(Line::from("Batches: press f to discover"));
    }

    let jobs = app.services.reports.jobs();
    if !jobs.is_empty() {
        lines.push(Line::from(""));
        lines.push(Line::from("Jobs"));
        for job in jobs {
            let state = match job.status {
                JobStatus::Running => format!("running {}%", job.progress),
                JobStatus::Complete => {
                    let formats: Vec<String> =
                        job.artifacts.iter().map(|(format, _)| format.to_string()).collect();
                    format!("ready ({})", formats.join(", "))
                }
                JobStatus::Failed => {
                    format!("failed: {}", job.error.as_deref().unwrap_or("unknown error"))
                }
            };
            lines.push(Line::from(format!("  {} {state}", job.name)));
        }
    }
    lines
}

fn history_lines(app: &TuiApp) -> Vec<Line<'static>> {
    let records = app.services.history.records();
    let mut lines = vec![Line::from(
        "History (space: mark, a: mark all, d: delete, u: undo, r: refresh)",
    )];
    if app.services.history.is_loading() {
        lines.push(Line::from("  loading..."));
    } else if records.is_empty() {
        lines.push(Line::from("  no reports generated yet"));
    }
    for (index, record) in records.iter().enumerate() {
        let created = record
            .created_at
            .map(|at| at.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        lines.push(Line::from(format!(
            "{} [{}] {:<24} {:<10} {created}{}",
            marker(index == app.history_cursor),
            if app.marked.contains(&record.id) { "*" } else { " " },
            record.template_name,
            record.status,
            record
                .error
                .as_deref()
                .map(|error| format!("  {error}"))
                .unwrap_or_default()
        )));
    }
    lines
}

fn query_lines(app: &TuiApp) -> Vec<Line<'static>> {
    let query = &app.services.query;
    let mut lines = vec![
        Line::from("Query Builder (e: edit prompt, Enter: generate, x: run, s: save, o: export)"),
        Line::from(format!("Prompt: {}", app.prompt_input)),
        Line::from(""),
    ];
    match query.sql() {
        Some(sql) => {
            lines.push(Line::from("SQL:"));
            lines.extend(sql.lines().map(|line| Line::from(format!("  {line}"))));
        }
        None => lines.push(Line::from("SQL: (none yet)")),
    }
    if let Some(explanation) = query.explanation() {
        lines.push(Line::from(format!("Why: {explanation}")));
    }
    if let Some(result) = query.result() {
        lines.push(Line::from(""));
        lines.extend(result_lines(&result));
    }
    lines
}

fn result_lines(result: &QueryResult) -> Vec<Line<'static>> {
    let mut lines = vec![Line::from(result.columns.join(" | "))];
    for row in result.rows.iter().take(RESULT_PREVIEW_ROWS) {
        let cells: Vec<String> = row.iter().map(QueryResult::cell_text).collect();
        lines.push(Line::from(cells.join(" | ")));
    }
    lines.push(Line::from(format!(
        "{} rows{}{}",
        result.row_count(),
        if result.truncated { " (truncated)" } else { "" },
        result
            .elapsed_ms
            .map(|ms| format!(" in {ms} ms"))
            .unwrap_or_default()
    )));
    lines
}

fn dashboard_lines(app: &TuiApp) -> Vec<Line<'static>> {
    let dashboard = &app.services.dashboard;
    let mut lines = vec![
        Line::from("Dashboard (e: edit goal, w: suggest, Enter: add, p: auto layout, HJKL: move)"),
        Line::from(format!("Goal: {}", app.goal_input)),
        Line::from(""),
        Line::from("Suggestions"),
    ];
    let suggestions = dashboard.suggestions();
    if suggestions.is_empty() {
        lines.push(Line::from("  press w to ask for suggestions"));
    }
    for (index, suggestion) in suggestions.iter().enumerate() {
        let focused = app.dashboard_focus == ListFocus::Primary && index == app.suggestion_cursor;
        lines.push(Line::from(format!(
            "{} {} [{}]{}",
            marker(focused),
            suggestion.title,
            suggestion.kind,
            suggestion
                .rationale
                .as_deref()
                .map(|rationale| format!(" - {rationale}"))
                .unwrap_or_default()
        )));
    }

    lines.push(Line::from(""));
    lines.push(Line::from("Widgets"));
    for (index, widget) in dashboard.widgets().iter().enumerate() {
        let focused = app.dashboard_focus == ListFocus::Secondary && index == app.widget_cursor;
        let rect = widget.rect;
        lines.push(Line::from(format!(
            "{} {} [{}] at ({}, {}) {}x{}",
            marker(focused),
            widget.title,
            widget.kind,
            rect.x,
            rect.y,
            rect.w,
            rect.h
        )));
    }
    lines
}

fn render_help_popup(frame: &mut Frame<'_>) {
    let area = centered_rect(70, 70, frame.area());
    frame.render_widget(Clear, area);
    let help = Paragraph::new(vec![
        Line::from("Global keymap"),
        Line::from("q: quit   ?: toggle help   Tab: cycle panes"),
        Line::from("Arrows or hjkl: navigation, left/right switches list"),
        Line::from("Enter: select or submit (by view)"),
        Line::from("e: edit form or prompt   Esc: stop editing"),
        Line::from("u: undo the last history delete"),
        Line::from(""),
        Line::from("Connections: n new, t test, s save, y type, d delete, c check"),
        Line::from("Reports: f discover, space toggle batch, a all, g run, d delete"),
        Line::from("History: space mark, a mark all, d delete, r refresh"),
        Line::from("Query: x run, s save, o export CSV, n clear"),
        Line::from("Dashboard: w suggest, p auto layout, HJKL move, d remove"),
    ])
    .block(Block::default().borders(Borders::ALL).title("Help"));
    frame.render_widget(help, area);
}

fn centered_rect(width_percent: u16, height_percent: u16, area: Rect) -> Rect {
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100_u16 - height_percent) / 2),
            Constraint::Percentage(height_percent),
            Constraint::Percentage((100_u16 - height_percent) / 2),
        ])
        .split(area);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100_u16 - width_percent) / 2),
            Constraint::Percentage(width_percent),
            Constraint::Percentage((100_u16 - width_percent) / 2),
        ])
        .split(vertical[1])[1]
}

fn map_key_event(key: KeyEvent, mode: InputMode) -> Option<Msg> {
    if mode == InputMode::Editing {
        return match (key.modifiers, key.code) {
            (KeyModifiers::CONTROL, KeyCode::Char('c')) => Some(Msg::Quit),
            (_, KeyCode::Esc) => Some(Msg::StopEditing),
            (_, KeyCode::Enter) => Some(Msg::Submit),
            (_, KeyCode::Tab | KeyCode::Down) => Some(Msg::NextField),
            (_, KeyCode::BackTab | KeyCode::Up) => Some(Msg::PreviousField),
            (_, KeyCode::Backspace) => Some(Msg::Backspace),
            (KeyModifiers::NONE | KeyModifiers::SHIFT, KeyCode::Char(character)) => {
                Some(Msg::Input(character))
            }
            _ => None,
        };
    }

    match (key.modifiers, key.code) {
        (KeyModifiers::CONTROL, KeyCode::Char('c')) | (_, KeyCode::Char('q')) => Some(Msg::Quit),
        (_, KeyCode::Char('?')) => Some(Msg::ToggleHelp),
        (_, KeyCode::Tab) => Some(Msg::NextPane),
        (_, KeyCode::Enter) => Some(Msg::Submit),
        (_, KeyCode::Up | KeyCode::Char('k')) => Some(Msg::Navigate(DirectionKey::Up)),
        (_, KeyCode::Down | KeyCode::Char('j')) => Some(Msg::Navigate(DirectionKey::Down)),
        (_, KeyCode::Left | KeyCode::Char('h')) => Some(Msg::Navigate(DirectionKey::Left)),
        (_, KeyCode::Right | KeyCode::Char('l')) => Some(Msg::Navigate(DirectionKey::Right)),
        (_, KeyCode::Char('K')) => Some(Msg::Command(Command::MoveWidget(DirectionKey::Up))),
        (_, KeyCode::Char('J')) => Some(Msg::Command(Command::MoveWidget(DirectionKey::Down))),
        (_, KeyCode::Char('H')) => Some(Msg::Command(Command::MoveWidget(DirectionKey::Left))),
        (_, KeyCode::Char('L')) => Some(Msg::Command(Command::MoveWidget(DirectionKey::Right))),
        (_, KeyCode::Char('e')) => Some(Msg::StartEditing),
        (_, KeyCode::Char('n')) => Some(Msg::Command(Command::New)),
        (_, KeyCode::Char('t')) => Some(Msg::Command(Command::Test)),
        (_, KeyCode::Char('s')) => Some(Msg::Command(Command::Save)),
        (_, KeyCode::Char('d')) => Some(Msg::Command(Command::Delete)),
        (_, KeyCode::Char('c')) => Some(Msg::Command(Command::Check)),
        (_, KeyCode::Char('y')) => Some(Msg::Command(Command::CycleDbType)),
        (_, KeyCode::Char('r')) => Some(Msg::Command(Command::Refresh)),
        (_, KeyCode::Char(' ')) => Some(Msg::Command(Command::ToggleMark)),
        (_, KeyCode::Char('a')) => Some(Msg::Command(Command::SelectAll)),
        (_, KeyCode::Char('u')) => Some(Msg::Command(Command::Undo)),
        (_, KeyCode::Char('f')) => Some(Msg::Command(Command::Discover)),
        (_, KeyCode::Char('g')) => Some(Msg::Command(Command::Run)),
        (_, KeyCode::Char('x')) => Some(Msg::Command(Command::Execute)),
        (_, KeyCode::Char('o')) => Some(Msg::Command(Command::Export)),
        (_, KeyCode::Char('w')) => Some(Msg::Command(Command::Suggest)),
        (_, KeyCode::Char('p')) => Some(Msg::Command(Command::Layout)),
        _ => None,
    }
}
