use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::api::{ApiError, SharedApi};
use crate::fencing::RequestFence;
use crate::identity::{ApiMode, IdentityError};
use crate::notices::Notifier;
use crate::store::{lock, SharedStore};

pub const GRID_COLUMNS: u16 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WidgetKind {
    Metric,
    Bar,
    Line,
    Pie,
    Table,
}

impl WidgetKind {
    /// Default footprint as (width, height) grid cells.
    #[must_use]
    pub fn default_size(self) -> (u16, u16) {
        match self {
            Self::Metric => (3, 2),
            Self::Pie => (4, 4),
            Self::Bar | Self::Line => (6, 4),
            Self::Table => (GRID_COLUMNS, 5),
        }
    }
}

impl fmt::Display for WidgetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Metric => "metric",
            Self::Bar => "bar",
            Self::Line => "line",
            Self::Pie => "pie",
            Self::Table => "table",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GridRect {
    pub x: u16,
    pub y: u16,
    pub w: u16,
    pub h: u16,
}

impl GridRect {
    #[must_use]
    pub fn bottom(self) -> u16 {
        self.y.saturating_add(self.h)
    }

    #[must_use]
    pub fn fits(self) -> bool {
        self.w > 0 && self.h > 0 && self.x.saturating_add(self.w) <= GRID_COLUMNS
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Widget {
    pub id: String,
    pub title: String,
    pub kind: WidgetKind,
    #[serde(default)]
    pub sql: Option<String>,
    pub rect: GridRect,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WidgetPlacement {
    pub widget_id: String,
    #[serde(flatten)]
    pub rect: GridRect,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WidgetSuggestionRequest {
    pub connection_id: String,
    pub goal: String,
    #[serde(default)]
    pub existing: Vec<WidgetKind>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WidgetSuggestion {
    pub title: String,
    pub kind: WidgetKind,
    #[serde(default)]
    pub sql: Option<String>,
    #[serde(default)]
    pub rationale: Option<String>,
}

#[derive(Debug, Error)]
pub enum DashboardError {
    #[error("select a connection first")]
    NoConnection,
    #[error("describe what the dashboard should show")]
    EmptyGoal,
    #[error("widget title is required")]
    EmptyTitle,
    #[error("no suggestion at position {0}")]
    UnknownSuggestion(usize),
    #[error("unknown widget `{0}`")]
    UnknownWidget(String),
    #[error("widget does not fit the {GRID_COLUMNS}-column grid at x={x}")]
    OutOfBounds { x: u16, w: u16 },
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("backend request failed: {0}")]
    Api(#[from] ApiError),
}

#[derive(Debug, Default)]
struct ComposerState {
    widgets: Vec<Widget>,
    suggestions: Vec<WidgetSuggestion>,
    suggest_fence: RequestFence,
    layout_fence: RequestFence,
    suggesting: bool,
    laying_out: bool,
}

impl ComposerState {
    fn next_row(&self) -> u16 {
        self.widgets
            .iter()
            .map(|widget| widget.rect.bottom())
            .max()
            .unwrap_or(0)
    }

    fn push(&mut self, title: String, kind: WidgetKind, sql: Option<String>) -> Widget {
        let (w, h) = kind.default_size();
        let widget = Widget {
            id: format!("widget-{}", Uuid::new_v4()),
            title,
            kind,
            sql,
            rect: GridRect {
                x: 0,
                y: self.next_row(),
                w,
                h,
            },
        };
        self.widgets.push(widget.clone());
        widget
    }
}

/// Builds a dashboard from suggested and hand-added widgets.
#[derive(Clone)]
pub struct DashboardComposer {
    api: SharedApi,
    store: SharedStore,
    notifier: Notifier,
    mode: ApiMode,
    state: Arc<Mutex<ComposerState>>,
}

impl DashboardComposer {
    #[must_use]
    pub fn new(api: SharedApi, store: SharedStore, notifier: Notifier, mode: ApiMode) -> Self {
        Self {
            api,
            store,
            notifier,
            mode,
            state: Arc::new(Mutex::new(ComposerState::default())),
        }
    }

    #[must_use]
    pub fn widgets(&self) -> Vec<Widget> {
        lock(&self.state).widgets.clone()
    }

    #[must_use]
    pub fn suggestions(&self) -> Vec<WidgetSuggestion> {
        lock(&self.state).suggestions.clone()
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        let state = lock(&self.state);
        state.suggesting || state.laying_out
    }

    /// Asks the backend for widget ideas. `Ok(None)` means a newer request
    /// superseded this one.
    pub async fn suggest(&self, goal: &str) -> Result<Option<usize>, DashboardError> {
        let goal = goal.trim();
        if goal.is_empty() {
            return Err(DashboardError::EmptyGoal);
        }
        let connection_id = self
            .store
            .read(|store| {
                let record = store
                    .selected_connection()
                    .ok_or(DashboardError::NoConnection)?;
                Ok::<_, DashboardError>(record.identity.resolve(self.mode)?.to_string())
            })
            .inspect_err(|error| self.notifier.error(error.to_string()))?;

        let (token, existing) = {
            let mut state = lock(&self.state);
            state.suggesting = true;
            let existing = state.widgets.iter().map(|widget| widget.kind).collect();
            (state.suggest_fence.issue(), existing)
        };

        let request = WidgetSuggestionRequest {
            connection_id,
            goal: goal.to_string(),
            existing,
        };
        let result = self.api.suggest_widgets(&request).await;

        let mut state = lock(&self.state);
        let Some(result) = state.suggest_fence.admit(token, result) else {
            tracing::debug!("discarding superseded widget suggestions");
            return Ok(None);
        };
        state.suggesting = false;
        match result {
            Ok(suggestions) => {
                let count = suggestions.len();
                state.suggestions = suggestions;
                Ok(Some(count))
            }
            Err(error) => {
                drop(state);
                self.notifier
                    .error(format!("Could not suggest widgets: {error}"));
                Err(error.into())
            }
        }
    }

    /// Moves a suggestion onto the board below the existing widgets.
    pub fn add_suggestion(&self, index: usize) -> Result<Widget, DashboardError> {
        let mut state = lock(&self.state);
        if index >= state.suggestions.len() {
            return Err(DashboardError::UnknownSuggestion(index));
        }
        let suggestion = state.suggestions.remove(index);
        Ok(state.push(suggestion.title, suggestion.kind, suggestion.sql))
    }

    pub fn add_widget(
        &self,
        title: &str,
        kind: WidgetKind,
        sql: Option<String>,
    ) -> Result<Widget, DashboardError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(DashboardError::EmptyTitle);
        }
        Ok(lock(&self.state).push(title.to_string(), kind, sql))
    }

    pub fn remove_widget(&self, widget_id: &str) -> bool {
        let mut state = lock(&self.state);
        let before = state.widgets.len();
        state.widgets.retain(|widget| widget.id != widget_id);
        state.widgets.len() != before
    }

    /// Manual placement. A layout request in flight is discarded so it
    /// cannot undo the move.
    pub fn move_widget(&self, widget_id: &str, x: u16, y: u16) -> Result<(), DashboardError> {
        let mut state = lock(&self.state);
        let widget = state
            .widgets
            .iter_mut()
            .find(|widget| widget.id == widget_id)
            .ok_or_else(|| DashboardError::UnknownWidget(widget_id.to_string()))?;
        let rect = GridRect { x, y, ..widget.rect };
        if !rect.fits() {
            return Err(DashboardError::OutOfBounds { x, w: rect.w });
        }
        widget.rect = rect;
        state.layout_fence.invalidate();
        state.laying_out = false;
        Ok(())
    }

    /// Asks the backend to arrange the current widgets. Placements for
    /// unknown widgets or off-grid rectangles are ignored.
    pub async fn auto_layout(&self) -> Result<Option<usize>, DashboardError> {
        let (token, widgets) = {
            let mut state = lock(&self.state);
            if state.widgets.is_empty() {
                return Ok(Some(0));
            }
            state.laying_out = true;
            (state.layout_fence.issue(), state.widgets.clone())
        };

        let result = self.api.layout_widgets(&widgets).await;

        let mut state = lock(&self.state);
        let Some(result) = state.layout_fence.admit(token, result) else {
            tracing::debug!("discarding superseded layout");
            return Ok(None);
        };
        state.laying_out = false;
        match result {
            Ok(placements) => {
                let mut applied = 0;
                for placement in placements {
                    if !placement.rect.fits() {
                        tracing::debug!(widget_id = %placement.widget_id, "skipping off-grid placement");
                        continue;
                    }
                    if let Some(widget) = state
                        .widgets
                        .iter_mut()
                        .find(|widget| widget.id == placement.widget_id)
                    {
                        widget.rect = placement.rect;
                        applied += 1;
                    }
                }
                Ok(Some(applied))
            }
            Err(error) => {
                drop(state);
                self.notifier
                    .error(format!("Could not arrange widgets: {error}"));
                Err(error.into())
            }
        }
    }
}
