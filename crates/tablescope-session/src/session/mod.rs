//! The session coordinator.
//!
//! A session is a tokio task that exclusively owns everything mutable about
//! one open dataset: phase, schema, view state, page cache and generation
//! counters. Callers talk to it through a cloneable [`SessionHandle`]. SQL runs
//! on the session's serial engine queue; results come back to the task as
//! completions and are checked against the current generation before they are
//! applied, so a superseded result is never cached or reported as current.

mod actor;
mod handle;
mod jobs;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tablescope_model::{CellValue, Columns, EngineType, LoadOptions, ViewState};

use crate::cache::{CacheStats, Page};
use crate::error::Operation;

pub use handle::{SessionBuilder, SessionHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Empty,
    PreviewLoaded,
    FullyLoaded,
    Reloading,
}

/// Milestones reported while the full table is materialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadProgress {
    Started,
    Reading,
    Materialized { rows: u64 },
    Finished { rows: u64 },
    Failed { message: String },
}

/// Reply to a page request.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Fetched(Page),
    /// The view or the page changed while the query was running; nothing was
    /// cached. Ask again.
    Stale,
}

impl FetchOutcome {
    pub fn page(self) -> Option<Page> {
        match self {
            FetchOutcome::Fetched(page) => Some(page),
            FetchOutcome::Stale => None,
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, FetchOutcome::Stale)
    }
}

/// Notifications for the table view.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Visible rows must be re-requested. `None` means every page.
    RowsInvalidated { pages: Option<Vec<u64>> },
    PagesLoaded { pages: Vec<u64> },
    RowCountChanged { total_rows: u64, filtered_rows: u64 },
    SchemaChanged { columns: Columns },
    ModifiedChanged { modified: bool },
    PhaseChanged { phase: Phase },
}

/// A schema or data edit, addressed by display row.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    AddColumn { name: String, engine_type: EngineType },
    RenameColumn { from: String, to: String },
    ChangeColumnType { column: String, engine_type: EngineType },
    DeleteColumn { column: String },
    AddRow,
    DeleteRows { rows: Vec<u64> },
    UpdateCell { row: u64, column: String, value: CellValue },
}

impl Mutation {
    pub fn operation(&self) -> Operation {
        match self {
            Mutation::AddColumn { .. } => Operation::AddingColumn,
            Mutation::RenameColumn { .. } => Operation::RenamingColumn,
            Mutation::ChangeColumnType { .. } => Operation::ChangingColumnType,
            Mutation::DeleteColumn { .. } => Operation::DeletingColumn,
            Mutation::AddRow => Operation::AddingRow,
            Mutation::DeleteRows { .. } => Operation::DeletingRows,
            Mutation::UpdateCell { .. } => Operation::EditingCell,
        }
    }

    fn changes_schema(&self) -> bool {
        matches!(
            self,
            Mutation::AddColumn { .. }
                | Mutation::RenameColumn { .. }
                | Mutation::ChangeColumnType { .. }
                | Mutation::DeleteColumn { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MutationOutcome {
    pub affected_rows: u64,
    /// Identity value of an inserted row.
    pub row_id: Option<i64>,
}

/// Query counters, mostly useful to tests and diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub page_queries: u64,
    pub count_queries: u64,
    /// Column-summary queries started, the overview included.
    pub summary_queries: u64,
    pub stale_results: u64,
}

/// Point-in-time copy of a session's state.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub id: u64,
    pub phase: Phase,
    pub modified: bool,
    pub derived: bool,
    pub source: Option<PathBuf>,
    pub load_options: Option<LoadOptions>,
    pub table: String,
    pub columns: Columns,
    pub view: ViewState,
    pub total_rows: u64,
    pub generation: u64,
    pub profiler_generation: u64,
    pub summary_generation: u64,
    pub cached_pages: Vec<u64>,
    pub cache: CacheStats,
    pub stats: SessionStats,
}

impl SessionSnapshot {
    pub fn filtered_rows(&self) -> u64 {
        self.view.total_filtered_rows
    }

    /// Loaded with unsaved edits.
    pub fn is_dirty(&self) -> bool {
        self.phase == Phase::FullyLoaded && self.modified
    }
}
