//! Engine work submitted by the session actor.
//!
//! Everything here runs on the engine queue thread (or, for the full load, a
//! blocking task with a cloned connection). Jobs receive owned copies of what
//! they need and never see actor state.

use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;

use tablescope_model::{CellValue, Columns, EngineType, LoadOptions, ViewState};
use tablescope_sql::{io, mutation, SqlBuilder};
use tempfile::NamedTempFile;
use tokio::sync::mpsc::UnboundedSender;

use crate::engine::{EngineGateway, QueryResult};
use crate::error::{Result, SessionError};
use crate::transcode::{stage_utf8, Transcoder};

use super::LoadProgress;

/// The file behind a session and how to read it.
#[derive(Clone)]
pub(crate) struct Source {
    pub path: PathBuf,
    pub options: LoadOptions,
    /// UTF-8 copy of a file in another encoding; deleted on drop.
    pub staged: Option<Arc<NamedTempFile>>,
}

impl Source {
    pub fn new(path: PathBuf, options: LoadOptions) -> Self {
        Self {
            path,
            options,
            staged: None,
        }
    }

    /// Path the engine reads: the file itself, or a UTF-8 staging copy.
    fn prepare(&mut self, transcoder: &dyn Transcoder) -> Result<PathBuf> {
        if !self.path.exists() {
            return Err(SessionError::FileNotFound(self.path.clone()));
        }
        self.options.validate()?;
        if self.options.is_utf8() {
            self.staged = None;
            return Ok(self.path.clone());
        }
        let staged = match &self.staged {
            Some(staged) => staged.clone(),
            None => {
                let encoding = self.options.resolved_encoding()?;
                let staged = Arc::new(stage_utf8(&self.path, encoding, transcoder)?);
                self.staged = Some(staged.clone());
                staged
            }
        };
        Ok(staged.path().to_path_buf())
    }
}

pub(crate) struct PreviewLoad {
    pub source: Source,
    pub columns: Columns,
    pub rows: QueryResult,
}

pub(crate) struct Materialized {
    pub source: Option<Source>,
    pub columns: Columns,
    pub rows: u64,
}

pub(crate) fn load_preview(
    engine: &EngineGateway,
    mut source: Source,
    transcoder: &dyn Transcoder,
    table: &str,
    limit: u64,
) -> Result<PreviewLoad> {
    let path = source.prepare(transcoder)?;
    engine
        .execute_batch(&io::create_preview_table(table, &path, &source.options, limit))
        .map_err(|err| SessionError::Load(err.to_string()))?;
    let columns = engine.table_schema(table)?;
    let sql = SqlBuilder::new(table).page_query(&ViewState::new(), &columns, 0..limit)?;
    let rows = engine.query(&sql)?;
    log::info!(
        "previewed {} ({} rows, {} columns)",
        source.path.display(),
        rows.row_count(),
        columns.len()
    );
    Ok(PreviewLoad {
        source,
        columns,
        rows,
    })
}

/// Read the whole file into `table`, with the identity column.
pub(crate) fn materialize(
    engine: &EngineGateway,
    mut source: Source,
    transcoder: &dyn Transcoder,
    table: &str,
    progress: Option<&UnboundedSender<LoadProgress>>,
) -> Result<Materialized> {
    let report = |milestone: LoadProgress| {
        if let Some(progress) = progress {
            let _ = progress.send(milestone);
        }
    };

    report(LoadProgress::Reading);
    let path = source.prepare(transcoder)?;
    engine
        .execute_batch(&io::create_table_from_csv(table, &path, &source.options))
        .map_err(|err| SessionError::Load(err.to_string()))?;
    let columns = engine.table_schema(table)?;
    let rows = engine.query_count(&io::count_rows(table))?;
    report(LoadProgress::Materialized { rows });
    log::info!(
        "loaded {} into {table:?} ({rows} rows)",
        source.path.display()
    );
    Ok(Materialized {
        source: Some(source),
        columns,
        rows,
    })
}

/// A mutation with display rows already resolved to identity values.
#[derive(Debug, Clone)]
pub(crate) enum Edit {
    AddColumn { name: String, engine_type: EngineType },
    RenameColumn { from: String, to: String },
    ChangeColumnType { column: String, engine_type: EngineType },
    DeleteColumn { column: String },
    AddRow,
    DeleteRows { row_ids: Vec<i64> },
    UpdateCell { row_id: i64, column: String, value: CellValue },
}

pub(crate) struct EditApplied {
    pub columns: Columns,
    pub affected: u64,
    pub row_id: Option<i64>,
}

pub(crate) fn apply_edit(engine: &EngineGateway, table: &str, edit: &Edit) -> Result<EditApplied> {
    let mut affected = 0;
    let mut row_id = None;
    match edit {
        Edit::AddColumn { name, engine_type } => {
            engine.execute_batch(&mutation::add_column(table, name, engine_type))?;
        }
        Edit::RenameColumn { from, to } => {
            engine.execute_batch(&mutation::rename_column(table, from, to))?;
        }
        Edit::ChangeColumnType {
            column,
            engine_type,
        } => change_column_type(engine, table, column, engine_type)?,
        Edit::DeleteColumn { column } => {
            engine.execute_batch(&mutation::drop_column(table, column))?;
        }
        Edit::AddRow => {
            let inserted = engine.query(&mutation::insert_blank_row(table))?;
            row_id = inserted.value(0, 0).and_then(CellValue::as_i64);
            affected = 1;
        }
        Edit::DeleteRows { row_ids } => {
            if let Some(sql) = mutation::delete_rows(table, row_ids) {
                affected = engine.execute(&sql)? as u64;
            }
        }
        Edit::UpdateCell {
            row_id: id,
            column,
            value,
        } => {
            affected = engine.execute(&mutation::update_cell(table, *id, column, value))? as u64;
        }
    }
    Ok(EditApplied {
        columns: engine.table_schema(table)?,
        affected,
        row_id,
    })
}

/// `ALTER COLUMN ... TYPE`, falling back to a `TRY_CAST` copy when the direct
/// conversion is rejected. A failed fallback leaves no scratch column behind.
fn change_column_type(
    engine: &EngineGateway,
    table: &str,
    column: &str,
    engine_type: &EngineType,
) -> Result<()> {
    let direct = match engine.execute_batch(&mutation::alter_column_type(table, column, engine_type)) {
        Ok(()) => return Ok(()),
        Err(err) => err,
    };
    log::debug!("retyping {column:?} to {engine_type} in place failed ({direct}); copying instead");

    let plan = mutation::retype_fallback(table, column, engine_type);
    for step in &plan.steps {
        if let Err(err) = engine.execute_batch(step) {
            if let Err(cleanup) = engine.execute_batch(&plan.cleanup) {
                log::warn!("failed to drop {:?}: {cleanup}", plan.temp_column);
            }
            return Err(err);
        }
    }
    // The original column is gone; the scratch column holds the only copy.
    engine.execute_batch(&plan.rename).map_err(|err| {
        log::warn!(
            "converted values of {column:?} left in {:?}: {err}",
            plan.temp_column
        );
        err
    })
}

/// Evaluate a validated expression preview; the transaction is always rolled back.
pub(crate) fn preview_expression(
    engine: &EngineGateway,
    statements: [String; 3],
) -> Result<Vec<CellValue>> {
    let [begin, select, rollback] = statements;
    engine.execute_batch(&begin)?;
    let result = engine.query(&select);
    if let Err(err) = engine.execute_batch(&rollback) {
        log::warn!("expression preview rollback failed: {err}");
    }
    Ok(result?
        .rows
        .into_iter()
        .map(|row| row.into_iter().next().unwrap_or_default())
        .collect())
}

pub(crate) fn create_summary_table(
    engine: &EngineGateway,
    table: &str,
    sql: &str,
) -> Result<Materialized> {
    engine.execute_batch(sql)?;
    let columns = engine.table_schema(table)?;
    let rows = engine.query_count(&io::count_rows(table))?;
    Ok(Materialized {
        source: None,
        columns,
        rows,
    })
}

pub(crate) fn drop_tables(engine: &EngineGateway, tables: &[String]) -> Result<()> {
    for table in tables {
        engine.execute_batch(&mutation::drop_table(table))?;
    }
    Ok(())
}

/// Split preview rows into pages of `page_size`.
pub(crate) fn paginate(
    rows: Vec<Vec<CellValue>>,
    page_size: u64,
) -> impl Iterator<Item = (Range<u64>, Vec<Vec<CellValue>>)> {
    let page_size = page_size.max(1) as usize;
    let mut rows = rows.into_iter().peekable();
    let mut start = 0u64;
    std::iter::from_fn(move || {
        rows.peek()?;
        let chunk: Vec<_> = rows.by_ref().take(page_size).collect();
        let range = start..start + chunk.len() as u64;
        start = range.end;
        Some((range, chunk))
    })
}
