use std::fmt;
use std::path::PathBuf;

use tablescope_model::SourceError;
use tablescope_sql::{AggregationError, ExpressionError};
use thiserror::Error;

/// User-facing description of what a session was doing when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    OpeningFile,
    LoadingFile,
    ReloadingFile,
    SavingFile,
    AddingColumn,
    RenamingColumn,
    ChangingColumnType,
    DeletingColumn,
    AddingRow,
    DeletingRows,
    EditingCell,
    Profiling,
    Summarizing,
    Aggregating,
    PreviewingExpression,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::OpeningFile => "opening file",
            Operation::LoadingFile => "loading file",
            Operation::ReloadingFile => "reloading file",
            Operation::SavingFile => "saving file",
            Operation::AddingColumn => "adding column",
            Operation::RenamingColumn => "renaming column",
            Operation::ChangingColumnType => "changing column type",
            Operation::DeletingColumn => "deleting column",
            Operation::AddingRow => "adding row",
            Operation::DeletingRows => "deleting rows",
            Operation::EditingCell => "editing cell",
            Operation::Profiling => "profiling column",
            Operation::Summarizing => "summarizing columns",
            Operation::Aggregating => "aggregating rows",
            Operation::PreviewingExpression => "previewing expression",
        })
    }
}

/// Every failure a session can report.
///
/// Errors are `Clone` because one engine result may be delivered to several
/// waiters (e.g. concurrent requests for the same page).
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("failed to initialize engine: {0}")]
    Initialization(String),
    #[error("engine connection error: {0}")]
    Connection(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),
    #[error("failed to load data: {0}")]
    Load(String),
    #[error("invalid expression: {0}")]
    InvalidExpression(#[from] ExpressionError),
    #[error("invalid aggregation: {0}")]
    InvalidAggregation(#[from] AggregationError),
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error("i/o error: {0}")]
    Io(String),
    /// No table is materialized yet, or the session has no backing file.
    #[error("no data loaded")]
    NotLoaded,
    #[error("row {0} is not loaded")]
    RowNotLoaded(u64),
    #[error("unknown column {0:?}")]
    UnknownColumn(String),
    #[error("session is closed")]
    Closed,
    #[error("{operation} failed: {source}")]
    Operation {
        operation: Operation,
        #[source]
        source: Box<SessionError>,
    },
}

impl SessionError {
    /// Attach a user-facing context phrase. Already-contextualized errors are
    /// left alone so the innermost operation wins.
    pub fn during(self, operation: Operation) -> Self {
        match self {
            SessionError::Operation { .. } | SessionError::Closed => self,
            other => SessionError::Operation {
                operation,
                source: Box::new(other),
            },
        }
    }

    /// The error without any [`SessionError::Operation`] wrapper.
    pub fn root(&self) -> &SessionError {
        match self {
            SessionError::Operation { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn operation(&self) -> Option<Operation> {
        match self {
            SessionError::Operation { operation, .. } => Some(*operation),
            _ => None,
        }
    }
}

impl From<duckdb::Error> for SessionError {
    fn from(err: duckdb::Error) -> Self {
        SessionError::Query(err.to_string())
    }
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        SessionError::Io(err.to_string())
    }
}

impl From<SourceError> for SessionError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::UnknownEncoding(_) => SessionError::Encoding(err.to_string()),
            SourceError::UnsupportedDelimiter(_) => SessionError::Load(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
