//! Session coordination for tablescope.
//!
//! A [`SessionHandle`] fronts one open delimited file: a preview, then a fully
//! materialized DuckDB table, with paging through an LRU [`PageCache`],
//! schema and cell edits, export, column profiling and header summaries. All
//! SQL for a session runs in submission order on one engine thread
//! ([`EngineHandle`]); results that arrive after the view changed are
//! discarded by generation checks instead of being cancelled.

mod budget;
mod cache;
mod config;
mod engine;
mod error;
mod export;
mod profile;
mod queue;
mod session;
mod summary;
mod transcode;

pub use budget::MemoryBudget;
pub use cache::{CacheStats, Page, PageCache};
pub use config::{EngineConfig, SessionConfig, SQL_LOG_ENV, SQL_LOG_TARGET};
pub use engine::{EngineGateway, QueryResult};
pub use error::{Operation, Result, SessionError};
pub use export::{export_table, SaveTarget};
pub use profile::{
    BooleanCounts, ColumnOverview, DescriptiveStats, Distribution, Histogram, HistogramBin,
    Overview, ProfileOutcome, ProfileRequest, ProfileResult, ValueCount,
};
pub use queue::EngineHandle;
pub use session::{
    FetchOutcome, LoadProgress, Mutation, MutationOutcome, Phase, SessionBuilder, SessionEvent,
    SessionHandle, SessionSnapshot, SessionStats,
};
pub use summary::{ColumnSummary, SummaryShape};
pub use transcode::{stage_utf8, EncodingRsTranscoder, Transcoder};
