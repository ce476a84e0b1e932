//! `tablescope-model` defines the values and view descriptions shared by the
//! SQL builder and the session coordinator.
//!
//! Everything here is plain data: no I/O and no engine access, so the types
//! can cross task and IPC boundaries (`serde` throughout).

mod aggregate;
mod display;
mod schema;
mod source;
mod value;
pub mod view;

pub use aggregate::{Aggregate, AggregateFunction, AggregationSpec};
pub use display::{format_cell, DisplayConfig};
pub use schema::{
    find_column, user_columns, ColumnDescriptor, Columns, DisplayType, EngineType, ROW_ID_COLUMN,
};
pub use source::{resolve_encoding, LoadOptions, SniffResult, SourceError};
pub use value::CellValue;
pub use view::{
    ColumnFilter, ComputedColumn, FilterOperator, FilterValue, SortColumn, SortDirection,
    ViewChange, ViewState, VisibleRange,
};
