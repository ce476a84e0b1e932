//! SQL text generation for tablescope.
//!
//! Nothing in this crate touches an engine: every function is a pure mapping
//! from model types to DuckDB-dialect SQL, so identical inputs always yield
//! byte-identical statements. User-supplied identifiers and values only ever
//! reach SQL through [`quote_identifier`] and [`quote_literal`]; free-form
//! computed-column expressions go through [`validate_expression`] first.

mod aggregate;
mod builder;
mod guard;
pub mod io;
pub mod mutation;
pub mod profile;
mod quote;

pub use aggregate::{create_summary_table, AggregationError};
pub use builder::{filter_condition, SqlBuilder};
pub use guard::{preview_statements, validate_expression, ExpressionError};
pub use quote::{
    escape_clause, escape_like, format_number, like_pattern, quote_identifier, quote_literal,
    value_literal, LIKE_ESCAPE,
};
