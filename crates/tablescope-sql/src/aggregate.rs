use std::collections::HashSet;

use tablescope_model::{find_column, AggregateFunction, AggregationSpec, ColumnDescriptor, ROW_ID_COLUMN};
use thiserror::Error;

use crate::quote::quote_identifier;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregationError {
    #[error("aggregation needs at least one group-by column or aggregate")]
    Empty,
    #[error("unknown column {0:?}")]
    UnknownColumn(String),
    #[error("{0:?} requires a column")]
    MissingColumn(AggregateFunction),
    #[error("duplicate output column {0:?}")]
    DuplicateOutput(String),
}

/// Materialize a group-by of `relation` into a temp table.
///
/// The result gets its own identity column, numbered in group order, so the
/// derived table pages like any loaded file.
pub fn create_summary_table(
    table: &str,
    relation: &str,
    columns: &[ColumnDescriptor],
    spec: &AggregationSpec,
) -> Result<String, AggregationError> {
    if spec.is_empty() {
        return Err(AggregationError::Empty);
    }

    let mut outputs = HashSet::new();
    let mut select = Vec::with_capacity(spec.group_by.len() + spec.aggregates.len());
    for group in &spec.group_by {
        if find_column(columns, group).is_none() {
            return Err(AggregationError::UnknownColumn(group.clone()));
        }
        if !outputs.insert(group.clone()) {
            return Err(AggregationError::DuplicateOutput(group.clone()));
        }
        select.push(quote_identifier(group));
    }

    for aggregate in &spec.aggregates {
        let argument = match (&aggregate.column, aggregate.function) {
            (None, AggregateFunction::Count) => "*".to_string(),
            (None, function) => return Err(AggregationError::MissingColumn(function)),
            (Some(column), function) => {
                if find_column(columns, column).is_none() {
                    return Err(AggregationError::UnknownColumn(column.clone()));
                }
                if function == AggregateFunction::CountDistinct {
                    format!("DISTINCT {}", quote_identifier(column))
                } else {
                    quote_identifier(column)
                }
            }
        };
        let output = aggregate.output_name();
        if output == ROW_ID_COLUMN || !outputs.insert(output.clone()) {
            return Err(AggregationError::DuplicateOutput(output));
        }
        select.push(format!(
            "{}({argument}) AS {}",
            aggregate.function.sql_name(),
            quote_identifier(&output)
        ));
    }

    let (group_clause, order) = if spec.group_by.is_empty() {
        (String::new(), String::new())
    } else {
        let keys: Vec<String> = spec.group_by.iter().map(|g| quote_identifier(g)).collect();
        let keys = keys.join(", ");
        (format!(" GROUP BY {keys}"), format!("ORDER BY {keys}"))
    };

    Ok(format!(
        "CREATE OR REPLACE TEMP TABLE {} AS SELECT row_number() OVER ({order}) AS {}, * \
         FROM (SELECT {} FROM {relation}{group_clause})",
        quote_identifier(table),
        quote_identifier(ROW_ID_COLUMN),
        select.join(", ")
    ))
}
