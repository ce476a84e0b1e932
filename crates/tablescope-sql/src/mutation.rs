//! DDL/DML for in-place edits of a materialized table.

use tablescope_model::{CellValue, EngineType, ROW_ID_COLUMN};

use crate::quote::{quote_identifier, quote_literal, value_literal};

/// Prefix of the scratch column used while retyping through a copy.
const RETYPE_PREFIX: &str = "__retype_";

/// `PRAGMA table_info`; rows are `cid, name, type, notnull, dflt_value, pk`.
pub fn table_info(table: &str) -> String {
    format!("PRAGMA table_info({})", quote_literal(table))
}

pub fn add_column(table: &str, column: &str, engine_type: &EngineType) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN {} {}",
        quote_identifier(table),
        quote_identifier(column),
        engine_type.sql_name()
    )
}

pub fn rename_column(table: &str, from: &str, to: &str) -> String {
    format!(
        "ALTER TABLE {} RENAME COLUMN {} TO {}",
        quote_identifier(table),
        quote_identifier(from),
        quote_identifier(to)
    )
}

pub fn drop_column(table: &str, column: &str) -> String {
    format!(
        "ALTER TABLE {} DROP COLUMN {}",
        quote_identifier(table),
        quote_identifier(column)
    )
}

/// Direct in-place type change; fails when any value does not convert.
pub fn alter_column_type(table: &str, column: &str, engine_type: &EngineType) -> String {
    format!(
        "ALTER TABLE {} ALTER COLUMN {} TYPE {}",
        quote_identifier(table),
        quote_identifier(column),
        engine_type.sql_name()
    )
}

/// Copy-based type change used when the direct `ALTER` is rejected.
///
/// Values that do not convert become `NULL` (`TRY_CAST`). If one of
/// [`RetypeFallback::steps`] fails, run [`RetypeFallback::cleanup`] before
/// reporting the error. Once every step has succeeded the original column is
/// gone and the converted values live only in the scratch column, so a failing
/// [`RetypeFallback::rename`] must not be followed by the cleanup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetypeFallback {
    /// Add the scratch column, fill it, drop the original.
    pub steps: Vec<String>,
    /// Move the scratch column into the original's place.
    pub rename: String,
    pub cleanup: String,
    pub temp_column: String,
}

pub fn retype_fallback(table: &str, column: &str, engine_type: &EngineType) -> RetypeFallback {
    let temp_column = format!("{RETYPE_PREFIX}{column}");
    let t = quote_identifier(table);
    let c = quote_identifier(column);
    let tmp = quote_identifier(&temp_column);
    let ty = engine_type.sql_name();
    RetypeFallback {
        steps: vec![
            format!("ALTER TABLE {t} ADD COLUMN {tmp} {ty}"),
            format!("UPDATE {t} SET {tmp} = TRY_CAST({c} AS {ty})"),
            format!("ALTER TABLE {t} DROP COLUMN {c}"),
        ],
        rename: format!("ALTER TABLE {t} RENAME COLUMN {tmp} TO {c}"),
        cleanup: format!("ALTER TABLE {t} DROP COLUMN IF EXISTS {tmp}"),
        temp_column,
    }
}

/// Append an all-null row with the next identity value; returns that value.
pub fn insert_blank_row(table: &str) -> String {
    let t = quote_identifier(table);
    let id = quote_identifier(ROW_ID_COLUMN);
    format!("INSERT INTO {t} ({id}) SELECT COALESCE(MAX({id}), 0) + 1 FROM {t} RETURNING {id}")
}

/// `None` when there is nothing to delete.
pub fn delete_rows(table: &str, row_ids: &[i64]) -> Option<String> {
    if row_ids.is_empty() {
        return None;
    }
    let ids: Vec<String> = row_ids.iter().map(i64::to_string).collect();
    Some(format!(
        "DELETE FROM {} WHERE {} IN ({})",
        quote_identifier(table),
        quote_identifier(ROW_ID_COLUMN),
        ids.join(", ")
    ))
}

pub fn update_cell(table: &str, row_id: i64, column: &str, value: &CellValue) -> String {
    format!(
        "UPDATE {} SET {} = {} WHERE {} = {row_id}",
        quote_identifier(table),
        quote_identifier(column),
        value_literal(value),
        quote_identifier(ROW_ID_COLUMN)
    )
}

pub fn drop_table(table: &str) -> String {
    format!("DROP TABLE IF EXISTS {}", quote_identifier(table))
}
