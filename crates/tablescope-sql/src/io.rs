//! Ingest, export and engine-setting statements.

use std::path::Path;

use tablescope_model::{user_columns, ColumnDescriptor, LoadOptions, ROW_ID_COLUMN};

use crate::quote::{quote_identifier, quote_literal};

/// Smallest memory limit handed to the engine, in megabytes.
const MIN_MEMORY_LIMIT_MB: u64 = 64;

/// `read_csv(...)` table function call for `path`.
///
/// Malformed rows are skipped (`ignore_errors`) rather than failing the load.
/// A quoted empty field reads as an empty string and only an unquoted empty
/// field reads as `NULL`.
pub fn read_csv_call(path: &Path, options: &LoadOptions) -> String {
    let mut args = vec![
        quote_literal(&path.to_string_lossy()),
        "ignore_errors = true".to_string(),
        "allow_quoted_nulls = false".to_string(),
        format!("header = {}", options.has_header),
    ];
    if let Some(delimiter) = options.delimiter {
        args.push(format!("delim = {}", quote_literal(&delimiter.to_string())));
    }
    format!("read_csv({})", args.join(", "))
}

/// First `limit` rows into a connection-local preview table.
pub fn create_preview_table(table: &str, path: &Path, options: &LoadOptions, limit: u64) -> String {
    format!(
        "CREATE OR REPLACE TEMP TABLE {} AS SELECT * FROM {} LIMIT {limit}",
        quote_identifier(table),
        read_csv_call(path, options)
    )
}

/// Full materialization with the synthetic identity column in front.
pub fn create_table_from_csv(table: &str, path: &Path, options: &LoadOptions) -> String {
    format!(
        "CREATE OR REPLACE TABLE {} AS SELECT row_number() OVER () AS {}, * FROM {}",
        quote_identifier(table),
        quote_identifier(ROW_ID_COLUMN),
        read_csv_call(path, options)
    )
}

pub fn count_rows(table: &str) -> String {
    format!("SELECT COUNT(*) FROM {}", quote_identifier(table))
}

/// Native CSV export of every user column in identity order.
///
/// Every field is force-quoted so a reload can tell an empty string (`""`)
/// from a null (empty, unquoted).
pub fn copy_to_csv(
    table: &str,
    columns: &[ColumnDescriptor],
    path: &Path,
    delimiter: char,
    header: bool,
) -> String {
    let select: Vec<String> = user_columns(columns)
        .map(|c| quote_identifier(&c.name))
        .collect();
    let select = if select.is_empty() {
        "*".to_string()
    } else {
        select.join(", ")
    };
    let order = if columns.iter().any(ColumnDescriptor::is_internal) {
        format!(" ORDER BY {}", quote_identifier(ROW_ID_COLUMN))
    } else {
        String::new()
    };
    format!(
        "COPY (SELECT {select} FROM {}{order}) TO {} (FORMAT CSV, HEADER {header}, DELIMITER {}, FORCE_QUOTE *)",
        quote_identifier(table),
        quote_literal(&path.to_string_lossy()),
        quote_literal(&delimiter.to_string()),
    )
}

pub fn set_memory_limit(bytes: u64) -> String {
    let megabytes = (bytes / 1_000_000).max(MIN_MEMORY_LIMIT_MB);
    format!("SET memory_limit = '{megabytes}MB'")
}

pub fn set_threads(threads: usize) -> String {
    format!("SET threads = {}", threads.max(1))
}

pub fn set_temp_directory(dir: &Path) -> String {
    format!("SET temp_directory = {}", quote_literal(&dir.to_string_lossy()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tablescope_model::EngineType;

    #[test]
    fn ingest_tolerates_bad_rows_and_adds_identity() {
        let options = LoadOptions::default().with_delimiter(Some(';'));
        assert_eq!(
            create_table_from_csv("data", Path::new("/tmp/it's.csv"), &options),
            "CREATE OR REPLACE TABLE \"data\" AS SELECT row_number() OVER () AS \"__rowid\", * \
             FROM read_csv('/tmp/it''s.csv', ignore_errors = true, allow_quoted_nulls = false, \
             header = true, delim = ';')"
        );
    }

    #[test]
    fn preview_omits_delimiter_when_auto_detecting() {
        let options = LoadOptions::default().with_header(false);
        assert_eq!(
            create_preview_table("preview", Path::new("/d.csv"), &options, 1000),
            "CREATE OR REPLACE TEMP TABLE \"preview\" AS SELECT * FROM \
             read_csv('/d.csv', ignore_errors = true, allow_quoted_nulls = false, \
             header = false) LIMIT 1000"
        );
    }

    #[test]
    fn export_excludes_identity_and_forces_quotes() {
        let columns = [
            ColumnDescriptor::new(ROW_ID_COLUMN, EngineType::BigInt, 0),
            ColumnDescriptor::new("a", EngineType::BigInt, 1),
            ColumnDescriptor::new("b", EngineType::Varchar, 2),
        ];
        assert_eq!(
            copy_to_csv("data", &columns, Path::new("/out.csv"), '\t', true),
            "COPY (SELECT \"a\", \"b\" FROM \"data\" ORDER BY \"__rowid\") TO '/out.csv' \
             (FORMAT CSV, HEADER true, DELIMITER '\t', FORCE_QUOTE *)"
        );
    }

    #[test]
    fn memory_limit_has_floor() {
        assert_eq!(set_memory_limit(0), "SET memory_limit = '64MB'");
        assert_eq!(set_memory_limit(8_000_000_000), "SET memory_limit = '8000MB'");
    }
}
