//! The single owner of a DuckDB connection.
//!
//! A [`EngineGateway`] is not shared between threads; it lives on the engine
//! queue thread (see [`crate::EngineHandle`]) and every statement a session
//! issues passes through it in FIFO order. A second connection to the same
//! database can be obtained with [`EngineGateway::try_clone`] for work that
//! must not hold up the queue (full-table materialization).

use chrono::{DateTime, NaiveDate, NaiveTime};
use duckdb::arrow::datatypes::DataType;
use duckdb::types::{TimeUnit, ValueRef};
use duckdb::Connection;
use tablescope_model::{CellValue, ColumnDescriptor, Columns, EngineType};
use tablescope_sql::{io, mutation};

use crate::config::{EngineConfig, SQL_LOG_TARGET};
use crate::error::{Result, SessionError};

/// Days between 0001-01-01 (day 1 of the common era) and 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Fully materialized result of one statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub types: Vec<EngineType>,
    pub rows: Vec<Vec<CellValue>>,
}

impl QueryResult {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column_name(&self, idx: usize) -> Option<&str> {
        self.columns.get(idx).map(String::as_str)
    }

    pub fn column_type(&self, idx: usize) -> Option<&EngineType> {
        self.types.get(idx)
    }

    pub fn value(&self, row: usize, column: usize) -> Option<&CellValue> {
        self.rows.get(row).and_then(|r| r.get(column))
    }

    /// First column of the first row, as a non-negative integer.
    pub fn scalar_u64(&self) -> Result<u64> {
        self.value(0, 0)
            .and_then(CellValue::as_i64)
            .and_then(|v| u64::try_from(v).ok())
            .ok_or_else(|| SessionError::Query("expected a single non-negative integer".into()))
    }
}

pub struct EngineGateway {
    conn: Connection,
    sql_log: bool,
}

impl EngineGateway {
    /// Open a fresh in-memory database and apply `config`.
    pub fn open(config: &EngineConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|err| SessionError::Initialization(err.to_string()))?;
        let gateway = Self {
            conn,
            sql_log: config.sql_log,
        };
        gateway
            .configure(config)
            .map_err(|err| SessionError::Initialization(err.to_string()))?;
        Ok(gateway)
    }

    fn configure(&self, config: &EngineConfig) -> Result<()> {
        self.execute_batch(&io::set_threads(config.resolved_threads()))?;
        if let Some(dir) = config.resolved_temp_directory() {
            self.execute_batch(&io::set_temp_directory(&dir))?;
        }
        if let Some(bytes) = config.memory_limit_bytes {
            self.set_memory_limit(bytes)?;
        }
        Ok(())
    }

    /// A second connection to the same database.
    ///
    /// Connection-local state (temp tables) is not visible through the clone.
    pub fn try_clone(&self) -> Result<Self> {
        let conn = self
            .conn
            .try_clone()
            .map_err(|err| SessionError::Connection(err.to_string()))?;
        Ok(Self {
            conn,
            sql_log: self.sql_log,
        })
    }

    fn log(&self, sql: &str) {
        if self.sql_log {
            log::debug!(target: SQL_LOG_TARGET, "{sql}");
        }
    }

    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.log(sql);
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    /// Run one statement; returns the number of affected rows.
    pub fn execute(&self, sql: &str) -> Result<usize> {
        self.log(sql);
        Ok(self.conn.execute(sql, [])?)
    }

    pub fn query(&self, sql: &str) -> Result<QueryResult> {
        self.log(sql);
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query([])?;

        let (columns, types) = match rows.as_ref() {
            Some(stmt) => {
                let names = stmt.column_names();
                let types = (0..names.len())
                    .map(|idx| engine_type_of(&stmt.column_type(idx)))
                    .collect();
                (names, types)
            }
            None => (Vec::new(), Vec::new()),
        };

        let width = columns.len();
        let mut data = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(width);
            for idx in 0..width {
                values.push(cell_from_ref(row.get_ref(idx)?));
            }
            data.push(values);
        }

        Ok(QueryResult {
            columns,
            types,
            rows: data,
        })
    }

    pub fn query_count(&self, sql: &str) -> Result<u64> {
        self.query(sql)?.scalar_u64()
    }

    /// Column descriptors of `table`, in table order.
    pub fn table_schema(&self, table: &str) -> Result<Columns> {
        let info = self.query(&mutation::table_info(table))?;
        let columns: Vec<ColumnDescriptor> = info
            .rows
            .iter()
            .enumerate()
            .map(|(ordinal, row)| {
                let name = row.get(1).and_then(CellValue::as_str).unwrap_or_default();
                let engine_type = row
                    .get(2)
                    .and_then(CellValue::as_str)
                    .map(EngineType::parse)
                    .unwrap_or_else(|| EngineType::Other(String::new()));
                ColumnDescriptor::new(name, engine_type, ordinal)
            })
            .collect();
        if columns.is_empty() {
            return Err(SessionError::Query(format!("table {table:?} has no columns")));
        }
        Ok(columns.into())
    }

    pub fn set_memory_limit(&self, bytes: u64) -> Result<()> {
        self.execute_batch(&io::set_memory_limit(bytes))
    }
}

fn engine_type_of(data_type: &DataType) -> EngineType {
    match data_type {
        DataType::Boolean => EngineType::Boolean,
        DataType::Int8 => EngineType::TinyInt,
        DataType::Int16 => EngineType::SmallInt,
        DataType::Int32 => EngineType::Integer,
        DataType::Int64 => EngineType::BigInt,
        DataType::UInt8 => EngineType::UTinyInt,
        DataType::UInt16 => EngineType::USmallInt,
        DataType::UInt32 => EngineType::UInteger,
        DataType::UInt64 => EngineType::UBigInt,
        DataType::Float16 | DataType::Float32 => EngineType::Float,
        DataType::Float64 => EngineType::Double,
        DataType::Decimal128(width, scale) => EngineType::Decimal {
            width: *width,
            scale: u8::try_from(*scale).unwrap_or(0),
        },
        DataType::Utf8 | DataType::LargeUtf8 => EngineType::Varchar,
        DataType::Date32 | DataType::Date64 => EngineType::Date,
        DataType::Time32(_) | DataType::Time64(_) => EngineType::Time,
        DataType::Timestamp(_, None) => EngineType::Timestamp,
        DataType::Timestamp(_, Some(_)) => EngineType::TimestampTz,
        DataType::Interval(_) | DataType::Duration(_) => EngineType::Interval,
        DataType::Binary | DataType::LargeBinary | DataType::FixedSizeBinary(_) => {
            EngineType::Blob
        }
        other => EngineType::Other(format!("{other:?}")),
    }
}

pub(crate) fn cell_from_ref(value: ValueRef<'_>) -> CellValue {
    match value {
        ValueRef::Null => CellValue::Null,
        ValueRef::Boolean(b) => CellValue::Boolean(b),
        ValueRef::TinyInt(v) => CellValue::Integer(v.into()),
        ValueRef::SmallInt(v) => CellValue::Integer(v.into()),
        ValueRef::Int(v) => CellValue::Integer(v.into()),
        ValueRef::BigInt(v) => CellValue::Integer(v),
        ValueRef::HugeInt(v) => i64::try_from(v)
            .map(CellValue::Integer)
            .unwrap_or(CellValue::Double(v as f64)),
        ValueRef::UTinyInt(v) => CellValue::Integer(v.into()),
        ValueRef::USmallInt(v) => CellValue::Integer(v.into()),
        ValueRef::UInt(v) => CellValue::Integer(v.into()),
        ValueRef::UBigInt(v) => i64::try_from(v)
            .map(CellValue::Integer)
            .unwrap_or(CellValue::Double(v as f64)),
        ValueRef::Float(v) => CellValue::Double(v.into()),
        ValueRef::Double(v) => CellValue::Double(v),
        ValueRef::Decimal(d) => {
            let text = d.to_string();
            text.parse::<f64>()
                .map(CellValue::Double)
                .unwrap_or(CellValue::String(text))
        }
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            CellValue::String(String::from_utf8_lossy(bytes).into_owned())
        }
        ValueRef::Date32(days) => date_from_days(days),
        ValueRef::Timestamp(unit, v) => timestamp_from(unit, v),
        ValueRef::Time64(unit, v) => time_from(unit, v),
        other => CellValue::String(format!("{other:?}")),
    }
}

fn to_micros(unit: TimeUnit, value: i64) -> i64 {
    match unit {
        TimeUnit::Second => value.saturating_mul(1_000_000),
        TimeUnit::Millisecond => value.saturating_mul(1_000),
        TimeUnit::Microsecond => value,
        TimeUnit::Nanosecond => value / 1_000,
    }
}

fn split_micros(micros: i64) -> (i64, u32) {
    let secs = micros.div_euclid(1_000_000);
    let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
    (secs, nanos)
}

fn date_from_days(days: i32) -> CellValue {
    days.checked_add(UNIX_EPOCH_DAYS_FROM_CE)
        .and_then(NaiveDate::from_num_days_from_ce_opt)
        .map(|date| CellValue::Date(date.format("%Y-%m-%d").to_string()))
        .unwrap_or(CellValue::Null)
}

fn timestamp_from(unit: TimeUnit, value: i64) -> CellValue {
    let (secs, nanos) = split_micros(to_micros(unit, value));
    DateTime::from_timestamp(secs, nanos)
        .map(|ts| {
            CellValue::Date(ts.naive_utc().format("%Y-%m-%d %H:%M:%S%.f").to_string())
        })
        .unwrap_or(CellValue::Null)
}

fn time_from(unit: TimeUnit, value: i64) -> CellValue {
    let (secs, nanos) = split_micros(to_micros(unit, value));
    u32::try_from(secs)
        .ok()
        .and_then(|secs| NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos))
        .map(|time| CellValue::String(time.format("%H:%M:%S%.f").to_string()))
        .unwrap_or(CellValue::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> EngineGateway {
        EngineGateway::open(&EngineConfig {
            threads: Some(1),
            ..EngineConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn query_converts_engine_values() {
        let engine = gateway();
        let result = engine
            .query(
                "SELECT 42::BIGINT AS n, 1.5::DOUBLE AS d, 'x' AS s, NULL AS z, true AS b, \
                 DATE '2024-03-01' AS day, TIMESTAMP '2024-03-01 12:30:00' AS ts",
            )
            .unwrap();
        assert_eq!(
            result.columns,
            vec!["n", "d", "s", "z", "b", "day", "ts"]
        );
        assert_eq!(result.column_type(0), Some(&EngineType::BigInt));
        assert_eq!(
            result.rows[0],
            vec![
                CellValue::Integer(42),
                CellValue::Double(1.5),
                CellValue::String("x".into()),
                CellValue::Null,
                CellValue::Boolean(true),
                CellValue::Date("2024-03-01".into()),
                CellValue::Date("2024-03-01 12:30:00".into()),
            ]
        );
    }

    #[test]
    fn table_schema_reports_declared_types() {
        let engine = gateway();
        engine
            .execute_batch("CREATE TABLE t (a BIGINT, b VARCHAR, c DECIMAL(18,3))")
            .unwrap();
        let schema = engine.table_schema("t").unwrap();
        let names: Vec<&str> = schema.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(
            schema[2].engine_type,
            EngineType::Decimal { width: 18, scale: 3 }
        );
        assert!(matches!(
            engine.table_schema("missing"),
            Err(SessionError::Query(_))
        ));
    }

    #[test]
    fn clone_sees_persistent_tables() {
        let engine = gateway();
        let clone = engine.try_clone().unwrap();
        clone
            .execute_batch("CREATE TABLE shared AS SELECT * FROM range(3)")
            .unwrap();
        assert_eq!(engine.query_count("SELECT COUNT(*) FROM shared").unwrap(), 3);
    }

    #[test]
    fn pre_epoch_dates_format() {
        assert_eq!(date_from_days(-1), CellValue::Date("1969-12-31".into()));
        assert_eq!(
            timestamp_from(TimeUnit::Microsecond, -1),
            CellValue::Date("1969-12-31 23:59:59.999999".into())
        );
    }
}
