use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Name of the synthetic identity column appended at full-load time.
///
/// Rows have no natural key, so every materialized table carries this
/// `row_number()` column to keep rows addressable across sorts and filters.
pub const ROW_ID_COLUMN: &str = "__rowid";

/// Immutable snapshot of a table's columns.
///
/// Schema changes produce a new list; holders keep the list that was current
/// when they received it.
pub type Columns = Arc<[ColumnDescriptor]>;

/// Engine-level column type, parsed from DuckDB type names.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineType {
    Boolean,
    TinyInt,
    SmallInt,
    Integer,
    BigInt,
    HugeInt,
    UTinyInt,
    USmallInt,
    UInteger,
    UBigInt,
    Float,
    Double,
    Decimal { width: u8, scale: u8 },
    Varchar,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Interval,
    Blob,
    Uuid,
    /// Anything else (lists, structs, enums...), kept verbatim.
    Other(String),
}

impl EngineType {
    /// Parse a type name as reported by `PRAGMA table_info` / `DESCRIBE`.
    pub fn parse(name: &str) -> Self {
        let normalized = name.trim().to_ascii_uppercase();
        if let Some(args) = normalized
            .strip_prefix("DECIMAL(")
            .or_else(|| normalized.strip_prefix("NUMERIC("))
            .and_then(|rest| rest.strip_suffix(')'))
        {
            let mut parts = args.split(',').map(|p| p.trim().parse::<u8>());
            if let (Some(Ok(width)), Some(Ok(scale))) = (parts.next(), parts.next()) {
                return EngineType::Decimal { width, scale };
            }
        }

        match normalized.as_str() {
            "BOOLEAN" | "BOOL" | "LOGICAL" => EngineType::Boolean,
            "TINYINT" | "INT1" => EngineType::TinyInt,
            "SMALLINT" | "INT2" | "SHORT" => EngineType::SmallInt,
            "INTEGER" | "INT4" | "INT" | "SIGNED" => EngineType::Integer,
            "BIGINT" | "INT8" | "LONG" => EngineType::BigInt,
            "HUGEINT" | "INT128" => EngineType::HugeInt,
            "UTINYINT" => EngineType::UTinyInt,
            "USMALLINT" => EngineType::USmallInt,
            "UINTEGER" => EngineType::UInteger,
            "UBIGINT" => EngineType::UBigInt,
            "FLOAT" | "FLOAT4" | "REAL" => EngineType::Float,
            "DOUBLE" | "FLOAT8" => EngineType::Double,
            "DECIMAL" | "NUMERIC" => EngineType::Decimal { width: 18, scale: 3 },
            "VARCHAR" | "TEXT" | "STRING" | "CHAR" | "BPCHAR" => EngineType::Varchar,
            "DATE" => EngineType::Date,
            "TIME" => EngineType::Time,
            "TIMESTAMP" | "DATETIME" | "TIMESTAMP_US" | "TIMESTAMP_MS" | "TIMESTAMP_NS"
            | "TIMESTAMP_S" => EngineType::Timestamp,
            "TIMESTAMPTZ" | "TIMESTAMP WITH TIME ZONE" => EngineType::TimestampTz,
            "INTERVAL" => EngineType::Interval,
            "BLOB" | "BYTEA" | "BINARY" | "VARBINARY" => EngineType::Blob,
            "UUID" => EngineType::Uuid,
            _ => EngineType::Other(name.trim().to_string()),
        }
    }

    /// Type name usable in DDL (`ALTER TABLE ... TYPE <name>`).
    pub fn sql_name(&self) -> String {
        match self {
            EngineType::Boolean => "BOOLEAN".into(),
            EngineType::TinyInt => "TINYINT".into(),
            EngineType::SmallInt => "SMALLINT".into(),
            EngineType::Integer => "INTEGER".into(),
            EngineType::BigInt => "BIGINT".into(),
            EngineType::HugeInt => "HUGEINT".into(),
            EngineType::UTinyInt => "UTINYINT".into(),
            EngineType::USmallInt => "USMALLINT".into(),
            EngineType::UInteger => "UINTEGER".into(),
            EngineType::UBigInt => "UBIGINT".into(),
            EngineType::Float => "FLOAT".into(),
            EngineType::Double => "DOUBLE".into(),
            EngineType::Decimal { width, scale } => format!("DECIMAL({width},{scale})"),
            EngineType::Varchar => "VARCHAR".into(),
            EngineType::Date => "DATE".into(),
            EngineType::Time => "TIME".into(),
            EngineType::Timestamp => "TIMESTAMP".into(),
            EngineType::TimestampTz => "TIMESTAMPTZ".into(),
            EngineType::Interval => "INTERVAL".into(),
            EngineType::Blob => "BLOB".into(),
            EngineType::Uuid => "UUID".into(),
            EngineType::Other(name) => name.clone(),
        }
    }

    pub fn display_type(&self) -> DisplayType {
        match self {
            EngineType::Boolean => DisplayType::Boolean,
            EngineType::TinyInt
            | EngineType::SmallInt
            | EngineType::Integer
            | EngineType::BigInt
            | EngineType::HugeInt
            | EngineType::UTinyInt
            | EngineType::USmallInt
            | EngineType::UInteger
            | EngineType::UBigInt => DisplayType::Integer,
            EngineType::Float | EngineType::Double | EngineType::Decimal { .. } => {
                DisplayType::Float
            }
            EngineType::Varchar | EngineType::Uuid => DisplayType::Text,
            EngineType::Date | EngineType::Timestamp | EngineType::TimestampTz => {
                DisplayType::Date
            }
            EngineType::Time | EngineType::Interval | EngineType::Blob | EngineType::Other(_) => {
                DisplayType::Unknown
            }
        }
    }
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql_name())
    }
}

/// Coarse type used by the UI and by profiling to pick a presentation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayType {
    Text,
    Integer,
    Float,
    Date,
    Boolean,
    Unknown,
}

impl DisplayType {
    pub fn is_numeric(self) -> bool {
        matches!(self, DisplayType::Integer | DisplayType::Float)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub engine_type: EngineType,
    pub display_type: DisplayType,
    pub ordinal: usize,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, engine_type: EngineType, ordinal: usize) -> Self {
        let display_type = engine_type.display_type();
        Self {
            name: name.into(),
            engine_type,
            display_type,
            ordinal,
        }
    }

    /// True for columns the engine adds for bookkeeping (never shown or exported).
    pub fn is_internal(&self) -> bool {
        self.name == ROW_ID_COLUMN
    }
}

/// Find a column by exact name.
pub fn find_column<'a>(columns: &'a [ColumnDescriptor], name: &str) -> Option<&'a ColumnDescriptor> {
    columns.iter().find(|c| c.name == name)
}

/// Columns that are visible to users (everything except the identity column).
pub fn user_columns(columns: &[ColumnDescriptor]) -> impl Iterator<Item = &ColumnDescriptor> {
    columns.iter().filter(|c| !c.is_internal())
}
