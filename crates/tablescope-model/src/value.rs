use serde::{Deserialize, Serialize};
use std::fmt;

/// Scalar value of a single cell as it comes back from the engine.
///
/// The enum uses an explicit `{type, value}` tagged layout so values can cross
/// an IPC boundary unchanged. Dates and timestamps are carried as pre-formatted
/// ISO strings: they are display-only and are never computed on outside SQL.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CellValue {
    /// SQL `NULL`.
    Null,
    Boolean(bool),
    /// Any integral engine type that fits in 64 bits.
    Integer(i64),
    /// IEEE-754 double (also used for `FLOAT`/`DECIMAL` and out-of-range integers).
    Double(f64),
    String(String),
    /// `DATE`, `TIMESTAMP` or `TIMESTAMPTZ` rendered as `YYYY-MM-DD[ HH:MM:SS[.ffffff]]`.
    Date(String),
}

impl Default for CellValue {
    fn default() -> Self {
        CellValue::Null
    }
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            CellValue::Integer(v) => Some(*v),
            CellValue::Double(v) if v.fract() == 0.0 && v.is_finite() => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Integer(v) => Some(*v as f64),
            CellValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CellValue::String(s) | CellValue::Date(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Plain text used for CSV output and text matching; `None` for nulls.
    pub fn to_plain_text(&self) -> Option<String> {
        match self {
            CellValue::Null => None,
            CellValue::Boolean(b) => Some(if *b { "true" } else { "false" }.to_string()),
            CellValue::Integer(v) => Some(v.to_string()),
            CellValue::Double(v) => Some(v.to_string()),
            CellValue::String(s) | CellValue::Date(s) => Some(s.clone()),
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_plain_text() {
            Some(text) => f.write_str(&text),
            None => Ok(()),
        }
    }
}

impl From<bool> for CellValue {
    fn from(value: bool) -> Self {
        CellValue::Boolean(value)
    }
}

impl From<i64> for CellValue {
    fn from(value: i64) -> Self {
        CellValue::Integer(value)
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        CellValue::Double(value)
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        CellValue::String(value)
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::String(value.to_string())
    }
}

impl<T: Into<CellValue>> From<Option<T>> for CellValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(CellValue::Null)
    }
}
