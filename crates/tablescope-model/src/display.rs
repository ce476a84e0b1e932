use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::{CellValue, DisplayType};

/// Presentation settings for rendering cell values.
///
/// This is an immutable value handed to the formatting functions; persisting
/// it (user defaults, config files) is the embedding application's concern.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayConfig {
    /// `chrono` format string for `DATE` values.
    #[serde(default = "default_date_format")]
    pub date_format: String,
    /// `chrono` format string for timestamps.
    #[serde(default = "default_datetime_format")]
    pub datetime_format: String,
    /// Grouping separator for the integer part of numbers (`None` disables grouping).
    #[serde(default)]
    pub thousands_separator: Option<char>,
    /// Fixed number of decimals for floating values (`None` keeps shortest form).
    #[serde(default)]
    pub decimal_places: Option<usize>,
    #[serde(default)]
    pub null_text: String,
}

fn default_date_format() -> String {
    "%Y-%m-%d".to_string()
}

fn default_datetime_format() -> String {
    "%Y-%m-%d %H:%M:%S".to_string()
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            date_format: default_date_format(),
            datetime_format: default_datetime_format(),
            thousands_separator: None,
            decimal_places: None,
            null_text: String::new(),
        }
    }
}

/// Render `value` for display in a column of `display_type`.
pub fn format_cell(value: &CellValue, display_type: DisplayType, config: &DisplayConfig) -> String {
    match value {
        CellValue::Null => config.null_text.clone(),
        CellValue::Boolean(b) => if *b { "true" } else { "false" }.to_string(),
        CellValue::Integer(v) => group_thousands(&v.to_string(), config.thousands_separator),
        CellValue::Double(v) => format_double(*v, display_type, config),
        CellValue::Date(text) => format_date(text, config),
        CellValue::String(text) => text.clone(),
    }
}

fn format_double(value: f64, display_type: DisplayType, config: &DisplayConfig) -> String {
    if !value.is_finite() {
        return value.to_string();
    }
    // Integer columns widened to double (e.g. HUGEINT overflow) keep no decimals.
    let text = match (display_type, config.decimal_places) {
        (DisplayType::Integer, _) => format!("{value:.0}"),
        (_, Some(places)) => format!("{value:.places$}"),
        (_, None) => value.to_string(),
    };
    group_thousands(&text, config.thousands_separator)
}

fn format_date(text: &str, config: &DisplayConfig) -> String {
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return date.format(&config.date_format).to_string();
    }
    for pattern in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(datetime) = NaiveDateTime::parse_from_str(text, pattern) {
            return datetime.format(&config.datetime_format).to_string();
        }
    }
    // Timezone-qualified or unrecognized text is shown verbatim.
    text.to_string()
}

fn group_thousands(text: &str, separator: Option<char>) -> String {
    let Some(separator) = separator else {
        return text.to_string();
    };
    let (sign, unsigned) = match text.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", text),
    };
    let (int_part, frac_part) = match unsigned.find('.') {
        Some(idx) => unsigned.split_at(idx),
        None => (unsigned, ""),
    };

    let mut grouped = String::with_capacity(text.len() + int_part.len() / 3);
    for (idx, ch) in int_part.chars().enumerate() {
        if idx > 0 && (int_part.len() - idx) % 3 == 0 {
            grouped.push(separator);
        }
        grouped.push(ch);
    }
    format!("{sign}{grouped}{frac_part}")
}
