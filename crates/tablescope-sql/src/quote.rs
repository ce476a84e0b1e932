//! Identifier and literal rendering.

use tablescope_model::CellValue;

/// Escape character declared on every `LIKE`/`ILIKE` built here.
pub const LIKE_ESCAPE: char = '\\';

/// Largest magnitude at which every integer is exactly representable as `f64`.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// `a"b` → `"a""b"`.
pub fn quote_identifier(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push('"');
    for ch in name.chars() {
        if ch == '"' {
            out.push('"');
        }
        out.push(ch);
    }
    out.push('"');
    out
}

/// `O'Brien` → `'O''Brien'`.
pub fn quote_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            out.push('\'');
        }
        out.push(ch);
    }
    out.push('\'');
    out
}

/// Escape `\`, `%` and `_` so user text matches literally inside a pattern.
pub fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            out.push(LIKE_ESCAPE);
        }
        out.push(ch);
    }
    out
}

/// Quoted pattern literal: `prefix + escaped(value) + suffix`.
pub fn like_pattern(prefix: &str, value: &str, suffix: &str) -> String {
    quote_literal(&format!("{prefix}{}{suffix}", escape_like(value)))
}

/// The `ESCAPE '\'` clause matching [`escape_like`].
pub fn escape_clause() -> String {
    format!("ESCAPE {}", quote_literal(&LIKE_ESCAPE.to_string()))
}

/// Render a double the way numeric columns expect it.
///
/// Integral values within the exactly representable range drop the decimal
/// point (`5.0` → `5`); non-finite values become typed literals.
pub fn format_number(value: f64) -> String {
    if value.is_nan() {
        return "'NaN'::DOUBLE".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 {
            "'Infinity'::DOUBLE".to_string()
        } else {
            "'-Infinity'::DOUBLE".to_string()
        };
    }
    if value.fract() == 0.0 && value.abs() < MAX_SAFE_INTEGER {
        return format!("{}", value as i64);
    }
    format!("{value}")
}

/// SQL literal for a cell value (used by `UPDATE ... SET`).
pub fn value_literal(value: &CellValue) -> String {
    match value {
        CellValue::Null => "NULL".to_string(),
        CellValue::Boolean(b) => if *b { "true" } else { "false" }.to_string(),
        CellValue::Integer(v) => v.to_string(),
        CellValue::Double(v) => format_number(*v),
        CellValue::String(s) | CellValue::Date(s) => quote_literal(s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_double_embedded_quotes() {
        assert_eq!(quote_identifier("a\"b"), "\"a\"\"b\"");
        assert_eq!(quote_identifier("plain"), "\"plain\"");
    }

    #[test]
    fn literals_double_single_quotes() {
        assert_eq!(quote_literal("O'Brien"), "'O''Brien'");
        assert_eq!(quote_literal(""), "''");
    }

    #[test]
    fn like_escaping_neutralizes_wildcards() {
        assert_eq!(escape_like(r"50%_off\"), r"50\%\_off\\");
        assert_eq!(like_pattern("%", "it's", "%"), "'%it''s%'");
        assert_eq!(escape_clause(), r"ESCAPE '\'");
    }

    #[test]
    fn numbers_render_without_spurious_decimals() {
        assert_eq!(format_number(5.0), "5");
        assert_eq!(format_number(-0.0), "0");
        assert_eq!(format_number(2.5), "2.5");
        assert_eq!(format_number(1e20), "100000000000000000000");
        assert_eq!(format_number(f64::NAN), "'NaN'::DOUBLE");
        assert_eq!(format_number(f64::NEG_INFINITY), "'-Infinity'::DOUBLE");
    }

    #[test]
    fn value_literals() {
        assert_eq!(value_literal(&CellValue::Null), "NULL");
        assert_eq!(value_literal(&CellValue::Double(3.0)), "3");
        assert_eq!(value_literal(&CellValue::String("x'y".into())), "'x''y'");
        assert_eq!(value_literal(&CellValue::Date("2024-01-01".into())), "'2024-01-01'");
    }
}
