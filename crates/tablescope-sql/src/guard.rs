//! Screening of free-form SQL expressions before interpolation.
//!
//! Computed columns are typed by users and pasted into queries verbatim, so a
//! statement terminator outside of a quoted region or comment is rejected
//! before any query is built. Previews additionally run inside a read-only
//! transaction (see [`preview_statements`]).

use thiserror::Error;

use crate::quote::quote_identifier;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpressionError {
    #[error("expression is empty")]
    Empty,
    #[error("expression contains a statement separator at byte {position}")]
    StatementSeparator { position: usize },
    #[error("expression has an unterminated {0}")]
    Unterminated(&'static str),
    #[error("computed column name {0:?} is empty or duplicated")]
    InvalidName(String),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Scan {
    Code,
    SingleQuoted,
    DoubleQuoted,
    LineComment,
    BlockComment,
}

/// Reject expressions that could terminate the surrounding statement.
///
/// Semicolons inside `'...'`, `"..."`, `-- ...` or `/* ... */` are fine.
pub fn validate_expression(expression: &str) -> Result<(), ExpressionError> {
    if expression.trim().is_empty() {
        return Err(ExpressionError::Empty);
    }

    let bytes = expression.as_bytes();
    let mut state = Scan::Code;
    let mut idx = 0;
    while idx < bytes.len() {
        let b = bytes[idx];
        let next = bytes.get(idx + 1).copied();
        match state {
            Scan::Code => match b {
                b';' => return Err(ExpressionError::StatementSeparator { position: idx }),
                b'\'' => state = Scan::SingleQuoted,
                b'"' => state = Scan::DoubleQuoted,
                b'-' if next == Some(b'-') => {
                    state = Scan::LineComment;
                    idx += 1;
                }
                b'/' if next == Some(b'*') => {
                    state = Scan::BlockComment;
                    idx += 1;
                }
                _ => {}
            },
            // A doubled quote leaves and re-enters the quoted state, which is
            // exactly the escape rule.
            Scan::SingleQuoted => {
                if b == b'\'' {
                    state = Scan::Code;
                }
            }
            Scan::DoubleQuoted => {
                if b == b'"' {
                    state = Scan::Code;
                }
            }
            Scan::LineComment => {
                if b == b'\n' {
                    state = Scan::Code;
                }
            }
            Scan::BlockComment => {
                if b == b'*' && next == Some(b'/') {
                    state = Scan::Code;
                    idx += 1;
                }
            }
        }
        idx += 1;
    }

    match state {
        Scan::SingleQuoted => Err(ExpressionError::Unterminated("string literal")),
        Scan::DoubleQuoted => Err(ExpressionError::Unterminated("quoted identifier")),
        Scan::BlockComment => Err(ExpressionError::Unterminated("block comment")),
        Scan::Code | Scan::LineComment => Ok(()),
    }
}

/// Statements for evaluating an untrusted expression against `relation`.
///
/// The caller must execute all of them in order and always execute the last
/// one (`ROLLBACK`), even when the `SELECT` fails.
pub fn preview_statements(
    expression: &str,
    relation: &str,
    limit: u64,
) -> Result<[String; 3], ExpressionError> {
    validate_expression(expression)?;
    Ok([
        "BEGIN TRANSACTION READ ONLY".to_string(),
        format!(
            "SELECT ({expression}) AS {} FROM {relation} LIMIT {limit}",
            quote_identifier("preview")
        ),
        "ROLLBACK".to_string(),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_injected_statement() {
        let err = validate_expression("1); DROP TABLE data; --").unwrap_err();
        assert_eq!(err, ExpressionError::StatementSeparator { position: 2 });
    }

    #[test]
    fn accepts_semicolon_inside_literal() {
        assert!(validate_expression("REPLACE(col, ';', ',')").is_ok());
        assert!(validate_expression(r#""semi;colon" || 'it''s;'"#).is_ok());
    }

    #[test]
    fn accepts_semicolon_inside_comments() {
        assert!(validate_expression("a + 1 -- trailing; note").is_ok());
        assert!(validate_expression("a /* ; */ + 1").is_ok());
        assert!(validate_expression("a -- note\n; DROP TABLE x").is_err());
    }

    #[test]
    fn rejects_empty_and_unterminated() {
        assert_eq!(validate_expression("  "), Err(ExpressionError::Empty));
        assert_eq!(
            validate_expression("'open"),
            Err(ExpressionError::Unterminated("string literal"))
        );
        assert_eq!(
            validate_expression("a /* open"),
            Err(ExpressionError::Unterminated("block comment"))
        );
    }

    #[test]
    fn preview_is_wrapped_in_rolled_back_transaction() {
        let [begin, select, end] = preview_statements("a * 2", "\"data\"", 5).unwrap();
        assert_eq!(begin, "BEGIN TRANSACTION READ ONLY");
        assert_eq!(select, "SELECT (a * 2) AS \"preview\" FROM \"data\" LIMIT 5");
        assert_eq!(end, "ROLLBACK");
        assert!(preview_statements("1; DELETE FROM data", "\"data\"", 5).is_err());
    }
}
