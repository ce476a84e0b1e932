//! Writing a session's table back to a delimited file.
//!
//! UTF-8 targets are written by the engine (`COPY ... FORCE_QUOTE *`) into a
//! temp file next to the target and renamed into place. Other encodings go
//! through an intermediate UTF-8 export that is re-serialized field by field,
//! force-quoted the same way, and transcoded. Both paths keep a quoted empty
//! field (empty string) distinct from an unquoted empty field (null).

use std::io::Write;
use std::path::{Path, PathBuf};

use encoding_rs::{Encoding, UTF_8};
use serde::{Deserialize, Serialize};
use tablescope_model::{resolve_encoding, ColumnDescriptor, LoadOptions};
use tablescope_sql::io;
use tempfile::NamedTempFile;

use crate::engine::EngineGateway;
use crate::error::{Result, SessionError};
use crate::transcode::Transcoder;

const DEFAULT_DELIMITER: char = ',';

/// Where and how to write a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveTarget {
    pub path: PathBuf,
    #[serde(default)]
    pub delimiter: Option<char>,
    #[serde(default = "default_encoding")]
    pub encoding: String,
    #[serde(default = "default_header")]
    pub has_header: bool,
}

fn default_encoding() -> String {
    "utf-8".to_string()
}

fn default_header() -> bool {
    true
}

impl SaveTarget {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            delimiter: None,
            encoding: default_encoding(),
            has_header: true,
        }
    }

    /// Write back in the same dialect the file was read with.
    pub fn from_load_options(path: impl Into<PathBuf>, options: &LoadOptions) -> Self {
        Self {
            path: path.into(),
            delimiter: options.delimiter,
            encoding: options.encoding.clone(),
            has_header: options.has_header,
        }
    }

    pub fn with_delimiter(mut self, delimiter: char) -> Self {
        self.delimiter = Some(delimiter);
        self
    }

    pub fn with_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encoding = encoding.into();
        self
    }

    pub fn with_header(mut self, has_header: bool) -> Self {
        self.has_header = has_header;
        self
    }

    pub fn resolved_delimiter(&self) -> char {
        self.delimiter.unwrap_or(DEFAULT_DELIMITER)
    }

    /// Options to read this target back with.
    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            has_header: self.has_header,
            delimiter: self.delimiter,
            encoding: self.encoding.clone(),
        }
    }
}

/// Export `table` (minus the identity column, in identity order) to `target`.
pub fn export_table(
    engine: &EngineGateway,
    table: &str,
    columns: &[ColumnDescriptor],
    target: &SaveTarget,
    transcoder: &dyn Transcoder,
) -> Result<()> {
    let encoding = resolve_encoding(&target.encoding)?;
    let delimiter = target.resolved_delimiter();
    if matches!(delimiter, '"' | '\n' | '\r') {
        return Err(SessionError::Io(format!(
            "unsupported delimiter {delimiter:?}"
        )));
    }

    let parent = parent_dir(&target.path);
    std::fs::create_dir_all(parent)?;
    let staged = tempfile::Builder::new()
        .prefix(".tablescope-")
        .suffix(".csv")
        .tempfile_in(parent)?;

    if encoding == UTF_8 {
        let sql = io::copy_to_csv(table, columns, staged.path(), delimiter, target.has_header);
        engine.execute_batch(&sql)?;
    } else {
        write_transcoded(engine, table, columns, target, delimiter, encoding, transcoder, &staged)?;
    }

    persist(staged, &target.path)?;
    log::info!("saved {} ({})", target.path.display(), encoding.name());
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn write_transcoded(
    engine: &EngineGateway,
    table: &str,
    columns: &[ColumnDescriptor],
    target: &SaveTarget,
    delimiter: char,
    encoding: &'static Encoding,
    transcoder: &dyn Transcoder,
    staged: &NamedTempFile,
) -> Result<()> {
    let intermediate = tempfile::Builder::new()
        .prefix("tablescope-export-")
        .suffix(".csv")
        .tempfile()?;
    let sql = io::copy_to_csv(
        table,
        columns,
        intermediate.path(),
        DEFAULT_DELIMITER,
        target.has_header,
    );
    engine.execute_batch(&sql)?;

    let utf8 = std::fs::read_to_string(intermediate.path())?;
    let records = parse_records(&utf8, DEFAULT_DELIMITER)?;
    let text = write_records(&records, delimiter);
    let bytes = transcoder.encode(&text, encoding)?;

    let mut file = staged.as_file();
    file.write_all(&bytes)?;
    file.flush()?;
    Ok(())
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

fn persist(staged: NamedTempFile, target: &Path) -> Result<()> {
    staged.as_file().sync_all()?;
    match staged.persist(target) {
        Ok(_) => Ok(()),
        Err(err) if err.error.kind() == std::io::ErrorKind::AlreadyExists => {
            let _ = std::fs::remove_file(target);
            err.file.persist(target).map(|_| ()).map_err(|e| e.error.into())
        }
        Err(err) => Err(err.error.into()),
    }
}

/// One field of a delimited record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Field {
    pub text: String,
    pub quoted: bool,
}

/// Split delimited text into records, remembering which fields were quoted.
pub(crate) fn parse_records(text: &str, delimiter: char) -> Result<Vec<Vec<Field>>> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if in_quotes {
            if ch == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    in_quotes = false;
                }
            } else {
                field.push(ch);
            }
            continue;
        }

        match ch {
            '"' if field.is_empty() && !quoted => {
                quoted = true;
                in_quotes = true;
            }
            c if c == delimiter => {
                record.push(Field {
                    text: std::mem::take(&mut field),
                    quoted,
                });
                quoted = false;
            }
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                record.push(Field {
                    text: std::mem::take(&mut field),
                    quoted,
                });
                quoted = false;
                records.push(std::mem::take(&mut record));
            }
            c => field.push(c),
        }
    }

    if in_quotes {
        return Err(SessionError::Io("unterminated quoted field in export".into()));
    }
    if quoted || !field.is_empty() || !record.is_empty() {
        record.push(Field { text: field, quoted });
        records.push(record);
    }
    Ok(records)
}

/// Serialize records force-quoted, like `COPY ... FORCE_QUOTE *`.
///
/// Only an unquoted empty field (a null) is written bare.
pub(crate) fn write_records(records: &[Vec<Field>], delimiter: char) -> String {
    let mut out = String::new();
    for record in records {
        for (idx, field) in record.iter().enumerate() {
            if idx > 0 {
                out.push(delimiter);
            }
            if field.quoted || !field.text.is_empty() {
                out.push('"');
                out.push_str(&field.text.replace('"', "\"\""));
                out.push('"');
            }
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn field(text: &str, quoted: bool) -> Field {
        Field {
            text: text.to_string(),
            quoted,
        }
    }

    #[test]
    fn parser_tracks_quoting() {
        let records = parse_records("a,b\n\"x,y\",\"\"\n\"he said \"\"hi\"\"\",\r\n", ',').unwrap();
        assert_eq!(
            records,
            vec![
                vec![field("a", false), field("b", false)],
                vec![field("x,y", true), field("", true)],
                vec![field("he said \"hi\"", true), field("", false)],
            ]
        );
    }

    #[test]
    fn quoted_empty_survives_reserialization() {
        let records = parse_records("\"Zoë\",\"\"\n\"Bob\",\n", ',').unwrap();
        assert_eq!(write_records(&records, ';'), "\"Zoë\";\"\"\n\"Bob\";\n");
    }

    #[test]
    fn every_value_is_quoted_and_nulls_stay_bare() {
        let records = parse_records("name,code\n\"a;b\",\"007\"\n,\"say \"\"hi\"\"\"\n", ',').unwrap();
        assert_eq!(
            write_records(&records, ';'),
            "\"name\";\"code\"\n\"a;b\";\"007\"\n;\"say \"\"hi\"\"\"\n"
        );
    }

    #[test]
    fn embedded_newlines_stay_in_one_field() {
        let records = parse_records("\"line1\nline2\",x\n", ',').unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0][0], field("line1\nline2", true));
        assert!(parse_records("\"open", ',').is_err());
    }

    #[test]
    fn target_defaults() {
        let target = SaveTarget::new("/tmp/out.csv");
        assert_eq!(target.resolved_delimiter(), ',');
        assert!(target.load_options().is_utf8());
        assert_eq!(parent_dir(Path::new("out.csv")), Path::new("."));
    }
}
