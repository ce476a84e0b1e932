use encoding_rs::{Encoding, UTF_8};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("unknown text encoding: {0}")]
    UnknownEncoding(String),
    #[error("unsupported delimiter {0:?}")]
    UnsupportedDelimiter(char),
}

/// What an external sniffer learned about a delimited file.
///
/// Sniffing heuristics live outside this crate; only the result is consumed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SniffResult {
    pub delimiter: Option<char>,
    pub has_header: bool,
    /// Encoding label guessed by the sniffer, if any.
    pub encoding: Option<String>,
    /// First bytes of the file, used for BOM detection.
    pub leading_bytes: Vec<u8>,
}

/// How a delimited file is read (and, by default, written back).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadOptions {
    #[serde(default = "default_has_header")]
    pub has_header: bool,
    /// `None` lets the engine's reader auto-detect.
    #[serde(default)]
    pub delimiter: Option<char>,
    /// WHATWG encoding label (`utf-8`, `windows-1252`, `utf-16le`, ...).
    #[serde(default = "default_encoding")]
    pub encoding: String,
}

fn default_has_header() -> bool {
    true
}

fn default_encoding() -> String {
    "utf-8".to_string()
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            has_header: true,
            delimiter: None,
            encoding: default_encoding(),
        }
    }
}

impl LoadOptions {
    /// Build options from a sniff result. A byte-order mark wins over the
    /// sniffer's encoding guess.
    pub fn from_sniff(sniff: &SniffResult) -> Self {
        let encoding = Encoding::for_bom(&sniff.leading_bytes)
            .map(|(encoding, _)| encoding.name().to_ascii_lowercase())
            .or_else(|| sniff.encoding.clone())
            .unwrap_or_else(default_encoding);
        Self {
            has_header: sniff.has_header,
            delimiter: sniff.delimiter,
            encoding,
        }
    }

    pub fn with_header(mut self, has_header: bool) -> Self {
        self.has_header = has_header;
        self
    }

    pub fn with_delimiter(mut self, delimiter: Option<char>) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn with_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encoding = encoding.into();
        self
    }

    /// Resolve the encoding label.
    pub fn resolved_encoding(&self) -> Result<&'static Encoding, SourceError> {
        resolve_encoding(&self.encoding)
    }

    /// True when the engine can read the file directly.
    pub fn is_utf8(&self) -> bool {
        self.resolved_encoding()
            .map(|encoding| encoding == UTF_8)
            .unwrap_or(false)
    }

    pub fn validate(&self) -> Result<(), SourceError> {
        self.resolved_encoding()?;
        if let Some(delimiter) = self.delimiter {
            if matches!(delimiter, '\n' | '\r' | '"') {
                return Err(SourceError::UnsupportedDelimiter(delimiter));
            }
        }
        Ok(())
    }
}

pub fn resolve_encoding(label: &str) -> Result<&'static Encoding, SourceError> {
    Encoding::for_label(label.trim().as_bytes())
        .ok_or_else(|| SourceError::UnknownEncoding(label.to_string()))
}
