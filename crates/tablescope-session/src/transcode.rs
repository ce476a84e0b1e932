use std::io::Write;
use std::path::Path;

use encoding_rs::{Encoding, UTF_16BE, UTF_16LE};
use tempfile::NamedTempFile;

use crate::error::{Result, SessionError};

/// Conversion between a file's text encoding and UTF-8.
///
/// The engine only reads and writes UTF-8; everything else passes through a
/// transcoder on the way in and on the way out.
pub trait Transcoder: Send + Sync {
    fn decode(&self, bytes: &[u8], encoding: &'static Encoding) -> Result<String>;
    fn encode(&self, text: &str, encoding: &'static Encoding) -> Result<Vec<u8>>;
}

/// [`Transcoder`] backed by `encoding_rs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct EncodingRsTranscoder;

impl Transcoder for EncodingRsTranscoder {
    fn decode(&self, bytes: &[u8], encoding: &'static Encoding) -> Result<String> {
        let (text, had_errors) = encoding.decode_with_bom_removal(bytes);
        if had_errors {
            log::warn!(
                "input is not valid {}; malformed sequences were replaced",
                encoding.name()
            );
        }
        Ok(text.into_owned())
    }

    fn encode(&self, text: &str, encoding: &'static Encoding) -> Result<Vec<u8>> {
        // encoding_rs never produces UTF-16; write it by hand, with a BOM.
        if encoding == UTF_16LE || encoding == UTF_16BE {
            let little = encoding == UTF_16LE;
            let mut out = Vec::with_capacity(2 + text.len() * 2);
            for unit in std::iter::once(0xFEFF_u16).chain(text.encode_utf16()) {
                let bytes = if little {
                    unit.to_le_bytes()
                } else {
                    unit.to_be_bytes()
                };
                out.extend_from_slice(&bytes);
            }
            return Ok(out);
        }

        let (bytes, used, had_errors) = encoding.encode(text);
        if had_errors || used != encoding {
            return Err(SessionError::Encoding(format!(
                "text cannot be represented in {}",
                encoding.name()
            )));
        }
        Ok(bytes.into_owned())
    }
}

/// Decode `source` into a UTF-8 temp file the engine can read directly.
///
/// The file is deleted when the returned handle drops.
pub fn stage_utf8(
    source: &Path,
    encoding: &'static Encoding,
    transcoder: &dyn Transcoder,
) -> Result<NamedTempFile> {
    let bytes = std::fs::read(source)?;
    let text = transcoder.decode(&bytes, encoding)?;
    let mut staged = tempfile::Builder::new()
        .prefix("tablescope-")
        .suffix(".csv")
        .tempfile()?;
    staged.write_all(text.as_bytes())?;
    staged.flush()?;
    log::debug!(
        "staged {} ({}) as {}",
        source.display(),
        encoding.name(),
        staged.path().display()
    );
    Ok(staged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use encoding_rs::{SHIFT_JIS, WINDOWS_1252};

    #[test]
    fn windows_1252_round_trip() {
        let t = EncodingRsTranscoder;
        let bytes = t.encode("café", WINDOWS_1252).unwrap();
        assert_eq!(bytes, b"caf\xE9");
        assert_eq!(t.decode(&bytes, WINDOWS_1252).unwrap(), "café");
    }

    #[test]
    fn unmappable_characters_are_an_error() {
        let err = EncodingRsTranscoder.encode("日本", WINDOWS_1252).unwrap_err();
        assert!(matches!(err, SessionError::Encoding(_)));
        assert!(EncodingRsTranscoder.encode("日本", SHIFT_JIS).is_ok());
    }

    #[test]
    fn utf16_gets_a_bom() {
        let bytes = EncodingRsTranscoder.encode("a", UTF_16LE).unwrap();
        assert_eq!(bytes, vec![0xFF, 0xFE, b'a', 0]);
        assert_eq!(EncodingRsTranscoder.decode(&bytes, UTF_16LE).unwrap(), "a");
    }

    #[test]
    fn staging_writes_utf8() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("latin1.csv");
        std::fs::write(&source, b"name\nJos\xE9\n").unwrap();
        let staged = stage_utf8(&source, WINDOWS_1252, &EncodingRsTranscoder).unwrap();
        assert_eq!(std::fs::read_to_string(staged.path()).unwrap(), "name\nJosé\n");
    }
}
