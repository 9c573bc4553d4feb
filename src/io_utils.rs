//! I/O utilities for reading uploaded delimited files.
//!
//! All source reads in csv-lake flow through this module. It provides:
//!
//! - **Format detection**: the delimiter is sniffed from the header line
//!   unless configured, and the text encoding is chosen from a fallback chain
//!   (configured label, UTF-8, windows-1252) by decoding a buffered prefix.
//! - **Reader construction**: `open_csv_reader` wraps any `Read` with the
//!   strict (non-flexible) settings used everywhere, so ragged rows surface as
//!   errors instead of being padded.
//! - **Decoding**: byte records are decoded field by field with the detected
//!   encoding.
//! - **Deadlines**: [`DeadlineReader`] fails reads with `TimedOut` once the
//!   caller's deadline has passed.

use std::{
    io::{self, BufRead, Read},
    path::Path,
};

use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};

use crate::{
    error::{LoaderError, LoaderResult},
    job::Deadline,
};

pub const DEFAULT_CSV_DELIMITER: u8 = b',';
pub const DEFAULT_TSV_DELIMITER: u8 = b'\t';
const SNIFF_CANDIDATES: &[u8] = b",;\t|";
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Delimiter and encoding chosen for one source file.
#[derive(Debug, Clone, Copy)]
pub struct SourceFormat {
    pub delimiter: u8,
    pub encoding: &'static Encoding,
}

pub fn resolve_encoding(label: Option<&str>) -> LoaderResult<Option<&'static Encoding>> {
    match label {
        Some(value) if !value.trim().is_empty() => Encoding::for_label(value.trim().as_bytes())
            .map(Some)
            .ok_or_else(|| LoaderError::Config(format!("Unknown encoding '{value}'"))),
        _ => Ok(None),
    }
}

/// Picks the encoding for a file from a buffered prefix of its bytes.
pub fn detect_encoding(prefix: &[u8], configured: Option<&'static Encoding>) -> &'static Encoding {
    if let Some(encoding) = configured {
        return encoding;
    }
    let body = prefix.strip_prefix(UTF8_BOM).unwrap_or(prefix);
    match std::str::from_utf8(body) {
        Ok(_) => UTF_8,
        // Only the final, truncated sequence is invalid.
        Err(err) if err.error_len().is_none() => UTF_8,
        Err(_) => WINDOWS_1252,
    }
}

/// Chooses the candidate delimiter that occurs most often, outside quotes,
/// in the first line of `prefix`.
pub fn sniff_delimiter(prefix: &[u8]) -> u8 {
    let mut counts = [0usize; SNIFF_CANDIDATES.len()];
    let mut in_quotes = false;
    for &byte in prefix {
        match byte {
            b'"' => in_quotes = !in_quotes,
            b'\n' | b'\r' if !in_quotes => break,
            _ if !in_quotes => {
                if let Some(idx) = SNIFF_CANDIDATES.iter().position(|c| *c == byte) {
                    counts[idx] += 1;
                }
            }
            _ => {}
        }
    }
    let mut best = 0;
    for idx in 1..counts.len() {
        if counts[idx] > counts[best] {
            best = idx;
        }
    }
    if counts[best] == 0 {
        DEFAULT_CSV_DELIMITER
    } else {
        SNIFF_CANDIDATES[best]
    }
}

pub fn extension_delimiter(key: &str) -> Option<u8> {
    match Path::new(key).extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("tsv") => Some(DEFAULT_TSV_DELIMITER),
        _ => None,
    }
}

/// Inspects the buffered head of `reader` without consuming it.
pub fn detect_format<R: BufRead>(
    reader: &mut R,
    key: &str,
    configured_delimiter: Option<u8>,
    configured_encoding: Option<&'static Encoding>,
) -> LoaderResult<SourceFormat> {
    let prefix = reader.fill_buf().map_err(|err| LoaderError::Storage(err.into()))?;
    let encoding = detect_encoding(prefix, configured_encoding);
    let delimiter = configured_delimiter
        .or_else(|| extension_delimiter(key))
        .unwrap_or_else(|| sniff_delimiter(prefix.strip_prefix(UTF8_BOM).unwrap_or(prefix)));
    Ok(SourceFormat {
        delimiter,
        encoding,
    })
}

pub fn open_csv_reader<R>(reader: R, delimiter: u8, has_headers: bool) -> csv::Reader<R>
where
    R: Read,
{
    let mut builder = csv::ReaderBuilder::new();
    builder
        .has_headers(has_headers)
        .delimiter(delimiter)
        .double_quote(true)
        .flexible(false);
    builder.from_reader(reader)
}

pub fn decode_bytes(bytes: &[u8], encoding: &'static Encoding) -> Option<String> {
    if encoding == UTF_8 {
        return std::str::from_utf8(bytes).ok().map(str::to_string);
    }
    let (text, had_errors) = encoding.decode_without_bom_handling(bytes);
    (!had_errors).then(|| text.into_owned())
}

pub fn decode_record(
    record: &csv::ByteRecord,
    encoding: &'static Encoding,
    row: usize,
) -> LoaderResult<Vec<String>> {
    record
        .iter()
        .enumerate()
        .map(|(idx, field)| {
            decode_bytes(field, encoding).ok_or(LoaderError::Undecodable {
                encoding,
                row,
                field: idx + 1,
            })
        })
        .collect()
}

/// Reads and decodes the header record, stripping a leading BOM.
pub fn reader_headers<R>(
    reader: &mut csv::Reader<R>,
    encoding: &'static Encoding,
) -> LoaderResult<Vec<String>>
where
    R: Read,
{
    let headers = reader.byte_headers()?.clone();
    let mut decoded = decode_record(&headers, encoding, 1)?;
    if let Some(first) = decoded.first_mut()
        && let Some(stripped) = first.strip_prefix('\u{feff}')
    {
        *first = stripped.to_string();
    }
    Ok(decoded)
}

/// Fails every read with [`io::ErrorKind::TimedOut`] once `deadline` passes.
pub struct DeadlineReader<R> {
    inner: R,
    deadline: Deadline,
}

impl<R> DeadlineReader<R> {
    pub fn new(inner: R, deadline: Deadline) -> Self {
        Self { inner, deadline }
    }
}

impl<R: Read> Read for DeadlineReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.deadline.is_expired() {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "deadline exceeded while reading source",
            ));
        }
        self.inner.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;

    #[test]
    fn sniff_prefers_most_frequent_unquoted_candidate() {
        assert_eq!(sniff_delimiter(b"a;b;c\n1;2;3\n"), b';');
        assert_eq!(sniff_delimiter(b"\"a,b\"|c|d\n"), b'|');
        assert_eq!(sniff_delimiter(b"a\tb\n"), b'\t');
        assert_eq!(sniff_delimiter(b"single\n"), b',');
    }

    #[test]
    fn encoding_falls_back_to_windows_1252_for_invalid_utf8() {
        assert_eq!(detect_encoding("caf\u{e9}".as_bytes(), None), UTF_8);
        assert_eq!(detect_encoding(b"caf\xE9,x\n", None), WINDOWS_1252);
        // Truncated multi-byte sequence at the end of the sampled prefix.
        assert_eq!(detect_encoding(b"caf\xC3", None), UTF_8);
    }

    #[test]
    fn configured_encoding_wins() {
        let latin = resolve_encoding(Some("latin1")).unwrap();
        assert_eq!(detect_encoding(b"plain", latin), WINDOWS_1252);
        assert!(resolve_encoding(Some("klingon")).is_err());
        assert!(resolve_encoding(None).unwrap().is_none());
    }

    #[test]
    fn headers_drop_utf8_bom() {
        let data = "\u{feff}id,name\n1,x\n";
        let mut reader = open_csv_reader(data.as_bytes(), b',', true);
        let headers = reader_headers(&mut reader, UTF_8).unwrap();
        assert_eq!(headers, vec!["id".to_string(), "name".to_string()]);
    }

    #[test]
    fn detect_format_does_not_consume_input() {
        let mut reader = BufReader::new("a|b\n1|2\n".as_bytes());
        let format = detect_format(&mut reader, "x.csv", None, None).unwrap();
        assert_eq!(format.delimiter, b'|');
        let mut rest = String::new();
        reader.read_to_string(&mut rest).unwrap();
        assert!(rest.starts_with("a|b"));
    }

    #[test]
    fn windows_1252_fields_decode() {
        let record = csv::ByteRecord::from(vec![&b"caf\xE9"[..]]);
        let decoded = decode_record(&record, WINDOWS_1252, 2).unwrap();
        assert_eq!(decoded[0], "caf\u{e9}");
        assert!(decode_record(&record, UTF_8, 2).is_err());
    }

    #[test]
    fn expired_deadline_fails_reads() {
        let mut reader = DeadlineReader::new("abc".as_bytes(), Deadline::expired());
        let mut buf = [0u8; 3];
        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
