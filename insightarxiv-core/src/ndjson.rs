//! Decoding month files: a JSON array or newline-delimited JSON records.
//!
//! The format is detected from the first non-whitespace byte. Array input is
//! all-or-nothing; NDJSON input skips (and logs) malformed lines.

use serde::de::DeserializeOwned;
use std::marker::PhantomData;

/// Layout of a data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    JsonArray,
    Lines,
}

impl DataFormat {
    /// Detect the format from the leading bytes, `None` while only whitespace was seen.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        bytes
            .iter()
            .find(|b| !b.is_ascii_whitespace())
            .map(|&b| if b == b'[' { Self::JsonArray } else { Self::Lines })
    }
}

/// Records decoded from a complete buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded<T> {
    pub records: Vec<T>,
    /// Malformed lines dropped (always 0 for array input).
    pub skipped: usize,
}

/// Decode a whole file.
pub fn decode_all<T: DeserializeOwned>(bytes: &[u8]) -> Result<Decoded<T>, serde_json::Error> {
    match DataFormat::sniff(bytes) {
        None => Ok(Decoded {
            records: Vec::new(),
            skipped: 0,
        }),
        Some(DataFormat::JsonArray) => Ok(Decoded {
            records: serde_json::from_slice(bytes)?,
            skipped: 0,
        }),
        Some(DataFormat::Lines) => {
            let mut records = Vec::new();
            let mut skipped = 0;
            for line in bytes.split(|&b| b == b'\n') {
                match decode_line(line) {
                    LineOutcome::Record(r) => records.push(r),
                    LineOutcome::Blank => {}
                    LineOutcome::Malformed => skipped += 1,
                }
            }
            Ok(Decoded { records, skipped })
        }
    }
}

enum LineOutcome<T> {
    Record(T),
    Blank,
    Malformed,
}

fn decode_line<T: DeserializeOwned>(line: &[u8]) -> LineOutcome<T> {
    let trimmed = line.trim_ascii();
    if trimmed.is_empty() {
        return LineOutcome::Blank;
    }
    match serde_json::from_slice(trimmed) {
        Ok(record) => LineOutcome::Record(record),
        Err(e) => {
            let preview: String = String::from_utf8_lossy(trimmed).chars().take(80).collect();
            tracing::warn!(error = %e, line = %preview, "Skipping malformed record");
            LineOutcome::Malformed
        }
    }
}

/// Incremental decoder fed with body chunks as they arrive.
///
/// Line input yields records as soon as their terminating newline arrives;
/// partial lines stay buffered. Array input is buffered until [`finish`].
///
/// [`finish`]: StreamDecoder::finish
pub struct StreamDecoder<T> {
    buffer: Vec<u8>,
    format: Option<DataFormat>,
    emitted: usize,
    skipped: usize,
    _record: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Default for StreamDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> StreamDecoder<T> {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            format: None,
            emitted: 0,
            skipped: 0,
            _record: PhantomData,
        }
    }

    pub fn format(&self) -> Option<DataFormat> {
        self.format
    }

    /// Records emitted so far.
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Feed the next chunk; returns the records completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<T> {
        self.buffer.extend_from_slice(chunk);
        if self.format.is_none() {
            self.format = DataFormat::sniff(&self.buffer);
        }
        if self.format != Some(DataFormat::Lines) {
            return Vec::new();
        }

        let Some(last_newline) = self.buffer.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };
        let rest = self.buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, rest);

        let mut records = Vec::new();
        for line in complete.split(|&b| b == b'\n') {
            match decode_line(line) {
                LineOutcome::Record(r) => records.push(r),
                LineOutcome::Blank => {}
                LineOutcome::Malformed => self.skipped += 1,
            }
        }
        self.emitted += records.len();
        records
    }

    /// Flush the trailing partial line, or decode the buffered array.
    pub fn finish(mut self) -> Result<Decoded<T>, serde_json::Error> {
        match self.format {
            None => Ok(Decoded {
                records: Vec::new(),
                skipped: self.skipped,
            }),
            Some(DataFormat::JsonArray) => {
                let records: Vec<T> = serde_json::from_slice(&self.buffer)?;
                Ok(Decoded {
                    records,
                    skipped: 0,
                })
            }
            Some(DataFormat::Lines) => {
                let tail = std::mem::take(&mut self.buffer);
                let records = match decode_line(&tail) {
                    LineOutcome::Record(r) => vec![r],
                    LineOutcome::Blank => Vec::new(),
                    LineOutcome::Malformed => {
                        self.skipped += 1;
                        Vec::new()
                    }
                };
                Ok(Decoded {
                    records,
                    skipped: self.skipped,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paper::Paper;
    use pretty_assertions::assert_eq;

    const LINES: &str = concat!(
        r#"{"id":"2507.00001","title":"One"}"#,
        "\n",
        r#"{"id":"2507.00002","title":"Two"}"#,
        "\n",
        r#"{"id":"2507.00003","title":"Three"}"#,
    );

    #[test]
    fn test_sniff() {
        assert_eq!(DataFormat::sniff(b"  \n [{}]"), Some(DataFormat::JsonArray));
        assert_eq!(DataFormat::sniff(b"{\"id\":1}"), Some(DataFormat::Lines));
        assert_eq!(DataFormat::sniff(b"   "), None);
    }

    #[test]
    fn test_decode_all_array() {
        let decoded: Decoded<Paper> =
            decode_all(br#"[{"id":"2507.00001"},{"id":"2507.00002"}]"#).unwrap();
        assert_eq!(decoded.records.len(), 2);
        assert_eq!(decoded.skipped, 0);
    }

    #[test]
    fn test_decode_all_malformed_array_fails() {
        let result: Result<Decoded<Paper>, _> = decode_all(br#"[{"id":"2507.00001"},"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_decode_all_lines_skips_malformed() {
        let input = format!("{}\nnot json\n\n", LINES);
        let decoded: Decoded<Paper> = decode_all(input.as_bytes()).unwrap();
        assert_eq!(decoded.records.len(), 3);
        assert_eq!(decoded.skipped, 1);
    }

    #[test]
    fn test_stream_buffers_partial_lines() {
        let mut decoder: StreamDecoder<Paper> = StreamDecoder::new();
        let bytes = LINES.as_bytes();

        // Split in the middle of the second record.
        let cut = LINES.find("Two").unwrap();
        let first = decoder.push(&bytes[..cut]);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].title, "One");

        let second = decoder.push(&bytes[cut..]);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].title, "Two");

        // The last record has no trailing newline.
        let rest = decoder.finish().unwrap();
        assert_eq!(rest.records.len(), 1);
        assert_eq!(rest.records[0].title, "Three");
    }

    #[test]
    fn test_stream_handles_crlf_and_multibyte_split() {
        let input = "{\"id\":\"2507.00001\",\"title\":\"注意力\"}\r\n";
        let bytes = input.as_bytes();
        let cut = input.find('意').unwrap() + 1; // inside a UTF-8 sequence
        let mut decoder: StreamDecoder<Paper> = StreamDecoder::new();
        assert!(decoder.push(&bytes[..cut]).is_empty());
        let records = decoder.push(&bytes[cut..]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].title, "注意力");
    }

    #[test]
    fn test_stream_array_mode_waits_for_finish() {
        let mut decoder: StreamDecoder<Paper> = StreamDecoder::new();
        assert!(decoder.push(b"[{\"id\":\"2507.00001\"},\n").is_empty());
        assert!(decoder.push(b"{\"id\":\"2507.00002\"}]").is_empty());
        assert_eq!(decoder.format(), Some(DataFormat::JsonArray));
        let decoded = decoder.finish().unwrap();
        assert_eq!(decoded.records.len(), 2);
    }

    #[test]
    fn test_stream_counts_malformed_lines() {
        let mut decoder: StreamDecoder<Paper> = StreamDecoder::new();
        let records = decoder.push(b"{\"id\":\"2507.00001\"}\n{broken\n");
        assert_eq!(records.len(), 1);
        assert_eq!(decoder.skipped(), 1);
        assert_eq!(decoder.emitted(), 1);
        let tail = decoder.finish().unwrap();
        assert!(tail.records.is_empty());
        assert_eq!(tail.skipped, 1);
    }
}
