//! Newline-delimited JSON decoding for the scheduler event stream.
//!
//! The stream body arrives in arbitrary chunks. [`decode_lines`] decodes every
//! complete line in a buffer and reports how many bytes it consumed;
//! [`StreamDecoder`] carries the unconsumed tail into the next chunk. Each
//! line decodes independently, so one corrupt line yields one error and
//! leaves its neighbours intact.

use bytes::{Buf, BytesMut};
use thiserror::Error;

use super::record::EventRecord;

/// Upper bound on bytes carried while waiting for a newline.
pub const DEFAULT_MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

/// Fragment bytes rendered in error messages.
const PREVIEW_LEN: usize = 120;

/// Errors that can occur while decoding a stream line.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("could not unmarshal event from stream: {source} (fragment: {preview})")]
    Malformed {
        fragment: String,
        preview: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("event line exceeds {limit} bytes without a newline ({len} bytes buffered)")]
    Oversized { len: usize, limit: usize },
}

impl DecodeError {
    fn malformed(line: &[u8], source: serde_json::Error) -> Self {
        let fragment = String::from_utf8_lossy(line).into_owned();
        let preview: String = fragment.chars().take(PREVIEW_LEN).collect();
        Self::Malformed {
            fragment,
            preview,
            source,
        }
    }

    /// The offending input, when the error came from a specific line.
    pub fn fragment(&self) -> Option<&str> {
        match self {
            Self::Malformed { fragment, .. } => Some(fragment),
            Self::Oversized { .. } => None,
        }
    }
}

/// Outcome of decoding one complete line.
pub type DecodedLine = Result<EventRecord, DecodeError>;

/// Result of [`decode_lines`].
#[derive(Debug, Default)]
pub struct Decoded {
    /// One entry per non-blank complete line, in input order.
    pub records: Vec<DecodedLine>,
    /// Bytes of input covered by complete lines.
    pub consumed: usize,
}

/// Decode every complete (newline-terminated) line in `buf`.
///
/// Bytes after the last newline are left unconsumed. Blank lines are skipped.
pub fn decode_lines(buf: &[u8]) -> Decoded {
    let mut decoded = Decoded::default();
    let mut start = 0;

    while let Some(offset) = buf[start..].iter().position(|b| *b == b'\n') {
        let end = start + offset;
        if let Some(line) = decode_line(&buf[start..end]) {
            decoded.records.push(line);
        }
        start = end + 1;
    }

    decoded.consumed = start;
    decoded
}

/// Decode a single line, returning `None` for blank input.
fn decode_line(line: &[u8]) -> Option<DecodedLine> {
    let line = trim_ascii(line);
    if line.is_empty() {
        return None;
    }

    Some(serde_json::from_slice::<EventRecord>(line).map_err(|e| DecodeError::malformed(line, e)))
}

fn trim_ascii(mut s: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = s {
        if first.is_ascii_whitespace() {
            s = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = s {
        if last.is_ascii_whitespace() {
            s = rest;
        } else {
            break;
        }
    }
    s
}

/// Incremental decoder that carries partial lines between reads.
#[derive(Debug)]
pub struct StreamDecoder {
    pending: BytesMut,
    max_line_bytes: usize,
}

impl StreamDecoder {
    /// Creates a decoder with the default line limit.
    pub fn new() -> Self {
        Self::with_max_line_bytes(DEFAULT_MAX_LINE_BYTES)
    }

    /// Creates a decoder that rejects lines longer than `max_line_bytes`.
    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            pending: BytesMut::new(),
            max_line_bytes: max_line_bytes.max(1),
        }
    }

    /// Pre-sizes the carry buffer for `capacity` bytes.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.pending.reserve(capacity);
        self
    }

    /// Append a chunk and decode every line it completes.
    ///
    /// Between calls `pending` never holds a newline, so only the new chunk
    /// is searched and a long line split over many reads is scanned once.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<DecodedLine> {
        self.pending.extend_from_slice(chunk);

        let mut records = Vec::new();
        if chunk.contains(&b'\n') {
            let decoded = decode_lines(&self.pending);
            self.pending.advance(decoded.consumed);
            records = decoded.records;
        }

        if self.pending.len() > self.max_line_bytes {
            records.push(Err(DecodeError::Oversized {
                len: self.pending.len(),
                limit: self.max_line_bytes,
            }));
            self.pending.clear();
        }

        records
    }

    /// Decode whatever remains once the stream has ended cleanly.
    ///
    /// A final record without a trailing newline is still a record.
    pub fn finish(&mut self) -> Option<DecodedLine> {
        let rest = self.pending.split();
        decode_line(&rest)
    }

    /// Drop any partially received line.
    pub fn reset(&mut self) {
        self.pending.clear();
    }

    /// Bytes waiting for a newline.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::record::{ChangeType, EventType};

    #[test]
    fn test_valid_line() {
        let decoded = decode_lines(b"{\"type\": 2, \"eventChangeType\": 2}\n");
        assert_eq!(decoded.records.len(), 1);
        assert_eq!(decoded.consumed, 34);

        let ev = decoded.records[0].as_ref().expect("record should decode");
        assert_eq!(ev.event_type, EventType::App);
        assert_eq!(ev.event_change_type, ChangeType::Add);
    }

    #[test]
    fn test_invalid_json_line() {
        let decoded = decode_lines(b"{\"type\": 2, \"eventChangeType\": 2\n");
        assert_eq!(decoded.records.len(), 1);

        let err = decoded.records[0].as_ref().expect_err("should fail");
        assert!(err
            .to_string()
            .contains("could not unmarshal event from stream"));
        assert_eq!(err.fragment(), Some("{\"type\": 2, \"eventChangeType\": 2"));
    }

    #[test]
    fn test_empty_input() {
        let decoded = decode_lines(b"");
        assert!(decoded.records.is_empty());
        assert_eq!(decoded.consumed, 0);
    }

    #[test]
    fn test_incomplete_line_not_consumed() {
        let input = b"{\"type\": 2}\n{\"type\": 3";
        let decoded = decode_lines(input);
        assert_eq!(decoded.records.len(), 1);
        assert_eq!(decoded.consumed, 12);
        assert_eq!(&input[decoded.consumed..], b"{\"type\": 3");
    }

    #[test]
    fn test_corrupt_line_isolated() {
        let decoded =
            decode_lines(b"{\"type\": 2}\nnot json\n\"text\"\n{\"type\": 4, \"eventChangeType\": 3}\n");
        assert_eq!(decoded.records.len(), 4);
        assert!(decoded.records[0].is_ok());
        assert!(decoded.records[1].is_err());
        assert!(decoded.records[2].is_err());

        let last = decoded.records[3].as_ref().expect("last should decode");
        assert_eq!(last.key().to_string(), "QUEUE-REMOVE");
    }

    #[test]
    fn test_blank_and_crlf_lines() {
        let decoded = decode_lines(b"\n\r\n{\"type\": 3}\r\n  \n");
        assert_eq!(decoded.records.len(), 1);
        assert!(decoded.records[0].is_ok());
    }

    #[test]
    fn test_stream_decoder_carries_partial_lines() {
        let mut dec = StreamDecoder::new();

        assert!(dec.push(b"{\"type\": 2, \"event").is_empty());
        assert!(dec.pending_len() > 0);

        let out = dec.push(b"ChangeType\": 2}\n{\"type\"");
        assert_eq!(out.len(), 1);
        assert_eq!(
            out[0].as_ref().expect("decode").key().to_string(),
            "APP-ADD"
        );

        let out = dec.push(b": 2, \"eventChangeType\": 1}\n");
        assert_eq!(out.len(), 1);
        assert_eq!(
            out[0].as_ref().expect("decode").key().to_string(),
            "APP-SET"
        );
        assert_eq!(dec.pending_len(), 0);
    }

    #[test]
    fn test_stream_decoder_finish_decodes_tail() {
        let mut dec = StreamDecoder::new();
        assert!(dec.push(b"{\"type\": 3, \"eventChangeType\": 2}").is_empty());

        let tail = dec.finish().expect("tail present");
        assert_eq!(tail.expect("decode").key().to_string(), "NODE-ADD");
        assert!(dec.finish().is_none());
    }

    #[test]
    fn test_stream_decoder_finish_reports_truncated_tail() {
        let mut dec = StreamDecoder::new();
        dec.push(b"{\"type\": 2, \"eventChangeType\": 2");

        let err = dec.finish().expect("tail present").expect_err("truncated");
        assert!(err
            .to_string()
            .contains("could not unmarshal event from stream"));
    }

    #[test]
    fn test_stream_decoder_oversized_line() {
        let mut dec = StreamDecoder::with_max_line_bytes(8);
        let out = dec.push(b"{\"type\": 2, \"eventChangeType\"");
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Err(DecodeError::Oversized { limit: 8, .. })));
        assert_eq!(dec.pending_len(), 0);
    }

    #[test]
    fn test_stream_decoder_long_line_in_small_chunks() {
        let mut line = b"{\"type\": 2, \"eventChangeType\": 2, \"message\": \"".to_vec();
        line.extend(std::iter::repeat(b'x').take(64 * 1024));
        line.extend_from_slice(b"\"}\n");

        let mut dec = StreamDecoder::new();
        let mut out = Vec::new();
        for chunk in line.chunks(7) {
            out.extend(dec.push(chunk));
        }

        assert_eq!(out.len(), 1);
        let record = out.remove(0).expect("decode");
        assert_eq!(record.key().to_string(), "APP-ADD");
        assert_eq!(record.message.len(), 64 * 1024);
        assert_eq!(dec.pending_len(), 0);
    }

    #[test]
    fn test_stream_decoder_oversized_across_chunks() {
        let mut dec = StreamDecoder::with_max_line_bytes(32);
        let mut errors = 0;
        for _ in 0..10 {
            errors += dec
                .push(b"xxxxxxxx")
                .iter()
                .filter(|r| matches!(r, Err(DecodeError::Oversized { limit: 32, .. })))
                .count();
        }
        assert_eq!(errors, 2);
        assert!(dec.pending_len() <= 32);
    }

    #[test]
    fn test_stream_decoder_reset() {
        let mut dec = StreamDecoder::new();
        dec.push(b"{\"type\"");
        dec.reset();
        assert_eq!(dec.pending_len(), 0);
        assert!(dec.finish().is_none());
    }
}
