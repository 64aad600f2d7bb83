//! SSE Record Framing
//!
//! Incremental decoder for the provider's wire framing: repeated
//! `field: value` records separated by a blank line. Network chunk
//! boundaries carry no meaning — a chunk may end mid-record or even mid
//! UTF-8 sequence — so the decoder buffers raw bytes and only ever yields
//! complete records. Nothing partial is emitted; a record that straddles
//! any number of chunk boundaries is reassembled byte-for-byte before it is
//! parsed.
//!
//! A malformed record is skipped with a warning; decoding always continues
//! with the next record.

/// The provider's explicit end-of-stream marker
///
/// Sent as a record's `data` payload. It terminates the stream and is never
/// content.
pub const END_OF_STREAM_DATA: &str = "[DONE]";

/// Minimum buffer capacity for the decoder
const MIN_BUFFER_CAPACITY: usize = 4096;

/// One decoded record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SseRecord {
    /// The `event:` field, if present
    pub event: Option<String>,
    /// All `data:` lines, joined with newlines
    pub data: String,
}

impl SseRecord {
    /// Whether this record is the explicit end-of-stream marker
    #[must_use]
    pub fn is_end_of_stream(&self) -> bool {
        self.data.trim() == END_OF_STREAM_DATA
    }
}

/// Streaming decoder for blank-line-separated `field: value` records
///
/// Push raw bytes in as they arrive, pull complete records out:
///
/// ```
/// use chorus_core::sse::SseDecoder;
///
/// let mut decoder = SseDecoder::new();
/// decoder.push(b"data: {\"a\"");
/// assert!(decoder.next_record().is_none()); // record still open
/// decoder.push(b": 1}\n\n");
/// let record = decoder.next_record().unwrap();
/// assert_eq!(record.data, "{\"a\": 1}");
/// ```
#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    read_pos: usize,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SseDecoder {
    /// Create a new decoder
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
        }
    }

    /// Append raw bytes to the buffer
    pub fn push(&mut self, data: &[u8]) {
        // Compact once we've consumed a decent share of the buffer
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Bytes buffered but not yet consumed
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Try to decode the next complete record
    ///
    /// Returns `None` when no complete record is buffered yet. Records that
    /// carry no fields (keep-alive comments, stray blank lines) and records
    /// that are not valid UTF-8 are skipped silently or with a warning, and
    /// scanning continues.
    pub fn next_record(&mut self) -> Option<SseRecord> {
        loop {
            let (end, skip) = self.find_record_boundary()?;
            let raw = &self.buffer[self.read_pos..end];

            let record = match std::str::from_utf8(raw) {
                Ok(text) => parse_record(text),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping non-UTF-8 record");
                    None
                }
            };

            self.read_pos = end + skip;

            if let Some(record) = record {
                return Some(record);
            }
            // Empty or malformed record: keep scanning
        }
    }

    /// Find the end of the next record (exclusive) and the separator width
    fn find_record_boundary(&self) -> Option<(usize, usize)> {
        let buf = &self.buffer[self.read_pos..];
        let mut i = 0;
        while i + 1 < buf.len() {
            if buf[i] == b'\n' && buf[i + 1] == b'\n' {
                return Some((self.read_pos + i, 2));
            }
            if i + 3 < buf.len()
                && buf[i] == b'\r'
                && buf[i + 1] == b'\n'
                && buf[i + 2] == b'\r'
                && buf[i + 3] == b'\n'
            {
                return Some((self.read_pos + i, 4));
            }
            i += 1;
        }
        None
    }
}

/// Parse the fields of one complete record
///
/// Unknown fields (`id:`, `retry:`) and comment lines are ignored. Returns
/// `None` if the record ends up with no data at all.
fn parse_record(text: &str) -> Option<SseRecord> {
    let mut event = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in text.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let Some((field, value)) = line.split_once(':') else {
            tracing::warn!(line, "Skipping malformed record line");
            continue;
        };
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data_lines.push(value),
            // id/retry and anything else: not used by this protocol
            _ => {}
        }
    }

    if data_lines.is_empty() && event.is_none() {
        return None;
    }

    Some(SseRecord {
        event,
        data: data_lines.join("\n"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn decode_all(decoder: &mut SseDecoder) -> Vec<SseRecord> {
        let mut records = Vec::new();
        while let Some(record) = decoder.next_record() {
            records.push(record);
        }
        records
    }

    #[test]
    fn test_single_complete_record() {
        let mut decoder = SseDecoder::new();
        decoder.push(b"event: chunk\ndata: \"hello\"\n\n");

        let record = decoder.next_record().expect("complete record");
        assert_eq!(record.event.as_deref(), Some("chunk"));
        assert_eq!(record.data, "\"hello\"");
        assert!(decoder.next_record().is_none());
    }

    #[test]
    fn test_record_split_across_chunk_boundaries() {
        let mut decoder = SseDecoder::new();
        decoder.push(b"data: {\"choi");
        assert!(decoder.next_record().is_none());
        decoder.push(b"ces\": []}");
        assert!(decoder.next_record().is_none());
        decoder.push(b"\n\n");

        let record = decoder.next_record().expect("reassembled record");
        assert_eq!(record.data, "{\"choices\": []}");
    }

    #[test]
    fn test_boundary_may_split_every_byte() {
        let wire = b"event: chunk\ndata: {\"text\": \"a\"}\n\ndata: [DONE]\n\n";
        let mut decoder = SseDecoder::new();
        let mut records = Vec::new();
        for byte in wire {
            decoder.push(&[*byte]);
            records.extend(decode_all(&mut decoder));
        }

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].data, "{\"text\": \"a\"}");
        assert!(records[1].is_end_of_stream());
    }

    #[test]
    fn test_multibyte_utf8_split_is_buffered() {
        // "é" is two bytes; split the record between them
        let wire = "data: \"caf\u{e9}\"\n\n".as_bytes();
        let split = wire.len() - 5;

        let mut decoder = SseDecoder::new();
        decoder.push(&wire[..split]);
        assert!(decoder.next_record().is_none());
        decoder.push(&wire[split..]);

        let record = decoder.next_record().expect("record");
        assert_eq!(record.data, "\"caf\u{e9}\"");
    }

    #[test]
    fn test_multiple_data_lines_join() {
        let mut decoder = SseDecoder::new();
        decoder.push(b"data: line one\ndata: line two\n\n");

        let record = decoder.next_record().unwrap();
        assert_eq!(record.data, "line one\nline two");
    }

    #[test]
    fn test_crlf_records() {
        let mut decoder = SseDecoder::new();
        decoder.push(b"event: status\r\ndata: \"ok\"\r\n\r\n");

        let record = decoder.next_record().unwrap();
        assert_eq!(record.event.as_deref(), Some("status"));
        assert_eq!(record.data, "\"ok\"");
    }

    #[test]
    fn test_comments_and_unknown_fields_ignored() {
        let mut decoder = SseDecoder::new();
        decoder.push(b": keep-alive\n\nid: 7\nretry: 100\ndata: \"x\"\n\n");

        let records = decode_all(&mut decoder);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data, "\"x\"");
    }

    #[test]
    fn test_malformed_line_does_not_stop_decoding() {
        let mut decoder = SseDecoder::new();
        decoder.push(b"not a field line\ndata: \"kept\"\n\ndata: \"next\"\n\n");

        let records = decode_all(&mut decoder);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].data, "\"kept\"");
        assert_eq!(records[1].data, "\"next\"");
    }

    #[test]
    fn test_end_of_stream_marker() {
        let record = SseRecord {
            event: None,
            data: "[DONE]".to_string(),
        };
        assert!(record.is_end_of_stream());

        let content = SseRecord {
            event: None,
            data: "[DONE] extra".to_string(),
        };
        assert!(!content.is_end_of_stream());
    }

    #[test]
    fn test_buffer_compaction_keeps_decoding() {
        let mut decoder = SseDecoder::new();
        // Push enough records to trigger compaction several times
        for i in 0..2_000 {
            decoder.push(format!("data: \"record {i} padded out a little\"\n\n").as_bytes());
            let record = decoder.next_record().expect("record per push");
            assert_eq!(record.data, format!("\"record {i} padded out a little\""));
        }
        assert!(decoder.available() < MIN_BUFFER_CAPACITY);
    }
}
