//! Streaming HTTP/1.1 message assembly.
//!
//! # Responsibilities
//! - Reconstruct one HTTP message from arbitrarily-fragmented byte chunks
//! - Preserve header insertion order and partial lines across chunk boundaries
//! - Decide completion (body-less method, or `Content-Length` satisfied)
//! - Serialize the assembled message back to wire format
//!
//! # Design Decisions
//! - Purely byte-oriented; no socket or allocation-pool coupling
//! - Structural splitting only: header names and values are opaque bytes
//! - Messages with neither a body-less method nor a `Content-Length` header
//!   never report completion; this is a documented boundary condition of the
//!   framing model, not an error

use thiserror::Error;

const CRLF: &[u8] = b"\r\n";
const HEADER_SEPARATOR: &[u8] = b": ";

/// Errors raised while assembling a message.
///
/// These are per-connection parse faults: the owning connection should be
/// closed, but the process carries on.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    /// A header line did not contain the `": "` separator.
    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),

    /// `Content-Length` was present but not a decimal integer.
    #[error("invalid Content-Length value: {0:?}")]
    InvalidContentLength(String),
}

/// Assembly phase of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for a CRLF-terminated start line.
    StartLine,
    /// Start line parsed; consuming header lines until the blank line.
    Headers,
    /// Blank line consumed; appending body fragments.
    Body,
    /// Completion predicate satisfied; further chunks are not processed.
    Complete,
}

/// One HTTP message assembled incrementally from sequential chunks.
///
/// Feed chunks with [`ingest_chunk`](Self::ingest_chunk) in arrival order.
/// The outcome is chunk-invariant: any split of the same byte sequence yields
/// the same completion state and the same [`to_bytes`](Self::to_bytes) output.
#[derive(Debug, Default)]
pub struct HttpMessage {
    start_line: Option<Vec<u8>>,
    /// Headers in first-seen order; names are unique.
    headers: Vec<(Vec<u8>, Vec<u8>)>,
    body_chunks: Vec<Vec<u8>>,
    /// Bytes of a partial line retained until the next chunk arrives.
    carry: Vec<u8>,
    phase: Phase,
}

impl Default for Phase {
    fn default() -> Self {
        Phase::StartLine
    }
}

impl HttpMessage {
    /// Create an empty accumulator awaiting its start line.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next sequential chunk of the message.
    ///
    /// Safe to call with chunks of any size, including single bytes. Once the
    /// message is complete further chunks are ignored.
    pub fn ingest_chunk(&mut self, chunk: &[u8]) -> Result<(), MessageError> {
        if self.phase == Phase::Complete {
            return Ok(());
        }

        let mut data = std::mem::take(&mut self.carry);
        data.extend_from_slice(chunk);

        if self.phase == Phase::StartLine {
            match split_line(&data) {
                Some((line, rest)) => {
                    self.start_line = Some(line.to_vec());
                    data = rest.to_vec();
                    self.phase = Phase::Headers;
                }
                None => {
                    self.carry = data;
                    return Ok(());
                }
            }
        }

        if self.phase == Phase::Headers {
            loop {
                match split_line(&data) {
                    None => {
                        // No CRLF yet; retain the partial line for the next chunk.
                        self.carry = data;
                        return Ok(());
                    }
                    Some((line, rest)) if line.is_empty() => {
                        // Blank line terminates the headers; the remainder of
                        // this chunk (possibly empty) is the first body fragment.
                        self.body_chunks.push(rest.to_vec());
                        self.phase = Phase::Body;
                        return self.check_complete();
                    }
                    Some((line, rest)) => {
                        let (name, value) = parse_header(line)?;
                        self.set_header(&name, &value);
                        data = rest.to_vec();
                    }
                }
            }
        }

        // Phase::Body: the whole chunk is one body fragment.
        self.body_chunks.push(data);
        self.check_complete()
    }

    /// Whether the completion predicate has been satisfied.
    pub fn is_complete(&self) -> bool {
        self.phase == Phase::Complete
    }

    /// Insert or overwrite a header, preserving its first-seen position.
    pub fn set_header(&mut self, name: &[u8], value: &[u8]) {
        for (existing, slot) in &mut self.headers {
            if existing == name {
                *slot = value.to_vec();
                return;
            }
        }
        self.headers.push((name.to_vec(), value.to_vec()));
    }

    /// Look up a header value by exact name.
    pub fn header(&self, name: &[u8]) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }

    /// Concatenated body bytes accumulated so far.
    pub fn body(&self) -> Vec<u8> {
        self.body_chunks.concat()
    }

    /// Serialize the message back to wire format.
    ///
    /// Headers are emitted in the order they were first seen.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        if let Some(line) = &self.start_line {
            out.extend_from_slice(line);
        }
        out.extend_from_slice(CRLF);
        for (name, value) in &self.headers {
            out.extend_from_slice(name);
            out.extend_from_slice(HEADER_SEPARATOR);
            out.extend_from_slice(value);
            out.extend_from_slice(CRLF);
        }
        out.extend_from_slice(CRLF);
        for chunk in &self.body_chunks {
            out.extend_from_slice(chunk);
        }
        out
    }

    fn body_len(&self) -> usize {
        self.body_chunks.iter().map(Vec::len).sum()
    }

    /// Evaluate the completion predicate after a chunk in the body phase.
    fn check_complete(&mut self) -> Result<(), MessageError> {
        if self.phase != Phase::Body {
            return Ok(());
        }
        // A body-less method completes as soon as the blank line has been
        // consumed (one body fragment appended, possibly empty).
        if self.is_bodyless() && !self.body_chunks.is_empty() {
            self.phase = Phase::Complete;
            return Ok(());
        }
        if let Some(value) = self.header(b"Content-Length") {
            let expected = std::str::from_utf8(value)
                .ok()
                .and_then(|s| s.trim().parse::<usize>().ok())
                .ok_or_else(|| {
                    MessageError::InvalidContentLength(
                        String::from_utf8_lossy(value).into_owned(),
                    )
                })?;
            if self.body_len() >= expected {
                self.phase = Phase::Complete;
            }
        }
        // Neither a body-less method nor Content-Length: never completes.
        Ok(())
    }

    fn is_bodyless(&self) -> bool {
        match &self.start_line {
            Some(line) => line.starts_with(b"GET ") || line.starts_with(b"HEAD "),
            None => false,
        }
    }
}

/// Split the first CRLF-terminated line off `data`.
///
/// Returns the line (without its CRLF) and the remainder, or `None` if no
/// CRLF is present yet.
fn split_line(data: &[u8]) -> Option<(&[u8], &[u8])> {
    let pos = data.windows(CRLF.len()).position(|w| w == CRLF)?;
    Some((&data[..pos], &data[pos + CRLF.len()..]))
}

/// Split a header line on the first `": "` occurrence.
fn parse_header(line: &[u8]) -> Result<(Vec<u8>, Vec<u8>), MessageError> {
    let pos = line
        .windows(HEADER_SEPARATOR.len())
        .position(|w| w == HEADER_SEPARATOR)
        .ok_or_else(|| {
            MessageError::MalformedHeader(String::from_utf8_lossy(line).into_owned())
        })?;
    Ok((
        line[..pos].to_vec(),
        line[pos + HEADER_SEPARATOR.len()..].to_vec(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const GET_REQUEST: &[u8] = b"GET / HTTP/1.1\r\nHost: example.test\r\n\r\n";
    const POST_REQUEST: &[u8] =
        b"POST /submit HTTP/1.1\r\nHost: example.test\r\nContent-Length: 5\r\n\r\nhello";

    fn feed_whole(bytes: &[u8]) -> HttpMessage {
        let mut msg = HttpMessage::new();
        msg.ingest_chunk(bytes).unwrap();
        msg
    }

    fn feed_bytewise(bytes: &[u8]) -> HttpMessage {
        let mut msg = HttpMessage::new();
        for b in bytes {
            msg.ingest_chunk(std::slice::from_ref(b)).unwrap();
        }
        msg
    }

    #[test]
    fn bodyless_request_completes_at_blank_line() {
        let msg = feed_whole(GET_REQUEST);
        assert!(msg.is_complete());
        assert_eq!(msg.body(), b"");
    }

    #[test]
    fn content_length_exactness() {
        let mut msg = HttpMessage::new();
        msg.ingest_chunk(b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\n")
            .unwrap();
        assert!(!msg.is_complete());
        msg.ingest_chunk(b"ab").unwrap();
        assert!(!msg.is_complete(), "2 of 5 body bytes is not complete");
        msg.ingest_chunk(b"cde").unwrap();
        assert!(msg.is_complete());
        assert_eq!(msg.body(), b"abcde");
    }

    #[test]
    fn chunk_invariance_at_every_split_point() {
        for request in [GET_REQUEST, POST_REQUEST] {
            let reference = feed_whole(request);
            for split in 1..request.len() {
                let mut msg = HttpMessage::new();
                msg.ingest_chunk(&request[..split]).unwrap();
                msg.ingest_chunk(&request[split..]).unwrap();
                assert_eq!(msg.is_complete(), reference.is_complete(), "split {split}");
                assert_eq!(msg.to_bytes(), reference.to_bytes(), "split {split}");
            }
        }
    }

    #[test]
    fn single_byte_delivery_matches_whole_delivery() {
        let whole = feed_whole(POST_REQUEST);
        let bytewise = feed_bytewise(POST_REQUEST);
        assert!(bytewise.is_complete());
        assert_eq!(bytewise.to_bytes(), whole.to_bytes());
    }

    #[test]
    fn partial_header_line_retained_across_chunks() {
        let mut msg = HttpMessage::new();
        msg.ingest_chunk(b"GET / HTTP/1.1\r\nHo").unwrap();
        assert!(!msg.is_complete());
        msg.ingest_chunk(b"st: example.test\r\n\r\n").unwrap();
        assert!(msg.is_complete());
        assert_eq!(msg.header(b"Host"), Some(&b"example.test"[..]));
    }

    #[test]
    fn crlf_split_between_chunks() {
        let mut msg = HttpMessage::new();
        msg.ingest_chunk(b"GET / HTTP/1.1\r\nHost: x\r").unwrap();
        msg.ingest_chunk(b"\n\r\n").unwrap();
        assert!(msg.is_complete());
    }

    #[test]
    fn headers_serialize_in_first_seen_order() {
        let mut msg = feed_whole(b"POST / HTTP/1.1\r\nB: 2\r\nA: 1\r\nContent-Length: 0\r\n\r\n");
        assert!(msg.is_complete());
        msg.set_header(b"B", b"9");
        let bytes = msg.to_bytes();
        assert_eq!(
            bytes,
            b"POST / HTTP/1.1\r\nB: 9\r\nA: 1\r\nContent-Length: 0\r\n\r\n"
        );
    }

    #[test]
    fn keep_alive_injection_appends_when_absent() {
        let mut msg = feed_whole(GET_REQUEST);
        msg.set_header(b"Connection", b"Keep-Alive");
        assert_eq!(
            msg.to_bytes(),
            b"GET / HTTP/1.1\r\nHost: example.test\r\nConnection: Keep-Alive\r\n\r\n"
        );
    }

    #[test]
    fn malformed_header_is_an_error() {
        let mut msg = HttpMessage::new();
        let err = msg
            .ingest_chunk(b"GET / HTTP/1.1\r\nno-separator-here\r\n\r\n")
            .unwrap_err();
        assert!(matches!(err, MessageError::MalformedHeader(_)));
    }

    #[test]
    fn non_numeric_content_length_is_an_error() {
        let mut msg = HttpMessage::new();
        let err = msg
            .ingest_chunk(b"POST / HTTP/1.1\r\nContent-Length: many\r\n\r\nx")
            .unwrap_err();
        assert!(matches!(err, MessageError::InvalidContentLength(_)));
    }

    #[test]
    fn no_length_and_no_bodyless_method_never_completes() {
        // Boundary condition of the framing model: nothing ever marks this done.
        let mut msg = HttpMessage::new();
        msg.ingest_chunk(b"POST / HTTP/1.1\r\nHost: x\r\n\r\nbody bytes")
            .unwrap();
        assert!(!msg.is_complete());
        msg.ingest_chunk(b"more").unwrap();
        assert!(!msg.is_complete());
    }

    #[test]
    fn chunks_after_completion_are_ignored() {
        let mut msg = feed_whole(GET_REQUEST);
        assert!(msg.is_complete());
        msg.ingest_chunk(b"trailing garbage").unwrap();
        assert_eq!(msg.to_bytes(), GET_REQUEST);
    }

    #[test]
    fn response_with_content_length_completes() {
        let mut msg = HttpMessage::new();
        msg.ingest_chunk(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n")
            .unwrap();
        assert!(!msg.is_complete());
        msg.ingest_chunk(b"ok").unwrap();
        assert!(msg.is_complete());
    }
}
