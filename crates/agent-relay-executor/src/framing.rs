//! Newline-delimited record reassembly.

use bytes::{Buf, BytesMut};

/// Reassembles newline-terminated records from arbitrarily chunked bytes.
///
/// Incomplete trailing bytes are carried over to the next [`feed`](Self::feed).
/// Blank and whitespace-only records are skipped, and a trailing `\r` is
/// stripped so CRLF output decodes the same as LF output.
#[derive(Debug, Default)]
pub struct FrameReassembler {
    buf: BytesMut,
    /// Bytes of `buf` already known to contain no newline.
    scanned: usize,
}

impl FrameReassembler {
    /// Create an empty reassembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and iterate the records it completes.
    ///
    /// Records not pulled from the iterator stay buffered and come out of the
    /// next call.
    pub fn feed(&mut self, chunk: &[u8]) -> Frames<'_> {
        self.buf.extend_from_slice(chunk);
        Frames { inner: self }
    }

    /// Flush the carried-over partial record at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        self.scanned = 0;
        let rest = self.buf.split();
        decode(&rest)
    }

    /// Number of buffered bytes not yet emitted.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    fn next_record(&mut self) -> Option<String> {
        loop {
            let offset = self.buf[self.scanned..].iter().position(|b| *b == b'\n');
            let Some(offset) = offset else {
                self.scanned = self.buf.len();
                return None;
            };
            let line = self.buf.split_to(self.scanned + offset);
            self.buf.advance(1);
            self.scanned = 0;
            if let Some(record) = decode(&line) {
                return Some(record);
            }
        }
    }
}

/// Complete records produced by one [`FrameReassembler::feed`].
pub struct Frames<'a> {
    inner: &'a mut FrameReassembler,
}

impl Iterator for Frames<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.inner.next_record()
    }
}

fn decode(line: &[u8]) -> Option<String> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let text = String::from_utf8_lossy(line);
    if text.trim().is_empty() {
        None
    } else {
        Some(text.into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &str = "{\"type\":\"system\"}\n\n{\"a\":\"caf\u{e9} \u{1f980}\"}\r\n   \n{\"type\":\"result\"}\n";

    fn feed_in_chunks(data: &[u8], size: usize) -> Vec<String> {
        let mut frames = FrameReassembler::new();
        let mut out = Vec::new();
        for chunk in data.chunks(size) {
            out.extend(frames.feed(chunk));
        }
        assert_eq!(frames.pending(), 0);
        out
    }

    #[test]
    fn test_every_chunking_yields_same_records() {
        let whole = feed_in_chunks(STREAM.as_bytes(), STREAM.len());
        assert_eq!(
            whole,
            vec![
                "{\"type\":\"system\"}".to_string(),
                "{\"a\":\"caf\u{e9} \u{1f980}\"}".to_string(),
                "{\"type\":\"result\"}".to_string(),
            ]
        );
        for size in 1..STREAM.len() {
            assert_eq!(feed_in_chunks(STREAM.as_bytes(), size), whole, "chunk size {size}");
        }
    }

    #[test]
    fn test_partial_record_is_held_back() {
        let mut frames = FrameReassembler::new();
        assert_eq!(frames.feed(b"{\"x\":").count(), 0);
        assert_eq!(frames.pending(), 5);

        let records: Vec<String> = frames.feed(b"1}\n{\"y\"").collect();
        assert_eq!(records, vec!["{\"x\":1}"]);
        assert_eq!(frames.finish(), Some("{\"y\"".to_string()));
        assert_eq!(frames.finish(), None);
    }

    #[test]
    fn test_unconsumed_records_survive_to_next_feed() {
        let mut frames = FrameReassembler::new();
        let first = frames.feed(b"a\nb\n").next();
        assert_eq!(first.as_deref(), Some("a"));

        let rest: Vec<String> = frames.feed(b"c\n").collect();
        assert_eq!(rest, vec!["b", "c"]);
    }

    #[test]
    fn test_delimiter_on_chunk_boundary() {
        let mut frames = FrameReassembler::new();
        assert_eq!(frames.feed(b"one").count(), 0);
        let records: Vec<String> = frames.feed(b"\n").collect();
        assert_eq!(records, vec!["one"]);
        assert_eq!(frames.feed(b"\n\n").count(), 0);
    }
}
