//! Per-connection inbound line framing.
//!
//! A `LineBuffer` accumulates raw bytes from the socket and hands back
//! complete, delimiter-stripped lines. It owns no I/O.
//!
//! ## Overflow
//!
//! The buffer holds at most `max_line_bytes - 1` bytes. When it fills up
//! without a newline, the whole content is flushed as a single line rather
//! than treated as an error, so no line ever exceeds that length.

use crate::error::ServerError;
use bytes::{Bytes, BytesMut};

/// Fixed-capacity inbound buffer that splits a byte stream into lines.
#[derive(Debug)]
pub struct LineBuffer {
    buf: BytesMut,
    /// Maximum number of buffered bytes.
    limit: usize,
}

impl LineBuffer {
    /// Create a buffer for lines of at most `max_line_bytes - 1` bytes.
    pub fn new(max_line_bytes: usize) -> Self {
        let limit = max_line_bytes.saturating_sub(1).max(1);
        Self {
            buf: BytesMut::with_capacity(limit),
            limit,
        }
    }

    /// Number of buffered bytes not yet returned as a line.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// How many more bytes may be fed before the buffer is full.
    pub fn spare(&self) -> usize {
        self.limit - self.buf.len()
    }

    /// Append `data` and return an iterator over the lines now complete.
    ///
    /// The iterator must be driven to exhaustion; any line it does not
    /// yield stays buffered for the next call.
    pub fn feed(&mut self, data: &[u8]) -> Result<Lines<'_>, ServerError> {
        if data.len() > self.spare() {
            return Err(ServerError::BufferOverrun {
                incoming: data.len(),
                spare: self.spare(),
            });
        }
        self.buf.extend_from_slice(data);
        Ok(Lines { buffer: self })
    }

    fn next_line(&mut self) -> Option<Bytes> {
        match self.buf.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let mut line = self.buf.split_to(pos + 1);
                line.truncate(pos);
                if line.last() == Some(&b'\r') {
                    line.truncate(pos - 1);
                }
                Some(line.freeze())
            }
            None if self.buf.len() >= self.limit => Some(self.buf.split().freeze()),
            None => None,
        }
    }
}

/// Lines completed by one `LineBuffer::feed` call.
pub struct Lines<'a> {
    buffer: &'a mut LineBuffer,
}

impl Iterator for Lines<'_> {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        self.buffer.next_line()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn feed_all(buffer: &mut LineBuffer, data: &[u8]) -> Vec<Bytes> {
        buffer.feed(data).unwrap().collect()
    }

    #[test]
    fn test_single_line() {
        let mut buffer = LineBuffer::new(4096);
        assert_eq!(feed_all(&mut buffer, b"ping\n"), vec![Bytes::from("ping")]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_crlf_stripped() {
        let mut buffer = LineBuffer::new(4096);
        assert_eq!(
            feed_all(&mut buffer, b"ping\r\n\r\n"),
            vec![Bytes::from("ping"), Bytes::new()]
        );
    }

    #[test]
    fn test_only_one_cr_stripped() {
        let mut buffer = LineBuffer::new(4096);
        assert_eq!(feed_all(&mut buffer, b"a\r\r\n"), vec![Bytes::from("a\r")]);
    }

    #[test]
    fn test_multiple_lines_one_read() {
        let mut buffer = LineBuffer::new(4096);
        assert_eq!(
            feed_all(&mut buffer, b"ping\npong\nbroad"),
            vec![Bytes::from("ping"), Bytes::from("pong")]
        );
        assert_eq!(buffer.len(), 5);

        assert_eq!(
            feed_all(&mut buffer, b"cast hi\n"),
            vec![Bytes::from("broadcast hi")]
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_partial_line_waits() {
        let mut buffer = LineBuffer::new(4096);
        assert!(feed_all(&mut buffer, b"pi").is_empty());
        assert!(feed_all(&mut buffer, b"ng").is_empty());
        assert_eq!(buffer.len(), 4);
        assert_eq!(feed_all(&mut buffer, b"\n"), vec![Bytes::from("ping")]);
    }

    #[test]
    fn test_capacity_flush() {
        let mut buffer = LineBuffer::new(4096);
        assert_eq!(buffer.spare(), 4095);

        let lines = feed_all(&mut buffer, &[b'x'; 4095]);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].len(), 4095);
        assert!(buffer.is_empty());
        assert_eq!(buffer.spare(), 4095);
    }

    #[test]
    fn test_capacity_flush_after_complete_line() {
        let mut buffer = LineBuffer::new(8);
        // Limit is 7 bytes: "ab\n" completes, then "cdef" waits
        assert_eq!(feed_all(&mut buffer, b"ab\ncdef"), vec![Bytes::from("ab")]);
        assert_eq!(buffer.len(), 4);
        // Three more bytes fill it to 7 with no newline
        assert_eq!(feed_all(&mut buffer, b"ghi"), vec![Bytes::from("cdefghi")]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_overrun_rejected() {
        let mut buffer = LineBuffer::new(8);
        let err = buffer.feed(b"12345678").err().unwrap();
        assert!(matches!(
            err,
            ServerError::BufferOverrun {
                incoming: 8,
                spare: 7
            }
        ));
        assert!(buffer.is_empty());
    }

    /// Feed `data` in pieces no larger than the buffer's free space.
    fn frame_chunked(data: &[u8], chunk: usize, max_line_bytes: usize) -> Vec<Bytes> {
        let mut buffer = LineBuffer::new(max_line_bytes);
        let mut lines = Vec::new();
        let mut rest = data;
        while !rest.is_empty() {
            let n = chunk.min(buffer.spare()).min(rest.len());
            lines.extend(buffer.feed(&rest[..n]).unwrap());
            rest = &rest[n..];
        }
        lines
    }

    proptest! {
        #[test]
        fn prop_chunking_invariance(
            data in proptest::collection::vec(
                prop_oneof![Just(b'\n'), Just(b'\r'), Just(b' '), any::<u8>()],
                0..2048,
            ),
            chunk in 1usize..64,
            max_line_bytes in 2usize..128,
        ) {
            let whole = frame_chunked(&data, usize::MAX, max_line_bytes);
            let pieces = frame_chunked(&data, chunk, max_line_bytes);
            prop_assert_eq!(whole, pieces);
        }

        #[test]
        fn prop_lines_never_exceed_limit(
            data in proptest::collection::vec(any::<u8>(), 0..4096),
            max_line_bytes in 2usize..256,
        ) {
            for line in frame_chunked(&data, 97, max_line_bytes) {
                prop_assert!(line.len() < max_line_bytes);
                prop_assert!(!line.contains(&b'\n'));
            }
        }
    }
}
