//! Incremental line framing over a raw byte stream.
//!
//! Socket reads do not respect line boundaries, so bytes are accumulated
//! here and handed out one complete line at a time:
//!
//! ```text
//!   "200- O"  "K\r\n202- mul"  "ti\r\n"
//!       │          │               │
//!       ▼          ▼               ▼
//!   [buffer] ─► "200- OK" ─► [buffer] ─► "202- multi"
//! ```
//!
//! A line ends at `\r`; anything between that `\r` and the next `\n` is
//! discarded along with the `\n`. Bytes that remain after the last complete
//! line stay buffered and are also what a following binary read consumes
//! first.

use bytes::{Buf, BytesMut};

/// Growing buffer that yields CRLF-terminated lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: BytesMut,
}

impl LineBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the socket.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Take the next complete line, without its terminator.
    ///
    /// Returns `None` until both `\r` and a following `\n` have arrived.
    pub fn next_line(&mut self) -> Option<String> {
        let cr = self.buf.iter().position(|&b| b == b'\r')?;
        let lf = cr + self.buf[cr..].iter().position(|&b| b == b'\n')?;
        let line: String = self.buf[..cr].iter().map(|&b| char::from(b)).collect();
        self.buf.advance(lf + 1);
        Some(line)
    }

    /// Move up to `dst.len()` buffered bytes into `dst`, returning the count.
    pub fn drain_into(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.buf.len());
        self.buf.copy_to_slice(&mut dst[..n]);
        n
    }

    /// Number of buffered bytes not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Returns true if a partial line (or leftover binary data) is buffered.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_line() {
        let mut lines = LineBuffer::new();
        lines.feed(b"200- OK\r\n");
        assert_eq!(lines.next_line().as_deref(), Some("200- OK"));
        assert_eq!(lines.next_line(), None);
        assert!(!lines.has_partial());
    }

    #[test]
    fn test_line_split_across_reads() {
        let mut lines = LineBuffer::new();
        lines.feed(b"202- mul");
        assert_eq!(lines.next_line(), None);
        lines.feed(b"tiline response follows\r");
        assert_eq!(lines.next_line(), None, "CR alone does not end a line");
        lines.feed(b"\nab");
        assert_eq!(lines.next_line().as_deref(), Some("202- multiline response follows"));
        assert_eq!(lines.next_line(), None);
        assert!(lines.has_partial());
    }

    #[test]
    fn test_multiple_lines_in_one_read() {
        let mut lines = LineBuffer::new();
        lines.feed(b"a\r\nb\r\n.\r\n");
        assert_eq!(lines.next_line().as_deref(), Some("a"));
        assert_eq!(lines.next_line().as_deref(), Some("b"));
        assert_eq!(lines.next_line().as_deref(), Some("."));
        assert_eq!(lines.next_line(), None);
    }

    #[test]
    fn test_bytes_between_cr_and_lf_are_dropped() {
        let mut lines = LineBuffer::new();
        lines.feed(b"abc\rjunk\ndef\r\n");
        assert_eq!(lines.next_line().as_deref(), Some("abc"));
        assert_eq!(lines.next_line().as_deref(), Some("def"));
    }

    #[test]
    fn test_empty_line() {
        let mut lines = LineBuffer::new();
        lines.feed(b"\r\n");
        assert_eq!(lines.next_line().as_deref(), Some(""));
    }

    #[test]
    fn test_binary_tail_is_drained_after_status_line() {
        let mut lines = LineBuffer::new();
        lines.feed(b"203- binary response follows\r\n\x04\x80\xDE\xAD");
        assert_eq!(lines.next_line().as_deref(), Some("203- binary response follows"));
        assert_eq!(lines.buffered(), 4);

        let mut header = [0u8; 2];
        assert_eq!(lines.drain_into(&mut header), 2);
        assert_eq!(header, [0x04, 0x80]);

        let mut payload = [0u8; 4];
        assert_eq!(lines.drain_into(&mut payload), 2, "only two bytes are buffered");
        assert_eq!(&payload[..2], &[0xDE, 0xAD]);
        assert!(!lines.has_partial());
    }
}
