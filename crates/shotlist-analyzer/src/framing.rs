//! Line framing over a byte stream.
//!
//! Reads from a pipe deliver arbitrary slices: half a line, several lines,
//! or a line split in the middle of a multi-byte character. [`LineBuffer`]
//! accumulates bytes and hands back only complete lines.

use tracing::warn;

/// Upper bound on a single buffered line.
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Accumulates bytes and splits them into `\n`-terminated lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completes.
    ///
    /// The trailing `\n` (and a `\r` before it) is stripped. Bytes after the
    /// last terminator stay buffered for the next chunk. Splitting happens on
    /// raw bytes, so a character cut across two chunks is decoded whole.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(pos) = self.buf[start..].iter().position(|b| *b == b'\n') {
            let end = start + pos;
            let mut line = &self.buf[start..end];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            lines.push(String::from_utf8_lossy(line).into_owned());
            start = end + 1;
        }
        self.buf.drain(..start);

        if self.buf.len() > MAX_LINE_BYTES {
            warn!(
                "Discarding {} buffered bytes without a line terminator",
                self.buf.len()
            );
            self.buf.clear();
        }

        lines
    }

    /// Bytes received after the last complete line.
    pub fn remainder(&self) -> &[u8] {
        &self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
