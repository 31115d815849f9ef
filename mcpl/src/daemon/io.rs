//! NDJSON message reading for the daemon's wire loops.
//!
//! Both wires (shim socket and server stdout) are consumed through a
//! [`MessageReader`], which owns the line assembly, the 10 MiB cap, UTF-8
//! validation, and JSON-RPC parsing. The session loop and the dispatcher
//! only ever see parsed [`Message`]s or a typed framing error.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use mcpl_core::error::FramingError;
use mcpl_core::jsonrpc::{parse_message, Message};
use mcpl_core::MAX_LINE_BYTES;

/// Skip granularity while resynchronizing after an oversized line.
const SKIP_CHUNK: u64 = 8 * 1024;

/// Reads newline-delimited JSON-RPC messages from a buffered source.
///
/// A line that exceeds the cap is consumed through to its newline so the
/// next call starts on a message boundary; the oversized line itself is
/// reported as [`FramingError::MessageTooLarge`] and lost.
pub(crate) struct MessageReader<R> {
    reader: R,
    buf: Vec<u8>,
    max_bytes: usize,
}

impl<R: AsyncBufRead + Unpin> MessageReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_limit(reader, MAX_LINE_BYTES)
    }

    fn with_limit(reader: R, max_bytes: usize) -> Self {
        MessageReader {
            reader,
            buf: Vec::new(),
            max_bytes,
        }
    }

    /// The next line as UTF-8 text, trailing newline stripped.
    ///
    /// Returns `Ok(None)` on EOF. A final line that ends at EOF without a
    /// newline is handed over as-is.
    pub async fn next_line(&mut self) -> Result<Option<String>, FramingError> {
        self.buf.clear();
        // One byte of headroom: a line of exactly `max_bytes` plus its
        // newline still fits, anything longer trips the limit.
        let limit = self.max_bytes as u64 + 1;
        let n = (&mut self.reader)
            .take(limit)
            .read_until(b'\n', &mut self.buf)
            .await?;
        if n == 0 {
            return Ok(None);
        }

        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
        } else if n as u64 == limit {
            // The cap cut the read short; skip ahead to the next message.
            self.skip_line().await?;
            return Err(FramingError::MessageTooLarge {
                max_bytes: self.max_bytes,
            });
        }

        match std::str::from_utf8(&self.buf) {
            Ok(line) => Ok(Some(line.to_string())),
            Err(_) => Err(FramingError::InvalidUtf8),
        }
    }

    /// The next parsed JSON-RPC message. Returns `Ok(None)` on EOF.
    pub async fn next_message(&mut self) -> Result<Option<Message>, FramingError> {
        match self.next_line().await? {
            Some(line) => parse_message(&line).map(Some),
            None => Ok(None),
        }
    }

    /// Discard input through the next newline (or EOF), in bounded chunks.
    async fn skip_line(&mut self) -> Result<(), FramingError> {
        loop {
            self.buf.clear();
            let n = (&mut self.reader)
                .take(SKIP_CHUNK)
                .read_until(b'\n', &mut self.buf)
                .await?;
            if n == 0 || self.buf.last() == Some(&b'\n') {
                self.buf.clear();
                return Ok(());
            }
        }
    }
}
