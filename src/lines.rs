//! Line-oriented reading with bounded raw copies
//!
//! IMAP is line-delimited except for literal payloads, which are counted
//! byte runs announced by the preceding line. `LineReader` owns the read
//! half of a stream and provides both: LF-terminated lines (CR preserved)
//! and exact-length transfers that drain its internal buffer before
//! touching the underlying stream.

use std::io;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

pub struct LineReader<R> {
    inner: BufReader<R>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
        }
    }

    /// Read one line, up to and including the LF terminator. A CR before
    /// the LF is part of the returned bytes. At EOF an unterminated
    /// partial line is returned once; after that, `None`.
    pub async fn read_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut line = Vec::new();
        let n = self.inner.read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(line))
    }

    /// Copy exactly `count` bytes to `writer`, buffered bytes first.
    ///
    /// # Errors
    ///
    /// `UnexpectedEof` if the stream ends before `count` bytes arrive.
    pub async fn copy_to<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        count: u64,
    ) -> io::Result<()> {
        let copied = tokio::io::copy(&mut (&mut self.inner).take(count), writer).await?;
        if copied < count {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream ended after {copied} of {count} literal bytes"),
            ));
        }
        writer.flush().await
    }

    /// Read and discard exactly `count` bytes.
    ///
    /// # Errors
    ///
    /// `UnexpectedEof` if the stream ends short.
    pub async fn discard(&mut self, count: u64) -> io::Result<()> {
        self.copy_to(&mut tokio::io::sink(), count).await
    }
}
