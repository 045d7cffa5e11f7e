//! Capped newline framing over a byte stream.
//!
//! `LineReader` pulls newline-terminated records out of any `AsyncRead`,
//! enforcing a per-record byte cap without ever buffering more than the cap
//! plus one socket read. Oversize records are drained to (and past) the
//! next newline so the connection can keep going on the following line.
//!
//! # Semantics
//! - A returned line excludes the terminating `\n` and a trailing `\r`.
//! - `Ok(None)` signals clean EOF.
//! - EOF with a non-empty partial line returns that line first; the next
//!   call returns `Ok(None)`.
//! - Each underlying socket read is bounded by the configured read timeout.

use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("record exceeds {limit} bytes")]
    Oversize { limit: usize },
    #[error("read timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Reads newline-terminated records up to a byte cap.
pub struct LineReader<R> {
    inner: BufReader<R>,
    max_line_bytes: usize,
    read_timeout: Duration,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R, max_line_bytes: usize, read_timeout: Duration) -> Self {
        LineReader {
            inner: BufReader::new(reader),
            max_line_bytes,
            read_timeout,
        }
    }

    /// Read the next record.
    ///
    /// Returns `Ok(Some(line))` for a complete (or EOF-terminated partial)
    /// record, `Ok(None)` at EOF, `Err(ReadError::Oversize)` after draining
    /// an over-cap record past its newline.
    pub async fn read_line(&mut self) -> Result<Option<Vec<u8>>, ReadError> {
        let mut line: Vec<u8> = Vec::new();
        let max_line_bytes = self.max_line_bytes;
        loop {
            let available = self.fill_buf().await?;
            if available.is_empty() {
                // EOF: surface a trailing partial line once, then None.
                if line.is_empty() {
                    return Ok(None);
                }
                strip_cr(&mut line);
                return Ok(Some(line));
            }

            match available.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    if line.len() + pos > max_line_bytes {
                        // The offending record ends in this chunk; skip it.
                        self.inner.consume(pos + 1);
                        return Err(ReadError::Oversize {
                            limit: max_line_bytes,
                        });
                    }
                    line.extend_from_slice(&available[..pos]);
                    self.inner.consume(pos + 1);
                    strip_cr(&mut line);
                    return Ok(Some(line));
                }
                None => {
                    let n = available.len();
                    if line.len() + n > max_line_bytes {
                        self.inner.consume(n);
                        self.drain_past_newline().await?;
                        return Err(ReadError::Oversize {
                            limit: max_line_bytes,
                        });
                    }
                    line.extend_from_slice(available);
                    self.inner.consume(n);
                }
            }
        }
    }

    /// Advance the stream to and past the next newline (or EOF).
    async fn drain_past_newline(&mut self) -> Result<(), ReadError> {
        loop {
            let available = self.fill_buf().await?;
            if available.is_empty() {
                return Ok(());
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    self.inner.consume(pos + 1);
                    return Ok(());
                }
                None => {
                    let n = available.len();
                    self.inner.consume(n);
                }
            }
        }
    }

    async fn fill_buf(&mut self) -> Result<&[u8], ReadError> {
        // Drop the fill_buf borrow before re-borrowing the buffer below.
        let outcome = tokio::time::timeout(self.read_timeout, self.inner.fill_buf())
            .await
            .map(|filled| filled.map(|_| ()));
        match outcome {
            Err(_) => Err(ReadError::Timeout(self.read_timeout)),
            Ok(Err(e)) => Err(ReadError::Io(e)),
            Ok(Ok(())) => Ok(self.inner.buffer()),
        }
    }
}

fn strip_cr(line: &mut Vec<u8>) {
    if line.last() == Some(&b'\r') {
        line.pop();
    }
}
