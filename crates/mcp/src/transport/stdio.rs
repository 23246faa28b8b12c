//! Newline-delimited JSON over a byte stream pair.

use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Stdin, Stdout,
};
use tokio::sync::Mutex;
use tracing::debug;

use super::{MAX_FRAME_SIZE, OutboundFrame, Transport};
use crate::error::{Error, Result};

/// One frame per line. Generic so tests can drive it with in-memory pipes.
pub struct StdioTransport<R, W> {
    reader: Mutex<R>,
    writer: Mutex<Option<W>>,
}

impl StdioTransport<BufReader<Stdin>, Stdout> {
    /// Bind to the process's stdin and stdout.
    pub fn stdio() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
    }
}

impl<R, W> StdioTransport<R, W>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(Some(writer)),
        }
    }
}

impl<R, W> Transport for StdioTransport<R, W>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn receive(&self) -> Option<Result<String>> {
        let mut reader = self.reader.lock().await;
        loop {
            let line = match read_line_bounded(&mut *reader, MAX_FRAME_SIZE).await {
                Ok(None) => return None,
                Ok(Some(Line::TooLarge(size))) => {
                    return Some(Err(Error::FrameTooLarge {
                        size,
                        max: MAX_FRAME_SIZE,
                    }));
                }
                Ok(Some(Line::Bytes(bytes))) => bytes,
                Err(e) => return Some(Err(Error::Io(e))),
            };

            let text = match String::from_utf8(line) {
                Ok(text) => text,
                Err(e) => return Some(Err(Error::InvalidFrame(e.to_string()))),
            };
            let frame = text.trim();
            if !frame.is_empty() {
                debug!(bytes = frame.len(), "frame received");
                return Some(Ok(frame.to_string()));
            }
        }
    }

    async fn send(&self, frame: OutboundFrame) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::Closed)?;
        writer.write_all(frame.body.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(mut writer) = self.writer.lock().await.take() {
            writer.flush().await?;
            writer.shutdown().await?;
        }
        Ok(())
    }
}

enum Line {
    Bytes(Vec<u8>),
    /// The line was discarded; carries its length.
    TooLarge(usize),
}

/// Read up to and including the next `\n`. Bytes past `max` are consumed
/// but not kept, so an unterminated flood never grows the buffer.
async fn read_line_bounded<R>(reader: &mut R, max: usize) -> std::io::Result<Option<Line>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let mut total = 0usize;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(match total {
                0 => None,
                n if n > max => Some(Line::TooLarge(n)),
                _ => Some(Line::Bytes(line)),
            });
        }

        let (used, done) = match available.iter().position(|&b| b == b'\n') {
            Some(i) => (i + 1, true),
            None => (available.len(), false),
        };
        if total + used <= max {
            line.extend_from_slice(&available[..used]);
        } else if !line.is_empty() {
            line = Vec::new();
        }
        total += used;
        reader.consume(used);

        if done {
            return Ok(Some(if total > max {
                Line::TooLarge(total)
            } else {
                Line::Bytes(line)
            }));
        }
    }
}
