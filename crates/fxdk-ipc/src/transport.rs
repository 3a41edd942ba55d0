//! Line transport abstractions for the IPC channel
//!
//! Provides AsyncReader/AsyncWriter traits over newline-delimited frames, implemented for any
//! tokio byte stream (local sockets in production, in-memory duplex pipes in tests).

use async_trait::async_trait;
use fxdk_core::{FxdkError, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// Trait for async reading from a transport
#[async_trait]
pub trait AsyncReader: Send {
    /// Read the next frame without its line terminator.
    /// Returns `None` once the peer has closed the stream.
    async fn read_message(&mut self) -> Result<Option<String>>;
}

/// Trait for async writing to a transport
#[async_trait]
pub trait AsyncWriter: Send {
    /// Write one complete, already terminated frame
    async fn write_message(&mut self, data: &[u8]) -> Result<()>;
}

/// Newline-delimited reader over any async byte stream
pub struct LineReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin + Send> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            buf: Vec::new(),
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> AsyncReader for LineReader<R> {
    async fn read_message(&mut self) -> Result<Option<String>> {
        self.buf.clear();
        let n = self
            .inner
            .read_until(b'\n', &mut self.buf)
            .await
            .map_err(|e| FxdkError::IpcError(format!("Read failed: {}", e)))?;

        if n == 0 {
            return Ok(None);
        }

        // Invalid UTF-8 is left for the JSON parser to reject so the connection survives.
        let line = String::from_utf8_lossy(&self.buf);
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    }
}

/// Writer for pre-framed lines over any async byte stream
pub struct LineWriter<W>(pub W);

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> AsyncWriter for LineWriter<W> {
    async fn write_message(&mut self, data: &[u8]) -> Result<()> {
        self.0
            .write_all(data)
            .await
            .map_err(|e| FxdkError::IpcError(format!("Write failed: {}", e)))?;

        // Flush to ensure data is sent
        self.0
            .flush()
            .await
            .map_err(|e| FxdkError::IpcError(format!("Flush failed: {}", e)))?;

        Ok(())
    }
}
