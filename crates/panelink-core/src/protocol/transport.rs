//! Byte transport
//!
//! Splits one bidirectional byte stream (a serial port, or anything else that
//! is `AsyncRead + AsyncWrite`) into a read half owned by the read loop and a
//! write half shared by request senders.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{ProtocolError, Result};

/// Size of the scratch buffer used for a single read poll
const READ_BUF_SIZE: usize = 256;

/// Read half of a byte transport
pub struct ByteReader {
    inner: Box<dyn AsyncRead + Send + Unpin>,
}

/// Write half of a byte transport
pub struct ByteWriter {
    inner: Box<dyn AsyncWrite + Send + Unpin>,
    chunk_size: usize,
}

/// Split a byte stream into independent read and write halves
pub fn split<T>(stream: T, chunk_size: usize) -> (ByteReader, ByteWriter)
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (rd, wr) = tokio::io::split(stream);
    (ByteReader::new(rd), ByteWriter::new(wr, chunk_size))
}

impl ByteReader {
    pub fn new(inner: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            inner: Box::new(inner),
        }
    }

    /// Return whatever bytes arrive within `wait`.
    ///
    /// An empty vector means nothing was available. End of stream is reported
    /// as [`ProtocolError::LinkBroken`] since a serial link never legitimately
    /// reaches EOF.
    pub async fn read_available(&mut self, wait: Duration) -> Result<Vec<u8>> {
        let mut buf = [0u8; READ_BUF_SIZE];
        match tokio::time::timeout(wait, self.inner.read(&mut buf)).await {
            Err(_) => Ok(Vec::new()),
            Ok(Ok(0)) => Err(ProtocolError::LinkBroken(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "transport closed",
            ))),
            Ok(Ok(n)) => Ok(buf[..n].to_vec()),
            Ok(Err(e)) if e.kind() == io::ErrorKind::TimedOut => Ok(Vec::new()),
            Ok(Err(e)) => Err(ProtocolError::LinkBroken(e)),
        }
    }
}

impl ByteWriter {
    pub fn new(inner: impl AsyncWrite + Send + Unpin + 'static, chunk_size: usize) -> Self {
        Self {
            inner: Box::new(inner),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Write all of `data` in bounded chunks, yielding between chunks so the
    /// read loop and other tasks keep running during long frames.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<usize> {
        for chunk in data.chunks(self.chunk_size) {
            self.inner.write_all(chunk).await?;
            tokio::task::yield_now().await;
        }
        self.inner.flush().await?;
        Ok(data.len())
    }

    /// Flush and shut down the write direction
    pub async fn close(mut self) {
        if let Err(e) = self.inner.shutdown().await {
            tracing::debug!(error = %e, "transport shutdown failed");
        }
    }
}
