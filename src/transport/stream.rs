//! Termination-aware byte channel shared by the serial and TCP transports
//!
//! Both media are plain byte streams without message framing, so responses
//! are delimited by the read terminator. Bytes received past a terminator are
//! kept in a pending buffer and handed out by the next read.

use std::io;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use super::find_subsequence;
use crate::error::{VisaError, VisaResult};

const READ_CHUNK: usize = 4096;

/// Async byte stream that can back a [`StreamChannel`].
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {
    /// Drop whatever the OS has buffered in either direction.
    fn discard_buffers(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ByteStream for tokio::net::TcpStream {}

impl ByteStream for tokio::io::DuplexStream {}

#[cfg(feature = "instrument_serial")]
impl ByteStream for tokio_serial::SerialStream {
    fn discard_buffers(&mut self) -> io::Result<()> {
        use tokio_serial::SerialPort;
        self.clear(tokio_serial::ClearBuffer::All)
            .map_err(io::Error::from)
    }
}

/// Byte stream plus the bytes received but not yet consumed.
#[derive(Default)]
pub struct StreamChannel {
    stream: Option<Box<dyn ByteStream>>,
    pending: BytesMut,
}

impl StreamChannel {
    /// Channel with no stream attached.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an opened stream, dropping any pending bytes.
    pub fn attach(&mut self, stream: Box<dyn ByteStream>) {
        self.pending.clear();
        self.stream = Some(stream);
    }

    /// Take the stream out of the channel.
    pub fn detach(&mut self) -> Option<Box<dyn ByteStream>> {
        self.pending.clear();
        self.stream.take()
    }

    /// Whether a stream is attached.
    pub fn is_attached(&self) -> bool {
        self.stream.is_some()
    }

    /// Bytes read but not yet consumed.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Shut the stream down, logging rather than returning failures.
    pub async fn shutdown(&mut self) {
        if let Some(mut stream) = self.detach() {
            if let Err(e) = stream.shutdown().await {
                debug!(error = %e, "Stream shutdown reported an error");
            }
        }
    }

    /// Write all of `data` and flush.
    pub async fn write_all(&mut self, data: &[u8]) -> VisaResult<usize> {
        let stream = self.stream.as_mut().ok_or(VisaError::NotOpen)?;
        trace!(bytes = data.len(), data = ?String::from_utf8_lossy(data), "TX");
        stream.write_all(data).await?;
        stream.flush().await?;
        Ok(data.len())
    }

    /// Read once from the stream into the pending buffer.
    async fn fill(&mut self) -> VisaResult<usize> {
        let stream = self.stream.as_mut().ok_or(VisaError::NotOpen)?;
        let mut buf = [0u8; READ_CHUNK];
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(VisaError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by peer",
            )));
        }
        trace!(bytes = n, data = ?String::from_utf8_lossy(&buf[..n]), "RX");
        self.pending.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    /// Bytes up to (not including) the next `terminator`.
    pub async fn read_until(&mut self, terminator: &[u8]) -> VisaResult<Vec<u8>> {
        loop {
            if let Some(pos) = find_subsequence(&self.pending, terminator) {
                let mut message = self.pending.split_to(pos + terminator.len());
                message.truncate(pos);
                return Ok(message.to_vec());
            }
            self.fill().await?;
        }
    }

    /// Whatever is available, up to `max_size` bytes, waiting for at least one.
    pub async fn read_some(&mut self, max_size: Option<usize>) -> VisaResult<Vec<u8>> {
        if self.pending.is_empty() {
            self.fill().await?;
        }
        let n = max_size.unwrap_or(self.pending.len()).min(self.pending.len());
        Ok(self.pending.split_to(n).to_vec())
    }

    /// Exactly `count` bytes.
    pub async fn read_exact(&mut self, count: usize) -> VisaResult<Vec<u8>> {
        while self.pending.len() < count {
            self.fill().await?;
        }
        Ok(self.pending.split_to(count).to_vec())
    }

    /// Drop pending bytes and the OS buffers.
    pub fn discard(&mut self) -> VisaResult<()> {
        self.pending.clear();
        if let Some(stream) = self.stream.as_mut() {
            stream.discard_buffers()?;
        }
        Ok(())
    }
}
