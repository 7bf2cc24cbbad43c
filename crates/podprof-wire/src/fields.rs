//! Typed field I/O over the agent socket.
//!
//! Every field is big-endian. Variable-length fields (strings, data
//! payloads) are 4-byte-length-prefixed and bounded by
//! [`consts::DATA_BUFFER_SIZE`]. Reads carry a per-operation deadline so a
//! stalled agent can never park a connection task forever; writes are
//! buffered and flushed explicitly by the protocol reader's flush policy.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use uuid::Uuid;

use crate::consts::{self, DATA_BUFFER_SIZE};
use crate::error::{WireError, WireResult};

/// Reads typed protocol fields from the agent socket.
///
/// Owns a reusable scratch buffer for variable-length fields; the slice
/// returned by [`FieldReader::read_field`] borrows it and is valid until
/// the next read.
pub struct FieldReader<R> {
    inner: R,
    scratch: Vec<u8>,
    read_timeout: Duration,
    bytes_read: u64,
}

impl<R: AsyncRead + Unpin> FieldReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_timeout(inner, consts::SOCKET_READ_TIMEOUT)
    }

    pub fn with_timeout(inner: R, read_timeout: Duration) -> Self {
        Self {
            inner,
            scratch: vec![0u8; DATA_BUFFER_SIZE],
            read_timeout,
            bytes_read: 0,
        }
    }

    /// Total bytes consumed from the socket.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn inner_ref(&self) -> &R {
        &self.inner
    }

    async fn fill(&mut self, n: usize) -> WireResult<()> {
        debug_assert!(n <= self.scratch.len());
        let deadline = self.read_timeout;
        match timeout(deadline, self.inner.read_exact(&mut self.scratch[..n])).await {
            Ok(Ok(_)) => {
                self.bytes_read += n as u64;
                Ok(())
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(WireError::Eof),
            Ok(Err(e)) => Err(WireError::Io(e)),
            Err(_) => Err(WireError::Timeout),
        }
    }

    pub async fn read_u8(&mut self) -> WireResult<u8> {
        self.fill(1).await?;
        Ok(self.scratch[0])
    }

    pub async fn read_i32(&mut self) -> WireResult<i32> {
        self.fill(4).await?;
        Ok(i32::from_be_bytes(self.scratch[..4].try_into().unwrap()))
    }

    pub async fn read_i64(&mut self) -> WireResult<i64> {
        self.fill(8).await?;
        Ok(i64::from_be_bytes(self.scratch[..8].try_into().unwrap()))
    }

    /// Reads a 16-byte UUID; the nil UUID decodes as `None` (null handle).
    pub async fn read_uuid(&mut self) -> WireResult<Option<Uuid>> {
        self.fill(16).await?;
        let uuid = Uuid::from_slice(&self.scratch[..16])
            .map_err(|e| WireError::Protocol(format!("bad uuid field: {e}")))?;
        Ok(if uuid.is_nil() { None } else { Some(uuid) })
    }

    /// Reads a length-prefixed field into the scratch buffer and returns it.
    pub async fn read_field(&mut self) -> WireResult<&[u8]> {
        let len = self.read_i32().await?;
        let len = usize::try_from(len)
            .map_err(|_| WireError::Protocol(format!("negative field length {len}")))?;
        if len > self.scratch.len() {
            return Err(WireError::FieldTooLong {
                len,
                max: self.scratch.len(),
            });
        }
        self.fill(len).await?;
        Ok(&self.scratch[..len])
    }

    /// Reads a length-prefixed UTF-8 string field.
    pub async fn read_string(&mut self) -> WireResult<String> {
        let bytes = self.read_field().await?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| WireError::Protocol(format!("non-utf8 string field: {e}")))
    }
}

/// Writes typed protocol fields into an internal buffer, flushed to the
/// socket on demand.
pub struct FieldWriter<W> {
    inner: W,
    buf: Vec<u8>,
    bytes_sent: u64,
}

impl<W: AsyncWrite + Unpin> FieldWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(DATA_BUFFER_SIZE),
            bytes_sent: 0,
        }
    }

    /// Total bytes handed to the socket by [`FieldWriter::flush`].
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// True when buffered output is waiting for a flush.
    pub fn has_pending(&self) -> bool {
        !self.buf.is_empty()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Writes a UUID as 16 raw bytes; `None` encodes as the nil UUID.
    pub fn write_uuid(&mut self, v: Option<Uuid>) {
        self.buf
            .extend_from_slice(v.unwrap_or(Uuid::nil()).as_bytes());
    }

    pub fn write_field(&mut self, bytes: &[u8]) {
        self.write_i32(bytes.len() as i32);
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_field(s.as_bytes());
    }

    /// Flushes buffered output to the socket.
    pub async fn flush(&mut self) -> WireResult<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        self.inner.write_all(&self.buf).await?;
        self.inner.flush().await?;
        self.bytes_sent += self.buf.len() as u64;
        self.buf.clear();
        Ok(())
    }

    /// Shuts the write side down, flushing pending output best-effort.
    pub async fn shutdown(&mut self) {
        let _ = self.flush().await;
        let _ = self.inner.shutdown().await;
    }
}
