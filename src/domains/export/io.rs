//! Writer adapters: byte counting, byte limits, and the renderer-to-store pipe.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};

use crate::errors::{ExportError, ExportResult};

/// Message carried by the validation error once the byte limit is hit.
pub const MAX_BYTES_EXCEEDED: &str = "max bytes exceeded";

/// Counts bytes accepted by the inner writer.
pub struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CountingWriter<W> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            this.written += *n as u64;
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Fails any write that would take the total past `limit` with
/// `ExportError::Validation("max bytes exceeded")` wrapped in an `io::Error`.
pub struct LimitedWriter<W> {
    inner: W,
    limit: u64,
    written: u64,
}

impl<W> LimitedWriter<W> {
    pub fn new(inner: W, limit: u64) -> Self {
        Self {
            inner,
            limit,
            written: 0,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for LimitedWriter<W> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.written + buf.len() as u64 > this.limit {
            return Poll::Ready(Err(ExportError::validation(MAX_BYTES_EXCEEDED).into_io()));
        }
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            this.written += *n as u64;
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[derive(Default)]
struct PipeState {
    error: Mutex<Option<ExportError>>,
}

impl PipeState {
    fn set(&self, err: ExportError) {
        let mut slot = self.error.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn get(&self) -> Option<ExportError> {
        self.error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Write end of [`pipe`], owned by the renderer.
pub struct PipeWriter {
    inner: Option<DuplexStream>,
    state: Arc<PipeState>,
}

/// Read end of [`pipe`], owned by the store uploader.
pub struct PipeReader {
    inner: DuplexStream,
    state: Arc<PipeState>,
}

/// Bounded single-producer/single-consumer byte pipe.
///
/// Closing the writer with an error makes the reader fail with that same
/// error once it has drained what was already written.
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (write_half, read_half) = tokio::io::duplex(capacity.max(1));
    let state = Arc::new(PipeState::default());
    (
        PipeWriter {
            inner: Some(write_half),
            state: state.clone(),
        },
        PipeReader {
            inner: read_half,
            state,
        },
    )
}

impl PipeWriter {
    /// Signals a clean EOF to the reader.
    pub async fn close(mut self) -> ExportResult<()> {
        if let Some(mut inner) = self.inner.take() {
            inner.shutdown().await?;
        }
        Ok(())
    }

    /// Fails the reader with `err`.
    pub fn close_with_error(mut self, err: ExportError) {
        self.state.set(err);
        self.inner.take();
    }

    fn closed_error() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "pipe writer closed")
    }
}

impl AsyncWrite for PipeWriter {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut().inner.as_mut() {
            Some(inner) => Pin::new(inner).poll_write(cx, buf),
            None => Poll::Ready(Err(Self::closed_error())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().inner.as_mut() {
            Some(inner) => Pin::new(inner).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().inner.as_mut() {
            Some(inner) => Pin::new(inner).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) if buf.filled().len() == before => match this.state.get() {
                Some(err) => Poll::Ready(Err(err.into_io())),
                None => Poll::Ready(Ok(())),
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn counting_writer_counts() {
        let mut out = CountingWriter::new(Vec::new());
        out.write_all(b"hello").await.unwrap();
        out.write_all(b" world").await.unwrap();
        assert_eq!(out.bytes_written(), 11);
        assert_eq!(out.into_inner(), b"hello world".to_vec());
    }

    #[tokio::test]
    async fn limited_writer_rejects_over_limit() {
        let mut out = LimitedWriter::new(Vec::new(), 1);
        let err = out.write_all(b"id,name\r\n").await.unwrap_err();
        let err: ExportError = err.into();
        assert_eq!(err, ExportError::Validation("max bytes exceeded".into()));
        assert_eq!(out.bytes_written(), 0);
    }

    #[tokio::test]
    async fn limited_writer_allows_exact_limit() {
        let mut out = LimitedWriter::new(Vec::new(), 4);
        out.write_all(b"abcd").await.unwrap();
        assert!(out.write_all(b"e").await.is_err());
    }

    #[tokio::test]
    async fn pipe_transfers_bytes_until_close() {
        let (mut writer, mut reader) = pipe(4);
        let read = tokio::spawn(async move {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).await.map(|_| buf)
        });
        writer.write_all(b"0123456789").await.unwrap();
        writer.close().await.unwrap();
        assert_eq!(read.await.unwrap().unwrap(), b"0123456789".to_vec());
    }

    #[tokio::test]
    async fn pipe_error_reaches_reader_with_same_kind() {
        let (mut writer, mut reader) = pipe(64);
        writer.write_all(b"partial").await.unwrap();
        writer.close_with_error(ExportError::deadline_exceeded());
        let mut buf = Vec::new();
        let err: ExportError = reader.read_to_end(&mut buf).await.unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(buf, b"partial".to_vec());
    }

    #[tokio::test]
    async fn writer_fails_when_reader_dropped() {
        let (mut writer, reader) = pipe(4);
        drop(reader);
        assert!(writer.write_all(b"0123456789").await.is_err());
    }
}
