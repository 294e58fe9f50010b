//! Upgraded transport port (interface) and its stream handles.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use super::AsyncStream;
use crate::error::Result;

/// Longest error-stream message kept for diagnostics.
const MAX_ERROR_MESSAGE: u64 = 64 * 1024;

/// A multiplexed transport that can carry many stream pairs.
pub trait UpgradedConnectionPort: Send + Sync + 'static {
    /// Open the data and error streams for one forwarded connection.
    fn open_stream(
        &self,
        request_id: u64,
        port: u16,
    ) -> impl std::future::Future<Output = Result<StreamPair>> + Send;

    /// Tear down the transport and every stream on it.
    fn close(&self) -> impl std::future::Future<Output = ()> + Send;

    /// Resolves once the transport is gone, whether closed locally or lost.
    fn closed(&self) -> impl std::future::Future<Output = ()> + Send;
}

/// Payload channel of a stream pair.
pub struct DataStream {
    inner: Box<dyn AsyncStream>,
}

impl DataStream {
    pub fn new(inner: impl AsyncStream + 'static) -> Self {
        Self {
            inner: Box::new(inner),
        }
    }
}

impl AsyncRead for DataStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for DataStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_shutdown(cx)
    }
}

/// Diagnostics channel of a stream pair. The remote side writes to it only
/// when forwarding failed.
pub struct ErrorStream {
    inner: Box<dyn AsyncRead + Send + Unpin>,
}

impl ErrorStream {
    pub fn new(inner: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            inner: Box::new(inner),
        }
    }

    /// Read until the remote closes the stream.
    ///
    /// Returns `None` when it closed without saying anything.
    pub async fn read_message(self) -> io::Result<Option<String>> {
        let mut raw = Vec::new();
        self.inner
            .take(MAX_ERROR_MESSAGE)
            .read_to_end(&mut raw)
            .await?;
        let message = String::from_utf8_lossy(&raw).trim().to_string();
        Ok((!message.is_empty()).then_some(message))
    }
}

/// The two streams opened for one forwarded local connection.
pub struct StreamPair {
    pub data: DataStream,
    pub error: ErrorStream,
}

impl StreamPair {
    pub fn new(
        data: impl AsyncStream + 'static,
        error: impl AsyncRead + Send + Unpin + 'static,
    ) -> Self {
        Self {
            data: DataStream::new(data),
            error: ErrorStream::new(error),
        }
    }
}
