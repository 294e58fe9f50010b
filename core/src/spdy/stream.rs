//! A single SPDY stream exposed as an async byte stream.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio_util::sync::PollSender;

use super::connection::{Inbound, Outgoing, Shared};

/// Largest payload put into one DATA frame.
const MAX_DATA_CHUNK: usize = 32 * 1024;

/// One logical stream of a [`SpdyConnection`](super::SpdyConnection).
///
/// Reads yield the peer's DATA frames until its FIN. `shutdown` sends our
/// FIN. Dropping a stream that has not finished in both directions resets it.
pub struct SpdyStream {
    id: u32,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    pending: Bytes,
    /// Budget held by `pending`, returned once it is fully read.
    pending_permit: Option<OwnedSemaphorePermit>,
    read_done: bool,
    outbound: PollSender<Outgoing>,
    local_fin: bool,
    shared: Arc<Shared>,
}

impl fmt::Debug for SpdyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpdyStream")
            .field("id", &self.id)
            .field("read_done", &self.read_done)
            .field("local_fin", &self.local_fin)
            .finish_non_exhaustive()
    }
}

impl SpdyStream {
    pub(crate) fn new(
        id: u32,
        inbound: mpsc::UnboundedReceiver<Inbound>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            id,
            inbound,
            pending: Bytes::new(),
            pending_permit: None,
            read_done: false,
            outbound: PollSender::new(shared.frames()),
            local_fin: false,
            shared,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    fn closed_error() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "spdy connection closed")
    }
}

impl AsyncRead for SpdyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending[..n]);
                this.pending.advance(n);
                if this.pending.is_empty() {
                    this.pending_permit = None;
                }
                return Poll::Ready(Ok(()));
            }
            if this.read_done {
                return Poll::Ready(Ok(()));
            }

            match ready!(this.inbound.poll_recv(cx)) {
                Some(Inbound::Data(data, permit)) => {
                    this.pending = data;
                    this.pending_permit = Some(permit);
                }
                Some(Inbound::Reset(status)) => {
                    this.read_done = true;
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        format!("stream {} reset by peer (status {status})", this.id),
                    )));
                }
                Some(Inbound::Aborted) => {
                    this.read_done = true;
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "spdy connection closed",
                    )));
                }
                // Sender dropped on the peer's FIN.
                None => this.read_done = true,
            }
        }
    }
}

impl AsyncWrite for SpdyStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.local_fin {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write after shutdown",
            )));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        ready!(this.outbound.poll_reserve(cx)).map_err(|_| Self::closed_error())?;
        let n = buf.len().min(MAX_DATA_CHUNK);
        this.outbound
            .send_item(Outgoing::Data {
                stream_id: this.id,
                data: Bytes::copy_from_slice(&buf[..n]),
                fin: false,
            })
            .map_err(|_| Self::closed_error())?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // The connection writer flushes whenever its queues drain.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.local_fin {
            return Poll::Ready(Ok(()));
        }

        ready!(this.outbound.poll_reserve(cx)).map_err(|_| Self::closed_error())?;
        this.outbound
            .send_item(Outgoing::Data {
                stream_id: this.id,
                data: Bytes::new(),
                fin: true,
            })
            .map_err(|_| Self::closed_error())?;
        this.local_fin = true;
        Poll::Ready(Ok(()))
    }
}

impl Drop for SpdyStream {
    fn drop(&mut self) {
        self.shared.release_stream(self.id, self.local_fin);
    }
}
