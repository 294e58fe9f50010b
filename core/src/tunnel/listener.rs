//! Local listener, accept loop and per-connection copy loops.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, debug_span, warn, Instrument};

use super::multiplexer::{ForwardStreams, StreamMultiplexer};
use crate::error::{Error, Result};
use crate::ports::UpgradedConnectionPort;

/// Pause after a failed `accept` (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// A bound local TCP listener.
pub struct LocalListener {
    inner: TcpListener,
    local_addr: SocketAddr,
}

impl LocalListener {
    /// Bind `addr`. Port 0 picks a free port; see [`local_addr`](Self::local_addr).
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let inner = TcpListener::bind(addr).await.map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("failed to bind {addr}: {e}"),
            ))
        })?;
        let local_addr = inner.local_addr()?;
        Ok(Self { inner, local_addr })
    }

    /// The address actually bound, with the OS-assigned port.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Connection counters of one session.
#[derive(Debug, Default)]
pub(crate) struct ConnectionCounters {
    active: AtomicU64,
    total: AtomicU64,
}

impl ConnectionCounters {
    fn opened(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    fn closed(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    pub(crate) fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

/// Session-wide state shared by the accept loop and its connections.
#[derive(Clone)]
pub(crate) struct ConnectionContext {
    pub shutdown: CancellationToken,
    pub tracker: TaskTracker,
    pub counters: Arc<ConnectionCounters>,
    /// How long to wait for an error-stream message after the data ends.
    pub error_grace: Duration,
}

/// Accept until shutdown or transport loss, forwarding each connection over
/// its own stream pair.
///
/// The listener is dropped, and the port released, when this returns.
pub(crate) async fn run_accept_loop<C>(
    listener: LocalListener,
    mux: Arc<StreamMultiplexer<C>>,
    ctx: ConnectionContext,
) where
    C: UpgradedConnectionPort,
{
    debug!(local_addr = %listener.local_addr, "accepting connections");
    loop {
        let (socket, peer) = tokio::select! {
            biased;
            _ = ctx.shutdown.cancelled() => break,
            _ = mux.transport_closed() => {
                warn!("lost connection to pod, no longer accepting");
                break;
            }
            accepted = listener.inner.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
        };

        let opened = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            opened = mux.open() => opened,
        };
        let streams = match opened {
            Ok(streams) => streams,
            Err(err) => {
                // Only this client is affected; keep accepting.
                warn!(%peer, error = %err, "failed to open streams, closing local connection");
                drop(socket);
                continue;
            }
        };

        let span = debug_span!("connection", request_id = streams.request_id, %peer);
        let port = mux.target_port();
        let ctx = ctx.clone();
        ctx.counters.opened();
        ctx.tracker.clone().spawn(
            async move {
                match forward_connection(
                    socket,
                    streams,
                    port,
                    ctx.shutdown.clone(),
                    ctx.error_grace,
                )
                .await
                {
                    Ok(transfer) => debug!(
                        sent = transfer.sent,
                        received = transfer.received,
                        "connection closed"
                    ),
                    Err(err @ Error::RemoteRefused { .. }) => warn!(error = %err, "pod refused connection"),
                    Err(err) => debug!(error = %err, "connection failed"),
                }
                ctx.counters.closed();
            }
            .instrument(span),
        );
    }
    debug!(local_addr = %listener.local_addr, "accept loop stopped");
}

/// Bytes moved by one forwarded connection, as far as they are known.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Transfer {
    pub sent: u64,
    pub received: u64,
}

enum Leg {
    Upstream(std::io::Result<u64>),
    Downstream(std::io::Result<u64>),
    Refused(String),
    Stopped,
}

/// Pump bytes between a local socket and its stream pair.
///
/// The first leg to finish, an error-stream message or shutdown ends the
/// whole connection: half-closes are not carried through. After a data leg
/// ends, the error stream gets `error_grace` to explain why.
pub(crate) async fn forward_connection(
    local: TcpStream,
    streams: ForwardStreams,
    port: u16,
    shutdown: CancellationToken,
    error_grace: Duration,
) -> Result<Transfer> {
    let ForwardStreams { data, error, .. } = streams;
    let remote_error = error.read_message();
    tokio::pin!(remote_error);

    let (mut local_read, mut local_write) = local.into_split();
    let (mut remote_read, mut remote_write) = tokio::io::split(data);

    let upstream = async {
        let copied = tokio::io::copy(&mut local_read, &mut remote_write).await;
        let _ = remote_write.shutdown().await;
        copied
    };
    let downstream = tokio::io::copy(&mut remote_read, &mut local_write);
    tokio::pin!(upstream, downstream);

    let mut error_done = false;
    let leg = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break Leg::Stopped,
            copied = &mut upstream => break Leg::Upstream(copied),
            copied = &mut downstream => break Leg::Downstream(copied),
            message = &mut remote_error, if !error_done => {
                error_done = true;
                match message {
                    Ok(Some(message)) => break Leg::Refused(message),
                    Ok(None) => {}
                    Err(err) => debug!(error = %err, "error stream failed"),
                }
            }
        }
    };

    let mut refusal = match &leg {
        Leg::Refused(message) => Some(message.clone()),
        _ => None,
    };
    if refusal.is_none() && !error_done && !matches!(leg, Leg::Stopped) {
        if let Ok(Ok(Some(message))) = tokio::time::timeout(error_grace, &mut remote_error).await {
            refusal = Some(message);
        }
    }
    if let Some(message) = refusal {
        return Err(Error::RemoteRefused { port, message });
    }

    let mut transfer = Transfer::default();
    match leg {
        Leg::Upstream(copied) => transfer.sent = copied?,
        Leg::Downstream(copied) => transfer.received = copied?,
        Leg::Refused(_) | Leg::Stopped => {}
    }
    Ok(transfer)
}
