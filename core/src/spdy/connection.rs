//! Multiplexed SPDY client connection.
//!
//! One reader task demultiplexes incoming frames into per-stream queues and
//! answers connection-level frames. One writer task owns the socket's write
//! half and the header compression context. Stream traffic flows through a
//! bounded queue for backpressure; PING replies, GOAWAY and overflow resets
//! use an unbounded priority queue.
//!
//! Inbound data is capped per stream at [`STREAM_BUFFER_BYTES`] unread
//! bytes. A stream at its cap stalls the reader, and with it the socket, so
//! a slow local client slows the pod down instead of growing memory. The
//! peer's flow-control windows are not used: the kubelet does not honour them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::frame::{rst_status, Frame, FrameCodec, FLAG_FIN};
use super::header::{HeaderDecoder, HeaderEncoder, Headers};
use super::stream::SpdyStream;
use super::SpdyError;

const MAX_STREAM_ID: u32 = 0x7FFF_FFFF;
const FRAME_QUEUE_DEPTH: usize = 64;

/// Unread inbound bytes a single stream may hold.
pub const STREAM_BUFFER_BYTES: usize = 256 * 1024;

/// Timeouts applied by a [`SpdyConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// How long `open_stream` waits for the peer's SYN_REPLY.
    pub reply_timeout: Duration,
    /// How long `close` may spend flushing GOAWAY before dropping the socket.
    pub close_grace: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(30),
            close_grace: Duration::from_secs(1),
        }
    }
}

pub(crate) enum Outgoing {
    SynStream { stream_id: u32, headers: Headers },
    Data { stream_id: u32, data: Bytes, fin: bool },
    RstStream { stream_id: u32, status: u32 },
    Ping { id: u32 },
    GoAway,
}

impl Outgoing {
    fn into_frame(self, encoder: &mut HeaderEncoder) -> Result<Frame, SpdyError> {
        let frame = match self {
            Outgoing::SynStream { stream_id, headers } => Frame::SynStream {
                stream_id,
                associated_stream_id: 0,
                priority: 0,
                flags: 0,
                header_block: encoder.encode(&headers)?,
            },
            Outgoing::Data {
                stream_id,
                data,
                fin,
            } => Frame::Data {
                stream_id,
                flags: if fin { FLAG_FIN } else { 0 },
                data,
            },
            Outgoing::RstStream { stream_id, status } => Frame::RstStream { stream_id, status },
            Outgoing::Ping { id } => Frame::Ping { id },
            Outgoing::GoAway => Frame::GoAway {
                last_good_stream_id: 0,
                status: 0,
            },
        };
        Ok(frame)
    }
}

pub(crate) enum Inbound {
    /// A payload and its share of the stream's buffer budget, returned when
    /// the reader has consumed it.
    Data(Bytes, OwnedSemaphorePermit),
    Reset(u32),
    Aborted,
}

struct StreamSlot {
    inbound: Option<mpsc::UnboundedSender<Inbound>>,
    budget: Arc<Semaphore>,
    reply: Option<oneshot::Sender<Result<Headers, SpdyError>>>,
    remote_fin: bool,
    reset: bool,
}

impl StreamSlot {
    fn new(
        inbound: mpsc::UnboundedSender<Inbound>,
        reply: oneshot::Sender<Result<Headers, SpdyError>>,
    ) -> Self {
        Self {
            inbound: Some(inbound),
            budget: Arc::new(Semaphore::new(STREAM_BUFFER_BYTES)),
            reply: Some(reply),
            remote_fin: false,
            reset: false,
        }
    }

    fn finish_remote(&mut self) {
        self.remote_fin = true;
        self.inbound = None;
    }

    fn fail(&mut self, reply_error: SpdyError, inbound: Inbound) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(Err(reply_error));
        }
        if let Some(sender) = self.inbound.take() {
            let _ = sender.send(inbound);
        }
        self.reset = true;
    }
}

/// Inbound DATA waiting for room in its stream's budget.
struct Delivery {
    inbound: mpsc::UnboundedSender<Inbound>,
    budget: Arc<Semaphore>,
    data: Bytes,
}

impl Delivery {
    /// Wait for budget, then queue the payload. Returns `false` if the
    /// connection closed first.
    async fn deliver(self, closed: &CancellationToken) -> bool {
        let cost = self.data.len().min(STREAM_BUFFER_BYTES) as u32;
        let permit = tokio::select! {
            _ = closed.cancelled() => return false,
            permit = self.budget.acquire_many_owned(cost) => permit,
        };
        if let Ok(permit) = permit {
            // A dropped receiver means nobody reads this stream anymore.
            let _ = self.inbound.send(Inbound::Data(self.data, permit));
        }
        true
    }
}

struct StreamTable {
    next_id: u32,
    slots: HashMap<u32, StreamSlot>,
}

pub(crate) struct Shared {
    table: Mutex<StreamTable>,
    frames_tx: mpsc::Sender<Outgoing>,
    control_tx: mpsc::UnboundedSender<Outgoing>,
    closed: CancellationToken,
    going_away: AtomicBool,
}

impl Shared {
    pub(crate) fn frames(&self) -> mpsc::Sender<Outgoing> {
        self.frames_tx.clone()
    }

    /// Forget a stream, resetting it unless both sides finished cleanly.
    pub(crate) fn release_stream(&self, stream_id: u32, local_fin: bool) {
        let Some(slot) = self.table.lock().slots.remove(&stream_id) else {
            return;
        };
        if slot.reset || self.closed.is_cancelled() || (local_fin && slot.remote_fin) {
            return;
        }

        trace!(stream_id, "cancelling unfinished stream");
        let rst = Outgoing::RstStream {
            stream_id,
            status: rst_status::CANCEL,
        };
        if let Err(err) = self.frames_tx.try_send(rst) {
            // Queue full: the reset may overtake pending data, which is fine
            // for a stream nobody reads anymore.
            let _ = self.control_tx.send(err.into_inner());
        }
    }

    /// Apply one inbound frame. DATA that still has to be queued is handed
    /// back, since waiting for budget must not happen under the table lock.
    fn dispatch(
        &self,
        frame: Frame,
        decoder: &mut HeaderDecoder,
    ) -> Result<Option<Delivery>, SpdyError> {
        match frame {
            Frame::Data {
                stream_id,
                flags,
                data,
            } => {
                let mut table = self.table.lock();
                let Some(slot) = table.slots.get_mut(&stream_id) else {
                    trace!(stream_id, "dropping data for unknown stream");
                    return Ok(None);
                };
                // Cloned before a FIN drops the slot's sender, so the payload
                // still lands ahead of the end of stream.
                let delivery = match &slot.inbound {
                    Some(inbound) if !data.is_empty() => Some(Delivery {
                        inbound: inbound.clone(),
                        budget: Arc::clone(&slot.budget),
                        data,
                    }),
                    _ => None,
                };
                if flags & FLAG_FIN != 0 {
                    slot.finish_remote();
                }
                return Ok(delivery);
            }
            Frame::SynReply {
                stream_id,
                flags,
                header_block,
            } => {
                let headers = decoder.decode(&header_block)?;
                let mut table = self.table.lock();
                if let Some(slot) = table.slots.get_mut(&stream_id) {
                    if let Some(reply) = slot.reply.take() {
                        let _ = reply.send(Ok(headers));
                    }
                    if flags & FLAG_FIN != 0 {
                        slot.finish_remote();
                    }
                }
            }
            Frame::Headers {
                stream_id,
                flags,
                header_block,
            } => {
                decoder.decode(&header_block)?;
                if flags & FLAG_FIN != 0 {
                    if let Some(slot) = self.table.lock().slots.get_mut(&stream_id) {
                        slot.finish_remote();
                    }
                }
            }
            Frame::RstStream { stream_id, status } => {
                debug!(stream_id, status, "stream reset by peer");
                if let Some(slot) = self.table.lock().slots.get_mut(&stream_id) {
                    slot.fail(SpdyError::Reset { stream_id, status }, Inbound::Reset(status));
                }
            }
            Frame::SynStream {
                stream_id,
                header_block,
                ..
            } => {
                // Port forwarding never accepts server-initiated streams, but
                // the block still has to go through the shared context.
                decoder.decode(&header_block)?;
                let _ = self.control_tx.send(Outgoing::RstStream {
                    stream_id,
                    status: rst_status::REFUSED_STREAM,
                });
            }
            Frame::Ping { id } => {
                let _ = self.control_tx.send(Outgoing::Ping { id });
            }
            Frame::GoAway {
                last_good_stream_id,
                status,
            } => {
                debug!(last_good_stream_id, status, "peer is going away");
                self.going_away.store(true, Ordering::Release);
            }
            Frame::Settings { .. } | Frame::WindowUpdate { .. } | Frame::Unknown { .. } => {}
        }
        Ok(None)
    }

    /// Stop both tasks and fail every open stream.
    fn terminate(&self) {
        self.closed.cancel();
        let mut table = self.table.lock();
        for slot in table.slots.values_mut() {
            slot.fail(SpdyError::Closed, Inbound::Aborted);
        }
    }
}

/// Client side of an upgraded SPDY/3.1 connection.
pub struct SpdyConnection {
    shared: Arc<Shared>,
    options: ConnectionOptions,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SpdyConnection {
    /// Take over an upgraded socket. Must be called inside a tokio runtime.
    pub fn new<T>(io: T, options: ConnectionOptions) -> Result<Self, SpdyError>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let encoder = HeaderEncoder::new()?;
        let (read_half, write_half) = tokio::io::split(io);
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            table: Mutex::new(StreamTable {
                next_id: 1,
                slots: HashMap::new(),
            }),
            frames_tx,
            control_tx,
            closed: CancellationToken::new(),
            going_away: AtomicBool::new(false),
        });

        let writer = tokio::spawn(write_loop(
            FramedWrite::new(write_half, FrameCodec),
            encoder,
            control_rx,
            frames_rx,
            Arc::clone(&shared),
            options.close_grace,
        ));
        let reader = tokio::spawn(read_loop(
            FramedRead::new(read_half, FrameCodec),
            Arc::clone(&shared),
        ));

        Ok(Self {
            shared,
            options,
            tasks: Mutex::new(vec![writer, reader]),
        })
    }

    /// Open a client stream with the given headers and wait for the reply.
    pub async fn open_stream(&self, headers: Headers) -> Result<SpdyStream, SpdyError> {
        let permit = tokio::select! {
            permit = self.shared.frames_tx.reserve() => permit.map_err(|_| SpdyError::Closed)?,
            _ = self.shared.closed.cancelled() => return Err(SpdyError::Closed),
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        // Ids must reach the wire in ascending order, so allocation and
        // enqueueing happen under the same lock.
        let stream_id = {
            let mut table = self.shared.table.lock();
            if self.shared.closed.is_cancelled() {
                return Err(SpdyError::Closed);
            }
            if self.shared.going_away.load(Ordering::Acquire) {
                return Err(SpdyError::GoingAway);
            }
            let stream_id = table.next_id;
            if stream_id > MAX_STREAM_ID {
                return Err(SpdyError::StreamIdsExhausted);
            }
            table.next_id += 2;
            table
                .slots
                .insert(stream_id, StreamSlot::new(inbound_tx, reply_tx));
            permit.send(Outgoing::SynStream { stream_id, headers });
            stream_id
        };

        let stream = SpdyStream::new(stream_id, inbound_rx, Arc::clone(&self.shared));
        match tokio::time::timeout(self.options.reply_timeout, reply_rx).await {
            Ok(Ok(Ok(_))) => {
                trace!(stream_id, "stream accepted");
                Ok(stream)
            }
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_)) => Err(SpdyError::Closed),
            Err(_) => Err(SpdyError::ReplyTimeout(stream_id)),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Resolves once the connection has shut down for any reason.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await
    }

    /// Send GOAWAY, fail all streams and wait for both tasks to exit.
    pub async fn close(&self) {
        if !self.shared.closed.is_cancelled() {
            let _ = self.shared.control_tx.send(Outgoing::GoAway);
        }
        self.shared.terminate();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
    }
}

impl Drop for SpdyConnection {
    fn drop(&mut self) {
        self.shared.terminate();
    }
}

async fn read_loop<R>(mut frames: FramedRead<R, FrameCodec>, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = HeaderDecoder::new();
    loop {
        let next = tokio::select! {
            _ = shared.closed.cancelled() => break,
            next = frames.next() => next,
        };
        match next {
            Some(Ok(frame)) => match shared.dispatch(frame, &mut decoder) {
                Ok(Some(delivery)) => {
                    if !delivery.deliver(&shared.closed).await {
                        break;
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %err, "protocol violation, closing transport");
                    break;
                }
            },
            Some(Err(err)) => {
                debug!(error = %err, "transport read failed");
                break;
            }
            None => {
                debug!("transport closed by peer");
                break;
            }
        }
    }
    shared.terminate();
}

async fn write_frames<W>(
    sink: &mut FramedWrite<W, FrameCodec>,
    encoder: &mut HeaderEncoder,
    control_rx: &mut mpsc::UnboundedReceiver<Outgoing>,
    frames_rx: &mut mpsc::Receiver<Outgoing>,
    closed: &CancellationToken,
) -> Result<(), SpdyError>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let outgoing = tokio::select! {
            biased;
            _ = closed.cancelled() => return Ok(()),
            Some(outgoing) = control_rx.recv() => outgoing,
            Some(outgoing) = frames_rx.recv() => outgoing,
            else => return Ok(()),
        };
        sink.feed(outgoing.into_frame(encoder)?).await?;
        if control_rx.is_empty() && frames_rx.is_empty() {
            sink.flush().await?;
        }
    }
}

async fn write_loop<W>(
    mut sink: FramedWrite<W, FrameCodec>,
    mut encoder: HeaderEncoder,
    mut control_rx: mpsc::UnboundedReceiver<Outgoing>,
    mut frames_rx: mpsc::Receiver<Outgoing>,
    shared: Arc<Shared>,
    close_grace: Duration,
) where
    W: AsyncWrite + Unpin,
{
    if let Err(err) = write_frames(
        &mut sink,
        &mut encoder,
        &mut control_rx,
        &mut frames_rx,
        &shared.closed,
    )
    .await
    {
        debug!(error = %err, "transport write failed");
    }
    shared.terminate();

    // Best effort: GOAWAY and resets queued before shutdown still go out.
    let drain = async {
        while let Ok(outgoing) = control_rx.try_recv() {
            if matches!(outgoing, Outgoing::GoAway | Outgoing::RstStream { .. }) {
                sink.feed(outgoing.into_frame(&mut encoder)?).await?;
            }
        }
        sink.close().await
    };
    if tokio::time::timeout(close_grace, drain).await.is_err() {
        debug!("gave up flushing transport on close");
    }
}
