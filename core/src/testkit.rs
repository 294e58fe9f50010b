//! In-memory cluster used by the tests.
//!
//! `FakeCluster` implements both cluster ports. Its dialer hands out duplex
//! pipes served by a `FakeKubelet`, which speaks SPDY port-forward and
//! proxies each data stream to a local TCP server.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::application::Session;
use crate::domain::{PodSummary, Resolution, ResolvedPod, SessionId, Target};
use crate::error::{Error, Result};
use crate::ports::{PodLookupPort, UpgradeDialerPort, UpgradedIo};
use crate::spdy::{
    ConnectionOptions, Frame, FrameCodec, HeaderDecoder, HeaderEncoder, Headers, FLAG_FIN,
};
use crate::tunnel::PortForwardConnection;

struct FakePod {
    namespace: String,
    name: String,
    ready: bool,
    labels: BTreeMap<String, String>,
}

#[derive(Default)]
struct ClusterState {
    pods: Vec<FakePod>,
    services: HashMap<(String, String), BTreeMap<String, String>>,
    backends: HashMap<(String, String), HashMap<u16, SocketAddr>>,
    dial_error: Option<fn() -> Error>,
    dial_delay: Option<Duration>,
    /// Cancelled to drop the server end of every pipe handed out so far.
    sever: CancellationToken,
}

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[derive(Default)]
pub(crate) struct FakeCluster {
    state: Mutex<ClusterState>,
    lookups: AtomicUsize,
    dials: AtomicUsize,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pod(&self, namespace: &str, name: &str, ready: bool, pod_labels: &[(&str, &str)]) {
        self.state.lock().pods.push(FakePod {
            namespace: namespace.to_string(),
            name: name.to_string(),
            ready,
            labels: labels(pod_labels),
        });
    }

    pub fn add_service(&self, namespace: &str, name: &str, selector: &[(&str, &str)]) {
        self.state
            .lock()
            .services
            .insert((namespace.to_string(), name.to_string()), labels(selector));
    }

    /// Route `pod:port` to a local TCP server.
    pub fn add_backend(&self, namespace: &str, pod: &str, port: u16, addr: SocketAddr) {
        self.state
            .lock()
            .backends
            .entry((namespace.to_string(), pod.to_string()))
            .or_default()
            .insert(port, addr);
    }

    /// Make every following dial fail with the error `make` builds.
    pub fn fail_dials(&self, make: fn() -> Error) {
        self.state.lock().dial_error = Some(make);
    }

    /// Slow every following dial down, to widen race windows.
    pub fn delay_dials(&self, delay: Duration) {
        self.state.lock().dial_delay = Some(delay);
    }

    /// Drop the server end of every connection dialed so far, as an API
    /// server restart would. Later dials are unaffected.
    pub fn sever_connections(&self) {
        let sever = std::mem::take(&mut self.state.lock().sever);
        sever.cancel();
    }

    /// Number of lookup calls served so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    /// Number of dial attempts so far, failed ones included.
    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    fn summary(pod: &FakePod) -> PodSummary {
        PodSummary {
            name: pod.name.clone(),
            namespace: pod.namespace.clone(),
            phase: Some("Running".to_string()),
            ready_condition: Some(pod.ready),
            containers_ready: vec![pod.ready],
            terminating: false,
        }
    }
}

impl PodLookupPort for FakeCluster {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<PodSummary>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        Ok(state
            .pods
            .iter()
            .find(|pod| pod.namespace == namespace && pod.name == name)
            .map(Self::summary))
    }

    async fn get_service_selector(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        Ok(state
            .services
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<PodSummary>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        Ok(state
            .pods
            .iter()
            .filter(|pod| pod.namespace == namespace)
            .filter(|pod| selector.iter().all(|(k, v)| pod.labels.get(k) == Some(v)))
            .map(Self::summary)
            .collect())
    }
}

impl UpgradeDialerPort for FakeCluster {
    async fn dial(&self, pod: &ResolvedPod) -> Result<UpgradedIo> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let (dial_error, dial_delay, backends, sever) = {
            let state = self.state.lock();
            let backends = state
                .backends
                .get(&(pod.namespace.clone(), pod.name.clone()))
                .cloned()
                .unwrap_or_default();
            (
                state.dial_error,
                state.dial_delay,
                backends,
                state.sever.clone(),
            )
        };
        if let Some(delay) = dial_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(make) = dial_error {
            return Err(make());
        }

        let (client, server) = tokio::io::duplex(256 * 1024);
        let kubelet = FakeKubelet::new(backends);
        tokio::spawn(async move {
            tokio::select! {
                _ = kubelet.serve(server) => {}
                _ = sever.cancelled() => {}
            }
        });
        Ok(Box::new(client))
    }
}

enum Reply {
    SynReply(u32),
    Frame(Frame),
}

fn data(stream_id: u32, payload: Bytes, fin: bool) -> Reply {
    Reply::Frame(Frame::Data {
        stream_id,
        flags: if fin { FLAG_FIN } else { 0 },
        data: payload,
    })
}

/// Server side of a port-forward connection.
pub(crate) struct FakeKubelet {
    backends: HashMap<u16, SocketAddr>,
}

impl FakeKubelet {
    pub fn new(backends: HashMap<u16, SocketAddr>) -> Self {
        Self { backends }
    }

    /// Serve one upgraded connection until the client goes away.
    pub async fn serve<T>(self, io: T)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let mut frames = FramedRead::new(read_half, FrameCodec);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Reply>();

        let writer = tokio::spawn(async move {
            let mut sink = FramedWrite::new(write_half, FrameCodec);
            let Ok(mut encoder) = HeaderEncoder::new() else {
                return;
            };
            while let Some(reply) = out_rx.recv().await {
                let frame = match reply {
                    Reply::SynReply(stream_id) => match encoder.encode(&Headers::new()) {
                        Ok(header_block) => Frame::SynReply {
                            stream_id,
                            flags: 0,
                            header_block,
                        },
                        Err(_) => return,
                    },
                    Reply::Frame(frame) => frame,
                };
                if sink.send(frame).await.is_err() {
                    return;
                }
            }
        });

        let mut decoder = HeaderDecoder::new();
        let mut error_streams: HashMap<String, u32> = HashMap::new();
        let mut upstreams: HashMap<u32, mpsc::UnboundedSender<Bytes>> = HashMap::new();
        let mut proxies = JoinSet::new();

        while let Some(Ok(frame)) = frames.next().await {
            match frame {
                Frame::SynStream {
                    stream_id,
                    header_block,
                    ..
                } => {
                    let Ok(headers) = decoder.decode(&header_block) else {
                        break;
                    };
                    let _ = out_tx.send(Reply::SynReply(stream_id));
                    let request_id = headers.get("requestid").unwrap_or_default().to_string();
                    let port: u16 = headers
                        .get("port")
                        .and_then(|p| p.parse().ok())
                        .unwrap_or_default();

                    match headers.get("streamtype") {
                        Some("error") => {
                            error_streams.insert(request_id, stream_id);
                        }
                        Some("data") => {
                            let error_id = error_streams.remove(&request_id);
                            let (up_tx, up_rx) = mpsc::unbounded_channel();
                            upstreams.insert(stream_id, up_tx);
                            proxies.spawn(proxy(
                                self.backends.get(&port).copied(),
                                port,
                                stream_id,
                                error_id,
                                up_rx,
                                out_tx.clone(),
                            ));
                        }
                        _ => {}
                    }
                }
                Frame::Data {
                    stream_id,
                    flags,
                    data,
                } => {
                    if let Some(upstream) = upstreams.get(&stream_id) {
                        if !data.is_empty() {
                            let _ = upstream.send(data);
                        }
                    }
                    if flags & FLAG_FIN != 0 {
                        upstreams.remove(&stream_id);
                    }
                }
                Frame::RstStream { stream_id, .. } => {
                    upstreams.remove(&stream_id);
                }
                Frame::Ping { id } => {
                    let _ = out_tx.send(Reply::Frame(Frame::Ping { id }));
                }
                Frame::GoAway { .. } => break,
                _ => {}
            }
        }

        proxies.shutdown().await;
        drop(out_tx);
        let _ = writer.await;
    }
}

/// Bridge one data stream to its backend, reporting failures on the error stream.
async fn proxy(
    backend: Option<SocketAddr>,
    port: u16,
    data_id: u32,
    error_id: Option<u32>,
    mut upstream: mpsc::UnboundedReceiver<Bytes>,
    out: mpsc::UnboundedSender<Reply>,
) {
    let finish = |message: Option<String>| {
        if let Some(error_id) = error_id {
            let payload = message.map(Bytes::from).unwrap_or_default();
            let _ = out.send(data(error_id, payload, true));
        }
        let _ = out.send(data(data_id, Bytes::new(), true));
    };

    let socket = match backend {
        Some(addr) => TcpStream::connect(addr).await.ok(),
        None => None,
    };
    let Some(socket) = socket else {
        finish(Some(format!(
            "error forwarding port {port} to pod fake: dial tcp4 127.0.0.1:{port}: connect: connection refused"
        )));
        return;
    };

    let (mut read, mut write) = socket.into_split();
    let pump_up = async move {
        while let Some(chunk) = upstream.recv().await {
            if write.write_all(&chunk).await.is_err() {
                return;
            }
        }
        let _ = write.shutdown().await;
    };
    let pump_down = async {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            match read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let chunk = Bytes::copy_from_slice(&buf[..n]);
                    if out.send(data(data_id, chunk, false)).is_err() {
                        return;
                    }
                }
            }
        }
        finish(None);
    };
    tokio::join!(pump_up, pump_down);
}

/// A TCP server that echoes every byte back.
pub(crate) async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut read, mut write) = socket.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    addr
}

/// A minimal HTTP server answering every request with `200 OK` and `body`.
pub(crate) async fn spawn_http_server(body: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

/// Send `GET /` to a local port and return the raw response.
pub(crate) async fn http_get(port: u16) -> std::io::Result<String> {
    let mut socket = TcpStream::connect(("127.0.0.1", port)).await?;
    socket
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await?;
    let mut response = Vec::new();
    socket.read_to_end(&mut response).await?;
    Ok(String::from_utf8_lossy(&response).into_owned())
}

/// A session over a live but unused transport, never started.
pub(crate) async fn idle_session(id: SessionId) -> Arc<Session> {
    let (client, server) = tokio::io::duplex(64 * 1024);
    tokio::spawn(FakeKubelet::new(HashMap::new()).serve(server));
    let transport = PortForwardConnection::new(client, ConnectionOptions::default()).unwrap();
    let resolution = Resolution {
        target: Target::pod(&id.namespace, &id.name),
        pod: ResolvedPod::new(&id.namespace, &id.name),
    };
    Arc::new(Session::new(
        id,
        resolution,
        transport,
        "127.0.0.1:0".parse().unwrap(),
    ))
}
