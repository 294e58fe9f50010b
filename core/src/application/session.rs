//! One forwarding session: a local listener bound to one pod port over one transport.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::domain::{Forwarding, Resolution, SessionId, SessionInfo, SessionState};
use crate::error::{Error, Result};
use crate::ports::UpgradedConnectionPort;
use crate::tunnel::{
    run_accept_loop, ConnectionContext, ConnectionCounters, LocalListener, PortForwardConnection,
    StreamMultiplexer,
};

/// A session owns its transport, its accept loop and every live connection.
///
/// State only moves forward: `Created -> Forwarding -> Stopped`.
pub struct Session {
    uid: Uuid,
    id: SessionId,
    resolution: Resolution,
    local_address: SocketAddr,
    state: Mutex<SessionState>,
    transport: Arc<PortForwardConnection>,
    shutdown: CancellationToken,
    connections: TaskTracker,
    counters: Arc<ConnectionCounters>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    /// Serialises concurrent `shutdown` calls.
    stop_lock: tokio::sync::Mutex<()>,
}

impl Session {
    pub fn new(
        id: SessionId,
        resolution: Resolution,
        transport: PortForwardConnection,
        local_address: SocketAddr,
    ) -> Self {
        Self {
            uid: Uuid::new_v4(),
            id,
            resolution,
            local_address,
            state: Mutex::new(SessionState::Created),
            transport: Arc::new(transport),
            shutdown: CancellationToken::new(),
            connections: TaskTracker::new(),
            counters: Arc::new(ConnectionCounters::default()),
            accept_task: Mutex::new(None),
            stop_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn uid(&self) -> Uuid {
        self.uid
    }

    pub fn resolution(&self) -> &Resolution {
        &self.resolution
    }

    pub fn local_address(&self) -> SocketAddr {
        self.local_address
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Start accepting on `listener`. Only valid once, from `Created`.
    pub fn begin_forwarding(
        &self,
        listener: LocalListener,
        target_port: u16,
        error_grace: Duration,
    ) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            SessionState::Created => {}
            SessionState::Forwarding => {
                return Err(Error::AlreadyExists(format!(
                    "session {} is already forwarding",
                    self.id
                )))
            }
            SessionState::Stopped => {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::Interrupted,
                    format!("session {} was stopped before forwarding began", self.id),
                )))
            }
        }

        let mux = Arc::new(StreamMultiplexer::new(
            Arc::clone(&self.transport),
            target_port,
        ));
        let ctx = ConnectionContext {
            shutdown: self.shutdown.clone(),
            tracker: self.connections.clone(),
            counters: Arc::clone(&self.counters),
            error_grace,
        };
        let span = info_span!("session", session = %self.id, local_addr = %self.local_address);
        let task = tokio::spawn(run_accept_loop(listener, mux, ctx).instrument(span));

        *self.accept_task.lock() = Some(task);
        *state = SessionState::Forwarding;
        Ok(())
    }

    /// Resolves to `true` if the transport went away on its own, or `false`
    /// once a shutdown has started.
    pub async fn transport_lost(&self) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => false,
            _ = self.transport.closed() => true,
        }
    }

    /// Stop accepting, end every connection and close the transport.
    ///
    /// Returns once all copy loops have exited. Calling it again, or
    /// concurrently, is a no-op.
    pub async fn shutdown(&self) {
        let _guard = self.stop_lock.lock().await;
        if self.state() == SessionState::Stopped {
            return;
        }

        self.shutdown.cancel();
        let accept_task = self.accept_task.lock().take();
        if let Some(task) = accept_task {
            if let Err(err) = task.await {
                warn!(session = %self.id, error = %err, "accept loop ended abnormally");
            }
        }

        self.connections.close();
        self.connections.wait().await;
        self.transport.close().await;

        *self.state.lock() = SessionState::Stopped;
        debug!(
            session = %self.id,
            connections = self.counters.total(),
            "session torn down"
        );
        info!(session = %self.id, pod = %self.resolution.pod.name, "port forward stopped");
    }

    /// Snapshot for callers.
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            uid: self.uid,
            id: self.id.clone(),
            target: self.resolution.target.name.clone(),
            kind: self.resolution.target.kind,
            pod_name: self.resolution.pod.name.clone(),
            local_address: self.local_address,
            state: self.state(),
            active_connections: self.counters.active(),
            total_connections: self.counters.total(),
        }
    }

    /// What `start` reports back to the caller.
    pub fn forwarding(&self) -> Forwarding {
        Forwarding {
            id: self.id.clone(),
            pod_name: self.resolution.pod.name.clone(),
            local_address: self.local_address,
        }
    }
}
