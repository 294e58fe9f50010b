//! Per-connection stream allocation over a session's single transport.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::ports::{DataStream, ErrorStream, UpgradedConnectionPort};

/// Streams handed to the copy loops of one local connection.
pub struct ForwardStreams {
    pub request_id: u64,
    pub data: DataStream,
    pub error: ErrorStream,
}

/// Opens a fresh stream pair for every accepted local connection.
///
/// Request ids start at 0 and are never reused while the multiplexer lives,
/// including ids whose open failed.
pub struct StreamMultiplexer<C> {
    connection: Arc<C>,
    target_port: u16,
    next_request_id: AtomicU64,
}

impl<C: UpgradedConnectionPort> StreamMultiplexer<C> {
    pub fn new(connection: Arc<C>, target_port: u16) -> Self {
        Self {
            connection,
            target_port,
            next_request_id: AtomicU64::new(0),
        }
    }

    pub fn target_port(&self) -> u16 {
        self.target_port
    }

    /// Resolves once the underlying transport is gone.
    pub async fn transport_closed(&self) {
        self.connection.closed().await
    }

    /// Allocate a request id and open its stream pair.
    pub async fn open(&self) -> Result<ForwardStreams> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let pair = self
            .connection
            .open_stream(request_id, self.target_port)
            .await?;
        Ok(ForwardStreams {
            request_id,
            data: pair.data,
            error: pair.error,
        })
    }
}
