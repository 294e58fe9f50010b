//! Kubernetes port-forward protocol on top of SPDY.
//!
//! Every forwarded connection uses two streams tagged with the same
//! `requestID`: an error stream that only the server writes to, opened
//! first and half-closed right away, and the data stream.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::Result;
use crate::ports::{StreamPair, UpgradedConnectionPort};
use crate::spdy::{ConnectionOptions, Headers, SpdyConnection};

/// Subprotocol negotiated during the upgrade.
pub const PORT_FORWARD_PROTOCOL: &str = "portforward.k8s.io";
/// Header carrying the subprotocol in the upgrade request and response.
pub const STREAM_PROTOCOL_HEADER: &str = "X-Stream-Protocol-Version";

pub const STREAM_TYPE_DATA: &str = "data";
pub const STREAM_TYPE_ERROR: &str = "error";

const HEADER_STREAM_TYPE: &str = "streamType";
const HEADER_PORT: &str = "port";
const HEADER_REQUEST_ID: &str = "requestID";

fn stream_headers(stream_type: &str, port: u16, request_id: u64) -> Headers {
    Headers::new()
        .with(HEADER_STREAM_TYPE, stream_type)
        .with(HEADER_PORT, port.to_string())
        .with(HEADER_REQUEST_ID, request_id.to_string())
}

/// An upgraded port-forward connection to one pod.
pub struct PortForwardConnection {
    spdy: SpdyConnection,
}

impl PortForwardConnection {
    /// Start the SPDY session over an upgraded socket.
    pub fn new<T>(io: T, options: ConnectionOptions) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Ok(Self {
            spdy: SpdyConnection::new(io, options)?,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.spdy.is_closed()
    }
}

impl UpgradedConnectionPort for PortForwardConnection {
    async fn open_stream(&self, request_id: u64, port: u16) -> Result<StreamPair> {
        let mut error = self
            .spdy
            .open_stream(stream_headers(STREAM_TYPE_ERROR, port, request_id))
            .await?;
        // Nothing is ever sent on the error stream.
        error.shutdown().await?;

        let data = self
            .spdy
            .open_stream(stream_headers(STREAM_TYPE_DATA, port, request_id))
            .await?;
        trace!(request_id, error_stream = error.id(), data_stream = data.id(), "stream pair open");

        Ok(StreamPair::new(data, error))
    }

    async fn close(&self) {
        self.spdy.close().await;
    }

    async fn closed(&self) {
        self.spdy.closed().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{self, FakeKubelet};
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_stream_headers() {
        let headers = stream_headers(STREAM_TYPE_ERROR, 8080, 7);
        assert_eq!(headers.get("streamtype"), Some("error"));
        assert_eq!(headers.get("port"), Some("8080"));
        assert_eq!(headers.get("requestid"), Some("7"));
    }

    #[tokio::test]
    async fn test_stream_pair_reaches_pod_port() {
        let backend = testkit::spawn_echo_server().await;
        let (client, server) = tokio::io::duplex(64 * 1024);
        let kubelet = FakeKubelet::new([(8080, backend)].into_iter().collect());
        tokio::spawn(kubelet.serve(server));

        let connection = PortForwardConnection::new(client, ConnectionOptions::default()).unwrap();
        let mut pair = connection.open_stream(0, 8080).await.unwrap();

        pair.data.write_all(b"hello pod").await.unwrap();
        let mut echoed = [0u8; 9];
        pair.data.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello pod");

        connection.close().await;
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn test_unserved_port_reports_on_error_stream() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(FakeKubelet::new(Default::default()).serve(server));

        let connection = PortForwardConnection::new(client, ConnectionOptions::default()).unwrap();
        let pair = connection.open_stream(0, 9999).await.unwrap();

        let message = pair.error.read_message().await.unwrap().unwrap();
        assert!(message.contains("9999"), "{message}");
    }
}
