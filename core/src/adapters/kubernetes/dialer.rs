//! Upgrade handshake against a pod's port-forward subresource.

use http::header::{CONNECTION, UPGRADE};
use http::{Method, Request, StatusCode};
use http_body_util::BodyExt;
use hyper_util::rt::TokioIo;
use kube::client::Body;
use serde::Deserialize;
use tracing::debug;

use super::KubeCluster;
use crate::domain::ResolvedPod;
use crate::error::{Error, Result};
use crate::ports::{UpgradeDialerPort, UpgradedIo};
use crate::spdy::SPDY_PROTOCOL;
use crate::tunnel::{PORT_FORWARD_PROTOCOL, STREAM_PROTOCOL_HEADER};

impl UpgradeDialerPort for KubeCluster {
    async fn dial(&self, pod: &ResolvedPod) -> Result<UpgradedIo> {
        let request = upgrade_request(pod)?;
        debug!(pod = %pod, "requesting port-forward upgrade");

        let response = self.client.send(request).await.map_err(|err| match err {
            kube::Error::Auth(err) => Error::Auth(err.to_string()),
            other => Error::Connect(other.to_string()),
        })?;

        let status = response.status();
        if status != StatusCode::SWITCHING_PROTOCOLS {
            let body = response
                .into_body()
                .collect()
                .await
                .map(|collected| collected.to_bytes())
                .unwrap_or_default();
            return Err(rejection(status, &body));
        }

        if let Some(protocol) = response.headers().get(STREAM_PROTOCOL_HEADER) {
            if protocol.as_bytes() != PORT_FORWARD_PROTOCOL.as_bytes() {
                return Err(Error::UpgradeRejected {
                    status: status.as_u16(),
                    message: format!(
                        "server negotiated unsupported protocol {:?}",
                        String::from_utf8_lossy(protocol.as_bytes())
                    ),
                });
            }
        }

        let upgraded = hyper::upgrade::on(response)
            .await
            .map_err(|e| Error::Connect(format!("connection upgrade failed: {}", e)))?;
        debug!(pod = %pod, "port-forward transport established");
        Ok(Box::new(TokioIo::new(upgraded)))
    }
}

/// `POST .../portforward` asking for a SPDY/3.1 upgrade.
pub(crate) fn upgrade_request(pod: &ResolvedPod) -> Result<Request<Body>> {
    Request::builder()
        .method(Method::POST)
        .uri(pod.portforward_path())
        .header(CONNECTION, "Upgrade")
        .header(UPGRADE, SPDY_PROTOCOL)
        .header(STREAM_PROTOCOL_HEADER, PORT_FORWARD_PROTOCOL)
        .body(Vec::new())
        .map(|request| request.map(Body::from))
        .map_err(|e| Error::validation(format!("invalid port-forward request for {}: {}", pod, e)))
}

#[derive(Deserialize)]
struct StatusBody {
    message: Option<String>,
}

/// Human-readable reason from an API error body.
pub(crate) fn status_message(body: &[u8]) -> Option<String> {
    if let Ok(status) = serde_json::from_slice::<StatusBody>(body) {
        return status.message.filter(|m| !m.is_empty());
    }
    let text = String::from_utf8_lossy(body).trim().to_string();
    (!text.is_empty()).then_some(text)
}

/// Map a non-101 answer to the error the caller sees.
pub(crate) fn rejection(status: StatusCode, body: &[u8]) -> Error {
    let message = status_message(body).unwrap_or_else(|| {
        status
            .canonical_reason()
            .unwrap_or("upgrade refused")
            .to_string()
    });
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Auth(message),
        _ => Error::UpgradeRejected {
            status: status.as_u16(),
            message,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_upgrade_request_headers() {
        let request = upgrade_request(&ResolvedPod::new("ns1", "web-abc123")).unwrap();
        assert_eq!(request.method(), Method::POST);
        assert_eq!(
            request.uri().path(),
            "/api/v1/namespaces/ns1/pods/web-abc123/portforward"
        );
        let headers = request.headers();
        assert_eq!(headers[CONNECTION], "Upgrade");
        assert_eq!(headers[UPGRADE], "SPDY/3.1");
        assert_eq!(headers["x-stream-protocol-version"], "portforward.k8s.io");
    }

    #[test]
    fn test_status_message() {
        let body = br#"{"kind":"Status","apiVersion":"v1","status":"Failure","message":"pods \"web\" not found","code":404}"#;
        assert_eq!(status_message(body).as_deref(), Some("pods \"web\" not found"));
        assert_eq!(status_message(b"  upgrade required\n").as_deref(), Some("upgrade required"));
        assert_eq!(status_message(b""), None);
    }

    #[test]
    fn test_rejection_mapping() {
        let err = rejection(StatusCode::FORBIDDEN, br#"{"message":"forbidden"}"#);
        assert_eq!(err.kind(), ErrorKind::Auth);
        assert!(err.to_string().contains("forbidden"));

        let err = rejection(StatusCode::UNAUTHORIZED, b"");
        assert_eq!(err.kind(), ErrorKind::Auth);

        match rejection(StatusCode::BAD_REQUEST, br#"{"message":"pod is terminating"}"#) {
            Error::UpgradeRejected { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "pod is terminating");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
