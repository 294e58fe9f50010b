//! Lifecycle controller: starting and stopping port-forward sessions.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::application::Session;
use crate::config::TunnelSettings;
use crate::domain::{ForwardRequest, Forwarding, Resolution, SessionId, SessionInfo, SessionState};
use crate::error::Result;
use crate::ports::{PodLookupPort, UpgradeDialerPort, UpgradedConnectionPort};
use crate::registry::SessionRegistry;
use crate::tunnel::{LocalListener, PortForwardConnection, TargetResolver};

/// Application service that owns the session registry.
///
/// The cluster is passed per call, since each request may name its own
/// kubeconfig and context.
pub struct Forwarder {
    registry: Arc<SessionRegistry>,
    settings: TunnelSettings,
}

impl Forwarder {
    pub fn new(registry: Arc<SessionRegistry>, settings: TunnelSettings) -> Self {
        Self { registry, settings }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Resolve a target without starting anything.
    pub async fn resolve<L: PodLookupPort>(
        &self,
        cluster: &L,
        namespace: &str,
        name: &str,
    ) -> Result<Resolution> {
        TargetResolver::new(cluster).resolve(namespace, name).await
    }

    /// Start forwarding `request` and return once the listener accepts.
    ///
    /// On error nothing is left behind: no registry entry, no bound
    /// listener and no open transport.
    pub async fn start<B>(&self, cluster: &B, request: &ForwardRequest) -> Result<Forwarding>
    where
        B: PodLookupPort + UpgradeDialerPort,
    {
        let bind_address = request.validate()?;
        let requested = request.requested_id();
        self.registry.ensure_available(&requested)?;

        let resolution = self
            .resolve(cluster, &request.namespace, &request.target)
            .await?;
        let id = SessionId::new(
            &request.namespace,
            &resolution.pod.name,
            request.target_port,
        );
        let reservation = self.registry.reserve(id.clone(), Some(requested))?;

        let io = cluster.dial(&resolution.pod).await?;
        let transport = PortForwardConnection::new(io, self.settings.connection_options())?;

        let listener = match LocalListener::bind(bind_address).await {
            Ok(listener) => listener,
            Err(err) => {
                transport.close().await;
                return Err(err);
            }
        };

        let session = Arc::new(Session::new(
            id,
            resolution,
            transport,
            listener.local_addr(),
        ));
        reservation.commit(Arc::clone(&session));

        if let Err(err) = session.begin_forwarding(
            listener,
            request.target_port,
            self.settings.error_stream_grace,
        ) {
            // A concurrent stop got here first.
            self.registry.remove_session(&session);
            session.shutdown().await;
            return Err(err);
        }

        info!(
            session = %session.id(),
            target = %session.resolution().target,
            local_addr = %session.local_address(),
            "port forward started"
        );
        self.watch(Arc::clone(&session));
        Ok(session.forwarding())
    }

    /// Tear a session down and unregister it if its transport is lost, so
    /// the port is released and a later `start` dials again.
    fn watch(&self, session: Arc<Session>) {
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            if !session.transport_lost().await {
                return;
            }
            warn!(
                session = %session.id(),
                pod = %session.resolution().pod.name,
                "lost connection to pod"
            );
            session.shutdown().await;
            registry.remove_session(&session);
        });
    }

    /// Stop the session registered as `id`, or started under that target id.
    ///
    /// Returns whether a session was stopped. Unknown ids are a no-op.
    pub async fn stop(&self, id: &SessionId) -> bool {
        let Some(session) = self.registry.lookup(id) else {
            debug!(session = %id, "no session to stop");
            return false;
        };
        session.shutdown().await;
        self.registry.remove_session(&session);
        true
    }

    /// Stop every registered session. Returns how many were stopped.
    pub async fn stop_all(&self) -> usize {
        let sessions = self.registry.active_sessions();
        join_all(sessions.iter().map(|session| session.shutdown())).await;
        sessions
            .iter()
            .filter(|session| self.registry.remove_session(session))
            .count()
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.registry.sessions()
    }

    /// Whether `id` names a session that is currently forwarding.
    pub fn is_forwarding(&self, id: &SessionId) -> bool {
        self.registry
            .lookup(id)
            .is_some_and(|session| session.state() == SessionState::Forwarding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TargetKind;
    use crate::error::{Error, ErrorKind};
    use crate::testkit::{self, FakeCluster};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn forwarder() -> Forwarder {
        let settings = TunnelSettings {
            error_stream_grace: Duration::from_millis(200),
            ..Default::default()
        };
        Forwarder::new(Arc::new(SessionRegistry::new()), settings)
    }

    fn request(target: &str, port: u16) -> ForwardRequest {
        ForwardRequest::new("ns1", target, "127.0.0.1:0", port)
    }

    /// ns1 with an HTTP pod behind service `web` and an echo pod `echo-0`.
    async fn cluster() -> FakeCluster {
        let cluster = FakeCluster::new();
        cluster.add_pod("ns1", "web-abc123", true, &[("app", "web")]);
        cluster.add_pod("ns1", "web-old", false, &[("app", "web")]);
        cluster.add_service("ns1", "web", &[("app", "web")]);
        cluster.add_backend("ns1", "web-abc123", 8080, testkit::spawn_http_server("ok").await);

        cluster.add_pod("ns1", "echo-0", true, &[("app", "echo")]);
        cluster.add_backend("ns1", "echo-0", 7000, testkit::spawn_echo_server().await);
        cluster
    }

    async fn assert_refused(port: u16) {
        let err = TcpStream::connect(("127.0.0.1", port)).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn test_http_through_service_then_refused_after_stop() {
        let cluster = cluster().await;
        let forwarder = forwarder();

        let forwarding = forwarder
            .start(&cluster, &request("web", 8080))
            .await
            .unwrap();
        assert_eq!(forwarding.pod_name, "web-abc123");
        let port = forwarding.bound_port();
        assert_ne!(port, 0);

        let response = testkit::http_get(port).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
        assert!(response.ends_with("ok"));

        assert!(forwarder.stop(&forwarding.id).await);
        assert_refused(port).await;
        assert!(forwarder.registry().is_empty());
    }

    #[tokio::test]
    async fn test_start_then_stop_leaves_nothing_behind() {
        let cluster = cluster().await;
        let forwarder = forwarder();

        for target in ["web", "web-abc123", "echo-0"] {
            let port = if target == "echo-0" { 7000 } else { 8080 };
            let forwarding = forwarder.start(&cluster, &request(target, port)).await.unwrap();
            assert!(forwarder.stop(&forwarding.id).await);
            assert_refused(forwarding.bound_port()).await;
            assert!(forwarder.registry().is_empty());
            assert!(forwarder.sessions().is_empty());
        }
    }

    #[tokio::test]
    async fn test_invalid_requests_touch_nothing() {
        let cluster = cluster().await;
        let forwarder = forwarder();

        let invalid = [
            ForwardRequest::new("", "web", "127.0.0.1:0", 8080),
            ForwardRequest::new("ns1", "", "127.0.0.1:0", 8080),
            ForwardRequest::new("ns/1", "web", "127.0.0.1:0", 8080),
            ForwardRequest::new("ns1", "web/x", "127.0.0.1:0", 8080),
            ForwardRequest::new("ns1", "web", "127.0.0.1:0", 0),
            ForwardRequest::new("ns1", "web", "127.0.0.1:70000", 8080),
            ForwardRequest::new("ns1", "web", "not-an-ip:80", 8080),
        ];
        for request in &invalid {
            let err = forwarder.start(&cluster, request).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "{request:?}");
        }
        assert_eq!(cluster.lookups(), 0);
        assert_eq!(cluster.dials(), 0);
        assert!(forwarder.registry().is_empty());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let cluster = cluster().await;
        let forwarder = forwarder();
        let forwarding = forwarder
            .start(&cluster, &request("echo-0", 7000))
            .await
            .unwrap();

        assert!(forwarder.stop(&forwarding.id).await);
        assert!(!forwarder.stop(&forwarding.id).await);
        assert!(!forwarder.stop(&SessionId::new("ns1", "never-started", 1)).await);
        assert!(forwarder.registry().is_empty());
    }

    #[tokio::test]
    async fn test_lost_transport_ends_and_unregisters_session() {
        let cluster = cluster().await;
        let forwarder = forwarder();
        let forwarding = forwarder
            .start(&cluster, &request("echo-0", 7000))
            .await
            .unwrap();

        let mut socket = TcpStream::connect(forwarding.local_address).await.unwrap();
        socket.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        socket.read_exact(&mut buf).await.unwrap();

        cluster.sever_connections();

        // The open connection is cut rather than left hanging.
        let mut rest = Vec::new();
        let _ = tokio::time::timeout(Duration::from_secs(5), socket.read_to_end(&mut rest))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while forwarder.is_forwarding(&forwarding.id) || !forwarder.registry().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(forwarder.sessions().is_empty());
        assert_refused(forwarding.bound_port()).await;
        assert!(!forwarder.stop(&forwarding.id).await);

        // The same target can be forwarded again over a fresh transport.
        let dials = cluster.dials();
        let again = forwarder
            .start(&cluster, &request("echo-0", 7000))
            .await
            .unwrap();
        assert_eq!(cluster.dials(), dials + 1);
        let mut socket = TcpStream::connect(again.local_address).await.unwrap();
        socket.write_all(b"back").await.unwrap();
        let mut buf = [0u8; 4];
        socket.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"back");

        drop(socket);
        forwarder.stop_all().await;
    }

    #[tokio::test]
    async fn test_bytes_round_trip_in_order() {
        let cluster = cluster().await;
        let forwarder = forwarder();
        let forwarding = forwarder
            .start(&cluster, &request("echo-0", 7000))
            .await
            .unwrap();

        let mut socket = TcpStream::connect(forwarding.local_address).await.unwrap();
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let (mut read, mut write) = socket.split();
        let send = async {
            write.write_all(&payload).await.unwrap();
        };
        let receive = async {
            let mut echoed = vec![0u8; payload.len()];
            read.read_exact(&mut echoed).await.unwrap();
            echoed
        };
        let ((), echoed) = tokio::join!(send, receive);
        assert_eq!(echoed, payload);

        drop(socket);
        forwarder.stop(&forwarding.id).await;
    }

    #[tokio::test]
    async fn test_ephemeral_ports_are_unique_and_accepting() {
        let cluster = FakeCluster::new();
        let echo = testkit::spawn_echo_server().await;
        for i in 0..4 {
            let pod = format!("echo-{i}");
            cluster.add_pod("ns1", &pod, true, &[]);
            cluster.add_backend("ns1", &pod, 7000, echo);
        }
        let forwarder = forwarder();

        let mut ports = std::collections::HashSet::new();
        for i in 0..4 {
            let forwarding = forwarder
                .start(&cluster, &request(&format!("echo-{i}"), 7000))
                .await
                .unwrap();
            assert_ne!(forwarding.bound_port(), 0);
            assert!(ports.insert(forwarding.bound_port()));
            TcpStream::connect(forwarding.local_address).await.unwrap();
        }
        assert_eq!(forwarder.sessions().len(), 4);
        assert_eq!(forwarder.stop_all().await, 4);
        for port in ports {
            assert_refused(port).await;
        }
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let cluster = FakeCluster::new();
        cluster.add_pod("ns1", "a", true, &[]);
        cluster.add_pod("ns1", "b", true, &[]);
        cluster.add_backend("ns1", "a", 7000, testkit::spawn_echo_server().await);
        cluster.add_backend("ns1", "b", 7000, testkit::spawn_echo_server().await);
        let forwarder = forwarder();

        let a = forwarder.start(&cluster, &request("a", 7000)).await.unwrap();
        let b = forwarder.start(&cluster, &request("b", 7000)).await.unwrap();

        let mut to_a = TcpStream::connect(a.local_address).await.unwrap();
        let mut to_b = TcpStream::connect(b.local_address).await.unwrap();
        to_a.write_all(b"for a").await.unwrap();
        to_b.write_all(b"for b").await.unwrap();

        let mut buf = [0u8; 5];
        to_a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"for a");
        to_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"for b");

        // Stopping `a` leaves `b`'s open connection working.
        forwarder.stop(&a.id).await;
        to_b.write_all(b"again").await.unwrap();
        to_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"again");
        assert!(forwarder.is_forwarding(&b.id));
        assert!(!forwarder.is_forwarding(&a.id));

        forwarder.stop_all().await;
    }

    #[tokio::test]
    async fn test_duplicate_start_is_rejected() {
        let cluster = cluster().await;
        let forwarder = forwarder();
        let first = forwarder
            .start(&cluster, &request("web", 8080))
            .await
            .unwrap();
        let dials = cluster.dials();

        // Same target name: rejected before resolving.
        let lookups = cluster.lookups();
        let err = forwarder
            .start(&cluster, &request("web", 8080))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(cluster.lookups(), lookups);

        // Pod name the service resolved to: same session.
        let err = forwarder
            .start(&cluster, &request("web-abc123", 8080))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(cluster.dials(), dials);
        assert_eq!(forwarder.sessions().len(), 1);

        // A different port is a different session.
        cluster.add_backend("ns1", "web-abc123", 9090, testkit::spawn_echo_server().await);
        forwarder
            .start(&cluster, &request("web-abc123", 9090))
            .await
            .unwrap();
        assert_eq!(forwarder.sessions().len(), 2);

        forwarder.stop(&first.id).await;
        forwarder.stop_all().await;
    }

    #[tokio::test]
    async fn test_concurrent_starts_for_one_pod_collapse() {
        let cluster = cluster().await;
        cluster.delay_dials(Duration::from_millis(50));
        let forwarder = forwarder();

        let service_request = request("web", 8080);
        let pod_request = request("web-abc123", 8080);
        let (via_service, via_pod) = tokio::join!(
            forwarder.start(&cluster, &service_request),
            forwarder.start(&cluster, &pod_request),
        );
        let outcomes = [via_service.is_ok(), via_pod.is_ok()];
        assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
        let err = via_service.err().or(via_pod.err()).unwrap();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        // The loser never opened a transport.
        assert_eq!(cluster.dials(), 1);
        assert_eq!(forwarder.sessions().len(), 1);
        forwarder.stop_all().await;
    }

    #[tokio::test]
    async fn test_stop_by_service_name() {
        let cluster = cluster().await;
        let forwarder = forwarder();
        let forwarding = forwarder
            .start(&cluster, &request("web", 8080))
            .await
            .unwrap();

        let info = &forwarder.sessions()[0];
        assert_eq!(info.target, "web");
        assert_eq!(info.kind, TargetKind::Service);
        assert_eq!(info.pod_name, "web-abc123");

        assert!(forwarder.is_forwarding(&SessionId::new("ns1", "web", 8080)));
        assert!(forwarder.stop(&SessionId::new("ns1", "web", 8080)).await);
        assert_refused(forwarding.bound_port()).await;
        assert!(forwarder.registry().is_empty());

        // Both names are free again.
        forwarder
            .start(&cluster, &request("web-abc123", 8080))
            .await
            .unwrap();
        forwarder.stop_all().await;
    }

    #[tokio::test]
    async fn test_remote_refusal_is_contained_to_its_connection() {
        let cluster = cluster().await;
        let forwarder = forwarder();
        // Nothing listens on 9999 inside the pod.
        let forwarding = forwarder
            .start(&cluster, &request("echo-0", 9999))
            .await
            .unwrap();

        for _ in 0..2 {
            let mut socket = TcpStream::connect(forwarding.local_address).await.unwrap();
            let mut rest = Vec::new();
            let _ = socket.read_to_end(&mut rest).await;
            assert!(rest.is_empty());
        }

        assert!(forwarder.is_forwarding(&forwarding.id));
        let info = &forwarder.sessions()[0];
        assert_eq!(info.total_connections, 2);
        forwarder.stop_all().await;
    }

    #[tokio::test]
    async fn test_resolution_failures_register_nothing() {
        let cluster = cluster().await;
        cluster.add_service("ns1", "empty", &[("app", "none")]);
        let forwarder = forwarder();

        let err = forwarder
            .start(&cluster, &request("missing", 80))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = forwarder
            .start(&cluster, &request("empty", 80))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoReadyBackend);

        assert_eq!(cluster.dials(), 0);
        assert!(forwarder.registry().is_empty());
        assert!(!forwarder.stop(&SessionId::new("ns1", "empty", 80)).await);
    }

    #[tokio::test]
    async fn test_dial_failure_releases_reservation() {
        let cluster = cluster().await;
        cluster.fail_dials(|| Error::Auth("token expired".to_string()));
        let forwarder = forwarder();

        let err = forwarder
            .start(&cluster, &request("web", 8080))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Auth);
        assert!(forwarder.registry().is_empty());
        assert!(forwarder
            .registry()
            .ensure_available(&SessionId::new("ns1", "web", 8080))
            .is_ok());
        assert!(forwarder
            .registry()
            .ensure_available(&SessionId::new("ns1", "web-abc123", 8080))
            .is_ok());
    }

    #[tokio::test]
    async fn test_bind_failure_releases_everything() {
        let cluster = cluster().await;
        let forwarder = forwarder();
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = taken.local_addr().unwrap().to_string();

        let err = forwarder
            .start(
                &cluster,
                &ForwardRequest::new("ns1", "echo-0", address, 7000),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(forwarder.registry().is_empty());

        // The id is free for a retry on another port.
        forwarder
            .start(&cluster, &request("echo-0", 7000))
            .await
            .unwrap();
        forwarder.stop_all().await;
    }

    #[tokio::test]
    async fn test_stop_unblocks_stalled_connections() {
        let cluster = FakeCluster::new();
        cluster.add_pod("ns1", "stall-0", true, &[]);
        // A backend that accepts and never answers.
        let stalled = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        cluster.add_backend("ns1", "stall-0", 5432, stalled.local_addr().unwrap());
        let forwarder = forwarder();

        let forwarding = forwarder
            .start(&cluster, &request("stall-0", 5432))
            .await
            .unwrap();
        let mut socket = TcpStream::connect(forwarding.local_address).await.unwrap();
        socket.write_all(b"hello").await.unwrap();
        let (_held, _) = stalled.accept().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), forwarder.stop(&forwarding.id))
            .await
            .expect("stop hung on a stalled connection");

        let mut rest = Vec::new();
        let _ = socket.read_to_end(&mut rest).await;
        assert!(rest.is_empty());
    }
}
