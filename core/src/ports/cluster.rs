//! Cluster lookup and upgrade ports (interfaces).

use std::collections::BTreeMap;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::domain::{PodSummary, ResolvedPod};
use crate::error::Result;

/// Any bidirectional async byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// A socket that has completed the port-forward upgrade handshake.
pub type UpgradedIo = Box<dyn AsyncStream>;

/// Port for read-only pod and service lookups.
///
/// Implementations are already bound to a cluster and context.
pub trait PodLookupPort: Send + Sync {
    /// Fetch a pod by name. `Ok(None)` when it does not exist.
    fn get_pod(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Option<PodSummary>>> + Send;

    /// Fetch a service's label selector. `Ok(None)` when the service does
    /// not exist; an empty map when it has no selector.
    fn get_service_selector(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Option<BTreeMap<String, String>>>> + Send;

    /// List pods matching every label of `selector`.
    fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> impl std::future::Future<Output = Result<Vec<PodSummary>>> + Send;
}

/// Port for upgrading a connection to a pod's port-forward subresource.
pub trait UpgradeDialerPort: Send + Sync {
    /// Perform the upgrade handshake and return the raw upgraded socket.
    fn dial(
        &self,
        pod: &ResolvedPod,
    ) -> impl std::future::Future<Output = Result<UpgradedIo>> + Send;
}
