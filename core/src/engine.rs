//! Port-forward engine - Synchronous facade over the async tunnel engine.
//!
//! The engine owns a tokio runtime and the process-wide session registry.
//! Every call blocks the calling thread until the operation is done, which
//! is what language bindings expect. Sessions keep running on the runtime's
//! worker threads between calls.

use std::path::Path;
use std::sync::Arc;

use tokio::runtime::{Builder, Runtime};
use tracing::debug;

use crate::adapters::{ClusterConfigSource, KubeCluster};
use crate::application::Forwarder;
use crate::config::{Settings, SettingsStore};
use crate::domain::{
    validate_name, validate_target_port, ForwardRequest, Forwarding, Resolution, SessionId,
    SessionInfo,
};
use crate::error::{Error, Result};
use crate::ports::{PodLookupPort, UpgradeDialerPort};
use crate::registry::SessionRegistry;

/// The port-forward engine.
///
/// Must not be called from inside another tokio runtime.
pub struct PortForwardEngine {
    runtime: Runtime,
    forwarder: Forwarder,
    settings: Settings,
}

impl PortForwardEngine {
    /// Create an engine with default settings.
    pub fn new() -> Result<Self> {
        Self::with_settings(Settings::default())
    }

    /// Create an engine with settings from `~/.podforward/config.json`.
    pub fn from_settings_file() -> Result<Self> {
        Self::from_store(&SettingsStore::new()?)
    }

    /// Create an engine with settings from `store`.
    pub fn from_store(store: &SettingsStore) -> Result<Self> {
        let loader = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Config(format!("Failed to create runtime: {}", e)))?;
        let settings = loader.block_on(store.load())?;
        Self::with_settings(settings)
    }

    pub fn with_settings(settings: Settings) -> Result<Self> {
        // Sessions must keep forwarding while the caller's thread is idle.
        let mut builder = Builder::new_multi_thread();
        if let Some(threads) = settings.worker_threads {
            builder.worker_threads(threads.max(1));
        }
        let runtime = builder
            .thread_name("podforward")
            .enable_all()
            .build()
            .map_err(|e| Error::Config(format!("Failed to create runtime: {}", e)))?;

        let forwarder = Forwarder::new(Arc::new(SessionRegistry::new()), settings.tunnel());
        Ok(Self {
            runtime,
            forwarder,
            settings,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Start forwarding and block until the local listener accepts.
    pub fn forward(&self, request: &ForwardRequest) -> Result<Forwarding> {
        request.validate()?;
        self.forwarder
            .registry()
            .ensure_available(&request.requested_id())?;

        self.runtime.block_on(async {
            let cluster = KubeCluster::connect(&ClusterConfigSource::from_request(request)).await?;
            self.forwarder.start(&cluster, request).await
        })
    }

    /// Start forwarding against an explicit cluster implementation.
    pub fn forward_via<B>(&self, cluster: &B, request: &ForwardRequest) -> Result<Forwarding>
    where
        B: PodLookupPort + UpgradeDialerPort,
    {
        self.runtime.block_on(self.forwarder.start(cluster, request))
    }

    /// Resolve a target to the pod a forward would use.
    pub fn resolve(
        &self,
        namespace: &str,
        target: &str,
        kube_config_path: Option<&Path>,
        kube_context: Option<&str>,
    ) -> Result<Resolution> {
        validate_name("namespace", namespace)?;
        validate_name("target", target)?;

        self.runtime.block_on(async {
            let source = ClusterConfigSource::discover(kube_config_path, kube_context);
            let cluster = KubeCluster::connect(&source).await?;
            self.forwarder.resolve(&cluster, namespace, target).await
        })
    }

    /// Stop the session for `(namespace, name, port)`.
    ///
    /// `name` may be the resolved pod or the target the session was started
    /// with. Returns whether a session was stopped; stopping an unknown
    /// session is not an error.
    pub fn stop(&self, namespace: &str, name: &str, target_port: u16) -> Result<bool> {
        validate_name("namespace", namespace)?;
        validate_name("name", name)?;
        validate_target_port(target_port)?;

        let id = SessionId::new(namespace, name, target_port);
        let stopped = self.runtime.block_on(self.forwarder.stop(&id));
        debug!(session = %id, stopped, "stop requested");
        Ok(stopped)
    }

    /// Stop every session. Returns how many were stopped.
    pub fn stop_all(&self) -> usize {
        self.runtime.block_on(self.forwarder.stop_all())
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.forwarder.sessions()
    }

    pub fn is_forwarding(&self, namespace: &str, name: &str, target_port: u16) -> bool {
        self.forwarder
            .is_forwarding(&SessionId::new(namespace, name, target_port))
    }
}
