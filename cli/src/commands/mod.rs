//! CLI command implementations.

pub mod config;
pub mod forward;
pub mod resolve;

use std::path::PathBuf;

use podforward_core::{ClusterConfigSource, KubeCluster, Settings};

/// The namespace from the flag, or the configured default.
pub fn namespace_or_default(settings: &Settings, namespace: Option<String>) -> String {
    namespace.unwrap_or_else(|| settings.default_namespace.clone())
}

pub async fn connect(
    kubeconfig: Option<PathBuf>,
    context: Option<String>,
) -> anyhow::Result<KubeCluster> {
    let source = ClusterConfigSource::discover(kubeconfig.as_deref(), context.as_deref());
    Ok(KubeCluster::connect(&source).await?)
}
