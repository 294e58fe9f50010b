//! Kubernetes adapter backed by kube-rs.
//!
//! Implements the lookup and upgrade ports against a real API server.

mod config;
mod dialer;
mod lookup;

pub use config::{default_kubeconfig_path, ClusterConfigSource};

use kube::Client;
use tracing::debug;

use crate::error::{Error, Result};

/// An authenticated API server client, bound to one kubeconfig context.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Load the configuration from `source` and build a client.
    pub async fn connect(source: &ClusterConfigSource) -> Result<Self> {
        let config = source.load().await?;
        debug!(cluster = %config.cluster_url, "building API client");
        let client = Client::try_from(config)
            .map_err(|e| Error::Auth(format!("failed to build API client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

/// Map an API call failure onto the engine's error taxonomy.
pub(crate) fn map_kube_error(err: kube::Error) -> Error {
    match err {
        kube::Error::Api(response) if matches!(response.code, 401 | 403) => {
            Error::Auth(response.message)
        }
        kube::Error::Api(response) => Error::Api {
            code: response.code,
            message: response.message,
        },
        kube::Error::Auth(err) => Error::Auth(err.to_string()),
        other => Error::Connect(other.to_string()),
    }
}
