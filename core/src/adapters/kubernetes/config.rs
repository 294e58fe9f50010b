//! Where the cluster client configuration comes from.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use kube::config::{KubeConfigOptions, Kubeconfig};
use tracing::debug;

use crate::domain::ForwardRequest;
use crate::error::{Error, Result};

/// Source of the client configuration for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterConfigSource {
    /// A kubeconfig file, using `context` or its current context.
    Kubeconfig {
        path: PathBuf,
        context: Option<String>,
    },
    /// The pod's service account.
    InCluster,
}

impl ClusterConfigSource {
    pub fn from_request(request: &ForwardRequest) -> Self {
        Self::discover(
            request.kube_config_path.as_deref(),
            request.kube_context.as_deref(),
        )
    }

    /// Pick a source: an explicit path wins, then the first `KUBECONFIG`
    /// entry, then `~/.kube/config` if it exists, then in-cluster.
    pub fn discover(path: Option<&Path>, context: Option<&str>) -> Self {
        let env = std::env::var_os("KUBECONFIG");
        let home = default_kubeconfig_path().filter(|path| path.is_file());
        choose(path, context, env.as_deref(), home)
    }

    /// Build the client configuration. Any failure is an auth error.
    pub async fn load(&self) -> Result<kube::Config> {
        match self {
            ClusterConfigSource::Kubeconfig { path, context } => {
                debug!(path = %path.display(), context = ?context, "loading kubeconfig");
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    Error::Auth(format!(
                        "failed to read kubeconfig {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                let options = KubeConfigOptions {
                    context: context.clone(),
                    ..Default::default()
                };
                kube::Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .map_err(|e| {
                        Error::Auth(format!(
                            "invalid kubeconfig {}: {}",
                            path.display(),
                            e
                        ))
                    })
            }
            ClusterConfigSource::InCluster => {
                debug!("loading in-cluster configuration");
                kube::Config::incluster().map_err(|e| {
                    Error::Auth(format!(
                        "no kubeconfig found and in-cluster configuration failed: {}",
                        e
                    ))
                })
            }
        }
    }
}

/// `~/.kube/config`, whether or not it exists.
pub fn default_kubeconfig_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".kube").join("config"))
}

fn choose(
    explicit: Option<&Path>,
    context: Option<&str>,
    env: Option<&OsStr>,
    home_config: Option<PathBuf>,
) -> ClusterConfigSource {
    let context = context.filter(|c| !c.is_empty()).map(str::to_string);
    let from_env = env.and_then(|value| std::env::split_paths(value).find(|p| !p.as_os_str().is_empty()));

    let path = explicit
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .or(from_env)
        .or(home_config);

    match path {
        Some(path) => ClusterConfigSource::Kubeconfig { path, context },
        None => ClusterConfigSource::InCluster,
    }
}
