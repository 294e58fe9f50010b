//! Resolve command - show the pod a target would forward to.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use podforward_core::{Forwarder, SessionRegistry, Settings};

pub async fn run(
    settings: &Settings,
    namespace: Option<String>,
    target: &str,
    kubeconfig: Option<PathBuf>,
    context: Option<String>,
    json: bool,
) -> Result<()> {
    let namespace = super::namespace_or_default(settings, namespace);
    let cluster = super::connect(kubeconfig, context).await?;
    let forwarder = Forwarder::new(Arc::new(SessionRegistry::new()), settings.tunnel());
    let resolution = forwarder.resolve(&cluster, &namespace, target).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&resolution)?);
    } else {
        println!("{} -> pod/{}", resolution.target, resolution.pod.name);
    }
    Ok(())
}
