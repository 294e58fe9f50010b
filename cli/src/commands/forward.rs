//! Forward command - run port-forward sessions until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use podforward_core::{
    bind_address_from, ForwardRequest, Forwarder, Forwarding, SessionRegistry, Settings,
};
use tracing::info;

const SESSION_POLL: Duration = Duration::from_millis(500);

pub struct Options {
    pub namespace: Option<String>,
    pub target: String,
    pub ports: Vec<String>,
    pub address: Option<String>,
    pub kubeconfig: Option<PathBuf>,
    pub context: Option<String>,
}

/// A `LOCAL:REMOTE` mapping. A local port of 0 lets the OS pick one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSpec {
    pub local: u16,
    pub remote: u16,
}

/// Parse `LOCAL:REMOTE`, `REMOTE` (same port locally) or `:REMOTE` (any local port).
pub fn parse_port_spec(spec: &str) -> Result<PortSpec> {
    let (local, remote) = match spec.split_once(':') {
        Some(("", remote)) => ("0", remote),
        Some((local, remote)) => (local, remote),
        None => (spec, spec),
    };
    let local: u16 = local
        .parse()
        .with_context(|| format!("invalid local port in '{spec}'"))?;
    let remote: u16 = remote
        .parse()
        .with_context(|| format!("invalid remote port in '{spec}'"))?;
    if remote == 0 {
        bail!("remote port in '{spec}' must be between 1 and 65535");
    }
    Ok(PortSpec { local, remote })
}

pub async fn run(settings: &Settings, options: Options, json: bool) -> Result<()> {
    let specs = options
        .ports
        .iter()
        .map(|spec| parse_port_spec(spec))
        .collect::<Result<Vec<_>>>()?;
    let namespace = super::namespace_or_default(settings, options.namespace);
    let address = options
        .address
        .unwrap_or_else(|| settings.bind_address.clone());

    let cluster = super::connect(options.kubeconfig, options.context).await?;
    let forwarder = Forwarder::new(Arc::new(SessionRegistry::new()), settings.tunnel());

    let mut started = Vec::with_capacity(specs.len());
    for spec in &specs {
        let request = ForwardRequest::new(
            &namespace,
            &options.target,
            bind_address_from(&address, spec.local)?,
            spec.remote,
        );
        match forwarder.start(&cluster, &request).await {
            Ok(forwarding) => started.push(forwarding),
            Err(e) => {
                forwarder.stop_all().await;
                return Err(e).with_context(|| {
                    format!("failed to forward {}:{}", options.target, spec.remote)
                });
            }
        }
    }

    print_started(&started, json)?;

    tokio::select! {
        signal = shutdown_signal() => {
            let signal = signal?;
            let stopped = forwarder.stop_all().await;
            info!(signal, stopped, "all sessions stopped");
            Ok(())
        }
        _ = all_sessions_ended(&forwarder) => bail!("lost connection to pod"),
    }
}

/// Resolves once every session has torn itself down after losing its transport.
async fn all_sessions_ended(forwarder: &Forwarder) {
    let mut poll = tokio::time::interval(SESSION_POLL);
    loop {
        poll.tick().await;
        if forwarder.sessions().is_empty() {
            return;
        }
    }
}

/// Wait for Ctrl-C, or SIGTERM on Unix. Returns the signal's name.
async fn shutdown_signal() -> Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate =
            signal(SignalKind::terminate()).context("failed to listen for SIGTERM")?;
        tokio::select! {
            interrupted = tokio::signal::ctrl_c() => {
                interrupted.context("failed to listen for interrupt")?;
                Ok("SIGINT")
            }
            _ = terminate.recv() => Ok("SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for interrupt")?;
        Ok("SIGINT")
    }
}

fn print_started(started: &[Forwarding], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(started)?);
        return Ok(());
    }
    for forwarding in started {
        println!(
            "Forwarding from {} -> {} ({}/{})",
            forwarding.local_address, forwarding.id.port, forwarding.id.namespace, forwarding.pod_name
        );
    }
    println!("Press Ctrl+C to stop.");
    Ok(())
}
