//! Forward requests, log levels and input validation.
//!
//! Everything here runs before any network I/O, so a rejected request
//! never touches the cluster or binds a socket.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

use crate::domain::SessionId;
use crate::error::{Error, Result};

/// Verbosity requested by the caller.
///
/// Numeric values match the levels accepted by existing bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug = 0,
    #[default]
    Info = 1,
    Warn = 2,
    Error = 3,
    Off = 4,
}

impl LogLevel {
    /// Map the numeric level used by bindings.
    pub fn from_value(value: i64) -> Option<Self> {
        match value {
            0 => Some(LogLevel::Debug),
            1 => Some(LogLevel::Info),
            2 => Some(LogLevel::Warn),
            3 => Some(LogLevel::Error),
            4 => Some(LogLevel::Off),
            _ => None,
        }
    }

    pub fn as_level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Off => LevelFilter::OFF,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Off => "off",
        };
        f.write_str(name)
    }
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "debug" | "trace" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "off" | "none" => Ok(LogLevel::Off),
            other => Err(Error::validation(format!("unknown log level '{other}'"))),
        }
    }
}

/// Everything needed to start one port-forward session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRequest {
    pub namespace: String,
    /// Pod or service name.
    pub target: String,
    /// Local `ip:port`; port 0 asks the OS for a free port.
    pub bind_address: String,
    pub target_port: u16,
    /// Kubeconfig file; `None` discovers one, falling back to in-cluster configuration.
    pub kube_config_path: Option<PathBuf>,
    /// Kubeconfig context; `None` means the current context.
    pub kube_context: Option<String>,
}

impl ForwardRequest {
    pub fn new(
        namespace: impl Into<String>,
        target: impl Into<String>,
        bind_address: impl Into<String>,
        target_port: u16,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            target: target.into(),
            bind_address: bind_address.into(),
            target_port,
            kube_config_path: None,
            kube_context: None,
        }
    }

    pub fn with_kube_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.kube_config_path = Some(path.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let context = context.into();
        self.kube_context = (!context.is_empty()).then_some(context);
        self
    }

    /// Check every field and return the parsed local address.
    pub fn validate(&self) -> Result<SocketAddr> {
        validate_name("namespace", &self.namespace)?;
        validate_name("target", &self.target)?;
        validate_target_port(self.target_port)?;
        parse_bind_address(&self.bind_address)
    }

    /// Session id under the caller's own naming, before resolution.
    pub fn requested_id(&self) -> SessionId {
        SessionId::new(&self.namespace, &self.target, self.target_port)
    }
}

/// Reject empty names and names containing a path separator.
pub fn validate_name(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::validation(format!("{field} cannot be empty")));
    }
    if value.contains('/') {
        return Err(Error::validation(format!(
            "{field} contains illegal character '/'"
        )));
    }
    Ok(())
}

/// Remote ports must be in `1..=65535`.
pub fn validate_target_port(port: u16) -> Result<()> {
    if port == 0 {
        return Err(Error::validation("target port must be between 1 and 65535"));
    }
    Ok(())
}

/// Range-check a port supplied as a wide integer by a binding.
pub fn port_from_value(field: &str, value: i64, allow_zero: bool) -> Result<u16> {
    let min = if allow_zero { 0 } else { 1 };
    match u16::try_from(value) {
        Ok(port) if i64::from(port) >= min => Ok(port),
        _ => Err(Error::validation(format!(
            "{field}={value} is not a valid port"
        ))),
    }
}

/// Parse `ip:port`. IPv6 addresses must be bracketed.
pub fn parse_bind_address(address: &str) -> Result<SocketAddr> {
    address
        .parse::<SocketAddr>()
        .map_err(|_| Error::validation(format!("'{address}' is not a valid ip:port address")))
}

/// Compose a bind address from a separate IP and port.
pub fn bind_address_from(ip: &str, port: u16) -> Result<String> {
    let ip: IpAddr = ip
        .parse()
        .map_err(|_| Error::validation(format!("'{ip}' is not a valid IP address")))?;
    Ok(SocketAddr::new(ip, port).to_string())
}
