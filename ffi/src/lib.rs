//! UniFFI bindings for podforward-core.
//!
//! Foreign callers either use the process-wide free functions (`forward`,
//! `stop`, ...) or hold their own `ForwardEngine` object. Arguments are
//! validated here, before the engine sees them.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};

use podforward_core::domain::{port_from_value, validate_name};
use podforward_core::{
    ErrorKind, ForwardRequest, LogLevel as CoreLogLevel, PortForwardEngine, SessionInfo,
};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, Registry};

uniffi::setup_scaffolding!();

/// Error type exposed via FFI, one variant per failure kind.
#[derive(Debug, thiserror::Error, uniffi::Error)]
pub enum PortForwardError {
    #[error("{msg}")]
    Validation { msg: String },
    #[error("{msg}")]
    NotFound { msg: String },
    #[error("{msg}")]
    NoReadyBackend { msg: String },
    #[error("{msg}")]
    Auth { msg: String },
    #[error("{msg}")]
    Connect { msg: String },
    #[error("{msg}")]
    UpgradeRejected { msg: String },
    #[error("{msg}")]
    RemoteRefused { msg: String },
    #[error("{msg}")]
    AlreadyExists { msg: String },
    #[error("{msg}")]
    Io { msg: String },
    #[error("{msg}")]
    Protocol { msg: String },
    #[error("{msg}")]
    Api { msg: String },
    #[error("{msg}")]
    Config { msg: String },
}

impl From<podforward_core::Error> for PortForwardError {
    fn from(e: podforward_core::Error) -> Self {
        let msg = e.to_string();
        match e.kind() {
            ErrorKind::Validation => PortForwardError::Validation { msg },
            ErrorKind::NotFound => PortForwardError::NotFound { msg },
            ErrorKind::NoReadyBackend => PortForwardError::NoReadyBackend { msg },
            ErrorKind::Auth => PortForwardError::Auth { msg },
            ErrorKind::Connect => PortForwardError::Connect { msg },
            ErrorKind::UpgradeRejected => PortForwardError::UpgradeRejected { msg },
            ErrorKind::RemoteRefused => PortForwardError::RemoteRefused { msg },
            ErrorKind::AlreadyExists => PortForwardError::AlreadyExists { msg },
            ErrorKind::Io => PortForwardError::Io { msg },
            ErrorKind::Protocol => PortForwardError::Protocol { msg },
            ErrorKind::Api => PortForwardError::Api { msg },
            ErrorKind::Config => PortForwardError::Config { msg },
        }
    }
}

/// Log verbosity, applied on every call that takes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Off,
}

impl From<LogLevel> for CoreLogLevel {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => CoreLogLevel::Debug,
            LogLevel::Info => CoreLogLevel::Info,
            LogLevel::Warn => CoreLogLevel::Warn,
            LogLevel::Error => CoreLogLevel::Error,
            LogLevel::Off => CoreLogLevel::Off,
        }
    }
}

/// Result of a successful `forward`.
#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct ForwardResult {
    /// The pod actually forwarded to.
    pub pod_name: String,
    pub local_address: String,
    /// The bound local port, assigned by the OS when 0 was requested.
    pub bound_port: u16,
}

/// Session snapshot exposed to foreign callers.
#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct SessionSummary {
    pub namespace: String,
    pub pod_name: String,
    pub target: String,
    pub kind: String,
    pub target_port: u16,
    pub local_address: String,
    pub bound_port: u16,
    pub state: String,
    pub active_connections: u64,
    pub total_connections: u64,
}

impl From<SessionInfo> for SessionSummary {
    fn from(info: SessionInfo) -> Self {
        Self {
            namespace: info.id.namespace.clone(),
            pod_name: info.pod_name.clone(),
            target: info.target.clone(),
            kind: info.kind.to_string(),
            target_port: info.id.port,
            local_address: info.local_address.to_string(),
            bound_port: info.bound_port(),
            state: info.state.to_string(),
            active_connections: info.active_connections,
            total_connections: info.total_connections,
        }
    }
}

// =========================================================================
// Logging
// =========================================================================

static LOG_FILTER: OnceLock<reload::Handle<LevelFilter, Registry>> = OnceLock::new();

/// Install the subscriber on first use, then retune its level.
fn apply_log_level(level: LogLevel) {
    let filter = CoreLogLevel::from(level).as_level_filter();
    let handle = LOG_FILTER.get_or_init(|| {
        let (filter_layer, handle) = reload::Layer::new(filter);
        // Another subscriber may already be installed by the host.
        let _ = tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt::layer().with_target(false))
            .try_init();
        handle
    });
    if let Err(err) = handle.modify(|current| *current = filter) {
        tracing::debug!(error = %err, level = ?level, "failed to change log level");
    }
}

// =========================================================================
// Argument validation
// =========================================================================

fn optional(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

fn forward_request(
    namespace: String,
    pod_or_service: String,
    bind_address: String,
    to_port: i64,
    config_path: String,
    kube_context: String,
) -> Result<ForwardRequest, PortForwardError> {
    validate_name("namespace", &namespace)?;
    validate_name("pod_or_service", &pod_or_service)?;
    let to_port = port_from_value("to_port", to_port, false)?;

    let mut request = ForwardRequest::new(namespace, pod_or_service, bind_address, to_port);
    request.kube_config_path = optional(config_path).map(PathBuf::from);
    request.kube_context = optional(kube_context);
    request.validate()?;
    Ok(request)
}

// =========================================================================
// Engine object
// =========================================================================

/// A port-forward engine with its own sessions and runtime.
#[derive(uniffi::Object)]
pub struct ForwardEngine {
    engine: PortForwardEngine,
}

#[uniffi::export]
impl ForwardEngine {
    /// Create an engine with settings from `~/.podforward/config.json`.
    #[uniffi::constructor]
    pub fn new() -> Result<Arc<Self>, PortForwardError> {
        Ok(Arc::new(Self {
            engine: PortForwardEngine::from_settings_file()?,
        }))
    }

    /// Start forwarding; returns once the local port accepts connections.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        namespace: String,
        pod_or_service: String,
        bind_address: String,
        to_port: i64,
        config_path: String,
        log_level: LogLevel,
        kube_context: String,
    ) -> Result<ForwardResult, PortForwardError> {
        apply_log_level(log_level);
        let request = forward_request(
            namespace,
            pod_or_service,
            bind_address,
            to_port,
            config_path,
            kube_context,
        )?;
        let forwarding = self.engine.forward(&request)?;
        Ok(ForwardResult {
            pod_name: forwarding.pod_name.clone(),
            local_address: forwarding.local_address.to_string(),
            bound_port: forwarding.bound_port(),
        })
    }

    /// Stop a session by resolved pod name or by the target it was started with.
    ///
    /// Returns whether a session was stopped.
    pub fn stop(
        &self,
        namespace: String,
        actual_pod: String,
        to_port: i64,
        log_level: LogLevel,
    ) -> Result<bool, PortForwardError> {
        apply_log_level(log_level);
        let to_port = port_from_value("to_port", to_port, false)?;
        Ok(self.engine.stop(&namespace, &actual_pod, to_port)?)
    }

    pub fn stop_all(&self) -> u64 {
        self.engine.stop_all() as u64
    }

    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        self.engine
            .sessions()
            .into_iter()
            .map(SessionSummary::from)
            .collect()
    }

    pub fn is_forwarding(&self, namespace: String, actual_pod: String, to_port: u16) -> bool {
        self.engine.is_forwarding(&namespace, &actual_pod, to_port)
    }
}

// =========================================================================
// Process-wide functions
// =========================================================================

static SHARED: OnceLock<Arc<ForwardEngine>> = OnceLock::new();
static SHARED_INIT: Mutex<()> = Mutex::new(());

fn shared() -> Result<Arc<ForwardEngine>, PortForwardError> {
    if let Some(engine) = SHARED.get() {
        return Ok(Arc::clone(engine));
    }
    let _guard = SHARED_INIT.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(engine) = SHARED.get() {
        return Ok(Arc::clone(engine));
    }
    let engine = ForwardEngine::new()?;
    tracing::debug!("process-wide engine created");
    let _ = SHARED.set(Arc::clone(&engine));
    Ok(engine)
}

/// Start forwarding on the process-wide engine.
#[uniffi::export]
pub fn forward(
    namespace: String,
    pod_or_service: String,
    bind_address: String,
    to_port: i64,
    config_path: String,
    log_level: LogLevel,
    kube_context: String,
) -> Result<ForwardResult, PortForwardError> {
    apply_log_level(log_level);
    // Reject bad arguments before spinning up the engine.
    forward_request(
        namespace.clone(),
        pod_or_service.clone(),
        bind_address.clone(),
        to_port,
        config_path.clone(),
        kube_context.clone(),
    )?;
    shared()?.forward(
        namespace,
        pod_or_service,
        bind_address,
        to_port,
        config_path,
        log_level,
        kube_context,
    )
}

/// Stop a session on the process-wide engine. Unknown sessions are a no-op.
#[uniffi::export]
pub fn stop(
    namespace: String,
    actual_pod: String,
    to_port: i64,
    log_level: LogLevel,
) -> Result<(), PortForwardError> {
    shared()?.stop(namespace, actual_pod, to_port, log_level)?;
    Ok(())
}

#[uniffi::export]
pub fn stop_all() -> Result<u64, PortForwardError> {
    Ok(shared()?.stop_all())
}

#[uniffi::export]
pub fn list_sessions() -> Result<Vec<SessionSummary>, PortForwardError> {
    Ok(shared()?.list_sessions())
}

#[uniffi::export]
pub fn is_forwarding(
    namespace: String,
    actual_pod: String,
    to_port: u16,
) -> Result<bool, PortForwardError> {
    Ok(shared()?.is_forwarding(namespace, actual_pod, to_port))
}

/// Compose an `ip:port` bind address for callers that keep them apart.
#[uniffi::export]
pub fn bind_address(ip: String, port: i64) -> Result<String, PortForwardError> {
    let port = port_from_value("from_port", port, true)?;
    Ok(podforward_core::bind_address_from(&ip, port)?)
}
