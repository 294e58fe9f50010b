//! Error types for the podforward-core library.

use thiserror::Error;

use crate::spdy::SpdyError;

/// Result type alias for podforward operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while resolving targets, establishing tunnels and forwarding bytes.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input, rejected before any network I/O.
    #[error("Invalid argument: {0}")]
    Validation(String),

    /// Neither a pod nor a service with that name exists.
    #[error("No pod or service named '{name}' in namespace '{namespace}'")]
    NotFound { namespace: String, name: String },

    /// The service exists but no backing pod is ready.
    #[error("Service '{service}' in namespace '{namespace}' has no ready pods")]
    NoReadyBackend { namespace: String, service: String },

    /// Credentials are missing, invalid or expired.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The API server could not be reached.
    #[error("Failed to connect to the API server: {0}")]
    Connect(String),

    /// The API server refused to upgrade the port-forward request.
    #[error("Port-forward upgrade rejected (HTTP {status}): {message}")]
    UpgradeRejected { status: u16, message: String },

    /// The pod rejected forwarding to the requested port.
    #[error("Pod refused port {port}: {message}")]
    RemoteRefused { port: u16, message: String },

    /// A session with the same id is already forwarding.
    #[error("Port forward {0} already exists")]
    AlreadyExists(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Multiplexed transport violated the framing protocol or went away.
    #[error("Transport error: {0}")]
    Protocol(#[from] SpdyError),

    /// The API server answered a lookup with an error status.
    #[error("Kubernetes API error ({code}): {message}")]
    Api { code: u16, message: String },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Fieldless classification of [`Error`], stable across messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    NotFound,
    NoReadyBackend,
    Auth,
    Connect,
    UpgradeRejected,
    RemoteRefused,
    AlreadyExists,
    Io,
    Protocol,
    Api,
    Config,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::NoReadyBackend { .. } => ErrorKind::NoReadyBackend,
            Error::Auth(_) => ErrorKind::Auth,
            Error::Connect(_) => ErrorKind::Connect,
            Error::UpgradeRejected { .. } => ErrorKind::UpgradeRejected,
            Error::RemoteRefused { .. } => ErrorKind::RemoteRefused,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::Io(_) => ErrorKind::Io,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::Api { .. } => ErrorKind::Api,
            Error::Config(_) => ErrorKind::Config,
        }
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }
}
