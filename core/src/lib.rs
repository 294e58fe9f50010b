//! Podforward Core Library
//!
//! A Kubernetes port-forward tunnel engine that needs no external CLI.
//! Provides functionality to:
//! - Resolve a pod or service name to a ready pod
//! - Upgrade an API server connection to a SPDY/3.1 port-forward transport
//! - Multiplex one stream pair per local TCP connection over that transport
//! - Run many sessions concurrently with race-free start and stop
//!
//! # Architecture
//! This library follows hexagonal architecture (ports & adapters):
//! - `domain`: Pure data models and validation
//! - `ports`: Trait definitions (interfaces)
//! - `adapters`: kube-rs backed cluster access
//! - `spdy` and `tunnel`: The transport and the per-connection plumbing
//! - `application`: Lifecycle controller and sessions
//! - `engine`: Blocking facade for bindings

// Hexagonal architecture layers
pub mod adapters;
pub mod application;
pub mod domain;
pub mod ports;

pub mod config;
pub mod engine;
pub mod error;
pub mod registry;
pub mod spdy;
pub mod tunnel;

#[cfg(test)]
mod testkit;

// Re-export domain types (primary API)
pub use domain::{
    bind_address_from, ForwardRequest, Forwarding, LogLevel, Resolution, ResolvedPod, SessionId,
    SessionInfo, SessionState, Target, TargetKind,
};

// Re-export other commonly used types
pub use adapters::{ClusterConfigSource, KubeCluster};
pub use application::Forwarder;
pub use config::{Settings, SettingsStore, TunnelSettings};
pub use engine::PortForwardEngine;
pub use error::{Error, ErrorKind, Result};
pub use registry::SessionRegistry;
