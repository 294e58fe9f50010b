//! Ports layer - Trait definitions (interfaces).
//!
//! This module defines the interfaces the tunnel engine uses to reach the
//! cluster. Implementations live in `adapters` (kube-rs) and `tunnel`
//! (the SPDY port-forward transport).

mod cluster;
mod transport;

pub use cluster::{AsyncStream, PodLookupPort, UpgradeDialerPort, UpgradedIo};
pub use transport::{DataStream, ErrorStream, StreamPair, UpgradedConnectionPort};
