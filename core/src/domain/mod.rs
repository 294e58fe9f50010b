//! Domain layer - Pure data models and validation.
//!
//! This module contains the types every other layer talks in: targets and
//! resolved pods, session identity and state, and forward requests.
//! These types have no I/O dependencies and can be tested in isolation.

mod request;
mod session;
mod target;

// Re-export all domain types
pub use request::{
    bind_address_from, parse_bind_address, port_from_value, validate_name, validate_target_port,
    ForwardRequest, LogLevel,
};
pub use session::{Forwarding, SessionId, SessionInfo, SessionState};
pub use target::{
    select_ready_pod, selector_query, PodSummary, Resolution, ResolvedPod, Target, TargetKind,
};
