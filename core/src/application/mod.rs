//! Application layer - Use case services.
//!
//! This module contains the lifecycle controller and the sessions it runs.
//! Both talk to the cluster only through the traits in `ports`, so tests can
//! inject an in-memory cluster.

mod forwarder;
mod session;

pub use forwarder::Forwarder;
pub use session::Session;
