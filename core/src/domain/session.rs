//! Session identity, state and snapshots.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::TargetKind;

/// Registry key of a session: `(namespace, name, target port)`.
///
/// Active sessions are keyed by the resolved pod name. The same shape keyed
/// by the caller's target name is used as an alias.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId {
    pub namespace: String,
    pub name: String,
    pub port: u16,
}

impl SessionId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, port: u16) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            port,
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.name, self.port)
    }
}

/// Lifecycle of a session. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Created,
    Forwarding,
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Created => write!(f, "created"),
            SessionState::Forwarding => write!(f, "forwarding"),
            SessionState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Point-in-time view of a session, safe to hand to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub uid: Uuid,
    pub id: SessionId,
    /// Name the caller asked for (pod or service).
    pub target: String,
    pub kind: TargetKind,
    pub pod_name: String,
    pub local_address: SocketAddr,
    pub state: SessionState,
    pub active_connections: u64,
    pub total_connections: u64,
}

impl SessionInfo {
    pub fn bound_port(&self) -> u16 {
        self.local_address.port()
    }
}

/// What `start` hands back once the listener is accepting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Forwarding {
    pub id: SessionId,
    pub pod_name: String,
    pub local_address: SocketAddr,
}

impl Forwarding {
    pub fn bound_port(&self) -> u16 {
        self.local_address.port()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_display() {
        let id = SessionId::new("ns1", "web-abc123", 8080);
        assert_eq!(id.to_string(), "ns1/web-abc123/8080");
    }

    #[test]
    fn test_forwarding_serializes_camel_case() {
        let forwarding = Forwarding {
            id: SessionId::new("ns1", "web-abc123", 8080),
            pod_name: "web-abc123".into(),
            local_address: "127.0.0.1:41000".parse().unwrap(),
        };
        let json = serde_json::to_value(&forwarding).unwrap();
        assert_eq!(json["podName"], "web-abc123");
        assert_eq!(json["localAddress"], "127.0.0.1:41000");
        assert_eq!(forwarding.bound_port(), 41000);
    }
}
