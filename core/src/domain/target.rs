//! Forward targets and the pods they resolve to.

use std::fmt;

use serde::{Deserialize, Serialize};

/// What kind of object a target name turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Pod,
    Service,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKind::Pod => write!(f, "pod"),
            TargetKind::Service => write!(f, "service"),
        }
    }
}

/// A pod or service the caller wants to reach.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub namespace: String,
    pub name: String,
    pub kind: TargetKind,
}

impl Target {
    pub fn pod(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            kind: TargetKind::Pod,
        }
    }

    pub fn service(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            kind: TargetKind::Service,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({})", self.namespace, self.name, self.kind)
    }
}

/// The concrete pod a session tunnels to. Immutable once a session starts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolvedPod {
    pub namespace: String,
    pub name: String,
}

impl ResolvedPod {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// API path of the pod's port-forward subresource.
    pub fn portforward_path(&self) -> String {
        format!(
            "/api/v1/namespaces/{}/pods/{}/portforward",
            self.namespace, self.name
        )
    }
}

impl fmt::Display for ResolvedPod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Outcome of resolving a target name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub target: Target,
    pub pod: ResolvedPod,
}

/// The parts of a pod's status that decide whether it can receive traffic.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PodSummary {
    pub name: String,
    pub namespace: String,
    pub phase: Option<String>,
    /// Value of the `Ready` condition, if the pod reports one.
    pub ready_condition: Option<bool>,
    /// Readiness of each container, in status order.
    pub containers_ready: Vec<bool>,
    /// Set once the pod has a deletion timestamp.
    pub terminating: bool,
}

impl PodSummary {
    /// A pod is ready when it runs, is not being deleted, and reports `Ready`.
    ///
    /// Pods without a `Ready` condition fall back to their container statuses.
    pub fn is_ready(&self) -> bool {
        if self.terminating || self.phase.as_deref() != Some("Running") {
            return false;
        }
        match self.ready_condition {
            Some(ready) => ready,
            None => !self.containers_ready.is_empty() && self.containers_ready.iter().all(|r| *r),
        }
    }
}

/// Pick the backend for a service: the first ready pod in name order.
pub fn select_ready_pod(pods: &[PodSummary]) -> Option<&PodSummary> {
    pods.iter()
        .filter(|pod| pod.is_ready())
        .min_by(|a, b| a.name.cmp(&b.name))
}

/// Render a label selector map as a `k=v,k2=v2` query.
pub fn selector_query<'a>(selector: impl IntoIterator<Item = (&'a String, &'a String)>) -> String {
    selector
        .into_iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}
