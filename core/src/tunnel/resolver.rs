//! Target resolution: pod names pass through, service names pick a ready pod.

use tracing::debug;

use crate::domain::{select_ready_pod, Resolution, ResolvedPod, Target};
use crate::error::{Error, Result};
use crate::ports::PodLookupPort;

/// Turns a `(namespace, name)` pair into a concrete pod.
///
/// Only read-only lookups are made, so resolution is safe to retry.
pub struct TargetResolver<'a, L> {
    lookup: &'a L,
}

impl<'a, L: PodLookupPort> TargetResolver<'a, L> {
    pub fn new(lookup: &'a L) -> Self {
        Self { lookup }
    }

    /// Resolve `name` as a pod first, then as a service.
    ///
    /// A service resolves to its first ready pod in name order. A service
    /// without a selector or without ready pods fails immediately rather
    /// than waiting for one to appear.
    pub async fn resolve(&self, namespace: &str, name: &str) -> Result<Resolution> {
        if let Some(pod) = self.lookup.get_pod(namespace, name).await? {
            debug!(namespace, pod = %pod.name, "target is a pod");
            return Ok(Resolution {
                target: Target::pod(namespace, name),
                pod: ResolvedPod::new(namespace, pod.name),
            });
        }

        let Some(selector) = self.lookup.get_service_selector(namespace, name).await? else {
            return Err(Error::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        };

        let no_backend = || Error::NoReadyBackend {
            namespace: namespace.to_string(),
            service: name.to_string(),
        };
        if selector.is_empty() {
            return Err(no_backend());
        }

        let pods = self.lookup.list_pods(namespace, &selector).await?;
        let pod = select_ready_pod(&pods).ok_or_else(no_backend)?;
        debug!(
            namespace,
            service = name,
            pod = %pod.name,
            candidates = pods.len(),
            "service resolved to pod"
        );

        Ok(Resolution {
            target: Target::service(namespace, name),
            pod: ResolvedPod::new(namespace, pod.name.clone()),
        })
    }
}
