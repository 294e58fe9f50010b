//! Pod and service lookups through the API server.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{Api, ListParams};
use tracing::trace;

use super::{map_kube_error, KubeCluster};
use crate::domain::{selector_query, PodSummary};
use crate::error::Result;
use crate::ports::PodLookupPort;

impl PodLookupPort for KubeCluster {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<PodSummary>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod = pods.get_opt(name).await.map_err(map_kube_error)?;
        Ok(pod.as_ref().map(pod_summary))
    }

    async fn get_service_selector(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let service = services.get_opt(name).await.map_err(map_kube_error)?;
        Ok(service.map(|service| {
            service
                .spec
                .and_then(|spec| spec.selector)
                .unwrap_or_default()
        }))
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<PodSummary>> {
        let query = selector_query(selector);
        trace!(namespace, selector = %query, "listing pods");
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods
            .list(&ListParams::default().labels(&query))
            .await
            .map_err(map_kube_error)?;
        Ok(list.items.iter().map(pod_summary).collect())
    }
}

/// Extract the readiness-relevant parts of a pod.
pub(crate) fn pod_summary(pod: &Pod) -> PodSummary {
    let status = pod.status.as_ref();
    let ready_condition = status
        .and_then(|status| status.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == "Ready"))
        .map(|condition| condition.status == "True");
    let containers_ready = status
        .and_then(|status| status.container_statuses.as_ref())
        .map(|statuses| statuses.iter().map(|c| c.ready).collect())
        .unwrap_or_default();

    PodSummary {
        name: pod.metadata.name.clone().unwrap_or_default(),
        namespace: pod.metadata.namespace.clone().unwrap_or_default(),
        phase: status.and_then(|status| status.phase.clone()),
        ready_condition,
        containers_ready,
        terminating: pod.metadata.deletion_timestamp.is_some(),
    }
}
