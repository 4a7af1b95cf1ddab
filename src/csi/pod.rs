use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
#[cfg(any(test, feature = "mockall"))]
use mockall::automock;
use moka::future::Cache;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::NodeError;
use crate::options::SIDECAR_CONTAINER_NAME;

const POD_CACHE_CAPACITY: u64 = 4096;

/// The parts of a pod the node daemon cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodInfo {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub annotations: BTreeMap<String, String>,
    /// Whether the admission webhook injected the helper container.
    pub has_helper: bool,
}

impl PodInfo {
    pub fn from_pod(pod: &Pod) -> Self {
        let has_helper = pod
            .spec
            .as_ref()
            .map(|spec| {
                spec.containers
                    .iter()
                    .chain(spec.init_containers.iter().flatten())
                    .any(|c| c.name == SIDECAR_CONTAINER_NAME)
            })
            .unwrap_or(false);

        Self {
            namespace: pod.metadata.namespace.clone().unwrap_or_default(),
            name: pod.metadata.name.clone().unwrap_or_default(),
            uid: pod.metadata.uid.clone().unwrap_or_default(),
            annotations: pod.metadata.annotations.clone().unwrap_or_default(),
            has_helper,
        }
    }
}

#[cfg_attr(any(test, feature = "mockall"), automock)]
#[async_trait]
pub trait PodLookup: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<PodInfo, NodeError>;

    /// Drop a cached entry, e.g. when its uid no longer matches.
    async fn invalidate(&self, namespace: &str, name: &str);
}

/// [`PodLookup`] against the API server with a short-lived cache in front.
pub struct KubePodLookup {
    client: Client,
    cache: Cache<(String, String), PodInfo>,
}

impl KubePodLookup {
    pub fn new(client: Client, ttl: Duration) -> Self {
        let cache = Cache::builder().max_capacity(POD_CACHE_CAPACITY).time_to_live(ttl).build();
        Self { client, cache }
    }
}

#[async_trait]
impl PodLookup for KubePodLookup {
    async fn get(&self, namespace: &str, name: &str) -> Result<PodInfo, NodeError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let key = (namespace.to_string(), name.to_string());
        let (ns, pod_name) = key.clone();

        self.cache
            .try_get_with(key, async move {
                match api.get_opt(&pod_name).await {
                    Ok(Some(pod)) => Ok(PodInfo::from_pod(&pod)),
                    Ok(None) => Err(NodeError::PodNotFound { namespace: ns, name: pod_name }),
                    Err(e) => Err(NodeError::Kube(e.to_string())),
                }
            })
            .await
            .map_err(|e: Arc<NodeError>| match e.as_ref() {
                NodeError::PodNotFound { namespace, name } => {
                    NodeError::PodNotFound { namespace: namespace.clone(), name: name.clone() }
                }
                other => NodeError::Kube(other.to_string()),
            })
    }

    async fn invalidate(&self, namespace: &str, name: &str) {
        self.cache.invalidate(&(namespace.to_string(), name.to_string())).await;
    }
}
