//! Kubernetes pod watch feeding the resolver's alive set.
//!
//! Lists pods scheduled on this node and maps their container ids to pod
//! metadata. Degrades gracefully: when the API server is unreachable or
//! `NODE_NAME` is unset the agent runs without pod naming and container GC
//! falls back to process liveness alone.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, ListParams},
    Client,
};
use rustc_hash::FxHashMap;
use tokio::sync::watch;

use crate::resolver::{PodMetadata, Resolver};

pub struct PodWatch {
    client: Client,
    node_name: String,
}

impl PodWatch {
    /// Try to build an in-cluster client. Returns `None` when Kubernetes is
    /// not available; the caller runs without enrichment.
    pub async fn try_new(node_name: Option<String>) -> Option<Self> {
        let node_name = match node_name.or_else(|| std::env::var("NODE_NAME").ok()) {
            Some(name) => name,
            None => {
                tracing::info!("NODE_NAME not set, running without pod metadata");
                return None;
            }
        };
        match Client::try_default().await {
            Ok(client) => {
                tracing::info!(node = %node_name, "kubernetes pod watch initialized");
                Some(Self { client, node_name })
            }
            Err(e) => {
                tracing::info!(error = %e, "kubernetes API unavailable, running without pod metadata");
                None
            }
        }
    }

    /// List pods on this node and build container id -> pod metadata.
    pub async fn list_containers(&self) -> anyhow::Result<FxHashMap<String, PodMetadata>> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={}", self.node_name));
        let pod_list = pods.list(&params).await?;

        let mut containers = FxHashMap::default();
        for pod in pod_list {
            let Some(pod_name) = pod.metadata.name.clone() else {
                continue;
            };
            let namespace = pod.metadata.namespace.clone().unwrap_or_default();
            let Some(status) = &pod.status else {
                continue;
            };
            let statuses = [
                status.container_statuses.as_deref(),
                status.init_container_statuses.as_deref(),
                status.ephemeral_container_statuses.as_deref(),
            ];
            for cs in statuses.into_iter().flatten().flatten() {
                let Some(container_id) = &cs.container_id else {
                    continue;
                };
                containers.insert(
                    bare_container_id(container_id).to_string(),
                    PodMetadata {
                        pod_name: pod_name.clone(),
                        container_name: cs.name.clone(),
                        namespace: namespace.clone(),
                    },
                );
            }
        }

        tracing::debug!(
            containers = containers.len(),
            node = %self.node_name,
            "refreshed pod metadata"
        );
        Ok(containers)
    }

    /// Periodic refresh loop; pushes each listing into the resolver until
    /// shutdown.
    pub async fn run(
        self,
        resolver: Arc<Resolver>,
        refresh_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(refresh_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.list_containers().await {
                        Ok(containers) => resolver.mark_alive(containers),
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to refresh pod metadata");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("pod watch shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Reduce an API-reported id (`containerd://<id>`, `docker://<id>`,
/// `cri-o://<id>`) to the bare id the resolver extracts from cgroup paths.
fn bare_container_id(id: &str) -> &str {
    match id.split_once("://") {
        Some((_runtime, bare)) => bare,
        None => id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_ids_reduce_to_cgroup_form() {
        assert_eq!(bare_container_id("containerd://abc123"), "abc123");
        assert_eq!(bare_container_id("docker://xyz789"), "xyz789");
        assert_eq!(bare_container_id("cri-o://test123"), "test123");
        // Already-bare ids pass through untouched.
        assert_eq!(bare_container_id("abc123"), "abc123");
    }
}
