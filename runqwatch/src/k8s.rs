//! Kubernetes pod identity resolution.
//!
//! Container ids come from cgroup paths (see `cgroup.rs`); this module keeps
//! a container id -> pod map for the pods scheduled on this node, fed by a
//! watch on the K8s API.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use anyhow::{Context, Result};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client, runtime::watcher};
use log::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodInfo {
    pub pod_name: String,
    pub namespace: String,
    /// Owner kind: "Deployment", "StatefulSet", "DaemonSet", "Job", etc.
    pub workload_kind: Option<String>,
    pub workload_name: Option<String>,
}

impl PodInfo {
    /// workload_name if available, otherwise pod_name.
    pub fn service_name(&self) -> &str {
        self.workload_name.as_deref().unwrap_or(&self.pod_name)
    }
}

/// container id (12-char prefix) -> PodInfo, shared with the ring buffer
/// reader thread.
#[derive(Default)]
pub struct PodResolver {
    pod_store: RwLock<HashMap<String, Arc<PodInfo>>>,
}

impl PodResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&self, container_id: &str) -> Option<Arc<PodInfo>> {
        self.pod_store.read().ok()?.get(container_id).cloned()
    }

    /// Watches pods on `node_name` and keeps the store updated.
    pub async fn start_k8s_watcher(
        self: &Arc<Self>,
        node_name: String,
    ) -> Result<tokio::task::JoinHandle<()>> {
        let client = Client::try_default()
            .await
            .context("Failed to create K8s client (not running in cluster?)")?;

        let api: Api<Pod> = Api::all(client);
        let watcher_config = watcher::Config {
            field_selector: Some(format!("spec.nodeName={}", node_name)),
            ..Default::default()
        };

        let resolver = Arc::clone(self);
        info!("Watching pods on node {}", node_name);

        let handle = tokio::spawn(async move {
            let stream = watcher(api, watcher_config);
            tokio::pin!(stream);

            while let Some(event) = stream.next().await {
                match event {
                    Ok(watcher::Event::Apply(pod) | watcher::Event::InitApply(pod)) => {
                        resolver.apply_pod(&pod);
                    }
                    Ok(watcher::Event::Delete(pod)) => {
                        resolver.remove_pod(&pod);
                    }
                    Ok(watcher::Event::Init | watcher::Event::InitDone) => {}
                    Err(e) => {
                        // kube's watcher retries with backoff.
                        warn!("K8s pod watcher error: {}. Will retry.", e);
                    }
                }
            }

            warn!("K8s pod watcher stream ended");
        });

        Ok(handle)
    }

    fn apply_pod(&self, pod: &Pod) {
        let Some(info) = pod_info(pod) else {
            return;
        };
        let info = Arc::new(info);
        if let Ok(mut store) = self.pod_store.write() {
            for cid in container_ids(pod) {
                store.insert(cid, Arc::clone(&info));
            }
        }
    }

    fn remove_pod(&self, pod: &Pod) {
        if let Ok(mut store) = self.pod_store.write() {
            for cid in container_ids(pod) {
                store.remove(&cid);
            }
        }
    }
}

fn pod_info(pod: &Pod) -> Option<PodInfo> {
    let metadata = &pod.metadata;
    let pod_name = metadata.name.clone()?;
    let namespace = metadata.namespace.clone().unwrap_or_default();

    let (workload_kind, workload_name) = metadata
        .owner_references
        .as_ref()
        .and_then(|refs| refs.first())
        .map(|owner| {
            if owner.kind == "ReplicaSet" {
                // "my-app-7d4b8c9f5" -> Deployment "my-app"
                let name = owner
                    .name
                    .rsplit_once('-')
                    .map(|(prefix, _)| prefix.to_string())
                    .unwrap_or_else(|| owner.name.clone());
                (Some("Deployment".to_string()), Some(name))
            } else {
                (Some(owner.kind.clone()), Some(owner.name.clone()))
            }
        })
        .unwrap_or((None, None));

    Some(PodInfo {
        pod_name,
        namespace,
        workload_kind,
        workload_name,
    })
}

/// Short (12-char) container ids from a pod's status.
fn container_ids(pod: &Pod) -> Vec<String> {
    let mut ids = Vec::new();

    if let Some(status) = &pod.status {
        for containers in [&status.container_statuses, &status.init_container_statuses]
            .into_iter()
            .flatten()
        {
            for cs in containers {
                // "containerd://<64hex>" or "docker://<64hex>"
                if let Some(cid) = &cs.container_id
                    && let Some(hex_id) = cid.rsplit("://").next()
                    && hex_id.len() >= 12
                {
                    ids.push(hex_id[..12].to_string());
                }
            }
        }
    }

    ids
}
