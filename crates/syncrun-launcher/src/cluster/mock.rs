// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock cluster for testing.
//!
//! Keeps pods in memory and lets tests drive their status by hand.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{ClusterApi, ClusterError, ContainerStatus, PodPhase, PodStatus, Result};

type PodKey = (String, String);

#[derive(Debug, Clone)]
struct MockPod {
    manifest: Value,
    status: PodStatus,
    logs: HashMap<String, Vec<String>>,
    copies: Vec<(String, String, Vec<u8>)>,
}

/// In-memory cluster.
pub struct MockCluster {
    pods: Mutex<HashMap<PodKey, MockPod>>,
    deleted: Mutex<Vec<PodKey>>,
    get_failures: AtomicUsize,
    /// Refuse every pod creation.
    pub reject_creates: bool,
    /// New pods come up with init and main containers already running.
    pub auto_start: bool,
    /// IP reported for started pods.
    pub pod_ip: String,
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCluster {
    /// Cluster whose pods start immediately.
    pub fn new() -> Self {
        Self {
            pods: Mutex::new(HashMap::new()),
            deleted: Mutex::new(Vec::new()),
            get_failures: AtomicUsize::new(0),
            reject_creates: false,
            auto_start: true,
            pod_ip: "127.0.0.1".to_string(),
        }
    }

    /// Cluster that refuses every pod.
    pub fn rejecting() -> Self {
        Self {
            reject_creates: true,
            ..Self::new()
        }
    }

    /// Cluster whose pods stay pending until a test advances them.
    pub fn stalled() -> Self {
        Self {
            auto_start: false,
            ..Self::new()
        }
    }

    fn started_status(&self, manifest: &Value) -> PodStatus {
        let names = |key: &str| -> Vec<String> {
            manifest["spec"][key]
                .as_array()
                .map(|list| {
                    list.iter()
                        .filter_map(|c| c["name"].as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default()
        };

        PodStatus {
            phase: PodPhase::Running,
            pod_ip: Some(self.pod_ip.clone()),
            init_containers: names("initContainers")
                .into_iter()
                .map(|name| ContainerStatus {
                    name,
                    running: true,
                    ..Default::default()
                })
                .collect(),
            containers: names("containers")
                .into_iter()
                .map(|name| ContainerStatus {
                    name,
                    running: true,
                    ready: true,
                    ..Default::default()
                })
                .collect(),
        }
    }

    /// Names of pods that currently exist.
    pub async fn pod_names(&self) -> Vec<String> {
        let pods = self.pods.lock().await;
        pods.keys().map(|(_, name)| name.clone()).collect()
    }

    /// Manifest a pod was created from.
    pub async fn manifest(&self, namespace: &str, name: &str) -> Option<Value> {
        let pods = self.pods.lock().await;
        pods.get(&(namespace.to_string(), name.to_string()))
            .map(|p| p.manifest.clone())
    }

    /// Replace a pod's status.
    pub async fn set_status(&self, namespace: &str, name: &str, status: PodStatus) {
        let mut pods = self.pods.lock().await;
        if let Some(pod) = pods.get_mut(&(namespace.to_string(), name.to_string())) {
            pod.status = status;
        }
    }

    /// Mark the init container of a stalled pod as running.
    pub async fn start_init(&self, namespace: &str, name: &str, init_container: &str) {
        let mut pods = self.pods.lock().await;
        if let Some(pod) = pods.get_mut(&(namespace.to_string(), name.to_string())) {
            pod.status.init_containers = vec![ContainerStatus {
                name: init_container.to_string(),
                running: true,
                ..Default::default()
            }];
        }
    }

    /// Set the pod phase without touching container states.
    pub async fn set_phase(&self, namespace: &str, name: &str, phase: PodPhase) {
        let mut pods = self.pods.lock().await;
        if let Some(pod) = pods.get_mut(&(namespace.to_string(), name.to_string())) {
            pod.status.phase = phase;
        }
    }

    /// Terminate a container with `exit_code`, moving the pod to a terminal phase.
    pub async fn terminate(
        &self,
        namespace: &str,
        name: &str,
        container: &str,
        exit_code: i32,
        reason: Option<&str>,
    ) {
        let mut pods = self.pods.lock().await;
        if let Some(pod) = pods.get_mut(&(namespace.to_string(), name.to_string())) {
            let status = ContainerStatus {
                name: container.to_string(),
                running: false,
                ready: false,
                exit_code: Some(exit_code),
                reason: reason.map(str::to_string),
            };
            match pod.status.containers.iter_mut().find(|c| c.name == container) {
                Some(existing) => *existing = status,
                None => pod.status.containers.push(status),
            }
            pod.status.phase = if exit_code == 0 {
                PodPhase::Succeeded
            } else {
                PodPhase::Failed
            };
        }
    }

    /// Remove a pod out-of-band, as if someone else deleted it.
    pub async fn remove_pod(&self, namespace: &str, name: &str) {
        let mut pods = self.pods.lock().await;
        pods.remove(&(namespace.to_string(), name.to_string()));
    }

    /// Set the log lines returned for a container.
    pub async fn set_logs(&self, namespace: &str, name: &str, container: &str, lines: &[&str]) {
        let mut pods = self.pods.lock().await;
        if let Some(pod) = pods.get_mut(&(namespace.to_string(), name.to_string())) {
            pod.logs.insert(
                container.to_string(),
                lines.iter().map(|l| l.to_string()).collect(),
            );
        }
    }

    /// Remote paths copied into a pod, in copy order.
    pub async fn copied_paths(&self, namespace: &str, name: &str) -> Vec<String> {
        let pods = self.pods.lock().await;
        pods.get(&(namespace.to_string(), name.to_string()))
            .map(|p| p.copies.iter().map(|(_, path, _)| path.clone()).collect())
            .unwrap_or_default()
    }

    /// Contents of a copied file.
    pub async fn copied_file(&self, namespace: &str, name: &str, path: &str) -> Option<Vec<u8>> {
        let pods = self.pods.lock().await;
        pods.get(&(namespace.to_string(), name.to_string()))
            .and_then(|p| p.copies.iter().find(|(_, p, _)| p == path))
            .map(|(_, _, data)| data.clone())
    }

    /// Names of pods deleted through the API, one entry per successful delete.
    pub async fn deleted(&self) -> Vec<String> {
        let deleted = self.deleted.lock().await;
        deleted.iter().map(|(_, name)| name.clone()).collect()
    }

    /// Make the next `count` `get_pod` calls fail.
    pub fn fail_next_gets(&self, count: usize) {
        self.get_failures.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl ClusterApi for MockCluster {
    async fn create_pod(&self, namespace: &str, manifest: &Value) -> Result<()> {
        if self.reject_creates {
            return Err(ClusterError::Rejected("admission denied".to_string()));
        }

        let name = manifest["metadata"]["name"]
            .as_str()
            .ok_or_else(|| ClusterError::Rejected("manifest has no name".to_string()))?
            .to_string();

        let status = if self.auto_start {
            self.started_status(manifest)
        } else {
            PodStatus::pending()
        };

        let mut pods = self.pods.lock().await;
        let key = (namespace.to_string(), name.clone());
        if pods.contains_key(&key) {
            return Err(ClusterError::Rejected(format!("pod {} already exists", name)));
        }
        pods.insert(
            key,
            MockPod {
                manifest: manifest.clone(),
                status,
                logs: HashMap::new(),
                copies: Vec::new(),
            },
        );
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<PodStatus>> {
        let failing = self
            .get_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ClusterError::Rejected("api server unavailable".to_string()));
        }

        let pods = self.pods.lock().await;
        Ok(pods
            .get(&(namespace.to_string(), name.to_string()))
            .map(|p| p.status.clone()))
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<bool> {
        let key = (namespace.to_string(), name.to_string());
        let removed = self.pods.lock().await.remove(&key).is_some();
        if removed {
            self.deleted.lock().await.push(key);
        }
        Ok(removed)
    }

    async fn copy_to_pod(
        &self,
        namespace: &str,
        name: &str,
        container: &str,
        remote_path: &str,
        contents: &[u8],
    ) -> Result<()> {
        let mut pods = self.pods.lock().await;
        let pod = pods
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| ClusterError::Rejected(format!("pod {} not found", name)))?;
        pod.copies.push((
            container.to_string(),
            remote_path.to_string(),
            contents.to_vec(),
        ));
        Ok(())
    }

    async fn tail_logs(
        &self,
        namespace: &str,
        name: &str,
        container: &str,
        lines: usize,
    ) -> Result<Vec<String>> {
        let pods = self.pods.lock().await;
        let logs = pods
            .get(&(namespace.to_string(), name.to_string()))
            .and_then(|p| p.logs.get(container))
            .cloned()
            .unwrap_or_default();
        let skip = logs.len().saturating_sub(lines);
        Ok(logs.into_iter().skip(skip).collect())
    }
}
