// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster API access.
//!
//! [`ClusterApi`] is the narrow slice of the Kubernetes API the process handles
//! need: create, read and delete a pod, copy a file into a container, and read
//! the tail of a container log. [`KubectlClient`] implements it by shelling out
//! to kubectl; [`MockCluster`] keeps pods in memory for tests.

mod kubectl;
pub mod manifest;
pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use kubectl::KubectlClient;
pub use mock::MockCluster;

/// Errors from cluster API calls.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClusterError {
    /// A kubectl invocation exited non-zero.
    #[error("{command} failed with status {status}: {stderr}")]
    Command {
        /// Command that was run.
        command: String,
        /// Exit status.
        status: i32,
        /// Standard error output.
        stderr: String,
    },

    /// The API server refused the request.
    #[error("Rejected: {0}")]
    Rejected(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for cluster operations.
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Pod lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    /// Accepted but not all containers are running.
    Pending,
    /// At least one container is running.
    Running,
    /// All containers exited successfully.
    Succeeded,
    /// All containers exited and at least one failed.
    Failed,
    /// State could not be obtained.
    Unknown,
}

impl PodPhase {
    fn parse(raw: &str) -> Self {
        match raw {
            "Pending" => PodPhase::Pending,
            "Running" => PodPhase::Running,
            "Succeeded" => PodPhase::Succeeded,
            "Failed" => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }
}

/// Observed state of one container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerStatus {
    /// Container name.
    pub name: String,
    /// The container is running.
    pub running: bool,
    /// The container passed its readiness check.
    pub ready: bool,
    /// Exit code, once terminated.
    pub exit_code: Option<i32>,
    /// Termination reason reported by the kubelet (e.g. `OOMKilled`).
    pub reason: Option<String>,
}

impl ContainerStatus {
    /// True once the container has terminated.
    pub fn is_terminated(&self) -> bool {
        self.exit_code.is_some()
    }
}

/// Observed state of a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodStatus {
    /// Phase.
    pub phase: PodPhase,
    /// Pod IP once scheduled.
    pub pod_ip: Option<String>,
    /// Init container states.
    pub init_containers: Vec<ContainerStatus>,
    /// Regular container states.
    pub containers: Vec<ContainerStatus>,
}

impl PodStatus {
    /// Pending pod with nothing running yet.
    pub fn pending() -> Self {
        Self {
            phase: PodPhase::Pending,
            pod_ip: None,
            init_containers: Vec::new(),
            containers: Vec::new(),
        }
    }

    /// Succeeded or Failed.
    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, PodPhase::Succeeded | PodPhase::Failed)
    }

    /// Status of a regular container by name.
    pub fn container(&self, name: &str) -> Option<&ContainerStatus> {
        self.containers.iter().find(|c| c.name == name)
    }

    /// Status of an init container by name.
    pub fn init_container(&self, name: &str) -> Option<&ContainerStatus> {
        self.init_containers.iter().find(|c| c.name == name)
    }

    /// The named container is running and ready.
    pub fn is_ready(&self, name: &str) -> bool {
        self.container(name).is_some_and(|c| c.running && c.ready)
    }

    /// Parse the `status` section of a pod object as returned by the API server.
    pub fn from_pod_json(pod: &Value) -> Result<Self> {
        let raw: RawPod = serde_json::from_value(pod.clone())?;
        let status = raw.status.unwrap_or_default();

        Ok(Self {
            phase: status
                .phase
                .as_deref()
                .map(PodPhase::parse)
                .unwrap_or(PodPhase::Pending),
            pod_ip: status.pod_ip,
            init_containers: status
                .init_container_statuses
                .into_iter()
                .map(RawContainerStatus::into_status)
                .collect(),
            containers: status
                .container_statuses
                .into_iter()
                .map(RawContainerStatus::into_status)
                .collect(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawPod {
    #[serde(default)]
    status: Option<RawPodStatus>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPodStatus {
    #[serde(default)]
    phase: Option<String>,
    #[serde(default, rename = "podIP")]
    pod_ip: Option<String>,
    #[serde(default)]
    init_container_statuses: Vec<RawContainerStatus>,
    #[serde(default)]
    container_statuses: Vec<RawContainerStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawContainerStatus {
    name: String,
    #[serde(default)]
    ready: bool,
    #[serde(default)]
    state: RawContainerState,
}

#[derive(Debug, Default, Deserialize)]
struct RawContainerState {
    #[serde(default)]
    running: Option<Value>,
    #[serde(default)]
    terminated: Option<RawTerminated>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTerminated {
    exit_code: i32,
    #[serde(default)]
    reason: Option<String>,
}

impl RawContainerStatus {
    fn into_status(self) -> ContainerStatus {
        ContainerStatus {
            name: self.name,
            running: self.state.running.is_some(),
            ready: self.ready,
            exit_code: self.state.terminated.as_ref().map(|t| t.exit_code),
            reason: self.state.terminated.and_then(|t| t.reason),
        }
    }
}

/// Cluster operations used by the pod-backed process handles.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Submit a pod manifest.
    async fn create_pod(&self, namespace: &str, manifest: &Value) -> Result<()>;

    /// Read a pod's status. `None` if the pod does not exist.
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<PodStatus>>;

    /// Delete a pod with foreground propagation. Returns false if nothing was deleted.
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<bool>;

    /// Write `contents` to `remote_path` inside `container`.
    async fn copy_to_pod(
        &self,
        namespace: &str,
        name: &str,
        container: &str,
        remote_path: &str,
        contents: &[u8],
    ) -> Result<()>;

    /// Last `lines` lines of a container's log.
    async fn tail_logs(
        &self,
        namespace: &str,
        name: &str,
        container: &str,
        lines: usize,
    ) -> Result<Vec<String>>;
}
