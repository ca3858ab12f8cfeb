// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Asynchronous orchestrator process.
//!
//! The pod is launched once and then observed from the outside. Its own
//! status documents are the source of truth; the cluster API is only consulted
//! when the store has nothing terminal to say.
//!
//! Exit code resolution, in order:
//!
//! | Observation | Exit code |
//! |-------------|-----------|
//! | FAILED document | 1 |
//! | SUCCEEDED document | 0 |
//! | Pod no longer exists | 2 |
//! | Pod terminal, store still silent, OOM in logs | 137 |
//! | Pod terminal, store still silent | 3 |
//! | Otherwise | not terminated |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::kube_pod::oom_in_logs;
use super::traits::*;
use crate::cluster::manifest::{
    CONFIG_DIR, INIT_CONTAINER, POD_INFO_FILE, SUCCESS_FILE, async_pod_manifest,
};
use crate::cluster::{ClusterApi, ClusterError};
use crate::config::LauncherConfig;
use crate::descriptor::LaunchDescriptor;
use crate::docstore::{AsyncPodStatus, DocumentStore, JobOutputStore, resolve_status, status_key};
use crate::error::LaunchError;

/// Upper bound for an untimed `wait_for`.
const DEFAULT_WAIT: Duration = Duration::from_secs(10 * 24 * 60 * 60);

/// Poll interval while the init container is starting.
const STARTUP_POLL: Duration = Duration::from_millis(100);

/// Shared collaborators for detached pods.
#[derive(Clone)]
pub struct AsyncPodContext {
    /// Cluster API.
    pub cluster: Arc<dyn ClusterApi>,
    /// Status documents written by the workload.
    pub docs: Arc<dyn DocumentStore>,
    /// Structured outputs keyed by workload id.
    pub outputs: Arc<dyn JobOutputStore>,
}

/// Detached pod whose status lives in the document store.
pub struct AsyncOrchestratorPodProcess {
    info: ProcessInfo,
    namespace: String,
    workload_id: String,
    ctx: AsyncPodContext,
    exit: ExitCodeCell,
    poll_interval: Duration,
    oom_lines: usize,
}

impl AsyncOrchestratorPodProcess {
    /// Handle for a pod that already exists, e.g. after the launcher restarted.
    pub fn attach(
        ctx: AsyncPodContext,
        config: &LauncherConfig,
        name: impl Into<String>,
        image: impl Into<String>,
        workload_id: impl Into<String>,
    ) -> Self {
        Self {
            info: ProcessInfo {
                namespace: Some(config.namespace.clone()),
                name: name.into(),
                image: image.into(),
                pull_policy: Some(config.image_pull_policy.clone()),
            },
            namespace: config.namespace.clone(),
            workload_id: workload_id.into(),
            ctx,
            exit: ExitCodeCell::new(),
            poll_interval: config.poll_interval,
            oom_lines: config.oom_log_lines,
        }
    }

    /// Launch `descriptor` as pod `name`.
    pub async fn create(
        ctx: AsyncPodContext,
        config: &LauncherConfig,
        descriptor: &LaunchDescriptor,
        name: String,
    ) -> std::result::Result<Self, LaunchError> {
        let process = Self::attach(
            ctx,
            config,
            name,
            descriptor.image(),
            descriptor.workload_id(),
        );

        match process.launch(config, descriptor).await {
            Ok(()) => {
                info!(pod = %process.info.name, workload_id = %process.workload_id, "Detached pod launched");
                Ok(process)
            }
            Err(e) => {
                error!(pod = %process.info.name, error = %e, "Detached pod launch failed");
                if let Err(delete_err) = process
                    .ctx
                    .cluster
                    .delete_pod(&process.namespace, &process.info.name)
                    .await
                {
                    warn!(pod = %process.info.name, error = %delete_err, "Failed to delete pod after launch failure");
                }
                Err(e)
            }
        }
    }

    async fn launch(
        &self,
        config: &LauncherConfig,
        descriptor: &LaunchDescriptor,
    ) -> std::result::Result<(), LaunchError> {
        let name = &self.info.name;
        let manifest = async_pod_manifest(name, descriptor, config);

        self.ctx
            .cluster
            .create_pod(&self.namespace, &manifest)
            .await
            .map_err(|e| match e {
                ClusterError::Rejected(msg) => LaunchError::PodRejected(msg),
                other => LaunchError::Cluster(other),
            })?;

        let deadline = Instant::now() + config.init_ready_timeout;
        loop {
            match self.ctx.cluster.get_pod(&self.namespace, name).await? {
                Some(status) if status.init_container(INIT_CONTAINER).is_some_and(|c| c.running) => {
                    break;
                }
                Some(status) if status.is_terminal() => {
                    return Err(LaunchError::TerminatedDuringStartup(name.clone()));
                }
                None => return Err(LaunchError::TerminatedDuringStartup(name.clone())),
                Some(_) => {}
            }
            if Instant::now() >= deadline {
                return Err(LaunchError::InitTimeout {
                    pod: name.clone(),
                    timeout_secs: config.init_ready_timeout.as_secs(),
                });
            }
            tokio::time::sleep(STARTUP_POLL).await;
        }

        let pod_info = serde_json::to_vec(&self.info)?;
        let files = descriptor
            .files()
            .iter()
            .map(|(file, contents)| (file.as_str(), contents.as_bytes()))
            .chain(std::iter::once((POD_INFO_FILE, pod_info.as_slice())))
            .chain(std::iter::once((SUCCESS_FILE, b"".as_slice())));

        for (file, contents) in files {
            self.ctx
                .cluster
                .copy_to_pod(
                    &self.namespace,
                    name,
                    INIT_CONTAINER,
                    &format!("{}/{}", CONFIG_DIR, file),
                    contents,
                )
                .await?;
        }
        Ok(())
    }

    /// Workload id used for the structured output lookup.
    pub fn workload_id(&self) -> &str {
        &self.workload_id
    }

    /// Highest-precedence status document currently present.
    pub async fn doc_store_status(&self) -> Result<AsyncPodStatus> {
        Ok(resolve_status(self.ctx.docs.as_ref(), &self.namespace, &self.info.name).await?)
    }

    async fn compute_exit_value(&self) -> Result<i32> {
        let name = &self.info.name;

        match self.doc_store_status().await? {
            AsyncPodStatus::Failed => return Ok(EXIT_FAILED),
            AsyncPodStatus::Succeeded => return Ok(EXIT_SUCCESS),
            _ => {}
        }

        let Some(pod) = self.ctx.cluster.get_pod(&self.namespace, name).await? else {
            warn!(pod = %name, "Pod is gone and no terminal status was written");
            return Ok(EXIT_RESOURCE_VANISHED);
        };

        if !pod.is_terminal() {
            return Err(ProcessError::NotTerminated);
        }

        // The workload may have written its document between the two reads.
        match self.doc_store_status().await? {
            AsyncPodStatus::Failed => return Ok(EXIT_FAILED),
            AsyncPodStatus::Succeeded => return Ok(EXIT_SUCCESS),
            _ => {}
        }

        if oom_in_logs(
            self.ctx.cluster.as_ref(),
            &self.namespace,
            name,
            self.oom_lines,
        )
        .await
        {
            warn!(pod = %name, "Pod terminated after running out of memory");
            return Ok(EXIT_OOM);
        }

        warn!(pod = %name, phase = ?pod.phase, "Pod terminated without a terminal status document");
        Ok(EXIT_STORE_SILENT)
    }
}

#[async_trait]
impl ProcessHandle for AsyncOrchestratorPodProcess {
    fn info(&self) -> &ProcessInfo {
        &self.info
    }

    async fn exit_value(&self) -> Result<i32> {
        if let Some(code) = self.exit.get() {
            return Ok(code);
        }

        let code = self.compute_exit_value().await?;
        if self.exit.complete(code) {
            info!(pod = %self.info.name, exit_code = code, "Detached pod exit resolved");
        }
        Ok(self.exit.get().unwrap_or(code))
    }

    async fn wait_for(&self) -> Result<i32> {
        if self.wait_for_timeout(DEFAULT_WAIT).await? {
            self.exit_value().await
        } else {
            Err(ProcessError::Timeout)
        }
    }

    async fn wait_for_timeout(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;

        loop {
            match self.exit_value().await {
                Ok(_) => return Ok(true),
                Err(ProcessError::NotTerminated) => {}
                Err(e) => {
                    warn!(pod = %self.info.name, error = %e, "Status check failed, will retry");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let remaining = deadline - now;
            tokio::time::sleep(remaining.min(self.poll_interval)).await;
        }
    }

    async fn destroy(&self) -> Result<()> {
        let name = &self.info.name;
        match self.ctx.cluster.delete_pod(&self.namespace, name).await {
            Ok(true) => info!(pod = %name, "Detached pod deleted"),
            Ok(false) => warn!(pod = %name, "Destroy found no pod to delete"),
            Err(e) => warn!(pod = %name, error = %e, "Failed to delete detached pod"),
        }
        Ok(())
    }

    async fn output(&self) -> Result<Option<String>> {
        let key = status_key(&self.namespace, &self.info.name, AsyncPodStatus::Succeeded);
        if let Some(doc) = self.ctx.docs.read(&key).await?
            && !doc.trim().is_empty()
        {
            return Ok(Some(doc));
        }

        debug!(workload_id = %self.workload_id, "Falling back to job output store");
        Ok(self
            .ctx
            .outputs
            .read_sync_output(&self.workload_id)
            .await?
            .map(|v| v.to_string()))
    }
}
