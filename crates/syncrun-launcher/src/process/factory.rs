// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process factories for each backend.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::async_pod::{AsyncOrchestratorPodProcess, AsyncPodContext};
use super::docker::{DockerProcess, DockerSettings};
use super::kube_pod::KubePodProcess;
use super::traits::*;
use crate::cluster::ClusterApi;
use crate::cluster::KubectlClient;
use crate::config::{Backend, KubeMode, LauncherConfig};
use crate::descriptor::{KUBE_NAME_LIMIT, LaunchDescriptor};
use crate::docstore::FsDocumentStore;
use crate::error::LaunchError;
use crate::ports::PortPool;

/// Launches connectors as local docker containers.
pub struct DockerProcessFactory {
    settings: DockerSettings,
}

impl DockerProcessFactory {
    /// Factory using `settings`.
    pub fn new(settings: DockerSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl ProcessFactory for DockerProcessFactory {
    fn backend(&self) -> &'static str {
        "docker"
    }

    async fn create(
        &self,
        descriptor: &LaunchDescriptor,
    ) -> std::result::Result<Box<dyn ProcessHandle>, LaunchError> {
        let process = DockerProcess::create(&self.settings, descriptor).await?;
        Ok(Box::new(process))
    }
}

enum KubeBackend {
    Sync { ports: Arc<PortPool> },
    Async { ctx: AsyncPodContext },
}

/// Launches connectors as pods, either attached or detached.
pub struct KubeProcessFactory {
    cluster: Arc<dyn ClusterApi>,
    config: LauncherConfig,
    backend: KubeBackend,
}

impl KubeProcessFactory {
    /// Attached pods with stdio relayed over `ports`.
    pub fn synchronous(
        cluster: Arc<dyn ClusterApi>,
        ports: Arc<PortPool>,
        config: LauncherConfig,
    ) -> Self {
        Self {
            cluster,
            config,
            backend: KubeBackend::Sync { ports },
        }
    }

    /// Detached pods observed through the document store.
    pub fn asynchronous(ctx: AsyncPodContext, config: LauncherConfig) -> Self {
        Self {
            cluster: ctx.cluster.clone(),
            config,
            backend: KubeBackend::Async { ctx },
        }
    }
}

#[async_trait]
impl ProcessFactory for KubeProcessFactory {
    fn backend(&self) -> &'static str {
        match self.backend {
            KubeBackend::Sync { .. } => "kube",
            KubeBackend::Async { .. } => "kube-async",
        }
    }

    async fn create(
        &self,
        descriptor: &LaunchDescriptor,
    ) -> std::result::Result<Box<dyn ProcessHandle>, LaunchError> {
        let name = descriptor.process_name(KUBE_NAME_LIMIT);
        info!(
            pod = %name,
            namespace = %self.config.namespace,
            image = %descriptor.image(),
            step = %descriptor.step(),
            backend = self.backend(),
            "Launching pod"
        );

        match &self.backend {
            KubeBackend::Sync { ports } => {
                let process = KubePodProcess::create(
                    self.cluster.clone(),
                    ports.clone(),
                    &self.config,
                    descriptor,
                    name,
                )
                .await?;
                Ok(Box::new(process))
            }
            KubeBackend::Async { ctx } => {
                let process =
                    AsyncOrchestratorPodProcess::create(ctx.clone(), &self.config, descriptor, name)
                        .await?;
                Ok(Box::new(process))
            }
        }
    }
}

/// Build the factory selected by `config`.
pub fn factory_from_config(config: &LauncherConfig) -> Arc<dyn ProcessFactory> {
    match config.backend {
        Backend::Docker => Arc::new(DockerProcessFactory::new(DockerSettings::from_config(config))),
        Backend::Kube => {
            let cluster: Arc<dyn ClusterApi> = Arc::new(KubectlClient::new(
                config.kubectl_bin.clone(),
                config.staging_dir.clone(),
            ));
            match config.kube_mode {
                KubeMode::Sync => {
                    let ports = if config.relay_port_count == 0 {
                        PortPool::ephemeral()
                    } else {
                        PortPool::new(config.relay_port_start, config.relay_port_count)
                    };
                    Arc::new(KubeProcessFactory::synchronous(
                        cluster,
                        Arc::new(ports),
                        config.clone(),
                    ))
                }
                KubeMode::Async => {
                    let store = Arc::new(FsDocumentStore::new(config.doc_store_root.clone()));
                    let ctx = AsyncPodContext {
                        cluster,
                        docs: store.clone(),
                        outputs: store,
                    };
                    Arc::new(KubeProcessFactory::asynchronous(ctx, config.clone()))
                }
            }
        }
    }
}
