// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for syncrun-launcher integration tests.
//!
//! Everything runs against the in-memory cluster and document store; no
//! docker daemon or Kubernetes cluster is needed.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use syncrun_launcher::cluster::mock::MockCluster;
use syncrun_launcher::config::{Backend, KubeMode, LauncherConfig};
use syncrun_launcher::descriptor::{LaunchDescriptor, StepKind};
use syncrun_launcher::docstore::InMemoryDocumentStore;
use syncrun_launcher::process::AsyncPodContext;

pub const NAMESPACE: &str = "jobs";

/// Config with short timeouts for the synchronous backend.
pub fn sync_config() -> LauncherConfig {
    LauncherConfig {
        backend: Backend::Kube,
        kube_mode: KubeMode::Sync,
        namespace: NAMESPACE.to_string(),
        poll_interval: Duration::from_millis(10),
        init_ready_timeout: Duration::from_secs(2),
        ..LauncherConfig::default()
    }
}

/// Config for the detached backend.
pub fn async_config() -> LauncherConfig {
    LauncherConfig {
        kube_mode: KubeMode::Async,
        poll_interval: Duration::from_secs(1),
        ..sync_config()
    }
}

/// Read step with config and catalog.
pub fn read_descriptor(job_id: &str) -> LaunchDescriptor {
    LaunchDescriptor::builder("airbyte/source-postgres:3.6.0", StepKind::Read, job_id, 0)
        .config(r#"{"host":"db.internal"}"#)
        .catalog(r#"{"streams":[]}"#)
        .state(r#"{"cursor":"2024-01-01"}"#)
        .build()
}

/// Write step, which reads records on stdin.
pub fn write_descriptor(job_id: &str) -> LaunchDescriptor {
    LaunchDescriptor::builder("airbyte/destination-s3:1.2.0", StepKind::Write, job_id, 0)
        .config(r#"{"bucket":"out"}"#)
        .catalog(r#"{"streams":[]}"#)
        .build()
}

/// Detached pod collaborators backed by in-memory fakes.
pub struct AsyncHarness {
    pub cluster: Arc<MockCluster>,
    pub store: Arc<InMemoryDocumentStore>,
    pub ctx: AsyncPodContext,
}

impl AsyncHarness {
    pub fn new() -> Self {
        Self::with_cluster(MockCluster::new())
    }

    pub fn with_cluster(cluster: MockCluster) -> Self {
        let cluster = Arc::new(cluster);
        let store = Arc::new(InMemoryDocumentStore::new());
        let ctx = AsyncPodContext {
            cluster: cluster.clone(),
            docs: store.clone(),
            outputs: store.clone(),
        };
        Self {
            cluster,
            store,
            ctx,
        }
    }
}

/// Ports that were free a moment ago.
pub fn free_ports(count: usize) -> Vec<u16> {
    let listeners: Vec<_> = (0..count)
        .map(|_| std::net::TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    listeners
        .iter()
        .map(|l| l.local_addr().unwrap().port())
        .collect()
}
