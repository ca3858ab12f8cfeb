// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! kubectl-backed cluster client.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{ClusterApi, ClusterError, PodStatus, Result};

/// Cluster client that shells out to kubectl.
pub struct KubectlClient {
    binary: String,
    staging_dir: PathBuf,
}

impl KubectlClient {
    /// Create a client using `binary`, staging copied files under `staging_dir`.
    pub fn new(binary: impl Into<String>, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            staging_dir: staging_dir.into(),
        }
    }

    async fn run(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<String> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        if let Some(input) = stdin
            && let Some(mut pipe) = child.stdin.take()
        {
            pipe.write_all(input).await?;
            pipe.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(ClusterError::Command {
                command: format!("{} {}", self.binary, args.join(" ")),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ClusterApi for KubectlClient {
    async fn create_pod(&self, namespace: &str, manifest: &Value) -> Result<()> {
        let body = serde_json::to_vec(manifest)?;
        match self
            .run(&["-n", namespace, "create", "-f", "-"], Some(&body))
            .await
        {
            Ok(_) => Ok(()),
            Err(ClusterError::Command { stderr, .. }) => Err(ClusterError::Rejected(stderr)),
            Err(e) => Err(e),
        }
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<PodStatus>> {
        let out = self
            .run(
                &["-n", namespace, "get", "pod", name, "-o", "json", "--ignore-not-found"],
                None,
            )
            .await?;

        if out.trim().is_empty() {
            return Ok(None);
        }

        let pod: Value = serde_json::from_str(&out)?;
        PodStatus::from_pod_json(&pod).map(Some)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<bool> {
        let out = self
            .run(
                &[
                    "-n",
                    namespace,
                    "delete",
                    "pod",
                    name,
                    "--cascade=foreground",
                    "--ignore-not-found",
                    "--wait=false",
                ],
                None,
            )
            .await?;
        Ok(!out.trim().is_empty())
    }

    async fn copy_to_pod(
        &self,
        namespace: &str,
        name: &str,
        container: &str,
        remote_path: &str,
        contents: &[u8],
    ) -> Result<()> {
        tokio::fs::create_dir_all(&self.staging_dir).await?;
        let local = self
            .staging_dir
            .join(format!("{}-{}", name, uuid::Uuid::new_v4()));
        tokio::fs::write(&local, contents).await?;

        let local_str = local.display().to_string();
        let target = format!("{}/{}:{}", namespace, name, remote_path);
        debug!(pod = %name, container = %container, remote_path = %remote_path, "Copying file to pod");

        let result = self
            .run(&["cp", &local_str, &target, "-c", container], None)
            .await;

        if let Err(e) = tokio::fs::remove_file(&local).await {
            warn!(path = %local_str, error = %e, "Failed to remove staged file");
        }

        result.map(|_| ())
    }

    async fn tail_logs(
        &self,
        namespace: &str,
        name: &str,
        container: &str,
        lines: usize,
    ) -> Result<Vec<String>> {
        let tail = format!("--tail={}", lines);
        let out = self
            .run(&["-n", namespace, "logs", name, "-c", container, &tail], None)
            .await?;
        Ok(out.lines().map(str::to_string).collect())
    }
}
