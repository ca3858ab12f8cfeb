// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Local docker backend.
//!
//! Input files are written to `{workspace_root}/{job}/{attempt}` before the
//! container starts; the workspace is mounted into the container and the
//! connector runs from that directory with stdio attached to this process.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::traits::*;
use crate::config::LauncherConfig;
use crate::descriptor::{DOCKER_NAME_LIMIT, LaunchDescriptor};
use crate::error::LaunchError;

/// Interval between `try_wait` polls.
const WAIT_POLL: Duration = Duration::from_millis(100);

/// Mount point of the workspace inside containers.
const CONTAINER_WORKSPACE: &str = "/data";

/// Docker settings taken from [`LauncherConfig`].
#[derive(Debug, Clone)]
pub struct DockerSettings {
    /// docker binary.
    pub docker_bin: String,
    /// Host workspace root.
    pub workspace_root: PathBuf,
    /// Volume or host path mounted at `/data`.
    pub workspace_mount: String,
    /// Network to attach containers to.
    pub network: String,
}

impl DockerSettings {
    /// Settings from the launcher config.
    pub fn from_config(config: &LauncherConfig) -> Self {
        Self {
            docker_bin: config.docker_bin.clone(),
            workspace_root: config.workspace_root.clone(),
            workspace_mount: config.workspace_mount.clone(),
            network: config.docker_network.clone(),
        }
    }
}

/// Host directory for one attempt.
pub fn job_root(workspace_root: &Path, descriptor: &LaunchDescriptor) -> PathBuf {
    workspace_root
        .join(descriptor.job_id())
        .join(descriptor.attempt().to_string())
}

/// Write every input file under `dir`.
pub async fn materialize_files(
    dir: &Path,
    descriptor: &LaunchDescriptor,
) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    for (name, contents) in descriptor.files() {
        tokio::fs::write(dir.join(name), contents).await?;
    }
    Ok(())
}

/// Arguments for `docker run`.
pub fn run_args(settings: &DockerSettings, descriptor: &LaunchDescriptor, name: &str) -> Vec<String> {
    let workdir = format!(
        "{}/{}/{}",
        CONTAINER_WORKSPACE,
        descriptor.job_id(),
        descriptor.attempt()
    );

    let mut args: Vec<String> = vec![
        "run".into(),
        "--rm".into(),
        "--init".into(),
        "-i".into(),
        "-w".into(),
        workdir,
        "--log-driver".into(),
        "none".into(),
        "--name".into(),
        name.into(),
        "--network".into(),
        settings.network.clone(),
        "-v".into(),
        format!("{}:{}", settings.workspace_mount, CONTAINER_WORKSPACE),
        "--label".into(),
        format!("syncrun.job-id={}", descriptor.job_id()),
        "--label".into(),
        format!("syncrun.attempt={}", descriptor.attempt()),
    ];

    if !descriptor.allowed_hosts().is_empty() {
        args.push("--label".into());
        args.push(format!(
            "syncrun.allowed-hosts={}",
            descriptor.allowed_hosts().join(",")
        ));
    }

    args.push("-e".into());
    args.push(format!("JOB_ID={}", descriptor.job_id()));
    args.push("-e".into());
    args.push(format!("ATTEMPT_ID={}", descriptor.attempt()));
    for (k, v) in descriptor.env() {
        args.push("-e".into());
        args.push(format!("{}={}", k, v));
    }

    let resources = descriptor.resources();
    if let Some(cpu) = &resources.cpu_limit {
        args.push(format!("--cpus={}", cpu));
    }
    if let Some(memory) = &resources.memory_limit {
        args.push(format!("--memory={}", docker_memory(memory)));
    }
    if let Some(memory) = &resources.memory_request {
        args.push(format!("--memory-reservation={}", docker_memory(memory)));
    }

    args.push(descriptor.image().to_string());
    args.extend(descriptor.args().iter().cloned());
    args
}

/// Docker wants `512m`/`2g` where Kubernetes says `512Mi`/`2Gi`.
fn docker_memory(quantity: &str) -> String {
    for (suffix, replacement) in [("Ki", "k"), ("Mi", "m"), ("Gi", "g")] {
        if let Some(number) = quantity.strip_suffix(suffix) {
            return format!("{}{}", number, replacement);
        }
    }
    quantity.to_string()
}

/// Whether `image` is present locally.
pub async fn image_exists(docker_bin: &str, image: &str) -> Result<bool> {
    let status = Command::new(docker_bin)
        .args(["image", "inspect", image])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;
    Ok(status.success())
}

/// Connector container run by the local docker daemon.
pub struct DockerProcess {
    info: ProcessInfo,
    docker_bin: String,
    job_root: PathBuf,
    child: tokio::sync::Mutex<Child>,
    exit: ExitCodeCell,
    killed: AtomicBool,
    stdin: Mutex<Option<ProcessWriter>>,
    stdout: Mutex<Option<ProcessReader>>,
    stderr: Mutex<Option<ProcessReader>>,
}

fn take_slot<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    slot.lock().unwrap_or_else(|e| e.into_inner()).take()
}

/// Delete an attempt's input files. A missing directory is fine.
async fn remove_job_root(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!(dir = %dir.display(), "Job root removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(dir = %dir.display(), error = %e, "Failed to remove job root"),
    }
}

impl DockerProcess {
    /// Verify the image, write input files and start the container.
    pub async fn create(
        settings: &DockerSettings,
        descriptor: &LaunchDescriptor,
    ) -> std::result::Result<Self, LaunchError> {
        let exists = image_exists(&settings.docker_bin, descriptor.image())
            .await
            .map_err(|e| LaunchError::StartFailed(e.to_string()))?;
        if !exists {
            return Err(LaunchError::ImageNotFound(descriptor.image().to_string()));
        }

        let dir = job_root(&settings.workspace_root, descriptor);
        materialize_files(&dir, descriptor).await?;
        debug!(dir = %dir.display(), files = descriptor.files().len(), "Input files written");

        let name = descriptor.process_name(DOCKER_NAME_LIMIT);
        let args = run_args(settings, descriptor, &name);

        let spawned = Command::new(&settings.docker_bin)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                error!(container = %name, error = %e, "Failed to spawn docker");
                remove_job_root(&dir).await;
                return Err(LaunchError::StartFailed(e.to_string()));
            }
        };

        info!(container = %name, image = %descriptor.image(), step = %descriptor.step(), "Container started");

        let stdin = child.stdin.take().map(|s| Box::new(s) as ProcessWriter);
        let stdout = child.stdout.take().map(|s| Box::new(s) as ProcessReader);
        let stderr = child.stderr.take().map(|s| Box::new(s) as ProcessReader);

        Ok(Self {
            info: ProcessInfo {
                namespace: None,
                name,
                image: descriptor.image().to_string(),
                pull_policy: None,
            },
            docker_bin: settings.docker_bin.clone(),
            job_root: dir,
            child: tokio::sync::Mutex::new(child),
            exit: ExitCodeCell::new(),
            killed: AtomicBool::new(false),
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(stdout),
            stderr: Mutex::new(stderr),
        })
    }

    async fn poll_exit(&self) -> Result<Option<i32>> {
        if let Some(code) = self.exit.get() {
            return Ok(Some(code));
        }

        let mut child = self.child.lock().await;
        match child.try_wait()? {
            Some(status) => {
                let code = status.code().unwrap_or(EXIT_KILLED);
                if self.exit.complete(code) {
                    info!(container = %self.info.name, exit_code = code, "Container exited");
                }
                Ok(self.exit.get())
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ProcessHandle for DockerProcess {
    fn info(&self) -> &ProcessInfo {
        &self.info
    }

    async fn exit_value(&self) -> Result<i32> {
        self.poll_exit().await?.ok_or(ProcessError::NotTerminated)
    }

    async fn wait_for(&self) -> Result<i32> {
        loop {
            if let Some(code) = self.poll_exit().await? {
                return Ok(code);
            }
            tokio::time::sleep(WAIT_POLL).await;
        }
    }

    async fn wait_for_timeout(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.poll_exit().await?.is_some() {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(WAIT_POLL.min(deadline - now)).await;
        }
    }

    async fn destroy(&self) -> Result<()> {
        if self.killed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        warn!(container = %self.info.name, "Killing container");
        let output = Command::new(&self.docker_bin)
            .args(["kill", &self.info.name])
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await;
        match output {
            Ok(out) if out.status.success() => {}
            Ok(out) => debug!(
                container = %self.info.name,
                stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                "docker kill reported an error"
            ),
            Err(e) => debug!(container = %self.info.name, error = %e, "docker kill failed"),
        }

        // The docker client may outlive the container; make sure it goes too.
        let mut child = self.child.lock().await;
        if let Err(e) = child.start_kill() {
            debug!(container = %self.info.name, error = %e, "docker client already exited");
        }
        drop(child);

        remove_job_root(&self.job_root).await;
        Ok(())
    }

    async fn take_stdin(&self) -> Option<ProcessWriter> {
        take_slot(&self.stdin)
    }

    async fn take_stdout(&self) -> Option<ProcessReader> {
        take_slot(&self.stdout)
    }

    async fn take_stderr(&self) -> Option<ProcessReader> {
        take_slot(&self.stderr)
    }
}
