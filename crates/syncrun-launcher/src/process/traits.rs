// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process handle trait definitions.
//!
//! Defines the process-like interface shared by the docker and cluster backends.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;

use crate::cluster::ClusterError;
use crate::descriptor::LaunchDescriptor;
use crate::docstore::DocStoreError;
use crate::error::LaunchError;

/// The workload finished successfully.
pub const EXIT_SUCCESS: i32 = 0;
/// The workload reported failure.
pub const EXIT_FAILED: i32 = 1;
/// The cluster resource vanished without a terminal status document.
pub const EXIT_RESOURCE_VANISHED: i32 = 2;
/// The pod is terminal but the status store never received a terminal document.
pub const EXIT_STORE_SILENT: i32 = 3;
/// The workload ran out of memory.
pub const EXIT_OOM: i32 = 137;
/// The workload was force-killed.
pub const EXIT_KILLED: i32 = 143;

/// Log marker that identifies an out-of-memory death.
pub const OOM_MARKERS: &[&str] = &["java.lang.OutOfMemoryError", "OOMKilled"];

/// Errors from process handle operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProcessError {
    /// The process has not reached a terminal state yet.
    #[error("Process has not terminated")]
    NotTerminated,

    /// Waiting for the process timed out.
    #[error("Timed out waiting for process")]
    Timeout,

    /// Cluster API call failed.
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Status document store read failed.
    #[error("Document store error: {0}")]
    DocStore(#[from] DocStoreError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for process operations.
pub type Result<T> = std::result::Result<T, ProcessError>;

/// Readable end of a process stdio stream.
pub type ProcessReader = Box<dyn AsyncRead + Send + Unpin>;

/// Writable end of a process stdin stream.
pub type ProcessWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Identity of a launched workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    /// Namespace, for cluster backends.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Pod or container name.
    pub name: String,
    /// Main container image.
    pub image: String,
    /// Main container pull policy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_policy: Option<String>,
}

/// Single-assignment exit code.
///
/// The first `complete` wins; later calls are no-ops. Waiters are woken when
/// the value lands.
#[derive(Debug)]
pub struct ExitCodeCell {
    tx: watch::Sender<Option<i32>>,
}

impl Default for ExitCodeCell {
    fn default() -> Self {
        Self::new()
    }
}

impl ExitCodeCell {
    /// Create an empty cell.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Store `code` unless a code is already present. Returns true if this call stored it.
    pub fn complete(&self, code: i32) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(code);
            true
        })
    }

    /// Current value, if completed.
    pub fn get(&self) -> Option<i32> {
        *self.tx.borrow()
    }

    /// Wait until a code is stored.
    pub async fn wait(&self) -> i32 {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(code) = *rx.borrow_and_update() {
                return code;
            }
            // The sender lives in self, so changed() only fails if self is gone.
            if rx.changed().await.is_err() {
                return EXIT_KILLED;
            }
        }
    }
}

/// True if any of the lines carries an out-of-memory marker.
pub fn has_oom_marker<S: AsRef<str>>(lines: &[S]) -> bool {
    lines
        .iter()
        .any(|line| OOM_MARKERS.iter().any(|m| line.as_ref().contains(m)))
}

/// A running or terminated workload that behaves like a local process.
///
/// Implementations exclusively own the container or pod they created; they are
/// the only actor expected to delete it.
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// Identity of the workload.
    fn info(&self) -> &ProcessInfo;

    /// Terminal exit code.
    ///
    /// Returns `ProcessError::NotTerminated` instead of blocking while the
    /// workload is still running. Once a code is returned it never changes.
    async fn exit_value(&self) -> Result<i32>;

    /// Whether the workload has reached a terminal state.
    async fn has_exited(&self) -> bool {
        self.exit_value().await.is_ok()
    }

    /// Wait for the workload to terminate and return its exit code.
    async fn wait_for(&self) -> Result<i32>;

    /// Wait at most `timeout`. Returns true if the workload terminated.
    async fn wait_for_timeout(&self, timeout: Duration) -> Result<bool>;

    /// Delete the underlying resource. Safe to call more than once.
    async fn destroy(&self) -> Result<()>;

    /// Take the stdin writer. Returns `None` if there is none or it was already taken.
    async fn take_stdin(&self) -> Option<ProcessWriter> {
        None
    }

    /// Take the stdout reader.
    async fn take_stdout(&self) -> Option<ProcessReader> {
        None
    }

    /// Take the stderr reader.
    async fn take_stderr(&self) -> Option<ProcessReader> {
        None
    }

    /// Structured output left behind by the workload, if the backend keeps one.
    async fn output(&self) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Creates process handles from launch descriptors.
#[async_trait]
pub trait ProcessFactory: Send + Sync {
    /// Backend identifier (e.g., "docker", "kube", "kube-async").
    fn backend(&self) -> &'static str;

    /// Launch the workload described by `descriptor`.
    async fn create(
        &self,
        descriptor: &LaunchDescriptor,
    ) -> std::result::Result<Box<dyn ProcessHandle>, LaunchError>;
}
