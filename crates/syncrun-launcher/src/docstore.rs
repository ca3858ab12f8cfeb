// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Status document store.
//!
//! Detached workloads report their lifecycle by writing small documents keyed
//! `{namespace}/{name}/{STATUS}`. The launcher only ever reads them.

use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

/// Errors from document store reads.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DocStoreError {
    /// The key escapes the store root.
    #[error("Invalid document key: {0}")]
    InvalidKey(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored output is not valid JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for document store operations.
pub type Result<T> = std::result::Result<T, DocStoreError>;

/// Lifecycle status a workload writes about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AsyncPodStatus {
    /// No document written yet.
    NotStarted,
    /// The workload is preparing.
    Initializing,
    /// The workload is running.
    Running,
    /// The workload failed.
    Failed,
    /// The workload succeeded.
    Succeeded,
}

impl AsyncPodStatus {
    /// Statuses with a document, most authoritative first.
    pub const PRECEDENCE: [AsyncPodStatus; 4] = [
        AsyncPodStatus::Failed,
        AsyncPodStatus::Succeeded,
        AsyncPodStatus::Running,
        AsyncPodStatus::Initializing,
    ];

    /// Document name for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            AsyncPodStatus::NotStarted => "NOT_STARTED",
            AsyncPodStatus::Initializing => "INITIALIZING",
            AsyncPodStatus::Running => "RUNNING",
            AsyncPodStatus::Failed => "FAILED",
            AsyncPodStatus::Succeeded => "SUCCEEDED",
        }
    }

    /// Failed or Succeeded.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AsyncPodStatus::Failed | AsyncPodStatus::Succeeded)
    }
}

impl fmt::Display for AsyncPodStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key of the `status` document for a pod.
pub fn status_key(namespace: &str, name: &str, status: AsyncPodStatus) -> String {
    format!("{}/{}/{}", namespace, name, status.as_str())
}

/// Read access to status documents.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Document contents, or `None` if absent.
    async fn read(&self, key: &str) -> Result<Option<String>>;
}

/// Read access to structured job outputs keyed by workload id.
#[async_trait]
pub trait JobOutputStore: Send + Sync {
    /// Sync output for `workload_id`, or `None` if absent.
    async fn read_sync_output(&self, workload_id: &str) -> Result<Option<Value>>;
}

/// Highest-precedence status present in the store for a pod.
pub async fn resolve_status(
    store: &dyn DocumentStore,
    namespace: &str,
    name: &str,
) -> Result<AsyncPodStatus> {
    for status in AsyncPodStatus::PRECEDENCE {
        if store
            .read(&status_key(namespace, name, status))
            .await?
            .is_some()
        {
            return Ok(status);
        }
    }
    Ok(AsyncPodStatus::NotStarted)
}

/// Document store backed by a directory tree; each key is a relative file path.
pub struct FsDocumentStore {
    root: PathBuf,
}

impl FsDocumentStore {
    /// Store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(DocStoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    async fn read_path(path: &Path) -> Result<Option<String>> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl DocumentStore for FsDocumentStore {
    async fn read(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key)?;
        Self::read_path(&path).await
    }
}

#[async_trait]
impl JobOutputStore for FsDocumentStore {
    async fn read_sync_output(&self, workload_id: &str) -> Result<Option<Value>> {
        let path = self.path_for(&format!("job-output/{}.json", workload_id))?;
        match Self::read_path(&path).await? {
            Some(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            None => Ok(None),
        }
    }
}

/// In-memory store. Tests write documents on behalf of the workload.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    docs: Mutex<HashMap<String, String>>,
    outputs: Mutex<HashMap<String, Value>>,
}

impl InMemoryDocumentStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Write the document for `status`.
    pub async fn write_status(
        &self,
        namespace: &str,
        name: &str,
        status: AsyncPodStatus,
        contents: &str,
    ) {
        self.docs
            .lock()
            .await
            .insert(status_key(namespace, name, status), contents.to_string());
    }

    /// Write a job output.
    pub async fn write_output(&self, workload_id: &str, output: Value) {
        self.outputs
            .lock()
            .await
            .insert(workload_id.to_string(), output);
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn read(&self, key: &str) -> Result<Option<String>> {
        Ok(self.docs.lock().await.get(key).cloned())
    }
}

#[async_trait]
impl JobOutputStore for InMemoryDocumentStore {
    async fn read_sync_output(&self, workload_id: &str) -> Result<Option<Value>> {
        Ok(self.outputs.lock().await.get(workload_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ALL: [AsyncPodStatus; 4] = AsyncPodStatus::PRECEDENCE;

    #[test]
    fn test_status_key() {
        assert_eq!(
            status_key("jobs", "pod-a", AsyncPodStatus::Succeeded),
            "jobs/pod-a/SUCCEEDED"
        );
    }

    #[tokio::test]
    async fn test_resolve_status_empty() {
        let store = InMemoryDocumentStore::new();
        let status = resolve_status(&store, "ns", "p").await.unwrap();
        assert_eq!(status, AsyncPodStatus::NotStarted);
    }

    #[tokio::test]
    async fn test_resolve_status_every_combination() {
        // Each bit of mask marks one status document as present.
        for mask in 0u8..16 {
            let store = InMemoryDocumentStore::new();
            for (i, status) in ALL.iter().enumerate() {
                if mask & (1 << i) != 0 {
                    store.write_status("ns", "p", *status, "").await;
                }
            }

            let expected = ALL
                .iter()
                .enumerate()
                .find(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, s)| *s)
                .unwrap_or(AsyncPodStatus::NotStarted);

            let first = resolve_status(&store, "ns", "p").await.unwrap();
            let second = resolve_status(&store, "ns", "p").await.unwrap();
            assert_eq!(first, expected, "mask {:04b}", mask);
            assert_eq!(first, second);
        }
    }

    #[tokio::test]
    async fn test_fs_store_reads_documents() {
        let dir = TempDir::new().unwrap();
        let doc_dir = dir.path().join("ns/p");
        std::fs::create_dir_all(&doc_dir).unwrap();
        std::fs::write(doc_dir.join("RUNNING"), "").unwrap();
        std::fs::write(doc_dir.join("SUCCEEDED"), "{\"records\":3}").unwrap();

        let store = FsDocumentStore::new(dir.path());
        assert_eq!(
            resolve_status(&store, "ns", "p").await.unwrap(),
            AsyncPodStatus::Succeeded
        );
        assert_eq!(
            store.read("ns/p/SUCCEEDED").await.unwrap().as_deref(),
            Some("{\"records\":3}")
        );
        assert!(store.read("ns/p/FAILED").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fs_store_rejects_escaping_keys() {
        let dir = TempDir::new().unwrap();
        let store = FsDocumentStore::new(dir.path());
        assert!(matches!(
            store.read("../etc/passwd").await,
            Err(DocStoreError::InvalidKey(_))
        ));
        assert!(matches!(
            store.read("/abs").await,
            Err(DocStoreError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_fs_store_job_output() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("job-output")).unwrap();
        std::fs::write(
            dir.path().join("job-output/w-1.json"),
            "{\"bytes_synced\": 10}",
        )
        .unwrap();

        let store = FsDocumentStore::new(dir.path());
        let output = store.read_sync_output("w-1").await.unwrap().unwrap();
        assert_eq!(output["bytes_synced"], 10);
        assert!(store.read_sync_output("w-2").await.unwrap().is_none());
    }
}
