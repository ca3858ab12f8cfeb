// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for syncrun-launcher.

use thiserror::Error;

/// Failure to start a workload.
///
/// Fatal to the attempt that asked for the launch, never to the connection.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LaunchError {
    /// The image is not available to the local container runtime.
    #[error("Image not found: {0}")]
    ImageNotFound(String),

    /// The cluster API refused to create the pod.
    #[error("Pod rejected: {0}")]
    PodRejected(String),

    /// No relay port could be leased.
    #[error("No relay ports available")]
    NoPortsAvailable,

    /// The init container did not start in time.
    #[error("Init container for {pod} not running after {timeout_secs}s")]
    InitTimeout {
        /// Pod name.
        pod: String,
        /// Timeout that elapsed.
        timeout_secs: u64,
    },

    /// The pod reached a terminal phase while it was still being prepared.
    #[error("Pod {0} terminated during startup")]
    TerminatedDuringStartup(String),

    /// The container process could not be spawned.
    #[error("Container start failed: {0}")]
    StartFailed(String),

    /// Cluster API call failed.
    #[error("Cluster error: {0}")]
    Cluster(#[from] crate::cluster::ClusterError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Launcher errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Launching the workload failed.
    #[error("Launch error: {0}")]
    Launch(#[from] LaunchError),

    /// A process handle operation failed.
    #[error("Process error: {0}")]
    Process(#[from] crate::process::ProcessError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type using the launcher Error.
pub type Result<T> = std::result::Result<T, Error>;
