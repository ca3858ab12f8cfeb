// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for syncrun-orchestrator.

use thiserror::Error;

use crate::activities::ActivityError;
use crate::config::ConfigError;

/// Top-level orchestrator error.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OrchestratorError {
    /// Configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A collaborator failed.
    #[error("Activity error: {0}")]
    Activity(#[from] ActivityError),

    /// The connection definition could not be parsed.
    #[error("Invalid connection definition: {0}")]
    Definition(#[from] serde_json::Error),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;
