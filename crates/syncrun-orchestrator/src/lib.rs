// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Syncrun Orchestrator - Connection Manager
//!
//! This crate drives one connection's syncs: it waits for the schedule or a
//! signal, creates jobs and attempts, runs the connectors, and decides after
//! each failure whether to retry, back off, or fail the job for good.
//!
//! # Architecture
//!
//! ```text
//!   signals ──▶ ConnectionManagerHandle ──▶ WorkflowState
//!                                               │
//!                                               ▼
//!   ┌────────────────────────── ConnectionManager ──────────────────────────┐
//!   │  wait ─▶ create job/attempt ─▶ check ─▶ sync ─▶ success / failure     │
//!   └───┬──────────────┬──────────────────┬──────────────────┬──────────────┘
//!       ▼              ▼                  ▼                  ▼
//!   Schedule     JobPersistence     AttemptExecution   RetryStatePersistence
//!                                   (process factory)  ProgressActivity
//!                                                      AutoDisableActivity
//! ```
//!
//! # Retry decisions
//!
//! [`retry::RetryManager`] counts complete failures (no data moved) and
//! partial failures separately. A job is failed for good when any counter
//! goes over its limit, or at once when the first failure is a configuration
//! error. Backoff after a complete failure never pushes the next attempt past
//! the connection's own next scheduled run.
//!
//! # Configuration
//!
//! See [`config::OrchestratorConfig::from_env`] for the `SYNCRUN_*` variables.

#![deny(missing_docs)]

/// Collaborator traits and the records they exchange.
pub mod activities;
/// Configuration loaded from the environment.
pub mod config;
/// Error types.
pub mod error;
/// Attempt execution backed by the launcher's process factories.
pub mod execution;
/// Failure reasons and summaries.
pub mod failure;
/// In-memory collaborators.
pub mod memory;
/// Retry counters, limits and backoff.
pub mod retry;
/// Workflow state flags and per-generation input.
pub mod state;
/// The connection manager state machine.
pub mod workflow;

pub use activities::{ActivityError, AttemptContext, AttemptOutcome, CheckOutcome, ConnectorSide};
pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, Result};
pub use execution::{ConnectionDefinition, ConnectorDefinition, ProcessAttemptExecution};
pub use failure::{FailureOrigin, FailureReason, FailureSummary, FailureType};
pub use retry::{BackoffPolicy, RetryLimits, RetryManager};
pub use state::{RunInput, WorkflowState};
pub use workflow::{Collaborators, ConnectionManager, ConnectionManagerHandle};
