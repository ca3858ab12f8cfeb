// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Collaborator interfaces consumed by the connection manager.
//!
//! Scheduling, job persistence, retry-state persistence, progress checks,
//! auto-disable and the attempt itself all live behind these traits. The
//! workflow decides when to call them; it never knows how they are backed.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::failure::{FailureOrigin, FailureReason, FailureSummary};
use crate::retry::RetryManager;
use syncrun_launcher::{LaunchError, ProcessError};

/// Errors returned by collaborators.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ActivityError {
    /// The backing service could not be reached or refused the call.
    #[error("Activity unavailable: {0}")]
    Unavailable(String),

    /// A referenced job or connection does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A connector could not be launched.
    #[error("Launch error: {0}")]
    Launch(#[from] LaunchError),

    /// A connector process could not be observed.
    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for collaborator calls.
pub type Result<T> = std::result::Result<T, ActivityError>;

/// Lifecycle of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, no attempt started.
    Pending,
    /// An attempt is running.
    Running,
    /// The last attempt failed after committing some data.
    Incomplete,
    /// Failed for good.
    Failed,
    /// Finished successfully.
    Succeeded,
    /// Cancelled on request.
    Cancelled,
}

impl JobStatus {
    /// Whether the job can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Failed | JobStatus::Succeeded | JobStatus::Cancelled
        )
    }
}

/// Lifecycle of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    /// In flight.
    Running,
    /// Failed without committing anything.
    Failed,
    /// Failed after committing some data.
    Incomplete,
    /// Finished successfully.
    Succeeded,
    /// Cancelled on request.
    Cancelled,
}

/// One attempt of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Attempt number, starting at 1.
    pub attempt_number: u32,
    /// Current status.
    pub status: AttemptStatus,
    /// Failures recorded when the attempt ended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_summary: Option<FailureSummary>,
}

/// A job and its attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Job id.
    pub job_id: i64,
    /// Connection the job belongs to.
    pub connection_id: Uuid,
    /// Whether this is a reset job.
    pub is_reset: bool,
    /// Current status.
    pub status: JobStatus,
    /// Attempts in creation order.
    pub attempts: Vec<AttemptRecord>,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
}

impl JobRecord {
    /// Attempts still marked running.
    pub fn running_attempts(&self) -> impl Iterator<Item = u32> + '_ {
        self.attempts
            .iter()
            .filter(|a| a.status == AttemptStatus::Running)
            .map(|a| a.attempt_number)
    }
}

/// Result of a successful sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutput {
    /// Bytes moved from source to destination.
    pub bytes_synced: u64,
    /// Final state emitted by the source, if the backend collects one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

/// Which side of a connection a check targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorSide {
    /// Source connector.
    Source,
    /// Destination connector.
    Destination,
}

impl ConnectorSide {
    /// Failure origin for this side.
    pub fn origin(&self) -> FailureOrigin {
        match self {
            ConnectorSide::Source => FailureOrigin::Source,
            ConnectorSide::Destination => FailureOrigin::Destination,
        }
    }
}

/// Identity of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptContext {
    /// Connection.
    pub connection_id: Uuid,
    /// Job.
    pub job_id: i64,
    /// Attempt number within the job.
    pub attempt_number: u32,
    /// Reset jobs clear destination data instead of reading the source.
    pub is_reset: bool,
}

/// Outcome of a connectivity check.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    /// The connector accepted its configuration.
    Succeeded,
    /// The connector refused, or could not run.
    Failed(FailureReason),
    /// The check was cancelled.
    Cancelled,
}

/// Outcome of one attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// The sync finished.
    Succeeded(SyncOutput),
    /// The sync failed.
    Failed {
        /// Why.
        failures: Vec<FailureReason>,
        /// Whether anything was committed before the failure.
        partial_success: bool,
    },
    /// The sync was cancelled through its token.
    Cancelled,
}

/// When the next run is due.
#[async_trait]
pub trait ScheduleActivity: Send + Sync {
    /// Time until the connection's next scheduled run. `Duration::MAX` means never.
    async fn time_until_next_run(&self, connection_id: Uuid) -> Result<Duration>;

    /// Attempt ceiling used when no retry state is configured.
    async fn max_attempts(&self) -> Result<u32>;
}

/// Job and attempt rows.
#[async_trait]
pub trait JobPersistence: Send + Sync {
    /// Create a job for the connection and return its id.
    async fn create_job(&self, connection_id: Uuid, is_reset: bool) -> Result<i64>;

    /// Create the next attempt for a job and return its number.
    async fn create_attempt(&self, job_id: i64) -> Result<u32>;

    /// Mark the job as running.
    async fn report_job_start(&self, job_id: i64) -> Result<()>;

    /// Record a failed attempt. `status` is [`AttemptStatus::Failed`] or
    /// [`AttemptStatus::Incomplete`].
    async fn fail_attempt(
        &self,
        job_id: i64,
        attempt_number: u32,
        status: AttemptStatus,
        summary: FailureSummary,
    ) -> Result<()>;

    /// Fail the whole job.
    async fn fail_job(&self, job_id: i64, reason: String) -> Result<()>;

    /// Mark the attempt and job succeeded.
    async fn job_success(&self, job_id: i64, attempt_number: u32, output: SyncOutput) -> Result<()>;

    /// Mark the attempt and job cancelled.
    async fn job_cancelled(
        &self,
        job_id: i64,
        attempt_number: u32,
        summary: FailureSummary,
    ) -> Result<()>;

    /// Load a job with its attempts.
    async fn get_job(&self, job_id: i64) -> Result<JobRecord>;

    /// Ids of the connection's jobs that are not terminal.
    async fn list_non_terminal_jobs(&self, connection_id: Uuid) -> Result<Vec<i64>>;

    /// Whether the connection's previous job, or the job's previous attempt, failed.
    async fn is_last_job_or_attempt_failure(&self, connection_id: Uuid, job_id: i64) -> Result<bool>;
}

/// Durable retry counters.
#[async_trait]
pub trait RetryStatePersistence: Send + Sync {
    /// Load counters for the job, or fresh ones for a new job. `None` means
    /// no retry policy is configured for the connection.
    async fn hydrate(&self, connection_id: Uuid, job_id: Option<i64>) -> Result<Option<RetryManager>>;

    /// Store counters for the job.
    async fn persist(&self, connection_id: Uuid, job_id: i64, manager: &RetryManager) -> Result<()>;
}

/// Whether an attempt moved any data.
#[async_trait]
pub trait ProgressActivity: Send + Sync {
    /// True if the attempt committed anything.
    async fn check_progress(&self, job_id: i64, attempt_number: u32) -> Result<bool>;
}

/// Disables connections that keep failing.
#[async_trait]
pub trait AutoDisableActivity: Send + Sync {
    /// Evaluate the connection. Returns true if it was disabled.
    async fn evaluate(&self, connection_id: Uuid) -> Result<bool>;
}

/// Runs connectors for one attempt.
#[async_trait]
pub trait AttemptExecution: Send + Sync {
    /// Check one side's configuration.
    async fn check(
        &self,
        ctx: AttemptContext,
        side: ConnectorSide,
        cancel: CancellationToken,
    ) -> Result<CheckOutcome>;

    /// Run the sync. Must return [`AttemptOutcome::Cancelled`] promptly once
    /// `cancel` fires.
    async fn run(&self, ctx: AttemptContext, cancel: CancellationToken) -> Result<AttemptOutcome>;
}
