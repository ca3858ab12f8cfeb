// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory collaborators.
//!
//! Used by the binary for local runs and by tests. Nothing here survives a
//! restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::activities::{
    ActivityError, AttemptRecord, AttemptStatus, AutoDisableActivity, JobPersistence, JobRecord,
    JobStatus, Result, RetryStatePersistence, ScheduleActivity, SyncOutput,
};
use crate::failure::FailureSummary;
use crate::retry::RetryManager;

/// Schedule with a fixed interval between runs.
#[derive(Debug, Clone)]
pub struct FixedSchedule {
    interval: Duration,
    max_attempts: u32,
}

impl FixedSchedule {
    /// Run every `interval`. `Duration::MAX` only runs on manual request.
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Never run on a schedule.
    pub fn manual(max_attempts: u32) -> Self {
        Self::new(Duration::MAX, max_attempts)
    }
}

#[async_trait]
impl ScheduleActivity for FixedSchedule {
    async fn time_until_next_run(&self, _connection_id: Uuid) -> Result<Duration> {
        Ok(self.interval)
    }

    async fn max_attempts(&self) -> Result<u32> {
        Ok(self.max_attempts)
    }
}

/// Job and attempt rows kept in memory.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<i64, JobRecord>>,
    outputs: Mutex<HashMap<(i64, u32), SyncOutput>>,
    failure_reasons: Mutex<HashMap<i64, String>>,
    next_id: AtomicI64,
}

impl InMemoryJobStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a job as-is, e.g. one left behind by an earlier run.
    pub async fn insert(&self, job: JobRecord) {
        self.next_id.fetch_max(job.job_id, Ordering::SeqCst);
        self.jobs.lock().await.insert(job.job_id, job);
    }

    /// Every job of `connection_id`, oldest first.
    pub async fn jobs_for(&self, connection_id: Uuid) -> Vec<JobRecord> {
        let mut jobs: Vec<_> = self
            .jobs
            .lock()
            .await
            .values()
            .filter(|j| j.connection_id == connection_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.job_id);
        jobs
    }

    /// Output recorded for a successful attempt.
    pub async fn output(&self, job_id: i64, attempt_number: u32) -> Option<SyncOutput> {
        self.outputs
            .lock()
            .await
            .get(&(job_id, attempt_number))
            .cloned()
    }

    /// Reason the job was failed with.
    pub async fn failure_reason(&self, job_id: i64) -> Option<String> {
        self.failure_reasons.lock().await.get(&job_id).cloned()
    }

    async fn update_attempt(
        &self,
        job_id: i64,
        attempt_number: u32,
        status: AttemptStatus,
        summary: Option<FailureSummary>,
    ) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(&job_id)
            .ok_or_else(|| ActivityError::NotFound(format!("job {}", job_id)))?;
        let attempt = job
            .attempts
            .iter_mut()
            .find(|a| a.attempt_number == attempt_number)
            .ok_or_else(|| {
                ActivityError::NotFound(format!("attempt {} of job {}", attempt_number, job_id))
            })?;
        attempt.status = status;
        attempt.failure_summary = summary;

        job.status = match status {
            AttemptStatus::Running => JobStatus::Running,
            AttemptStatus::Failed => JobStatus::Running,
            AttemptStatus::Incomplete => JobStatus::Incomplete,
            AttemptStatus::Succeeded => JobStatus::Succeeded,
            AttemptStatus::Cancelled => JobStatus::Cancelled,
        };
        Ok(())
    }

    async fn set_job_status(&self, job_id: i64, status: JobStatus) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(&job_id)
            .ok_or_else(|| ActivityError::NotFound(format!("job {}", job_id)))?;
        job.status = status;
        Ok(())
    }
}

#[async_trait]
impl JobPersistence for InMemoryJobStore {
    async fn create_job(&self, connection_id: Uuid, is_reset: bool) -> Result<i64> {
        let job_id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.jobs.lock().await.insert(
            job_id,
            JobRecord {
                job_id,
                connection_id,
                is_reset,
                status: JobStatus::Pending,
                attempts: Vec::new(),
                created_at: Utc::now(),
            },
        );
        Ok(job_id)
    }

    async fn create_attempt(&self, job_id: i64) -> Result<u32> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(&job_id)
            .ok_or_else(|| ActivityError::NotFound(format!("job {}", job_id)))?;
        let attempt_number = job.attempts.len() as u32 + 1;
        job.attempts.push(AttemptRecord {
            attempt_number,
            status: AttemptStatus::Running,
            failure_summary: None,
        });
        Ok(attempt_number)
    }

    async fn report_job_start(&self, job_id: i64) -> Result<()> {
        self.set_job_status(job_id, JobStatus::Running).await
    }

    async fn fail_attempt(
        &self,
        job_id: i64,
        attempt_number: u32,
        status: AttemptStatus,
        summary: FailureSummary,
    ) -> Result<()> {
        self.update_attempt(job_id, attempt_number, status, Some(summary))
            .await
    }

    async fn fail_job(&self, job_id: i64, reason: String) -> Result<()> {
        self.set_job_status(job_id, JobStatus::Failed).await?;
        self.failure_reasons.lock().await.insert(job_id, reason);
        Ok(())
    }

    async fn job_success(&self, job_id: i64, attempt_number: u32, output: SyncOutput) -> Result<()> {
        self.update_attempt(job_id, attempt_number, AttemptStatus::Succeeded, None)
            .await?;
        self.outputs
            .lock()
            .await
            .insert((job_id, attempt_number), output);
        Ok(())
    }

    async fn job_cancelled(
        &self,
        job_id: i64,
        attempt_number: u32,
        summary: FailureSummary,
    ) -> Result<()> {
        // An attempt that already ended keeps its own status and summary.
        let attempt_running = self.jobs.lock().await.get(&job_id).is_some_and(|j| {
            j.attempts
                .iter()
                .any(|a| a.attempt_number == attempt_number && a.status == AttemptStatus::Running)
        });
        if attempt_running {
            self.update_attempt(job_id, attempt_number, AttemptStatus::Cancelled, Some(summary))
                .await
        } else {
            self.set_job_status(job_id, JobStatus::Cancelled).await
        }
    }

    async fn get_job(&self, job_id: i64) -> Result<JobRecord> {
        self.jobs
            .lock()
            .await
            .get(&job_id)
            .cloned()
            .ok_or_else(|| ActivityError::NotFound(format!("job {}", job_id)))
    }

    async fn list_non_terminal_jobs(&self, connection_id: Uuid) -> Result<Vec<i64>> {
        Ok(self
            .jobs_for(connection_id)
            .await
            .into_iter()
            .filter(|j| !j.status.is_terminal())
            .map(|j| j.job_id)
            .collect())
    }

    async fn is_last_job_or_attempt_failure(&self, connection_id: Uuid, job_id: i64) -> Result<bool> {
        let jobs = self.jobs_for(connection_id).await;

        if let Some(current) = jobs.iter().find(|j| j.job_id == job_id) {
            let previous_attempt_failed = current
                .attempts
                .iter()
                .rev()
                .filter(|a| a.status != AttemptStatus::Running)
                .map(|a| a.status)
                .next()
                .is_some_and(|s| matches!(s, AttemptStatus::Failed | AttemptStatus::Incomplete));
            if previous_attempt_failed {
                return Ok(true);
            }
        }

        Ok(jobs
            .iter()
            .filter(|j| j.job_id < job_id && j.status.is_terminal())
            .next_back()
            .is_some_and(|j| j.status == JobStatus::Failed))
    }
}

/// Retry counters kept in memory.
///
/// Jobs without stored counters start from `template`; a store without a
/// template reports that no retry policy is configured.
pub struct InMemoryRetryStore {
    template: Option<RetryManager>,
    states: Mutex<HashMap<i64, RetryManager>>,
}

impl InMemoryRetryStore {
    /// Store handing out copies of `template` for new jobs.
    pub fn new(template: Option<RetryManager>) -> Self {
        Self {
            template,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Counters stored for `job_id`.
    pub async fn get(&self, job_id: i64) -> Option<RetryManager> {
        self.states.lock().await.get(&job_id).cloned()
    }
}

#[async_trait]
impl RetryStatePersistence for InMemoryRetryStore {
    async fn hydrate(&self, _connection_id: Uuid, job_id: Option<i64>) -> Result<Option<RetryManager>> {
        let Some(template) = &self.template else {
            return Ok(None);
        };
        let stored = match job_id {
            Some(job_id) => self.states.lock().await.get(&job_id).cloned(),
            None => None,
        };
        Ok(Some(stored.unwrap_or_else(|| {
            RetryManager::new(template.backoff_policy, template.limits)
        })))
    }

    async fn persist(&self, _connection_id: Uuid, job_id: i64, manager: &RetryManager) -> Result<()> {
        self.states.lock().await.insert(job_id, manager.clone());
        Ok(())
    }
}

/// Disables a connection once its last `threshold` jobs all failed.
pub struct ConsecutiveFailureAutoDisable {
    jobs: Arc<InMemoryJobStore>,
    threshold: usize,
    disabled: Mutex<Vec<Uuid>>,
}

impl ConsecutiveFailureAutoDisable {
    /// Watch `jobs`, disabling after `threshold` failed jobs in a row.
    pub fn new(jobs: Arc<InMemoryJobStore>, threshold: usize) -> Self {
        Self {
            jobs,
            threshold: threshold.max(1),
            disabled: Mutex::new(Vec::new()),
        }
    }

    /// Whether `connection_id` was disabled.
    pub async fn is_disabled(&self, connection_id: Uuid) -> bool {
        self.disabled.lock().await.contains(&connection_id)
    }
}

#[async_trait]
impl AutoDisableActivity for ConsecutiveFailureAutoDisable {
    async fn evaluate(&self, connection_id: Uuid) -> Result<bool> {
        let jobs = self.jobs.jobs_for(connection_id).await;
        let failed_in_a_row = jobs
            .iter()
            .rev()
            .filter(|j| j.status.is_terminal())
            .take_while(|j| j.status == JobStatus::Failed)
            .count();
        if failed_in_a_row < self.threshold {
            return Ok(false);
        }

        let mut disabled = self.disabled.lock().await;
        if !disabled.contains(&connection_id) {
            disabled.push(connection_id);
        }
        Ok(true)
    }
}
