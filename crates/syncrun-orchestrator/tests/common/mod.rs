// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for syncrun-orchestrator integration tests.
//!
//! Collaborators are the in-memory ones from the crate plus scripted and
//! recording fakes defined here. Tests run with tokio's clock paused, so
//! schedule waits and backoffs complete instantly.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use syncrun_orchestrator::activities::{
    ActivityError, AttemptContext, AttemptExecution, AttemptOutcome, AttemptRecord,
    AttemptStatus, AutoDisableActivity, CheckOutcome, ConnectorSide, JobPersistence, JobRecord,
    JobStatus, ProgressActivity, Result, ScheduleActivity, SyncOutput,
};
use syncrun_orchestrator::failure::{FailureOrigin, FailureReason, FailureSummary, FailureType};
use syncrun_orchestrator::memory::{InMemoryJobStore, InMemoryRetryStore};
use syncrun_orchestrator::{
    Collaborators, ConnectionManager, ConnectionManagerHandle, OrchestratorConfig, RetryManager,
    RunInput, WorkflowState,
};

// ============================================================================
// Schedule
// ============================================================================

/// Schedule with a fixed wait that can be made to fail.
pub struct TestSchedule {
    pub wait: Duration,
    pub max_attempts: u32,
    pub failures_left: AtomicUsize,
    pub calls: AtomicUsize,
}

impl TestSchedule {
    pub fn new(wait: Duration) -> Self {
        Self {
            wait,
            max_attempts: 3,
            failures_left: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn forever() -> Self {
        Self::new(Duration::MAX)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScheduleActivity for TestSchedule {
    async fn time_until_next_run(&self, _connection_id: Uuid) -> Result<Duration> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ActivityError::Unavailable("scheduler down".to_string()));
        }
        Ok(self.wait)
    }

    async fn max_attempts(&self) -> Result<u32> {
        Ok(self.max_attempts)
    }
}

// ============================================================================
// Job persistence
// ============================================================================

/// In-memory job store with injectable failures and delays.
pub struct FlakyJobs {
    pub inner: Arc<InMemoryJobStore>,
    pub report_job_start_failures: AtomicUsize,
    pub create_attempt_delay: std::sync::Mutex<Duration>,
}

impl FlakyJobs {
    pub fn new(inner: Arc<InMemoryJobStore>) -> Self {
        Self {
            inner,
            report_job_start_failures: AtomicUsize::new(0),
            create_attempt_delay: std::sync::Mutex::new(Duration::ZERO),
        }
    }

    pub fn delay_create_attempt(&self, delay: Duration) {
        *self.create_attempt_delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl JobPersistence for FlakyJobs {
    async fn create_job(&self, connection_id: Uuid, is_reset: bool) -> Result<i64> {
        self.inner.create_job(connection_id, is_reset).await
    }

    async fn create_attempt(&self, job_id: i64) -> Result<u32> {
        let delay = *self.create_attempt_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.inner.create_attempt(job_id).await
    }

    async fn report_job_start(&self, job_id: i64) -> Result<()> {
        let failing = self
            .report_job_start_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ActivityError::Unavailable("job store down".to_string()));
        }
        self.inner.report_job_start(job_id).await
    }

    async fn fail_attempt(
        &self,
        job_id: i64,
        attempt_number: u32,
        status: AttemptStatus,
        summary: FailureSummary,
    ) -> Result<()> {
        self.inner
            .fail_attempt(job_id, attempt_number, status, summary)
            .await
    }

    async fn fail_job(&self, job_id: i64, reason: String) -> Result<()> {
        self.inner.fail_job(job_id, reason).await
    }

    async fn job_success(&self, job_id: i64, attempt_number: u32, output: SyncOutput) -> Result<()> {
        self.inner.job_success(job_id, attempt_number, output).await
    }

    async fn job_cancelled(
        &self,
        job_id: i64,
        attempt_number: u32,
        summary: FailureSummary,
    ) -> Result<()> {
        self.inner.job_cancelled(job_id, attempt_number, summary).await
    }

    async fn get_job(&self, job_id: i64) -> Result<JobRecord> {
        self.inner.get_job(job_id).await
    }

    async fn list_non_terminal_jobs(&self, connection_id: Uuid) -> Result<Vec<i64>> {
        self.inner.list_non_terminal_jobs(connection_id).await
    }

    async fn is_last_job_or_attempt_failure(&self, connection_id: Uuid, job_id: i64) -> Result<bool> {
        self.inner
            .is_last_job_or_attempt_failure(connection_id, job_id)
            .await
    }
}

// ============================================================================
// Progress and auto-disable
// ============================================================================

#[derive(Default)]
pub struct RecordingProgress {
    pub made_progress: AtomicBool,
    pub calls: AtomicUsize,
}

#[async_trait]
impl ProgressActivity for RecordingProgress {
    async fn check_progress(&self, _job_id: i64, _attempt_number: u32) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.made_progress.load(Ordering::SeqCst))
    }
}

#[derive(Default)]
pub struct RecordingAutoDisable {
    pub calls: AtomicUsize,
}

impl RecordingAutoDisable {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AutoDisableActivity for RecordingAutoDisable {
    async fn evaluate(&self, _connection_id: Uuid) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(false)
    }
}

// ============================================================================
// Scripted execution
// ============================================================================

/// What one sync run does.
#[derive(Debug, Clone)]
pub enum Script {
    Succeed,
    Fail(FailureReason),
    HangUntilCancelled,
}

/// Attempt execution that follows a script and records what it was asked to do.
#[derive(Default)]
pub struct ScriptedExecution {
    runs: Mutex<VecDeque<Script>>,
    checks: Mutex<VecDeque<CheckOutcome>>,
    pub run_contexts: Mutex<Vec<AttemptContext>>,
    pub check_calls: Mutex<Vec<(AttemptContext, ConnectorSide)>>,
    pub cancellations: AtomicUsize,
}

impl ScriptedExecution {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue sync runs. Runs past the end of the script succeed.
    pub async fn script(&self, runs: impl IntoIterator<Item = Script>) {
        self.runs.lock().await.extend(runs);
    }

    /// Queue check outcomes. Checks past the end succeed.
    pub async fn script_checks(&self, checks: impl IntoIterator<Item = CheckOutcome>) {
        self.checks.lock().await.extend(checks);
    }

    pub async fn runs(&self) -> Vec<AttemptContext> {
        self.run_contexts.lock().await.clone()
    }
}

#[async_trait]
impl AttemptExecution for ScriptedExecution {
    async fn check(
        &self,
        ctx: AttemptContext,
        side: ConnectorSide,
        _cancel: CancellationToken,
    ) -> Result<CheckOutcome> {
        self.check_calls.lock().await.push((ctx, side));
        Ok(self
            .checks
            .lock()
            .await
            .pop_front()
            .unwrap_or(CheckOutcome::Succeeded))
    }

    async fn run(&self, ctx: AttemptContext, cancel: CancellationToken) -> Result<AttemptOutcome> {
        self.run_contexts.lock().await.push(ctx);
        let script = self.runs.lock().await.pop_front().unwrap_or(Script::Succeed);

        // Every run takes a second so tests can signal mid-attempt.
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            _ = cancel.cancelled() => {
                self.cancellations.fetch_add(1, Ordering::SeqCst);
                return Ok(AttemptOutcome::Cancelled);
            }
        }

        match script {
            Script::Succeed => Ok(AttemptOutcome::Succeeded(SyncOutput {
                bytes_synced: 42,
                state: None,
            })),
            Script::Fail(reason) => Ok(AttemptOutcome::Failed {
                failures: vec![reason],
                partial_success: false,
            }),
            Script::HangUntilCancelled => {
                cancel.cancelled().await;
                self.cancellations.fetch_add(1, Ordering::SeqCst);
                Ok(AttemptOutcome::Cancelled)
            }
        }
    }
}

pub fn system_error(message: &str) -> FailureReason {
    FailureReason::new(FailureOrigin::Replication, FailureType::SystemError, message)
}

// ============================================================================
// Harness
// ============================================================================

/// Config with short local retries and the default workflow delay.
pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        activity_max_attempts: 2,
        activity_initial_interval: Duration::from_secs(1),
        activity_max_interval: Duration::from_secs(2),
        ..OrchestratorConfig::default()
    }
}

pub struct Harness {
    pub connection_id: Uuid,
    pub config: OrchestratorConfig,
    pub store: Arc<InMemoryJobStore>,
    pub jobs: Arc<FlakyJobs>,
    pub schedule: Arc<TestSchedule>,
    pub retry: Arc<InMemoryRetryStore>,
    pub progress: Arc<RecordingProgress>,
    pub auto_disable: Arc<RecordingAutoDisable>,
    pub execution: Arc<ScriptedExecution>,
    pub execution_override: Option<Arc<dyn AttemptExecution>>,
}

impl Harness {
    pub fn new(schedule: TestSchedule, retry_template: Option<RetryManager>) -> Self {
        let store = Arc::new(InMemoryJobStore::new());
        Self {
            connection_id: Uuid::new_v4(),
            config: test_config(),
            jobs: Arc::new(FlakyJobs::new(store.clone())),
            store,
            schedule: Arc::new(schedule),
            retry: Arc::new(InMemoryRetryStore::new(retry_template)),
            progress: Arc::new(RecordingProgress::default()),
            auto_disable: Arc::new(RecordingAutoDisable::default()),
            execution: Arc::new(ScriptedExecution::new()),
            execution_override: None,
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            schedule: self.schedule.clone(),
            jobs: self.jobs.clone(),
            retry_state: self.retry.clone(),
            progress: self.progress.clone(),
            auto_disable: self.auto_disable.clone(),
            execution: self
                .execution_override
                .clone()
                .unwrap_or_else(|| self.execution.clone() as Arc<dyn AttemptExecution>),
        }
    }

    pub fn start(&self, input: RunInput) -> (ConnectionManagerHandle, JoinHandle<()>) {
        let manager = ConnectionManager::new(self.connection_id, self.config.clone(), self.collaborators());
        let handle = manager.handle();
        let task = tokio::spawn(async move { manager.run(input).await });
        (handle, task)
    }

    pub fn start_fresh(&self) -> (ConnectionManagerHandle, JoinHandle<()>) {
        self.start(RunInput::new(self.connection_id))
    }

    pub async fn jobs(&self) -> Vec<JobRecord> {
        self.store.jobs_for(self.connection_id).await
    }

    /// Insert a job with one attempt in the given states.
    pub async fn seed_job(&self, job_id: i64, status: JobStatus, attempt: AttemptStatus) {
        self.store
            .insert(JobRecord {
                job_id,
                connection_id: self.connection_id,
                is_reset: false,
                status,
                attempts: vec![AttemptRecord {
                    attempt_number: 1,
                    status: attempt,
                    failure_summary: None,
                }],
                created_at: Utc::now(),
            })
            .await;
    }
}

/// Poll the workflow state until `predicate` holds.
pub async fn wait_for_state(
    handle: &ConnectionManagerHandle,
    predicate: impl Fn(&WorkflowState) -> bool,
) -> WorkflowState {
    for _ in 0..10_000 {
        let state = handle.state().await;
        if predicate(&state) {
            return state;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("workflow state never matched: {:?}", handle.state().await);
}

/// Poll the harness jobs until `predicate` holds.
pub async fn wait_for_jobs(harness: &Harness, predicate: impl Fn(&[JobRecord]) -> bool) -> Vec<JobRecord> {
    for _ in 0..10_000 {
        let jobs = harness.jobs().await;
        if predicate(&jobs) {
            return jobs;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("jobs never matched: {:?}", harness.jobs().await);
}

/// Poll until the scripted execution has started `count` runs.
pub async fn wait_for_runs(harness: &Harness, count: usize) {
    for _ in 0..10_000 {
        if harness.execution.runs().await.len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("execution never reached {} runs", count);
}

/// Delete the connection and wait for the workflow to stop.
pub async fn shutdown(handle: &ConnectionManagerHandle, task: JoinHandle<()>) {
    handle.delete_connection().await;
    tokio::time::timeout(Duration::from_secs(3600), task)
        .await
        .expect("workflow should stop after delete")
        .expect("workflow task panicked");
}
