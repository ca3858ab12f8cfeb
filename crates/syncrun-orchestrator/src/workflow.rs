// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Connection manager: the per-connection attempt state machine.
//!
//! One [`ConnectionManager`] owns one connection. Its [`run`](ConnectionManager::run)
//! loop is a sequence of generations; each generation waits for the schedule
//! (or a signal), runs at most one attempt, records the outcome and starts
//! over. Signals arrive through a [`ConnectionManagerHandle`] and only flip
//! flags in the shared [`WorkflowState`]; the loop reads them at its decision
//! points.
//!
//! ```text
//!   ┌──────────────┐  schedule / signal  ┌───────────────┐
//!   │ Waiting      │ ──────────────────▶ │ Attempt       │
//!   └──────────────┘                     └───────┬───────┘
//!          ▲                                     │ success / failure / cancel
//!          └──────────── next generation ◀───────┘
//! ```
//!
//! Collaborator calls that must not be lost go through a local retry
//! wrapper. When it gives up, the generation is abandoned, a platform
//! failure is recorded for the open job and the loop restarts after
//! `workflow_delay`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::activities::{
    ActivityError, AttemptContext, AttemptExecution, AttemptOutcome, AttemptStatus,
    AutoDisableActivity, CheckOutcome, ConnectorSide, JobPersistence, ProgressActivity,
    RetryStatePersistence, ScheduleActivity,
};
use crate::config::OrchestratorConfig;
use crate::failure::{FailureReason, FailureSummary, FailureType};
use crate::retry::RetryManager;
use crate::state::{RunInput, WorkflowState};

/// A mandatory activity that kept failing after local retries.
#[derive(Debug, Error)]
#[error("Activity {activity} failed: {source}")]
pub struct ActivityFailure {
    /// Name of the activity.
    pub activity: &'static str,
    /// Last error it returned.
    #[source]
    pub source: ActivityError,
}

/// Everything the connection manager talks to.
#[derive(Clone)]
pub struct Collaborators {
    /// Schedule lookups.
    pub schedule: Arc<dyn ScheduleActivity>,
    /// Job and attempt rows.
    pub jobs: Arc<dyn JobPersistence>,
    /// Retry counters.
    pub retry_state: Arc<dyn RetryStatePersistence>,
    /// Progress checks after failed attempts.
    pub progress: Arc<dyn ProgressActivity>,
    /// Auto-disable evaluation after a job fails for good.
    pub auto_disable: Arc<dyn AutoDisableActivity>,
    /// Connector runs.
    pub execution: Arc<dyn AttemptExecution>,
}

struct Inner {
    state: WorkflowState,
    attempt_cancel: Option<CancellationToken>,
}

struct Shared {
    inner: Mutex<Inner>,
    notify: Notify,
}

/// How a generation ended.
enum GenerationEnd {
    Continue,
    Deleted,
}

/// Signal and query surface of a running [`ConnectionManager`].
#[derive(Clone)]
pub struct ConnectionManagerHandle {
    connection_id: Uuid,
    shared: Arc<Shared>,
}

impl ConnectionManagerHandle {
    /// Start a sync now instead of waiting for the schedule. Ignored while a job is running.
    pub async fn submit_manual_sync(&self) {
        let mut inner = self.shared.inner.lock().await;
        if inner.state.running {
            info!(connection_id = %self.connection_id, "Sync already running, ignoring manual sync");
            return;
        }
        inner.state.skip_scheduling = true;
        drop(inner);

        info!(connection_id = %self.connection_id, "Manual sync requested");
        self.shared.notify.notify_waiters();
    }

    /// Cancel the running job. Ignored when nothing is running.
    pub async fn cancel_job(&self) {
        let mut inner = self.shared.inner.lock().await;
        if !inner.state.running {
            info!(connection_id = %self.connection_id, "No job running, ignoring cancel");
            return;
        }
        inner.state.cancelled = true;
        if let Some(token) = &inner.attempt_cancel {
            token.cancel();
        }
        drop(inner);

        info!(connection_id = %self.connection_id, "Job cancellation requested");
        self.shared.notify.notify_waiters();
    }

    /// Delete the connection. The running job is cancelled and the workflow stops.
    pub async fn delete_connection(&self) {
        let mut inner = self.shared.inner.lock().await;
        inner.state.deleted = true;
        if inner.state.running {
            inner.state.cancelled = true;
            if let Some(token) = &inner.attempt_cancel {
                token.cancel();
            }
        }
        drop(inner);

        info!(connection_id = %self.connection_id, "Connection deleted");
        self.shared.notify.notify_waiters();
    }

    /// Re-read the schedule without starting a job.
    pub async fn connection_updated(&self) {
        self.shared.inner.lock().await.state.updated = true;
        info!(connection_id = %self.connection_id, "Connection updated");
        self.shared.notify.notify_waiters();
    }

    /// Run a reset job next, cancelling the running attempt if there is one.
    pub async fn reset_connection(&self) {
        self.request_reset(false).await;
    }

    /// Like [`reset_connection`](Self::reset_connection), and run the following
    /// sync without waiting for the schedule.
    pub async fn reset_connection_and_skip_next_scheduling(&self) {
        self.request_reset(true).await;
    }

    async fn request_reset(&self, skip_next: bool) {
        let mut inner = self.shared.inner.lock().await;
        inner.state.reset_requested = true;
        if skip_next {
            inner.state.skip_scheduling_next_workflow = true;
        }
        if inner.state.done_waiting {
            inner.state.cancelled_for_reset = true;
            if let Some(token) = &inner.attempt_cancel {
                token.cancel();
            }
        } else {
            inner.state.skip_scheduling = true;
        }
        drop(inner);

        info!(connection_id = %self.connection_id, skip_next, "Reset requested");
        self.shared.notify.notify_waiters();
    }

    /// Snapshot of the current workflow state.
    pub async fn state(&self) -> WorkflowState {
        self.shared.inner.lock().await.state.clone()
    }

    /// Connection this handle signals.
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }
}

/// Per-connection attempt state machine.
pub struct ConnectionManager {
    connection_id: Uuid,
    config: OrchestratorConfig,
    collaborators: Collaborators,
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Create a manager for `connection_id`. Nothing runs until [`run`](Self::run).
    pub fn new(connection_id: Uuid, config: OrchestratorConfig, collaborators: Collaborators) -> Self {
        Self {
            connection_id,
            config,
            collaborators,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: WorkflowState::default(),
                    attempt_cancel: None,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal and query handle.
    pub fn handle(&self) -> ConnectionManagerHandle {
        ConnectionManagerHandle {
            connection_id: self.connection_id,
            shared: self.shared.clone(),
        }
    }

    /// Run generations until the connection is deleted.
    pub async fn run(&self, mut input: RunInput) {
        info!(connection_id = %self.connection_id, "Connection manager started");

        loop {
            let end = match self.run_generation(&mut input).await {
                Ok(end) => end,
                Err(failure) => {
                    self.recover(failure, &mut input).await;
                    GenerationEnd::Continue
                }
            };

            let deleted = matches!(end, GenerationEnd::Deleted) || self.prepare_for_next_run(&mut input).await;
            if deleted {
                info!(connection_id = %self.connection_id, "Connection deleted, stopping");
                return;
            }
        }
    }

    async fn run_generation(&self, input: &mut RunInput) -> Result<GenerationEnd, ActivityFailure> {
        let connection_id = self.connection_id;
        {
            let mut inner = self.shared.inner.lock().await;
            inner.state.running = input.job_id.is_some();
            if input.skip_scheduling {
                inner.state.skip_scheduling = true;
                input.skip_scheduling = false;
            }
        }

        if input.job_id.is_none() {
            self.ensure_clean_job_state().await?;
        }

        let retry = self.hydrate_retry_manager(input.job_id).await;
        let schedule = self.collaborators.schedule.as_ref();
        let time_until_next_run = self
            .mandatory("time_until_next_run", move || {
                schedule.time_until_next_run(connection_id)
            })
            .await?;

        let wait = if input.from_failure {
            retry
                .as_ref()
                .map(|m| m.backoff_within(time_until_next_run))
                .unwrap_or(Duration::ZERO)
        } else {
            time_until_next_run
        };
        debug!(
            connection_id = %connection_id,
            wait_secs = wait.as_secs(),
            from_failure = input.from_failure,
            "Waiting for next run"
        );

        self.wait_until(wait, WorkflowState::should_interrupt_waiting).await;

        let state = {
            let mut inner = self.shared.inner.lock().await;
            inner.state.done_waiting = true;
            // The wait it interrupted is over.
            inner.state.skip_scheduling = false;
            if !inner.state.deleted && !inner.state.updated && !inner.state.cancelled {
                // Cancels from here on target the job about to be created.
                inner.state.running = true;
            }
            inner.state.clone()
        };

        if state.deleted {
            if input.job_id.is_some() {
                self.report_cancelled(input, Vec::new(), None).await?;
            }
            return Ok(GenerationEnd::Deleted);
        }
        if state.updated {
            info!(connection_id = %connection_id, "Configuration changed, re-reading schedule");
            return Ok(GenerationEnd::Continue);
        }
        if state.cancelled {
            if input.job_id.is_some() {
                self.report_cancelled(input, Vec::new(), None).await?;
            }
            return Ok(GenerationEnd::Continue);
        }

        let retry = self.hydrate_retry_manager(input.job_id).await;
        let is_reset = input.reset_connection || state.reset_requested;
        let jobs = self.collaborators.jobs.as_ref();

        let job_id = match input.job_id {
            Some(job_id) => job_id,
            None => {
                self.mandatory("create_job", move || jobs.create_job(connection_id, is_reset))
                    .await?
            }
        };
        input.job_id = Some(job_id);
        input.attempt_number = self
            .mandatory("create_attempt", move || jobs.create_attempt(job_id))
            .await?;
        self.mandatory("report_job_start", move || jobs.report_job_start(job_id))
            .await?;

        let ctx = AttemptContext {
            connection_id,
            job_id,
            attempt_number: input.attempt_number,
            is_reset,
        };
        info!(
            connection_id = %connection_id,
            job_id,
            attempt = ctx.attempt_number,
            is_reset,
            "Attempt started"
        );

        let token = self.register_attempt().await;
        let outcome = self.run_attempt(ctx, &token).await;
        let state = {
            let mut inner = self.shared.inner.lock().await;
            inner.attempt_cancel = None;
            inner.state.clone()
        };

        let cancel_requested = state.cancelled || state.cancelled_for_reset || state.deleted;
        match outcome? {
            AttemptOutcome::Succeeded(output) => {
                let success_output = &output;
                self.mandatory("job_success", move || {
                    jobs.job_success(job_id, ctx.attempt_number, success_output.clone())
                })
                .await?;
                if let Some(mut retry) = retry {
                    retry.record_success();
                    self.persist_retry_manager(job_id, &retry).await;
                }
                self.shared.inner.lock().await.state.success = true;
                info!(
                    connection_id = %connection_id,
                    job_id,
                    attempt = ctx.attempt_number,
                    bytes = output.bytes_synced,
                    "Attempt succeeded"
                );
                input.reset();
            }
            AttemptOutcome::Cancelled => {
                self.report_cancelled(input, Vec::new(), None).await?;
            }
            AttemptOutcome::Failed {
                failures,
                partial_success,
            } if cancel_requested => {
                self.report_cancelled(input, failures, Some(partial_success))
                    .await?;
            }
            AttemptOutcome::Failed {
                failures,
                partial_success,
            } => {
                self.report_failure(input, retry, failures, partial_success)
                    .await?;
            }
        }

        Ok(GenerationEnd::Continue)
    }

    /// Store a fresh cancellation token for the attempt. Cancels it right away
    /// if a cancel landed before the attempt started.
    async fn register_attempt(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let mut inner = self.shared.inner.lock().await;
        inner.state.running = true;
        if inner.state.cancelled || inner.state.cancelled_for_reset || inner.state.deleted {
            token.cancel();
        }
        inner.attempt_cancel = Some(token.clone());
        token
    }

    async fn run_attempt(
        &self,
        ctx: AttemptContext,
        token: &CancellationToken,
    ) -> Result<AttemptOutcome, ActivityFailure> {
        if token.is_cancelled() {
            return Ok(AttemptOutcome::Cancelled);
        }

        let jobs = self.collaborators.jobs.as_ref();
        let check_first = self
            .mandatory("is_last_job_or_attempt_failure", move || {
                jobs.is_last_job_or_attempt_failure(ctx.connection_id, ctx.job_id)
            })
            .await?;

        if check_first {
            let sides: &[ConnectorSide] = if ctx.is_reset {
                &[ConnectorSide::Destination]
            } else {
                &[ConnectorSide::Source, ConnectorSide::Destination]
            };

            for side in sides {
                let outcome = self
                    .collaborators
                    .execution
                    .check(ctx, *side, token.clone())
                    .await;
                match outcome {
                    Ok(CheckOutcome::Succeeded) => {}
                    Ok(CheckOutcome::Failed(reason)) => {
                        info!(job_id = ctx.job_id, side = ?side, reason = %reason, "Connection check failed");
                        return Ok(AttemptOutcome::Failed {
                            failures: vec![reason],
                            partial_success: false,
                        });
                    }
                    Ok(CheckOutcome::Cancelled) => return Ok(AttemptOutcome::Cancelled),
                    Err(e) => return Ok(platform_failure(&e, ctx)),
                }
            }
        }

        match self.collaborators.execution.run(ctx, token.clone()).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => Ok(platform_failure(&e, ctx)),
        }
    }

    async fn report_failure(
        &self,
        input: &mut RunInput,
        retry: Option<RetryManager>,
        failures: Vec<FailureReason>,
        partial_success: bool,
    ) -> Result<(), ActivityFailure> {
        let connection_id = self.connection_id;
        let Some(job_id) = input.job_id else {
            return Ok(());
        };
        let attempt_number = input.attempt_number;

        let made_progress = match self
            .collaborators
            .progress
            .check_progress(job_id, attempt_number)
            .await
        {
            Ok(made_progress) => made_progress,
            Err(e) => {
                warn!(job_id, attempt = attempt_number, error = %e, "Progress check failed, assuming no progress");
                false
            }
        };
        let status = if made_progress {
            AttemptStatus::Incomplete
        } else {
            AttemptStatus::Failed
        };

        let summary = FailureSummary::new(failures, Some(partial_success));
        let jobs = self.collaborators.jobs.as_ref();
        let attempt_summary = &summary;
        self.mandatory("fail_attempt", move || {
            jobs.fail_attempt(job_id, attempt_number, status, attempt_summary.clone())
        })
        .await?;

        let mut retry = retry;
        if let Some(manager) = retry.as_mut() {
            manager.increment_failure(made_progress);
            self.persist_retry_manager(job_id, manager).await;
        }

        let within_limit = match &retry {
            Some(manager) => manager.should_retry(),
            None => self.max_attempts().await > attempt_number,
        };
        let config_error = summary.primary_type() == Some(FailureType::ConfigError);
        self.shared.inner.lock().await.state.failed = true;

        if within_limit && !config_error {
            info!(
                connection_id = %connection_id,
                job_id,
                attempt = attempt_number,
                made_progress,
                retry = retry.as_ref().map(|m| m.to_string()),
                "Attempt failed, will retry"
            );
            input.from_failure = true;
            return Ok(());
        }

        let reason = if config_error {
            summary
                .failures
                .first()
                .and_then(|f| f.internal_message.clone())
                .unwrap_or_else(|| "Unknown failure reason".to_string())
        } else {
            format!(
                "Job failed after too many retries for connection {}",
                connection_id
            )
        };
        warn!(connection_id = %connection_id, job_id, reason = %reason, "Failing job");

        let fail_reason = &reason;
        self.mandatory("fail_job", move || jobs.fail_job(job_id, fail_reason.clone()))
            .await?;

        let auto_disable = self.collaborators.auto_disable.as_ref();
        let disabled = self
            .mandatory("auto_disable", move || auto_disable.evaluate(connection_id))
            .await?;
        if disabled {
            warn!(connection_id = %connection_id, "Connection disabled after repeated failures");
        }

        input.reset();
        Ok(())
    }

    async fn report_cancelled(
        &self,
        input: &mut RunInput,
        failures: Vec<FailureReason>,
        partial_success: Option<bool>,
    ) -> Result<(), ActivityFailure> {
        let Some(job_id) = input.job_id else {
            return Ok(());
        };
        let attempt_number = input.attempt_number;
        let summary = FailureSummary::for_cancellation(
            Some(job_id),
            Some(attempt_number),
            failures,
            partial_success,
        );

        let jobs = self.collaborators.jobs.as_ref();
        let summary = &summary;
        self.mandatory("job_cancelled", move || {
            jobs.job_cancelled(job_id, attempt_number, summary.clone())
        })
        .await?;
        info!(
            connection_id = %self.connection_id,
            job_id,
            attempt = attempt_number,
            "Job cancelled"
        );

        let cancelled_for_reset = self.shared.inner.lock().await.state.cancelled_for_reset;
        input.reset();
        if cancelled_for_reset {
            input.reset_connection = true;
            input.skip_scheduling = true;
        }
        Ok(())
    }

    /// Fail every job and attempt a previous run left behind.
    async fn ensure_clean_job_state(&self) -> Result<(), ActivityFailure> {
        let connection_id = self.connection_id;
        let jobs = self.collaborators.jobs.as_ref();
        let stale = self
            .mandatory("list_non_terminal_jobs", move || {
                jobs.list_non_terminal_jobs(connection_id)
            })
            .await?;

        for job_id in stale {
            let job = self.mandatory("get_job", move || jobs.get_job(job_id)).await?;
            for attempt_number in job.running_attempts().collect::<Vec<_>>() {
                let summary =
                    FailureSummary::new([FailureReason::stale_state(job_id, Some(attempt_number))], None);
                let summary = &summary;
                self.mandatory("fail_attempt", move || {
                    jobs.fail_attempt(job_id, attempt_number, AttemptStatus::Failed, summary.clone())
                })
                .await?;
            }
            self.mandatory("fail_job", move || {
                jobs.fail_job(
                    job_id,
                    "Failing job because the workflow for this connection was restarted and existing job state was cleaned".to_string(),
                )
            })
            .await?;
            warn!(connection_id = %connection_id, job_id, "Failed stale job left by a previous run");
        }
        Ok(())
    }

    /// Clear per-generation flags. Returns true if the connection was deleted.
    async fn prepare_for_next_run(&self, input: &mut RunInput) -> bool {
        let mut inner = self.shared.inner.lock().await;
        if inner.state.deleted {
            return true;
        }
        if inner.state.skip_scheduling_next_workflow {
            input.skip_scheduling = true;
        }
        inner.state.next_generation();
        inner.attempt_cancel = None;
        debug!(
            connection_id = %self.connection_id,
            generation = inner.state.generation,
            "Starting next generation"
        );
        false
    }

    /// Abandon the generation after a mandatory activity gave up.
    async fn recover(&self, failure: ActivityFailure, input: &mut RunInput) {
        error!(
            connection_id = %self.connection_id,
            activity = failure.activity,
            error = %failure.source,
            delay_secs = self.config.workflow_delay.as_secs(),
            "Mandatory activity failed, restarting workflow after delay"
        );

        self.wait_until(self.config.workflow_delay, |s| s.deleted).await;

        if let Some(job_id) = input.job_id {
            let reason = FailureReason::platform(&failure, Some(job_id), Some(input.attempt_number));
            let summary = FailureSummary::new([reason], None);
            let jobs = &self.collaborators.jobs;
            if let Err(e) = jobs
                .fail_attempt(job_id, input.attempt_number, AttemptStatus::Failed, summary)
                .await
            {
                warn!(job_id, error = %e, "Could not record platform failure for attempt");
            }
            if let Err(e) = jobs.fail_job(job_id, failure.to_string()).await {
                warn!(job_id, error = %e, "Could not fail job after platform failure");
            }
        }

        *input = RunInput::new(self.connection_id);
    }

    /// Wait for `duration`, or until `interrupt` holds for the current state.
    async fn wait_until(&self, duration: Duration, interrupt: fn(&WorkflowState) -> bool) {
        let deadline = Instant::now().checked_add(duration);
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if interrupt(&self.shared.inner.lock().await.state) {
                return;
            }

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => return,
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn hydrate_retry_manager(&self, job_id: Option<i64>) -> Option<RetryManager> {
        match self
            .collaborators
            .retry_state
            .hydrate(self.connection_id, job_id)
            .await
        {
            Ok(manager) => manager,
            Err(e) => {
                warn!(connection_id = %self.connection_id, error = %e, "Could not hydrate retry state");
                None
            }
        }
    }

    async fn persist_retry_manager(&self, job_id: i64, manager: &RetryManager) {
        if let Err(e) = self
            .collaborators
            .retry_state
            .persist(self.connection_id, job_id, manager)
            .await
        {
            warn!(connection_id = %self.connection_id, job_id, error = %e, "Could not persist retry state");
        }
    }

    async fn max_attempts(&self) -> u32 {
        match self.collaborators.schedule.max_attempts().await {
            Ok(max) => max,
            Err(e) => {
                warn!(error = %e, default = self.config.default_max_attempts, "Could not read max attempts");
                self.config.default_max_attempts
            }
        }
    }

    /// Call an activity, retrying locally with backoff.
    async fn mandatory<T, F, Fut>(&self, activity: &'static str, call: F) -> Result<T, ActivityFailure>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = crate::activities::Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(source) if attempt >= self.config.activity_max_attempts => {
                    return Err(ActivityFailure { activity, source });
                }
                Err(e) => {
                    let delay = self.config.activity_retry_delay(attempt);
                    warn!(
                        activity,
                        attempt,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Activity failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

fn platform_failure(error: &ActivityError, ctx: AttemptContext) -> AttemptOutcome {
    AttemptOutcome::Failed {
        failures: vec![FailureReason::platform(
            error,
            Some(ctx.job_id),
            Some(ctx.attempt_number),
        )],
        partial_success: false,
    }
}
