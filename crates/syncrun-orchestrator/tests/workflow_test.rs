// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Connection manager tests: scheduling, attempts, retries and recovery.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;

use common::*;
use syncrun_launcher::process::mock::{MockBehavior, MockProcessFactory};
use syncrun_launcher::process::EXIT_FAILED;
use syncrun_launcher::{ProcessFactory, StepKind};
use syncrun_orchestrator::activities::{
    AttemptStatus, ConnectorSide, JobPersistence, JobStatus, RetryStatePersistence,
};
use syncrun_orchestrator::failure::{FailureOrigin, FailureReason, FailureSummary, FailureType};
use syncrun_orchestrator::retry::{BackoffPolicy, RetryLimits, RetryManager};
use syncrun_orchestrator::{
    ConnectionDefinition, ConnectorDefinition, ProcessAttemptExecution, RunInput,
};

fn budget(n: u32) -> RetryLimits {
    RetryLimits {
        successive_complete_failures: n,
        total_complete_failures: n,
        successive_partial_failures: n,
        total_partial_failures: n,
    }
}

// ============================================================================
// Scheduling
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_manual_sync_runs_one_job_then_waits_again() {
    let harness = Harness::new(TestSchedule::forever(), None);
    let (handle, task) = harness.start_fresh();

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(harness.jobs().await.is_empty());
    assert!(!handle.state().await.done_waiting);

    handle.submit_manual_sync().await;
    let state = wait_for_state(&handle, |s| s.generation >= 1).await;
    assert!(!state.running);
    assert!(!state.done_waiting);

    let jobs = harness.jobs().await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Succeeded);
    assert_eq!(jobs[0].attempts.len(), 1);
    assert_eq!(jobs[0].attempts[0].status, AttemptStatus::Succeeded);
    assert_eq!(
        harness
            .store
            .output(jobs[0].job_id, 1)
            .await
            .map(|o| o.bytes_synced),
        Some(42)
    );
    assert_eq!(harness.execution.runs().await.len(), 1);

    shutdown(&handle, task).await;
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_run_starts_after_wait() {
    let harness = Harness::new(TestSchedule::new(Duration::from_secs(3600)), None);
    let started = Instant::now();
    let (handle, task) = harness.start_fresh();

    tokio::time::sleep(Duration::from_secs(3599)).await;
    assert!(harness.jobs().await.is_empty());

    let jobs = wait_for_jobs(&harness, |jobs| {
        jobs.first().is_some_and(|j| j.status == JobStatus::Succeeded)
    })
    .await;
    assert_eq!(jobs.len(), 1);
    assert!(started.elapsed() >= Duration::from_secs(3600));

    shutdown(&handle, task).await;
}

#[tokio::test(start_paused = true)]
async fn test_update_rereads_schedule_without_creating_job() {
    let harness = Harness::new(TestSchedule::new(Duration::from_secs(3600)), None);
    let (handle, task) = harness.start_fresh();

    tokio::time::sleep(Duration::from_secs(10)).await;
    handle.connection_updated().await;

    let state = wait_for_state(&handle, |s| s.generation >= 1).await;
    assert!(!state.updated);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(harness.schedule.calls(), 2);
    assert!(harness.jobs().await.is_empty());

    shutdown(&handle, task).await;
}

// ============================================================================
// Connection checks
// ============================================================================

fn definition(harness: &Harness) -> ConnectionDefinition {
    ConnectionDefinition {
        connection_id: harness.connection_id,
        workspace_id: None,
        source: ConnectorDefinition {
            image: "airbyte/source-postgres:3.6.0".to_string(),
            config: json!({ "host": "db.internal" }),
            resources: Default::default(),
        },
        destination: ConnectorDefinition {
            image: "airbyte/destination-s3:1.2.0".to_string(),
            config: json!({ "bucket": "out" }),
            resources: Default::default(),
        },
        catalog: json!({ "streams": [] }),
        state: None,
    }
}

#[tokio::test(start_paused = true)]
async fn test_source_check_config_error_fails_job_without_leaking_processes() {
    let mut harness = Harness::new(TestSchedule::forever(), None);
    let factory = Arc::new(MockProcessFactory::new());
    factory.set_behavior(StepKind::Check, MockBehavior::exiting(EXIT_FAILED));
    harness.execution_override = Some(Arc::new(
        ProcessAttemptExecution::new(factory.clone() as Arc<dyn ProcessFactory>)
            .with_connection(definition(&harness)),
    ));

    // A failed previous job makes the next attempt check its connectors first.
    harness
        .seed_job(1, JobStatus::Failed, AttemptStatus::Failed)
        .await;

    let (handle, task) = harness.start_fresh();
    handle.submit_manual_sync().await;

    let jobs = wait_for_jobs(&harness, |jobs| {
        jobs.iter().any(|j| j.job_id == 2 && j.status == JobStatus::Failed)
    })
    .await;
    let job = &jobs[1];
    assert_eq!(job.attempts.len(), 1);
    assert_eq!(job.attempts[0].status, AttemptStatus::Failed);

    let summary = job.attempts[0].failure_summary.clone().unwrap();
    assert_eq!(summary.failures[0].origin, FailureOrigin::Source);
    assert_eq!(summary.failures[0].failure_type, FailureType::ConfigError);
    assert_eq!(
        harness.store.failure_reason(2).await.as_deref(),
        Some("SOURCE rejected its configuration")
    );

    // Config errors are never retried.
    assert_eq!(harness.auto_disable.calls(), 1);
    assert_eq!(factory.launched_steps().await, vec![StepKind::Check]);
    for process in factory.processes().await {
        assert!(process.destroyed.load(Ordering::SeqCst));
    }

    shutdown(&handle, task).await;
}

#[tokio::test(start_paused = true)]
async fn test_reset_job_skips_source_check() {
    let harness = Harness::new(TestSchedule::forever(), None);
    harness
        .seed_job(1, JobStatus::Failed, AttemptStatus::Failed)
        .await;

    let (handle, task) = harness.start_fresh();
    handle.reset_connection().await;

    wait_for_jobs(&harness, |jobs| {
        jobs.iter().any(|j| j.job_id == 2 && j.status == JobStatus::Succeeded)
    })
    .await;

    let checks = harness.execution.check_calls.lock().await.clone();
    assert_eq!(checks.len(), 1);
    assert_eq!(checks[0].1, ConnectorSide::Destination);
    assert!(checks[0].0.is_reset);

    shutdown(&handle, task).await;
}

// ============================================================================
// Retries
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_backoff_from_failure_waits_before_next_attempt() {
    let template = RetryManager::new(
        Some(BackoffPolicy::new(
            Duration::from_secs(300),
            Duration::from_secs(3600),
        )),
        RetryLimits::default(),
    );
    let harness = Harness::new(
        TestSchedule::new(Duration::from_secs(3600)),
        Some(template.clone()),
    );

    let job_id = harness.store.create_job(harness.connection_id, false).await.unwrap();
    harness.store.create_attempt(job_id).await.unwrap();
    harness
        .store
        .fail_attempt(job_id, 1, AttemptStatus::Failed, FailureSummary::default())
        .await
        .unwrap();
    let mut counters = template.clone();
    counters.increment_failure(false);
    harness
        .retry
        .persist(harness.connection_id, job_id, &counters)
        .await
        .unwrap();

    let started = Instant::now();
    let (handle, task) = harness.start(RunInput {
        job_id: Some(job_id),
        attempt_number: 1,
        from_failure: true,
        ..RunInput::new(harness.connection_id)
    });

    tokio::time::sleep(Duration::from_secs(299)).await;
    assert!(!handle.state().await.done_waiting);
    assert_eq!(harness.jobs().await[0].attempts.len(), 1);

    let jobs = wait_for_jobs(&harness, |jobs| jobs[0].attempts.len() == 2).await;
    assert!(started.elapsed() >= Duration::from_secs(300));
    assert_eq!(jobs[0].job_id, job_id);

    shutdown(&handle, task).await;
}

#[tokio::test(start_paused = true)]
async fn test_retry_budget_exhausted_fails_job_and_evaluates_auto_disable_once() {
    let harness = Harness::new(
        TestSchedule::forever(),
        Some(RetryManager::new(None, budget(1))),
    );
    harness
        .execution
        .script([
            Script::Fail(system_error("destination timed out")),
            Script::Fail(system_error("destination timed out")),
        ])
        .await;

    let (handle, task) = harness.start_fresh();
    handle.submit_manual_sync().await;

    let jobs = wait_for_jobs(&harness, |jobs| {
        jobs.first().is_some_and(|j| j.status == JobStatus::Failed)
    })
    .await;
    assert_eq!(jobs[0].attempts.len(), 2);
    assert!(
        jobs[0]
            .attempts
            .iter()
            .all(|a| a.status == AttemptStatus::Failed)
    );
    assert_eq!(harness.auto_disable.calls(), 1);

    let reason = harness.store.failure_reason(jobs[0].job_id).await.unwrap();
    assert!(reason.contains("too many retries"));

    let counters = harness.retry.get(jobs[0].job_id).await.unwrap();
    assert_eq!(counters.successive_complete_failures, 2);
    assert_eq!(counters.total_complete_failures, 2);

    // The second attempt followed a failure, so both connectors were checked.
    assert_eq!(harness.execution.check_calls.lock().await.len(), 2);

    wait_for_state(&handle, |s| s.generation >= 2).await;
    assert_eq!(harness.auto_disable.calls(), 1);

    shutdown(&handle, task).await;
}

#[tokio::test(start_paused = true)]
async fn test_max_attempts_without_retry_state() {
    let mut schedule = TestSchedule::forever();
    schedule.max_attempts = 2;
    let harness = Harness::new(schedule, None);
    harness
        .execution
        .script([
            Script::Fail(system_error("boom")),
            Script::Fail(system_error("boom")),
        ])
        .await;

    let (handle, task) = harness.start_fresh();
    handle.submit_manual_sync().await;

    let jobs = wait_for_jobs(&harness, |jobs| {
        jobs.first().is_some_and(|j| j.status == JobStatus::Failed)
    })
    .await;
    assert_eq!(jobs[0].attempts.len(), 2);
    assert_eq!(harness.auto_disable.calls(), 1);

    shutdown(&handle, task).await;
}

#[tokio::test(start_paused = true)]
async fn test_config_error_is_not_retried() {
    let harness = Harness::new(
        TestSchedule::forever(),
        Some(RetryManager::new(None, RetryLimits::default())),
    );
    harness
        .execution
        .script([Script::Fail(FailureReason::new(
            FailureOrigin::Destination,
            FailureType::ConfigError,
            "bucket does not exist",
        ))])
        .await;

    let (handle, task) = harness.start_fresh();
    handle.submit_manual_sync().await;

    let jobs = wait_for_jobs(&harness, |jobs| {
        jobs.first().is_some_and(|j| j.status == JobStatus::Failed)
    })
    .await;
    assert_eq!(jobs[0].attempts.len(), 1);
    assert_eq!(
        harness.store.failure_reason(jobs[0].job_id).await.as_deref(),
        Some("bucket does not exist")
    );

    shutdown(&handle, task).await;
}

#[tokio::test(start_paused = true)]
async fn test_partial_progress_counts_as_partial_failure() {
    let harness = Harness::new(
        TestSchedule::forever(),
        Some(RetryManager::new(None, RetryLimits::default())),
    );
    harness.progress.made_progress.store(true, Ordering::SeqCst);
    harness
        .execution
        .script([Script::Fail(system_error("connection reset"))])
        .await;

    let (handle, task) = harness.start_fresh();
    handle.submit_manual_sync().await;

    let jobs = wait_for_jobs(&harness, |jobs| {
        jobs.first().is_some_and(|j| j.status == JobStatus::Succeeded)
    })
    .await;
    assert_eq!(jobs[0].attempts[0].status, AttemptStatus::Incomplete);
    assert_eq!(jobs[0].attempts[1].status, AttemptStatus::Succeeded);
    assert_eq!(harness.progress.calls.load(Ordering::SeqCst), 1);

    // Success clears the counters.
    let counters = harness.retry.get(jobs[0].job_id).await.unwrap();
    assert_eq!(counters.total_partial_failures, 0);

    shutdown(&handle, task).await;
}

// ============================================================================
// Recovery
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_stale_running_job_is_failed_on_start() {
    let harness = Harness::new(TestSchedule::forever(), None);
    harness
        .seed_job(7, JobStatus::Running, AttemptStatus::Running)
        .await;

    let (handle, task) = harness.start_fresh();

    let jobs = wait_for_jobs(&harness, |jobs| jobs[0].status == JobStatus::Failed).await;
    let attempt = &jobs[0].attempts[0];
    assert_eq!(attempt.status, AttemptStatus::Failed);
    let reason = &attempt.failure_summary.as_ref().unwrap().failures[0];
    assert_eq!(reason.origin, FailureOrigin::Platform);
    assert_eq!(reason.failure_type, FailureType::SystemError);
    assert!(
        harness
            .store
            .failure_reason(7)
            .await
            .unwrap()
            .contains("restarted")
    );

    shutdown(&handle, task).await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_mandatory_activity_restarts_after_delay() {
    let harness = Harness::new(TestSchedule::forever(), None);
    harness
        .jobs
        .report_job_start_failures
        .store(2, Ordering::SeqCst);

    let started = Instant::now();
    let (handle, task) = harness.start_fresh();
    handle.submit_manual_sync().await;

    wait_for_state(&handle, |s| s.generation >= 1).await;
    assert!(started.elapsed() >= harness.config.workflow_delay);
    assert!(harness.execution.runs().await.is_empty());

    let jobs = harness.jobs().await;
    assert_eq!(jobs[0].status, JobStatus::Failed);
    let reason = &jobs[0].attempts[0].failure_summary.as_ref().unwrap().failures[0];
    assert_eq!(reason.origin, FailureOrigin::Platform);
    assert_eq!(reason.failure_type, FailureType::SystemError);
    assert!(
        reason
            .internal_message
            .as_deref()
            .unwrap()
            .contains("report_job_start")
    );

    shutdown(&handle, task).await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_schedule_lookup_restarts_without_job() {
    let harness = Harness::new(TestSchedule::forever(), None);
    harness.schedule.failures_left.store(2, Ordering::SeqCst);

    let (handle, task) = harness.start_fresh();

    wait_for_state(&handle, |s| s.generation >= 1).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(harness.schedule.calls(), 3);
    assert!(harness.jobs().await.is_empty());

    shutdown(&handle, task).await;
}
