// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Attempt execution tests against the mock process factory.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use syncrun_launcher::descriptor::{CATALOG_FILE, CONFIG_FILE, STATE_FILE};
use syncrun_launcher::process::mock::{MockBehavior, MockProcessFactory, MockProcessState};
use syncrun_launcher::process::{
    EXIT_FAILED, EXIT_OOM, ExitCodeCell, ProcessInfo, ProcessReader, Result as ProcessResult,
};
use syncrun_launcher::{LaunchDescriptor, LaunchError, ProcessFactory, ProcessHandle, StepKind};
use syncrun_orchestrator::activities::{
    ActivityError, AttemptContext, AttemptExecution, AttemptOutcome, CheckOutcome, ConnectorSide,
    ProgressActivity,
};
use syncrun_orchestrator::failure::{FailureOrigin, FailureType};
use syncrun_orchestrator::{ConnectionDefinition, ConnectorDefinition, ProcessAttemptExecution};

const RECORDS: &[u8] = b"{\"type\":\"RECORD\",\"record\":{\"stream\":\"users\",\"data\":{\"id\":1}}}\n\
{\"type\":\"RECORD\",\"record\":{\"stream\":\"users\",\"data\":{\"id\":2}}}\n";

fn definition(connection_id: Uuid) -> ConnectionDefinition {
    ConnectionDefinition {
        connection_id,
        workspace_id: Some(Uuid::new_v4()),
        source: ConnectorDefinition {
            image: "airbyte/source-postgres:3.6.0".to_string(),
            config: json!({ "host": "db.internal", "port": 5432 }),
            resources: Default::default(),
        },
        destination: ConnectorDefinition {
            image: "airbyte/destination-s3:1.2.0".to_string(),
            config: json!({ "bucket": "out" }),
            resources: Default::default(),
        },
        catalog: json!({ "streams": [{ "name": "users" }] }),
        state: Some(json!({ "cursor": 41 })),
    }
}

fn setup() -> (Arc<MockProcessFactory>, ProcessAttemptExecution, AttemptContext) {
    let factory = Arc::new(MockProcessFactory::new());
    let connection_id = Uuid::new_v4();
    let execution = ProcessAttemptExecution::new(factory.clone() as Arc<dyn ProcessFactory>)
        .with_connection(definition(connection_id));
    let ctx = AttemptContext {
        connection_id,
        job_id: 12,
        attempt_number: 1,
        is_reset: false,
    };
    (factory, execution, ctx)
}

async fn all_destroyed(factory: &MockProcessFactory) -> bool {
    factory
        .processes()
        .await
        .iter()
        .all(|p| p.destroyed.load(Ordering::SeqCst))
}

/// Stdin is drained by a background task, so give it a chance to catch up.
async fn captured_stdin(process: &MockProcessState, expected: usize) -> Vec<u8> {
    for _ in 0..1000 {
        let stdin = process.stdin.lock().await.clone();
        if stdin.len() >= expected {
            return stdin;
        }
        tokio::task::yield_now().await;
    }
    process.stdin.lock().await.clone()
}

// ============================================================================
// Sync
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_sync_pipes_source_into_destination() {
    let (factory, execution, ctx) = setup();
    factory.set_behavior(StepKind::Read, MockBehavior::default().with_stdout(RECORDS));

    let outcome = execution.run(ctx, CancellationToken::new()).await.unwrap();
    match outcome {
        AttemptOutcome::Succeeded(output) => {
            assert_eq!(output.bytes_synced, RECORDS.len() as u64);
        }
        other => panic!("expected success, got {:?}", other),
    }

    assert_eq!(
        factory.launched_steps().await,
        vec![StepKind::Read, StepKind::Write]
    );
    assert!(all_destroyed(&factory).await);

    let processes = factory.processes().await;
    assert_eq!(captured_stdin(&processes[1], RECORDS.len()).await, RECORDS);
    assert!(execution.check_progress(ctx.job_id, ctx.attempt_number).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_sync_descriptors_carry_payloads() {
    let (factory, execution, ctx) = setup();

    execution.run(ctx, CancellationToken::new()).await.unwrap();

    let processes = factory.processes().await;
    let read = processes[0].descriptor.as_ref().unwrap();
    let write = processes[1].descriptor.as_ref().unwrap();

    assert_eq!(read.job_id(), "12");
    assert_eq!(read.attempt(), 1);
    assert_eq!(read.connection_id(), Some(ctx.connection_id));
    assert!(read.workspace_id().is_some());
    assert!(read.files().contains_key(CONFIG_FILE));
    assert!(read.files().contains_key(CATALOG_FILE));
    assert_eq!(read.files().get(STATE_FILE).map(String::as_str), Some(r#"{"cursor":41}"#));

    assert_eq!(write.image(), "airbyte/destination-s3:1.2.0");
    assert!(write.uses_stdin());
    assert!(write.files().contains_key(CATALOG_FILE));
    assert!(!write.files().contains_key(STATE_FILE));
}

#[tokio::test(start_paused = true)]
async fn test_destination_failure_after_records_is_partial() {
    let (factory, execution, ctx) = setup();
    factory.set_behavior(StepKind::Read, MockBehavior::default().with_stdout(RECORDS));
    factory.set_behavior(StepKind::Write, MockBehavior::exiting(EXIT_FAILED));

    let outcome = execution.run(ctx, CancellationToken::new()).await.unwrap();
    let AttemptOutcome::Failed {
        failures,
        partial_success,
    } = outcome
    else {
        panic!("expected failure, got {:?}", outcome);
    };

    assert!(partial_success);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].origin, FailureOrigin::Destination);
    assert_eq!(failures[0].failure_type, FailureType::SystemError);
    assert_eq!(failures[0].job_id, Some(12));
    assert_eq!(failures[0].attempt_number, Some(1));
    assert!(all_destroyed(&factory).await);
    assert!(execution.check_progress(ctx.job_id, ctx.attempt_number).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_source_out_of_memory_without_records() {
    let (factory, execution, ctx) = setup();
    factory.set_behavior(StepKind::Read, MockBehavior::exiting(EXIT_OOM));

    let outcome = execution.run(ctx, CancellationToken::new()).await.unwrap();
    let AttemptOutcome::Failed {
        failures,
        partial_success,
    } = outcome
    else {
        panic!("expected failure, got {:?}", outcome);
    };

    assert!(!partial_success);
    assert_eq!(failures[0].origin, FailureOrigin::Source);
    assert!(failures[0].external_message.contains("ran out of memory"));
    assert!(!execution.check_progress(ctx.job_id, ctx.attempt_number).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_reset_only_launches_destination() {
    let (factory, execution, mut ctx) = setup();
    ctx.is_reset = true;

    let outcome = execution.run(ctx, CancellationToken::new()).await.unwrap();
    assert!(matches!(outcome, AttemptOutcome::Succeeded(ref o) if o.bytes_synced == 0));
    assert_eq!(factory.launched_steps().await, vec![StepKind::Write]);
    assert!(all_destroyed(&factory).await);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_destroys_both_processes() {
    let (factory, execution, ctx) = setup();
    factory.set_behavior(StepKind::Write, MockBehavior::never_completing());

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        canceller.cancel();
    });

    let outcome = execution.run(ctx, token).await.unwrap();
    assert_eq!(outcome, AttemptOutcome::Cancelled);
    assert_eq!(factory.processes().await.len(), 2);
    assert!(all_destroyed(&factory).await);
}

#[tokio::test(start_paused = true)]
async fn test_launch_failure_is_an_error() {
    let (factory, execution, ctx) = setup();
    factory.fail_next_launches(1);

    let err = execution.run(ctx, CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, ActivityError::Launch(_)));
    assert!(factory.processes().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unknown_connection_is_not_found() {
    let (factory, execution, mut ctx) = setup();
    ctx.connection_id = Uuid::new_v4();

    let err = execution.run(ctx, CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, ActivityError::NotFound(_)));

    let err = execution
        .check(ctx, ConnectorSide::Source, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ActivityError::NotFound(_)));
    assert!(factory.processes().await.is_empty());
}

/// Destination that writes `total` bytes of state messages to a small pipe
/// and only exits once all of them were read.
struct ChattyDestination {
    info: ProcessInfo,
    exit: Arc<ExitCodeCell>,
    stdout: std::sync::Mutex<Option<ProcessReader>>,
}

impl ChattyDestination {
    fn start(descriptor: &LaunchDescriptor, total: usize) -> Self {
        let (reader, mut writer) = tokio::io::duplex(64 * 1024);
        let exit = Arc::new(ExitCodeCell::new());
        let done = exit.clone();
        tokio::spawn(async move {
            let line = format!("{}\n", "s".repeat(1023));
            for _ in 0..total / line.len() {
                if writer.write_all(line.as_bytes()).await.is_err() {
                    done.complete(EXIT_FAILED);
                    return;
                }
            }
            done.complete(0);
        });
        Self {
            info: ProcessInfo {
                namespace: None,
                name: descriptor.process_name(63),
                image: descriptor.image().to_string(),
                pull_policy: None,
            },
            exit,
            stdout: std::sync::Mutex::new(Some(Box::new(reader))),
        }
    }
}

#[async_trait]
impl ProcessHandle for ChattyDestination {
    fn info(&self) -> &ProcessInfo {
        &self.info
    }

    async fn exit_value(&self) -> ProcessResult<i32> {
        self.exit
            .get()
            .ok_or(syncrun_launcher::ProcessError::NotTerminated)
    }

    async fn wait_for(&self) -> ProcessResult<i32> {
        Ok(self.exit.wait().await)
    }

    async fn wait_for_timeout(&self, timeout: Duration) -> ProcessResult<bool> {
        Ok(tokio::time::timeout(timeout, self.exit.wait()).await.is_ok())
    }

    async fn destroy(&self) -> ProcessResult<()> {
        self.exit.complete(syncrun_launcher::process::EXIT_KILLED);
        Ok(())
    }

    async fn take_stdout(&self) -> Option<ProcessReader> {
        self.stdout.lock().unwrap().take()
    }
}

/// Mock sources, chatty destinations.
struct ChattyFactory {
    mock: MockProcessFactory,
}

#[async_trait]
impl ProcessFactory for ChattyFactory {
    fn backend(&self) -> &'static str {
        "chatty"
    }

    async fn create(
        &self,
        descriptor: &LaunchDescriptor,
    ) -> Result<Box<dyn ProcessHandle>, LaunchError> {
        match descriptor.step() {
            StepKind::Write => Ok(Box::new(ChattyDestination::start(descriptor, 1 << 20))),
            _ => self.mock.create(descriptor).await,
        }
    }
}

#[tokio::test]
async fn test_sync_drains_destination_stdout() {
    let connection_id = Uuid::new_v4();
    let factory = Arc::new(ChattyFactory {
        mock: MockProcessFactory::new(),
    });
    let execution = ProcessAttemptExecution::new(factory as Arc<dyn ProcessFactory>)
        .with_connection(definition(connection_id));
    let ctx = AttemptContext {
        connection_id,
        job_id: 12,
        attempt_number: 1,
        is_reset: false,
    };

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        execution.run(ctx, CancellationToken::new()),
    )
    .await
    .expect("a destination writing more than a pipe buffer must not stall the sync")
    .unwrap();
    assert!(matches!(outcome, AttemptOutcome::Succeeded(_)));
}

// ============================================================================
// Check
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_check_exit_codes() {
    let (factory, execution, ctx) = setup();

    let outcome = execution
        .check(ctx, ConnectorSide::Source, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, CheckOutcome::Succeeded);

    factory.set_behavior(StepKind::Check, MockBehavior::exiting(EXIT_FAILED));
    let outcome = execution
        .check(ctx, ConnectorSide::Destination, CancellationToken::new())
        .await
        .unwrap();
    let CheckOutcome::Failed(reason) = outcome else {
        panic!("expected failure, got {:?}", outcome);
    };
    assert_eq!(reason.origin, FailureOrigin::Destination);
    assert_eq!(reason.failure_type, FailureType::ConfigError);

    factory.set_behavior(StepKind::Check, MockBehavior::exiting(EXIT_OOM));
    let outcome = execution
        .check(ctx, ConnectorSide::Source, CancellationToken::new())
        .await
        .unwrap();
    let CheckOutcome::Failed(reason) = outcome else {
        panic!("expected failure, got {:?}", outcome);
    };
    assert_eq!(reason.origin, FailureOrigin::Source);
    assert_eq!(reason.failure_type, FailureType::SystemError);

    let processes = factory.processes().await;
    assert_eq!(processes.len(), 3);
    assert!(all_destroyed(&factory).await);
    let images: Vec<_> = processes
        .iter()
        .map(|p| p.descriptor.as_ref().unwrap().image().to_string())
        .collect();
    assert_eq!(
        images,
        vec![
            "airbyte/source-postgres:3.6.0",
            "airbyte/destination-s3:1.2.0",
            "airbyte/source-postgres:3.6.0",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_check_cancelled() {
    let (factory, execution, ctx) = setup();
    factory.set_behavior(StepKind::Check, MockBehavior::never_completing());

    let token = CancellationToken::new();
    token.cancel();
    let outcome = execution
        .check(ctx, ConnectorSide::Source, token)
        .await
        .unwrap();
    assert_eq!(outcome, CheckOutcome::Cancelled);
    assert!(all_destroyed(&factory).await);
}

// ============================================================================
// Connection definition
// ============================================================================

#[tokio::test]
async fn test_connection_definition_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("connection.json");
    let connection_id = Uuid::new_v4();
    let raw = json!({
        "connection_id": connection_id,
        "source": { "image": "airbyte/source-faker:6.0.0", "config": { "count": 10 } },
        "destination": { "image": "airbyte/destination-dev-null:0.4.0", "config": {} }
    });
    std::fs::write(&path, raw.to_string()).unwrap();

    let definition = ConnectionDefinition::from_file(&path).await.unwrap();
    assert_eq!(definition.connection_id, connection_id);
    assert_eq!(definition.source.image, "airbyte/source-faker:6.0.0");
    assert!(definition.workspace_id.is_none());
    assert!(definition.state.is_none());
    assert!(definition.catalog.is_null());

    std::fs::write(&path, "not json").unwrap();
    assert!(ConnectionDefinition::from_file(&path).await.is_err());
}
