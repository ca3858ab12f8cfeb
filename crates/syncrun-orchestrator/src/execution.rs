// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Attempt execution on top of a [`ProcessFactory`].
//!
//! A check launches one connector with the `check` step and maps its exit
//! code to an outcome. A sync launches the source `read` and destination
//! `write` steps and pipes the source's stdout into the destination's stdin.
//! Every process launched here is destroyed before the call returns.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::activities::{
    ActivityError, AttemptContext, AttemptExecution, AttemptOutcome, CheckOutcome,
    ConnectorSide, ProgressActivity, Result, SyncOutput,
};
use crate::failure::{FailureReason, FailureType};
use syncrun_launcher::process::{
    EXIT_FAILED, EXIT_KILLED, EXIT_OOM, EXIT_SUCCESS, ProcessHandle, ProcessReader,
};
use syncrun_launcher::{LaunchDescriptor, ProcessFactory, ResourceRequirements, StepKind};

/// One side of a connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorDefinition {
    /// Connector image.
    pub image: String,
    /// Connector configuration.
    pub config: serde_json::Value,
    /// Resource constraints.
    #[serde(default)]
    pub resources: ResourceRequirements,
}

/// Everything needed to run a connection's connectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionDefinition {
    /// Connection id.
    pub connection_id: Uuid,
    /// Owning workspace.
    #[serde(default)]
    pub workspace_id: Option<Uuid>,
    /// Source connector.
    pub source: ConnectorDefinition,
    /// Destination connector.
    pub destination: ConnectorDefinition,
    /// Configured catalog shared by both sides.
    #[serde(default)]
    pub catalog: serde_json::Value,
    /// Source state from the last successful sync.
    #[serde(default)]
    pub state: Option<serde_json::Value>,
}

impl ConnectionDefinition {
    /// Load a definition from a JSON file.
    pub async fn from_file(path: &Path) -> crate::error::Result<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn connector(&self, side: ConnectorSide) -> &ConnectorDefinition {
        match side {
            ConnectorSide::Source => &self.source,
            ConnectorSide::Destination => &self.destination,
        }
    }
}

/// [`AttemptExecution`] that runs connectors through a process factory.
///
/// It also answers progress checks: bytes moved by a failed sync count as
/// progress for that attempt.
pub struct ProcessAttemptExecution {
    factory: Arc<dyn ProcessFactory>,
    connections: HashMap<Uuid, ConnectionDefinition>,
    committed: Mutex<HashMap<(i64, u32), u64>>,
}

impl ProcessAttemptExecution {
    /// Execution with no connections registered.
    pub fn new(factory: Arc<dyn ProcessFactory>) -> Self {
        Self {
            factory,
            connections: HashMap::new(),
            committed: Mutex::new(HashMap::new()),
        }
    }

    /// Register a connection.
    pub fn with_connection(mut self, definition: ConnectionDefinition) -> Self {
        self.connections
            .insert(definition.connection_id, definition);
        self
    }

    fn definition(&self, connection_id: Uuid) -> Result<&ConnectionDefinition> {
        self.connections
            .get(&connection_id)
            .ok_or_else(|| ActivityError::NotFound(format!("connection {}", connection_id)))
    }

    fn descriptor(
        &self,
        definition: &ConnectionDefinition,
        side: ConnectorSide,
        step: StepKind,
        ctx: AttemptContext,
    ) -> LaunchDescriptor {
        let connector = definition.connector(side);
        let mut builder = LaunchDescriptor::builder(
            connector.image.clone(),
            step,
            ctx.job_id.to_string(),
            ctx.attempt_number,
        )
        .connection_id(definition.connection_id)
        .config(connector.config.to_string())
        .resources(connector.resources.clone());

        if let Some(workspace_id) = definition.workspace_id {
            builder = builder.workspace_id(workspace_id);
        }
        if matches!(step, StepKind::Read | StepKind::Write) {
            builder = builder.catalog(definition.catalog.to_string());
        }
        if step == StepKind::Read
            && let Some(state) = &definition.state
        {
            builder = builder.state(state.to_string());
        }
        builder.build()
    }
}

/// Destroy a process, logging instead of failing.
async fn destroy_quietly(process: &dyn ProcessHandle) {
    if let Err(e) = process.destroy().await {
        warn!(name = %process.info().name, error = %e, "Failed to destroy process");
    }
}

/// Forward a process stream to the log, one line per event.
fn log_lines(reader: ProcessReader, name: String, stream: &'static str) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(process = %name, stream, "{}", line);
        }
    });
}

fn exit_failure(side: ConnectorSide, step: StepKind, code: i32) -> FailureReason {
    let message = match code {
        EXIT_OOM => format!("{} {} ran out of memory", side.origin(), step),
        EXIT_KILLED => format!("{} {} was killed", side.origin(), step),
        code => format!("{} {} exited with code {}", side.origin(), step, code),
    };
    FailureReason::new(side.origin(), FailureType::SystemError, message)
}

#[async_trait]
impl AttemptExecution for ProcessAttemptExecution {
    async fn check(
        &self,
        ctx: AttemptContext,
        side: ConnectorSide,
        cancel: CancellationToken,
    ) -> Result<CheckOutcome> {
        let definition = self.definition(ctx.connection_id)?;
        let descriptor = self.descriptor(definition, side, StepKind::Check, ctx);
        let process = self.factory.create(&descriptor).await?;
        info!(
            job_id = ctx.job_id,
            attempt = ctx.attempt_number,
            side = ?side,
            name = %process.info().name,
            "Connection check launched"
        );

        let result = tokio::select! {
            code = process.wait_for() => Some(code),
            _ = cancel.cancelled() => None,
        };
        destroy_quietly(process.as_ref()).await;

        let code = match result {
            None => return Ok(CheckOutcome::Cancelled),
            Some(code) => code?,
        };

        let outcome = match code {
            EXIT_SUCCESS => CheckOutcome::Succeeded,
            EXIT_FAILED => CheckOutcome::Failed(
                FailureReason::new(
                    side.origin(),
                    FailureType::ConfigError,
                    format!("{} rejected its configuration", side.origin()),
                )
                .for_attempt(Some(ctx.job_id), Some(ctx.attempt_number)),
            ),
            code => CheckOutcome::Failed(
                exit_failure(side, StepKind::Check, code)
                    .for_attempt(Some(ctx.job_id), Some(ctx.attempt_number)),
            ),
        };
        info!(job_id = ctx.job_id, side = ?side, exit_code = code, "Connection check finished");
        Ok(outcome)
    }

    async fn run(&self, ctx: AttemptContext, cancel: CancellationToken) -> Result<AttemptOutcome> {
        let definition = self.definition(ctx.connection_id)?;

        // Reset jobs only run the destination, with nothing on stdin.
        let source = if ctx.is_reset {
            None
        } else {
            let descriptor = self.descriptor(definition, ConnectorSide::Source, StepKind::Read, ctx);
            Some(self.factory.create(&descriptor).await?)
        };

        let descriptor =
            self.descriptor(definition, ConnectorSide::Destination, StepKind::Write, ctx);
        let destination = match self.factory.create(&descriptor).await {
            Ok(destination) => destination,
            Err(e) => {
                if let Some(source) = &source {
                    destroy_quietly(source.as_ref()).await;
                }
                return Err(e.into());
            }
        };
        info!(
            job_id = ctx.job_id,
            attempt = ctx.attempt_number,
            destination = %destination.info().name,
            source = source.as_ref().map(|s| s.info().name.clone()),
            "Sync launched"
        );

        let pump = pump(source.as_deref(), destination.as_ref());
        let result = tokio::select! {
            result = pump => Some(result),
            _ = cancel.cancelled() => None,
        };

        if let Some(source) = &source {
            destroy_quietly(source.as_ref()).await;
        }
        destroy_quietly(destination.as_ref()).await;

        let Some(result) = result else {
            info!(job_id = ctx.job_id, attempt = ctx.attempt_number, "Sync cancelled");
            return Ok(AttemptOutcome::Cancelled);
        };
        let (bytes_synced, source_code, destination_code) = result?;
        self.committed
            .lock()
            .await
            .insert((ctx.job_id, ctx.attempt_number), bytes_synced);

        let mut failures = Vec::new();
        if let Some(code) = source_code
            && code != EXIT_SUCCESS
        {
            failures.push(exit_failure(ConnectorSide::Source, StepKind::Read, code));
        }
        if destination_code != EXIT_SUCCESS {
            failures.push(exit_failure(
                ConnectorSide::Destination,
                StepKind::Write,
                destination_code,
            ));
        }

        if failures.is_empty() {
            let state = match &source {
                Some(source) => source.output().await.ok().flatten(),
                None => None,
            };
            info!(job_id = ctx.job_id, attempt = ctx.attempt_number, bytes_synced, "Sync finished");
            return Ok(AttemptOutcome::Succeeded(SyncOutput {
                bytes_synced,
                state,
            }));
        }

        let failures = failures
            .into_iter()
            .map(|f| f.for_attempt(Some(ctx.job_id), Some(ctx.attempt_number)))
            .collect::<Vec<_>>();
        warn!(
            job_id = ctx.job_id,
            attempt = ctx.attempt_number,
            failures = failures.len(),
            bytes_synced,
            "Sync failed"
        );
        Ok(AttemptOutcome::Failed {
            failures,
            partial_success: bytes_synced > 0,
        })
    }
}

/// Copy source stdout into destination stdin, then wait for both.
///
/// Returns bytes copied, the source exit code (if there is a source) and the
/// destination exit code.
async fn pump(
    source: Option<&dyn ProcessHandle>,
    destination: &dyn ProcessHandle,
) -> Result<(u64, Option<i32>, i32)> {
    if let Some(stderr) = destination.take_stderr().await {
        log_lines(stderr, destination.info().name.clone(), "stderr");
    }
    // Destination state messages are not consumed, but a full pipe would block it.
    if let Some(stdout) = destination.take_stdout().await {
        log_lines(stdout, destination.info().name.clone(), "stdout");
    }
    if let Some(source) = source
        && let Some(stderr) = source.take_stderr().await
    {
        log_lines(stderr, source.info().name.clone(), "stderr");
    }

    let mut stdin = destination.take_stdin().await;
    let stdout = match source {
        Some(source) => source.take_stdout().await,
        None => None,
    };

    let mut bytes = 0;
    if let (Some(mut stdout), Some(stdin)) = (stdout, stdin.as_mut()) {
        bytes = tokio::io::copy(&mut stdout, stdin).await?;
    }
    if let Some(mut stdin) = stdin {
        // Closing stdin tells the destination there are no more records.
        if let Err(e) = stdin.shutdown().await {
            debug!(error = %e, "Destination stdin already closed");
        }
    }

    let source_code = match source {
        Some(source) => Some(source.wait_for().await?),
        None => None,
    };
    let destination_code = destination.wait_for().await?;
    Ok((bytes, source_code, destination_code))
}

#[async_trait]
impl ProgressActivity for ProcessAttemptExecution {
    async fn check_progress(&self, job_id: i64, attempt_number: u32) -> Result<bool> {
        Ok(self
            .committed
            .lock()
            .await
            .get(&(job_id, attempt_number))
            .is_some_and(|bytes| *bytes > 0))
    }
}
