// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Syncrun Orchestrator - run one connection locally
//!
//! Loads a connection definition, wires in-memory persistence around a
//! connection manager and runs it until ctrl-c, which deletes the
//! connection and lets the manager stop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use syncrun_launcher::{LauncherConfig, factory_from_config};
use syncrun_orchestrator::memory::{
    ConsecutiveFailureAutoDisable, FixedSchedule, InMemoryJobStore, InMemoryRetryStore,
};
use syncrun_orchestrator::{
    BackoffPolicy, Collaborators, ConnectionDefinition, ConnectionManager, OrchestratorConfig,
    ProcessAttemptExecution, RetryLimits, RetryManager, RunInput,
};

/// Failed jobs in a row before the connection is disabled.
const AUTO_DISABLE_THRESHOLD: usize = 3;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "syncrun_orchestrator=info,syncrun_launcher=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = OrchestratorConfig::from_env()?;
    let launcher_config = LauncherConfig::from_env()?;

    let path = config
        .connection_file
        .clone()
        .context("SYNCRUN_CONNECTION_FILE must point to a connection definition")?;
    let definition = ConnectionDefinition::from_file(&path)
        .await
        .with_context(|| format!("loading connection from {}", path.display()))?;
    let connection_id = definition.connection_id;

    info!(
        connection_id = %connection_id,
        source = %definition.source.image,
        destination = %definition.destination.image,
        backend = ?launcher_config.backend,
        interval_secs = config.sync_interval.as_secs(),
        "Starting syncrun orchestrator"
    );

    let factory = factory_from_config(&launcher_config);
    let execution = Arc::new(ProcessAttemptExecution::new(factory).with_connection(definition));
    let jobs = Arc::new(InMemoryJobStore::new());
    let retry_template = RetryManager::new(
        Some(BackoffPolicy::new(
            Duration::from_secs(10),
            Duration::from_secs(30 * 60),
        )),
        RetryLimits::default(),
    );

    let collaborators = Collaborators {
        schedule: Arc::new(FixedSchedule::new(
            config.sync_interval,
            config.default_max_attempts,
        )),
        jobs: jobs.clone(),
        retry_state: Arc::new(InMemoryRetryStore::new(Some(retry_template))),
        progress: execution.clone(),
        auto_disable: Arc::new(ConsecutiveFailureAutoDisable::new(
            jobs.clone(),
            AUTO_DISABLE_THRESHOLD,
        )),
        execution,
    };

    let run_on_start = config.run_on_start;
    let manager = ConnectionManager::new(connection_id, config, collaborators);
    let handle = manager.handle();
    let workflow = tokio::spawn(async move { manager.run(RunInput::new(connection_id)).await });

    if run_on_start {
        handle.submit_manual_sync().await;
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, deleting connection");
    handle.delete_connection().await;
    workflow.await?;

    for job in jobs.jobs_for(connection_id).await {
        info!(
            job_id = job.job_id,
            status = ?job.status,
            attempts = job.attempts.len(),
            "Job summary"
        );
    }
    Ok(())
}
