// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Syncrun Launcher - run a single connector step
//!
//! Launches one connector invocation on the configured backend, streams its
//! stdout and stderr to the log, forwards this process's stdin for write
//! steps and exits with the connector's exit code.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use syncrun_launcher::config::{Backend, KubeMode};
use syncrun_launcher::process::{ProcessHandle, ProcessReader};
use syncrun_launcher::{LaunchDescriptor, LauncherConfig, StepKind, factory_from_config, heartbeat};

#[derive(Parser, Debug)]
#[command(name = "syncrun-launcher", version, about = "Run one connector step")]
struct Cli {
    /// Connector image
    #[arg(long)]
    image: String,

    /// Protocol step: spec, check, discover, read or write
    #[arg(long, value_parser = parse_step)]
    step: StepKind,

    /// Job id
    #[arg(long, default_value = "0")]
    job_id: String,

    /// Attempt number
    #[arg(long, default_value_t = 0)]
    attempt: u32,

    /// Connector configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Configured catalog file
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Input state file
    #[arg(long)]
    state: Option<PathBuf>,

    /// Extra environment for the connector (KEY=VALUE)
    #[arg(long = "env", value_parser = parse_key_value)]
    env: Vec<(String, String)>,

    /// Run on isolated nodes
    #[arg(long)]
    isolated: bool,

    /// Print the structured output after the run (detached pods only)
    #[arg(long)]
    print_output: bool,
}

fn parse_step(value: &str) -> Result<StepKind, String> {
    serde_json::from_value(serde_json::Value::String(value.to_lowercase()))
        .map_err(|_| format!("unknown step '{}'", value))
}

fn parse_key_value(value: &str) -> Result<(String, String), String> {
    value
        .split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", value))
}

async fn read_input(path: &Option<PathBuf>) -> anyhow::Result<Option<String>> {
    match path {
        Some(path) => Ok(Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?,
        )),
        None => Ok(None),
    }
}

async fn descriptor_from_cli(cli: &Cli) -> anyhow::Result<LaunchDescriptor> {
    let mut builder = LaunchDescriptor::builder(&cli.image, cli.step, &cli.job_id, cli.attempt)
        .isolated(cli.isolated);
    if let Some(config) = read_input(&cli.config).await? {
        builder = builder.config(config);
    }
    if let Some(catalog) = read_input(&cli.catalog).await? {
        builder = builder.catalog(catalog);
    }
    if let Some(state) = read_input(&cli.state).await? {
        builder = builder.state(state);
    }
    for (k, v) in &cli.env {
        builder = builder.env(k, v);
    }
    Ok(builder.build())
}

fn log_lines(reader: ProcessReader, stream: &'static str) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => info!(stream, "{}", line),
                Ok(None) => break,
                Err(e) => {
                    warn!(stream, error = %e, "Stream read failed");
                    break;
                }
            }
        }
    })
}

async fn run(process: &dyn ProcessHandle, cli: &Cli) -> anyhow::Result<i32> {
    let mut relays = Vec::new();
    if let Some(stdout) = process.take_stdout().await {
        relays.push(log_lines(stdout, "stdout"));
    }
    if let Some(stderr) = process.take_stderr().await {
        relays.push(log_lines(stderr, "stderr"));
    }
    if let Some(mut stdin) = process.take_stdin().await {
        relays.push(tokio::spawn(async move {
            if let Err(e) = tokio::io::copy(&mut tokio::io::stdin(), &mut stdin).await {
                warn!(error = %e, "Forwarding stdin failed");
            }
        }));
    }

    let code = tokio::select! {
        result = process.wait_for() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, destroying workload");
            process.destroy().await?;
            process.wait_for().await?
        }
    };

    for relay in relays {
        relay.abort();
    }

    if cli.print_output
        && let Some(output) = process.output().await?
    {
        println!("{}", output);
    }
    Ok(code)
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "syncrun_launcher=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let cli = Cli::parse();
    let config = LauncherConfig::from_env()?;
    let descriptor = descriptor_from_cli(&cli).await?;

    info!(
        backend = ?config.backend,
        image = %descriptor.image(),
        step = %descriptor.step(),
        job_id = %descriptor.job_id(),
        attempt = descriptor.attempt(),
        "Starting syncrun launcher"
    );

    // Synchronous pods kill themselves when the heartbeat stops answering.
    let shutdown = CancellationToken::new();
    let heartbeat = if config.backend == Backend::Kube && config.kube_mode == KubeMode::Sync {
        let listener = tokio::net::TcpListener::bind(config.heartbeat_addr)
            .await
            .with_context(|| format!("binding heartbeat on {}", config.heartbeat_addr))?;
        Some(tokio::spawn(heartbeat::serve(listener, shutdown.clone())))
    } else {
        None
    };

    let factory = factory_from_config(&config);
    let process: Arc<dyn ProcessHandle> = Arc::from(factory.create(&descriptor).await?);
    info!(name = %process.info().name, backend = factory.backend(), "Workload launched");

    let code = run(process.as_ref(), &cli).await?;
    info!(exit_code = code, "Workload finished");

    shutdown.cancel();
    if let Some(heartbeat) = heartbeat
        && let Err(e) = heartbeat.await
    {
        warn!(error = %e, "Heartbeat server task failed");
    }

    Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
}
