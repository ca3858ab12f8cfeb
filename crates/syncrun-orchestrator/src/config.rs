// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for syncrun-orchestrator.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Connection manager configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Sleep before restarting a generation whose mandatory activity kept failing.
    pub workflow_delay: Duration,
    /// Calls made to a mandatory activity before giving up on it.
    pub activity_max_attempts: u32,
    /// Delay before the first local retry of a failed activity.
    pub activity_initial_interval: Duration,
    /// Upper bound for local activity retry delays.
    pub activity_max_interval: Duration,
    /// Attempt ceiling used when the scheduler does not answer `max_attempts`.
    pub default_max_attempts: u32,
    /// Connection definition loaded by the binary.
    pub connection_file: Option<PathBuf>,
    /// Interval between scheduled syncs for the binary's connection.
    pub sync_interval: Duration,
    /// Start a sync as soon as the binary starts.
    pub run_on_start: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workflow_delay: Duration::from_secs(600),
            activity_max_attempts: 5,
            activity_initial_interval: Duration::from_secs(1),
            activity_max_interval: Duration::from_secs(30),
            default_max_attempts: 3,
            connection_file: None,
            sync_interval: Duration::from_secs(3600),
            run_on_start: false,
        }
    }
}

fn parse_env<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue { var, value }),
        Err(_) => Ok(default),
    }
}

impl OrchestratorConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let workflow_delay = Duration::from_secs(parse_env(
            "SYNCRUN_WORKFLOW_DELAY_SECS",
            defaults.workflow_delay.as_secs(),
        )?);
        let activity_initial_interval = Duration::from_millis(parse_env(
            "SYNCRUN_ACTIVITY_INITIAL_INTERVAL_MS",
            1_000u64,
        )?);
        let activity_max_interval = Duration::from_millis(parse_env(
            "SYNCRUN_ACTIVITY_MAX_INTERVAL_MS",
            30_000u64,
        )?);

        let activity_max_attempts =
            parse_env("SYNCRUN_ACTIVITY_MAX_ATTEMPTS", defaults.activity_max_attempts)?;
        if activity_max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                var: "SYNCRUN_ACTIVITY_MAX_ATTEMPTS",
                value: "0".to_string(),
            });
        }

        Ok(Self {
            workflow_delay,
            activity_max_attempts,
            activity_initial_interval,
            activity_max_interval,
            default_max_attempts: parse_env(
                "SYNCRUN_DEFAULT_MAX_ATTEMPTS",
                defaults.default_max_attempts,
            )?,
            connection_file: std::env::var("SYNCRUN_CONNECTION_FILE")
                .ok()
                .map(PathBuf::from),
            sync_interval: Duration::from_secs(parse_env(
                "SYNCRUN_SYNC_INTERVAL_SECS",
                defaults.sync_interval.as_secs(),
            )?),
            run_on_start: std::env::var("SYNCRUN_RUN_ON_START")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.run_on_start),
        })
    }

    /// Local retry delay after the `attempt`-th failed call, doubling up to the maximum.
    pub fn activity_retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.activity_initial_interval
            .checked_mul(factor)
            .unwrap_or(self.activity_max_interval)
            .min(self.activity_max_interval)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable is set but cannot be parsed.
    #[error("Invalid value for {var}: {value}")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },
}
