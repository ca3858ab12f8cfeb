// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Retry decisions.
//!
//! [`RetryManager`] is pure: it holds the failure counters for one job,
//! decides whether another attempt is allowed and how long to back off
//! before it. Counters only grow while the job keeps failing; a successful
//! attempt is the only thing that resets them.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff applied after complete failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Backoff after the first complete failure.
    pub min_interval: Duration,
    /// Upper bound for any backoff.
    pub max_interval: Duration,
    /// Growth factor per additional failure.
    pub base: u32,
}

impl BackoffPolicy {
    /// Policy with the default base of 3.
    pub fn new(min_interval: Duration, max_interval: Duration) -> Self {
        Self {
            min_interval,
            max_interval,
            base: 3,
        }
    }

    /// Backoff after `failures` successive complete failures.
    ///
    /// Zero failures means no backoff; after that the delay is
    /// `min * base^(failures - 1)`, capped at `max`.
    pub fn backoff(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let factor = self.base.max(1).checked_pow(failures - 1).unwrap_or(u32::MAX);
        self.min_interval
            .checked_mul(factor)
            .unwrap_or(self.max_interval)
            .min(self.max_interval)
    }
}

/// Number of failures tolerated before a job is failed for good.
///
/// A limit of `n` allows `n` retries: the job fails once a counter exceeds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryLimits {
    /// Complete failures in a row.
    pub successive_complete_failures: u32,
    /// Complete failures overall.
    pub total_complete_failures: u32,
    /// Partial failures in a row.
    pub successive_partial_failures: u32,
    /// Partial failures overall.
    pub total_partial_failures: u32,
}

impl Default for RetryLimits {
    fn default() -> Self {
        Self {
            successive_complete_failures: 5,
            total_complete_failures: 10,
            successive_partial_failures: 1000,
            total_partial_failures: 20,
        }
    }
}

/// Failure counters and retry policy for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryManager {
    /// Backoff policy for complete failures, if any.
    #[serde(default)]
    pub backoff_policy: Option<BackoffPolicy>,
    /// Retry budget.
    #[serde(default)]
    pub limits: RetryLimits,
    /// Complete failures since the last success.
    #[serde(default)]
    pub successive_complete_failures: u32,
    /// Complete failures recorded for the job.
    #[serde(default)]
    pub total_complete_failures: u32,
    /// Partial failures since the last success.
    #[serde(default)]
    pub successive_partial_failures: u32,
    /// Partial failures recorded for the job.
    #[serde(default)]
    pub total_partial_failures: u32,
}

impl RetryManager {
    /// Fresh counters.
    pub fn new(backoff_policy: Option<BackoffPolicy>, limits: RetryLimits) -> Self {
        Self {
            backoff_policy,
            limits,
            successive_complete_failures: 0,
            total_complete_failures: 0,
            successive_partial_failures: 0,
            total_partial_failures: 0,
        }
    }

    /// Record a failed attempt. `made_progress` makes it a partial failure.
    pub fn increment_failure(&mut self, made_progress: bool) {
        if made_progress {
            self.successive_partial_failures = self.successive_partial_failures.saturating_add(1);
            self.total_partial_failures = self.total_partial_failures.saturating_add(1);
        } else {
            self.successive_complete_failures = self.successive_complete_failures.saturating_add(1);
            self.total_complete_failures = self.total_complete_failures.saturating_add(1);
        }
    }

    /// Record a successful attempt.
    pub fn record_success(&mut self) {
        self.successive_complete_failures = 0;
        self.total_complete_failures = 0;
        self.successive_partial_failures = 0;
        self.total_partial_failures = 0;
    }

    /// Whether another attempt is within budget.
    pub fn should_retry(&self) -> bool {
        self.successive_complete_failures <= self.limits.successive_complete_failures
            && self.total_complete_failures <= self.limits.total_complete_failures
            && self.successive_partial_failures <= self.limits.successive_partial_failures
            && self.total_partial_failures <= self.limits.total_partial_failures
    }

    /// Backoff before the next attempt.
    pub fn backoff(&self) -> Duration {
        self.backoff_policy
            .map(|p| p.backoff(self.successive_complete_failures))
            .unwrap_or(Duration::ZERO)
    }

    /// Backoff, or `remaining` if waiting for the schedule is shorter.
    ///
    /// The backoff never pushes an attempt past the connection's own next
    /// scheduled run.
    pub fn backoff_within(&self, remaining: Duration) -> Duration {
        let backoff = self.backoff();
        if backoff < remaining { backoff } else { remaining }
    }
}

impl fmt::Display for RetryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "complete failures {}/{} successive, {}/{} total; partial failures {}/{} successive, {}/{} total; backoff {}s",
            self.successive_complete_failures,
            self.limits.successive_complete_failures,
            self.total_complete_failures,
            self.limits.total_complete_failures,
            self.successive_partial_failures,
            self.limits.successive_partial_failures,
            self.total_partial_failures,
            self.limits.total_partial_failures,
            self.backoff().as_secs(),
        )
    }
}
