// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Structured failure reasons.
//!
//! Every terminal job state carries a [`FailureSummary`], even when the cause
//! was an infrastructure fault, so operators can tell a misconfigured
//! connector apart from platform trouble.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Component a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureOrigin {
    /// The source connector.
    Source,
    /// The destination connector.
    Destination,
    /// Record replication between the two.
    Replication,
    /// The platform itself.
    Platform,
    /// Could not be attributed.
    Unknown,
}

impl FailureOrigin {
    /// Upper-case name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureOrigin::Source => "SOURCE",
            FailureOrigin::Destination => "DESTINATION",
            FailureOrigin::Replication => "REPLICATION",
            FailureOrigin::Platform => "PLATFORM",
            FailureOrigin::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for FailureOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    /// The user's configuration is wrong; retrying will not help.
    ConfigError,
    /// Something broke in the platform or the connector.
    SystemError,
    /// A failure that is expected to go away on its own.
    TransientError,
    /// The attempt was cancelled on request.
    ManualCancellation,
}

impl FailureType {
    /// Upper-case name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureType::ConfigError => "CONFIG_ERROR",
            FailureType::SystemError => "SYSTEM_ERROR",
            FailureType::TransientError => "TRANSIENT_ERROR",
            FailureType::ManualCancellation => "MANUAL_CANCELLATION",
        }
    }
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One reason an attempt failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReason {
    /// Where the failure came from.
    pub origin: FailureOrigin,
    /// What kind of failure it is.
    pub failure_type: FailureType,
    /// Message shown to users.
    pub external_message: String,
    /// Message for operators.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_message: Option<String>,
    /// Job the failure belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<i64>,
    /// Attempt the failure belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_number: Option<u32>,
    /// When the failure was recorded.
    pub timestamp: DateTime<Utc>,
}

impl FailureReason {
    /// Failure with the same message for users and operators.
    pub fn new(origin: FailureOrigin, failure_type: FailureType, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            origin,
            failure_type,
            internal_message: Some(message.clone()),
            external_message: message,
            job_id: None,
            attempt_number: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach job and attempt.
    pub fn for_attempt(mut self, job_id: Option<i64>, attempt_number: Option<u32>) -> Self {
        self.job_id = job_id;
        self.attempt_number = attempt_number;
        self
    }

    /// Platform-side failure, e.g. a collaborator that kept failing.
    pub fn platform(error: &dyn std::error::Error, job_id: Option<i64>, attempt_number: Option<u32>) -> Self {
        Self {
            external_message: "Something went wrong within the platform".to_string(),
            internal_message: Some(error.to_string()),
            ..Self::new(FailureOrigin::Platform, FailureType::SystemError, "")
        }
        .for_attempt(job_id, attempt_number)
    }

    /// Cancellation requested by a user or by connection deletion.
    pub fn manual_cancellation(job_id: Option<i64>, attempt_number: Option<u32>) -> Self {
        Self::new(
            FailureOrigin::Platform,
            FailureType::ManualCancellation,
            "The sync was cancelled.",
        )
        .for_attempt(job_id, attempt_number)
    }

    /// Failure recorded for work left running by a previous generation.
    pub fn stale_state(job_id: i64, attempt_number: Option<u32>) -> Self {
        Self {
            external_message: "Setting attempt to FAILED because the workflow for this connection was restarted, and existing job state was cleaned.".to_string(),
            ..Self::new(
                FailureOrigin::Platform,
                FailureType::SystemError,
                "Workflow restarted with a non-terminal job or attempt",
            )
        }
        .for_attempt(Some(job_id), attempt_number)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}: {}",
            self.origin, self.failure_type, self.external_message
        )
    }
}

/// Failures attached to a terminal attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailureSummary {
    /// Failure reasons, oldest first.
    pub failures: Vec<FailureReason>,
    /// Whether some data was committed before the failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_success: Option<bool>,
}

impl FailureSummary {
    /// Summary of `failures`, sorted by time.
    pub fn new(failures: impl IntoIterator<Item = FailureReason>, partial_success: Option<bool>) -> Self {
        let mut failures: Vec<_> = failures.into_iter().collect();
        failures.sort_by_key(|f| f.timestamp);
        Self {
            failures,
            partial_success,
        }
    }

    /// Summary for a cancelled attempt. Always carries a manual cancellation reason.
    pub fn for_cancellation(
        job_id: Option<i64>,
        attempt_number: Option<u32>,
        failures: impl IntoIterator<Item = FailureReason>,
        partial_success: Option<bool>,
    ) -> Self {
        let mut summary = Self::new(failures, partial_success);
        summary
            .failures
            .push(FailureReason::manual_cancellation(job_id, attempt_number));
        summary
    }

    /// First failure's type, which decides whether a retry can help.
    pub fn primary_type(&self) -> Option<FailureType> {
        self.failures.first().map(|f| f.failure_type)
    }

    /// Whether any reason is a manual cancellation.
    pub fn is_cancellation(&self) -> bool {
        self.failures
            .iter()
            .any(|f| f.failure_type == FailureType::ManualCancellation)
    }
}
