// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow state and per-generation input.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Flags describing what a connection's workflow is doing and what was asked of it.
///
/// Signals only set flags; the workflow loop reads them at its decision
/// points. Flags are cleared when a generation ends, the generation counter
/// is not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowState {
    /// An attempt is in flight, or the job is between attempts after a failure.
    pub running: bool,
    /// The scheduled wait is over for this generation.
    pub done_waiting: bool,
    /// Cancel was requested.
    pub cancelled: bool,
    /// The running attempt is being cancelled so a reset can run.
    pub cancelled_for_reset: bool,
    /// The connection was deleted.
    pub deleted: bool,
    /// The connection configuration changed.
    pub updated: bool,
    /// Run now instead of waiting for the schedule. Cleared when the wait ends.
    pub skip_scheduling: bool,
    /// Carry `skip_scheduling` into the next generation.
    pub skip_scheduling_next_workflow: bool,
    /// The next job created should be a reset.
    pub reset_requested: bool,
    /// The last attempt failed.
    pub failed: bool,
    /// The last attempt succeeded.
    pub success: bool,
    /// Incremented every time the workflow starts over.
    pub generation: u64,
}

impl WorkflowState {
    /// Clear every flag and move to the next generation.
    pub fn next_generation(&mut self) {
        let generation = self.generation + 1;
        *self = Self {
            generation,
            ..Self::default()
        };
    }

    /// Whether a signal asked the scheduled wait to end early.
    pub fn should_interrupt_waiting(&self) -> bool {
        self.skip_scheduling || self.deleted || self.updated || self.cancelled
    }
}

/// Input carried from one generation to the next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInput {
    /// Connection this workflow owns.
    pub connection_id: Uuid,
    /// Job still open from the previous generation.
    pub job_id: Option<i64>,
    /// Attempt count for the open job, starting at 1.
    pub attempt_number: u32,
    /// The previous generation ended with a retryable failure.
    pub from_failure: bool,
    /// Start the next run without waiting for the schedule.
    pub skip_scheduling: bool,
    /// The next job is a reset.
    pub reset_connection: bool,
}

impl RunInput {
    /// Input for a connection with nothing in flight.
    pub fn new(connection_id: Uuid) -> Self {
        Self {
            connection_id,
            job_id: None,
            attempt_number: 1,
            from_failure: false,
            skip_scheduling: false,
            reset_connection: false,
        }
    }

    /// Forget the open job.
    pub fn reset(&mut self) {
        *self = Self::new(self.connection_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_generation_clears_flags() {
        let mut state = WorkflowState {
            running: true,
            cancelled: true,
            skip_scheduling_next_workflow: true,
            generation: 4,
            ..Default::default()
        };
        state.next_generation();
        assert_eq!(
            state,
            WorkflowState {
                generation: 5,
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_should_interrupt_waiting() {
        let mut state = WorkflowState::default();
        assert!(!state.should_interrupt_waiting());
        state.updated = true;
        assert!(state.should_interrupt_waiting());
    }

    #[test]
    fn test_run_input_reset_keeps_connection() {
        let id = Uuid::new_v4();
        let mut input = RunInput {
            job_id: Some(3),
            attempt_number: 2,
            from_failure: true,
            ..RunInput::new(id)
        };
        input.reset();
        assert_eq!(input, RunInput::new(id));
    }
}
