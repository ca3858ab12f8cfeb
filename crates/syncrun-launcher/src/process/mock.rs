// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock process factory for testing.
//!
//! Simulates connector runs without containers or pods. Each step can be
//! scripted with an exit code, canned stdout and a run time; everything a
//! process receives on stdin is captured for assertions.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;

use super::traits::*;
use crate::descriptor::{LaunchDescriptor, StepKind};
use crate::error::LaunchError;

/// Scripted behaviour for one step.
#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Exit code reported when the run completes.
    pub exit_code: i32,
    /// Bytes served on stdout.
    pub stdout: Vec<u8>,
    /// Simulated run time.
    pub run_time: Duration,
    /// Stay running until destroyed.
    pub never_complete: bool,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            exit_code: EXIT_SUCCESS,
            stdout: Vec::new(),
            run_time: Duration::from_millis(10),
            never_complete: false,
        }
    }
}

impl MockBehavior {
    /// Completes with `exit_code`.
    pub fn exiting(exit_code: i32) -> Self {
        Self {
            exit_code,
            ..Self::default()
        }
    }

    /// Stays running until destroyed.
    pub fn never_completing() -> Self {
        Self {
            never_complete: true,
            ..Self::default()
        }
    }

    /// Serve `stdout` before exiting.
    pub fn with_stdout(mut self, stdout: impl Into<Vec<u8>>) -> Self {
        self.stdout = stdout.into();
        self
    }

    /// Run for `run_time` before exiting.
    pub fn with_run_time(mut self, run_time: Duration) -> Self {
        self.run_time = run_time;
        self
    }
}

/// Observable state of one mock process.
#[derive(Debug, Default)]
pub struct MockProcessState {
    /// Descriptor the process was created from.
    pub descriptor: Option<LaunchDescriptor>,
    /// Set once `destroy` was called.
    pub destroyed: AtomicBool,
    /// Bytes written to stdin so far.
    pub stdin: Mutex<Vec<u8>>,
}

/// Process whose lifetime is driven by a [`MockBehavior`].
pub struct MockProcess {
    info: ProcessInfo,
    exit: Arc<ExitCodeCell>,
    state: Arc<MockProcessState>,
    stdin: std::sync::Mutex<Option<ProcessWriter>>,
    stdout: std::sync::Mutex<Option<ProcessReader>>,
}

impl MockProcess {
    fn start(descriptor: &LaunchDescriptor, behavior: MockBehavior) -> (Self, Arc<MockProcessState>) {
        let exit = Arc::new(ExitCodeCell::new());
        let state = Arc::new(MockProcessState {
            descriptor: Some(descriptor.clone()),
            ..Default::default()
        });

        if !behavior.never_complete {
            let exit = exit.clone();
            let code = behavior.exit_code;
            let run_time = behavior.run_time;
            tokio::spawn(async move {
                tokio::time::sleep(run_time).await;
                exit.complete(code);
            });
        }

        let (writer, mut reader) = tokio::io::duplex(64 * 1024);
        {
            let state = state.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8192];
                loop {
                    match reader.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => state.stdin.lock().await.extend_from_slice(&buf[..n]),
                    }
                }
            });
        }

        let process = Self {
            info: ProcessInfo {
                namespace: None,
                name: descriptor.workload_id(),
                image: descriptor.image().to_string(),
                pull_policy: None,
            },
            exit,
            state: state.clone(),
            stdin: std::sync::Mutex::new(Some(Box::new(writer))),
            stdout: std::sync::Mutex::new(Some(Box::new(std::io::Cursor::new(behavior.stdout)))),
        };
        (process, state)
    }
}

#[async_trait]
impl ProcessHandle for MockProcess {
    fn info(&self) -> &ProcessInfo {
        &self.info
    }

    async fn exit_value(&self) -> Result<i32> {
        self.exit.get().ok_or(ProcessError::NotTerminated)
    }

    async fn wait_for(&self) -> Result<i32> {
        Ok(self.exit.wait().await)
    }

    async fn wait_for_timeout(&self, timeout: Duration) -> Result<bool> {
        Ok(tokio::time::timeout(timeout, self.exit.wait()).await.is_ok())
    }

    async fn destroy(&self) -> Result<()> {
        self.state.destroyed.store(true, Ordering::SeqCst);
        self.exit.complete(EXIT_KILLED);
        Ok(())
    }

    async fn take_stdin(&self) -> Option<ProcessWriter> {
        self.stdin.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    async fn take_stdout(&self) -> Option<ProcessReader> {
        self.stdout.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

/// Factory handing out [`MockProcess`]es.
#[derive(Default)]
pub struct MockProcessFactory {
    behaviors: std::sync::Mutex<HashMap<StepKind, MockBehavior>>,
    processes: Mutex<Vec<Arc<MockProcessState>>>,
    launch_failures: AtomicUsize,
}

impl MockProcessFactory {
    /// Every step exits 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the behaviour of `step`.
    pub fn set_behavior(&self, step: StepKind, behavior: MockBehavior) {
        self.behaviors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(step, behavior);
    }

    /// Fail the next `count` launches with `StartFailed`.
    pub fn fail_next_launches(&self, count: usize) {
        self.launch_failures.store(count, Ordering::SeqCst);
    }

    /// State of every process launched so far, in launch order.
    pub async fn processes(&self) -> Vec<Arc<MockProcessState>> {
        self.processes.lock().await.clone()
    }

    /// Steps launched so far, in order.
    pub async fn launched_steps(&self) -> Vec<StepKind> {
        self.processes
            .lock()
            .await
            .iter()
            .filter_map(|p| p.descriptor.as_ref().map(|d| d.step()))
            .collect()
    }
}

#[async_trait]
impl ProcessFactory for MockProcessFactory {
    fn backend(&self) -> &'static str {
        "mock"
    }

    async fn create(
        &self,
        descriptor: &LaunchDescriptor,
    ) -> std::result::Result<Box<dyn ProcessHandle>, LaunchError> {
        let failing = self
            .launch_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(LaunchError::StartFailed("mock launch failure".to_string()));
        }

        let behavior = self
            .behaviors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&descriptor.step())
            .cloned()
            .unwrap_or_default();

        let (process, state) = MockProcess::start(descriptor, behavior);
        self.processes.lock().await.push(state);
        Ok(Box::new(process))
    }
}
