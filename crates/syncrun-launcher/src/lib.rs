// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Syncrun Launcher - Connector Process Execution
//!
//! This crate turns a connector invocation (image, protocol step, input
//! files, resources) into something that behaves like a local process, no
//! matter where the connector actually runs.
//!
//! # Architecture
//!
//! ```text
//!                 ┌────────────────────┐
//!                 │  LaunchDescriptor  │
//!                 └─────────┬──────────┘
//!                           │ create()
//!                           ▼
//!                 ┌────────────────────┐
//!                 │   ProcessFactory   │
//!                 └─────────┬──────────┘
//!          ┌────────────────┼───────────────────┐
//!          ▼                ▼                   ▼
//!   ┌─────────────┐  ┌──────────────┐  ┌──────────────────────┐
//!   │   Docker    │  │ KubePod      │  │ AsyncOrchestratorPod │
//!   │ (local run) │  │ (stdio relay)│  │ (status documents)   │
//!   └─────────────┘  └──────────────┘  └──────────────────────┘
//! ```
//!
//! # Backends
//!
//! | Backend | Stdio | Exit code source |
//! |---------|-------|------------------|
//! | `docker` | piped from the docker client | container exit status |
//! | `kube` | TCP relays between pod and launcher | main container termination |
//! | `kube-async` | none | status documents, then pod state |
//!
//! # Exit codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Success |
//! | 1 | Workload reported failure |
//! | 2 | Pod vanished without a terminal status |
//! | 3 | Pod terminal, status store silent |
//! | 137 | Out of memory |
//! | 143 | Killed |
//!
//! # Configuration
//!
//! See [`config::LauncherConfig::from_env`] for the `SYNCRUN_*` variables.

#![deny(missing_docs)]

/// Kubernetes API access and pod manifests.
pub mod cluster;
/// Configuration loaded from the environment.
pub mod config;
/// Launch descriptors and process naming.
pub mod descriptor;
/// Status documents and job outputs written by detached workloads.
pub mod docstore;
/// Error types.
pub mod error;
/// Liveness endpoint polled by pod sidecars.
pub mod heartbeat;
/// Relay port leasing.
pub mod ports;
/// Process handles and factories.
pub mod process;

pub use config::{Backend, KubeMode, LauncherConfig};
pub use descriptor::{LaunchDescriptor, LaunchDescriptorBuilder, ResourceRequirements, StepKind};
pub use error::{Error, LaunchError, Result};
pub use process::{ProcessError, ProcessFactory, ProcessHandle, factory_from_config};
