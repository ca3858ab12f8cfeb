// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process module - connector execution backends.

pub mod async_pod;
pub mod docker;
pub mod factory;
pub mod kube_pod;
pub mod mock;
mod traits;

pub use async_pod::{AsyncOrchestratorPodProcess, AsyncPodContext};
pub use docker::DockerProcess;
pub use factory::{DockerProcessFactory, KubeProcessFactory, factory_from_config};
pub use kube_pod::KubePodProcess;
pub use mock::{MockProcess, MockProcessFactory};
pub use traits::*;
