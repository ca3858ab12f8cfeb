// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Relay port pool.
//!
//! Pods connect back to the launcher on a fixed range of ports so the range can
//! be opened in network policies. Each synchronous process leases two ports and
//! offers them back when it closes.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Bounded pool of relay ports.
///
/// A pool built with [`PortPool::ephemeral`] hands out port 0, letting the OS
/// pick, and ignores returns.
#[derive(Debug)]
pub struct PortPool {
    available: Mutex<VecDeque<u16>>,
    ephemeral: bool,
}

impl PortPool {
    /// Pool holding `count` ports starting at `start`.
    pub fn new(start: u16, count: u16) -> Self {
        let ports = (0..count).filter_map(|i| start.checked_add(i)).collect();
        Self {
            available: Mutex::new(ports),
            ephemeral: false,
        }
    }

    /// Pool holding exactly `ports`.
    pub fn from_ports(ports: impl IntoIterator<Item = u16>) -> Self {
        Self {
            available: Mutex::new(ports.into_iter().collect()),
            ephemeral: false,
        }
    }

    /// Pool that always leases port 0.
    pub fn ephemeral() -> Self {
        Self {
            available: Mutex::new(VecDeque::new()),
            ephemeral: true,
        }
    }

    /// Take a port, if any is free.
    pub fn take(&self) -> Option<u16> {
        if self.ephemeral {
            return Some(0);
        }
        self.lock().pop_front()
    }

    /// Return a port to the pool.
    pub fn offer(&self, port: u16) {
        if self.ephemeral || port == 0 {
            return;
        }
        self.lock().push_back(port);
    }

    /// Number of free ports.
    pub fn available(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<u16>> {
        self.available.lock().unwrap_or_else(|e| e.into_inner())
    }
}
