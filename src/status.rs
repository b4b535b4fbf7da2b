//! Environment check status record and its delivery to observers
//!
//! `CheckStatus` is the single record the UI collaborator renders while the
//! runtime environment is being verified. The environment checker mutates it
//! step by step and hands every snapshot to a [`StatusBroadcaster`].

use std::sync::Mutex;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Overall progress of the environment check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Initializing,
    Checking,
    Installing,
    Ready,
    Error,
}

impl OverallStatus {
    fn rank(self) -> u8 {
        match self {
            OverallStatus::Initializing => 0,
            OverallStatus::Checking => 1,
            OverallStatus::Installing => 2,
            OverallStatus::Ready | OverallStatus::Error => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OverallStatus::Ready | OverallStatus::Error)
    }
}

/// Per-dependency classification, in manifest order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyLists {
    pub installed: Vec<String>,
    pub missing: Vec<String>,
    pub installing: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckStatus {
    pub has_runtime: bool,
    pub runtime_version: String,
    pub dependencies: DependencyLists,
    pub overall_status: OverallStatus,
    pub error: Option<String>,
}

impl Default for CheckStatus {
    fn default() -> Self {
        Self {
            has_runtime: false,
            runtime_version: String::new(),
            dependencies: DependencyLists::default(),
            overall_status: OverallStatus::Initializing,
            error: None,
        }
    }
}

impl CheckStatus {
    /// Move the overall status forward.
    ///
    /// Returns `false` and leaves the record untouched when `next` would move
    /// backwards, leave a terminal state, or report `ready` while dependencies
    /// are still missing.
    pub fn advance(&mut self, next: OverallStatus) -> bool {
        let current = self.overall_status;
        if current.is_terminal() || next.rank() <= current.rank() {
            warn!("Ignoring status transition {current:?} -> {next:?}");
            return false;
        }
        if next == OverallStatus::Ready && !self.dependencies.missing.is_empty() {
            warn!(
                "Refusing to report ready with {} missing dependencies",
                self.dependencies.missing.len()
            );
            return false;
        }
        self.overall_status = next;
        true
    }

    /// Record a terminal error with a human-readable cause
    pub fn fail(&mut self, message: impl Into<String>) -> bool {
        if self.overall_status.is_terminal() {
            return false;
        }
        self.error = Some(message.into());
        self.overall_status = OverallStatus::Error;
        true
    }

    pub fn is_ready(&self) -> bool {
        self.overall_status == OverallStatus::Ready
    }
}

/// Delivery of status snapshots to the UI collaborator
pub trait StatusBroadcaster: Send + Sync {
    /// Called after every mutation with the full record
    fn publish(&self, status: &CheckStatus);

    /// Latest published record, for observers that attach late
    fn current(&self) -> CheckStatus;
}

/// Push delivery through a watch channel; late subscribers read the latest value
pub struct WatchBroadcaster {
    tx: watch::Sender<CheckStatus>,
}

impl WatchBroadcaster {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(CheckStatus::default());
        Self { tx }
    }

    /// New subscriber; sees the current record immediately, then every change
    pub fn subscribe(&self) -> watch::Receiver<CheckStatus> {
        self.tx.subscribe()
    }
}

impl Default for WatchBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBroadcaster for WatchBroadcaster {
    fn publish(&self, status: &CheckStatus) {
        // send_replace keeps the value even with zero receivers
        self.tx.send_replace(status.clone());
    }

    fn current(&self) -> CheckStatus {
        self.tx.borrow().clone()
    }
}

/// Pull-only delivery: keeps the latest snapshot and logs each change
#[derive(Default)]
pub struct LogBroadcaster {
    latest: Mutex<CheckStatus>,
}

impl StatusBroadcaster for LogBroadcaster {
    fn publish(&self, status: &CheckStatus) {
        debug!(
            "environment status: {:?} (installed {}, missing {})",
            status.overall_status,
            status.dependencies.installed.len(),
            status.dependencies.missing.len()
        );
        let mut latest = self.latest.lock().unwrap_or_else(|p| p.into_inner());
        *latest = status.clone();
    }

    fn current(&self) -> CheckStatus {
        self.latest
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}
