//! Companion process lifecycle states

use log::{debug, warn};
use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompanionState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl CompanionState {
    pub fn can_transition(self, next: CompanionState) -> bool {
        use CompanionState::*;
        matches!(
            (self, next),
            (NotStarted | Stopped | Failed, Starting)
                | (Starting, Running | Stopping | Stopped | Failed)
                | (Running, Stopping | Stopped | Failed)
                | (Stopping, Stopped | Failed)
        )
    }
}

/// Shared lifecycle state; observers subscribe to changes
#[derive(Debug, Clone)]
pub struct StateCell {
    tx: watch::Sender<CompanionState>,
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(CompanionState::NotStarted);
        Self { tx }
    }

    pub fn get(&self) -> CompanionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<CompanionState> {
        self.tx.subscribe()
    }

    /// Apply `next` if it is a legal move from the current state
    pub fn transition(&self, next: CompanionState) -> bool {
        self.tx.send_if_modified(|state| {
            if state.can_transition(next) {
                debug!("companion state {state:?} -> {next:?}");
                *state = next;
                true
            } else {
                if *state != next {
                    warn!("Ignoring companion state transition {state:?} -> {next:?}");
                }
                false
            }
        })
    }

    /// Apply `next` only when currently in `from`
    pub fn transition_from(&self, from: CompanionState, next: CompanionState) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == from && state.can_transition(next) {
                debug!("companion state {state:?} -> {next:?}");
                *state = next;
                true
            } else {
                false
            }
        })
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}
