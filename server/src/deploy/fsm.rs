//! Finite state machine for the deploy pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Deploy pipeline state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployState {
    /// No deploy in progress
    Idle,

    /// Hashing the upload and checking its signature
    Verifying,

    /// Extracting into `next/`
    Staging,

    /// Loading config, installing SQL, starting the candidate group and handler
    Installing,

    /// Replacing live state under the reload lock
    Swapping,

    /// Stopping the superseded group
    DrainingOld,
}

/// Deploy pipeline event
#[derive(Debug, Clone)]
pub enum DeployEvent {
    /// A signed upload arrived
    Begin,

    /// An already staged tree is loaded at startup
    Load,

    Verified,

    Staged,

    Installed,

    Swapped,

    Drained,

    /// Any failure; returns to idle
    Fail(String),
}

/// Deploy FSM
#[derive(Debug, Clone)]
pub struct DeployFsm {
    state: DeployState,
    last_error: Option<String>,
    last_success_at: Option<DateTime<Utc>>,
    succeeded: u64,
    failed: u64,
}

/// Snapshot of the FSM for status reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployStatus {
    pub state: DeployState,
    pub last_error: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub succeeded: u64,
    pub failed: u64,
}

impl DeployFsm {
    /// Create a new FSM in idle state
    pub fn new() -> Self {
        Self {
            state: DeployState::Idle,
            last_error: None,
            last_success_at: None,
            succeeded: 0,
            failed: 0,
        }
    }

    /// Get current state
    pub fn state(&self) -> DeployState {
        self.state
    }

    /// Error of the most recent failed deploy
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }

    pub fn status(&self) -> DeployStatus {
        DeployStatus {
            state: self.state,
            last_error: self.last_error.clone(),
            last_success_at: self.last_success_at,
            succeeded: self.succeeded,
            failed: self.failed,
        }
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: DeployEvent) -> Result<(), String> {
        let new_state = match (&self.state, &event) {
            (DeployState::Idle, DeployEvent::Begin) => DeployState::Verifying,
            (DeployState::Idle, DeployEvent::Load) => DeployState::Installing,

            (DeployState::Verifying, DeployEvent::Verified) => DeployState::Staging,
            (DeployState::Staging, DeployEvent::Staged) => DeployState::Installing,
            (DeployState::Installing, DeployEvent::Installed) => DeployState::Swapping,
            (DeployState::Swapping, DeployEvent::Swapped) => DeployState::DrainingOld,

            (DeployState::DrainingOld, DeployEvent::Drained) => {
                self.succeeded += 1;
                self.last_error = None;
                self.last_success_at = Some(Utc::now());
                DeployState::Idle
            }

            (state, DeployEvent::Fail(err)) if *state != DeployState::Idle => {
                self.last_error = Some(err.clone());
                self.failed += 1;
                DeployState::Idle
            }

            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        self.state = new_state;
        Ok(())
    }
}

impl Default for DeployFsm {
    fn default() -> Self {
        Self::new()
    }
}
