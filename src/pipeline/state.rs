// src/pipeline/state.rs

use chrono::{DateTime, Utc};
use std::fmt;

use crate::error::PipelineError;

/// Where a single pipeline run is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RunState {
    Pending,
    TransformRunning,
    TransformDone,
    TransformFailed,
    LoadRunning,
    LoadDone,
    LoadFailed,
    Succeeded,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &str {
        match self {
            RunState::Pending => "Pending",
            RunState::TransformRunning => "TransformRunning",
            RunState::TransformDone => "TransformDone",
            RunState::TransformFailed => "TransformFailed",
            RunState::LoadRunning => "LoadRunning",
            RunState::LoadDone => "LoadDone",
            RunState::LoadFailed => "LoadFailed",
            RunState::Succeeded => "Succeeded",
            RunState::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed)
    }

    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Pending, TransformRunning)
                | (TransformRunning, TransformDone)
                | (TransformRunning, TransformFailed)
                | (TransformFailed, Failed)
                | (TransformDone, LoadRunning)
                | (LoadRunning, LoadDone)
                | (LoadRunning, LoadFailed)
                | (LoadDone, Succeeded)
                | (LoadFailed, Failed)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateChange {
    pub state: RunState,
    pub at: DateTime<Utc>,
}

/// Current state plus every state entered so far, oldest first.
#[derive(Clone, Debug)]
pub struct RunTracker {
    history: Vec<StateChange>,
}

impl RunTracker {
    pub fn new() -> Self {
        Self {
            history: vec![StateChange {
                state: RunState::Pending,
                at: Utc::now(),
            }],
        }
    }

    pub fn state(&self) -> RunState {
        // history always holds at least Pending
        self.history
            .last()
            .map(|c| c.state)
            .unwrap_or(RunState::Pending)
    }

    pub fn advance(&mut self, next: RunState) -> Result<(), PipelineError> {
        let from = self.state();
        if !from.can_transition_to(next) {
            return Err(PipelineError::InvalidTransition { from, to: next });
        }
        self.history.push(StateChange {
            state: next,
            at: Utc::now(),
        });
        Ok(())
    }

    pub fn history(&self) -> &[StateChange] {
        &self.history
    }

    pub fn into_history(self) -> Vec<StateChange> {
        self.history
    }
}

impl Default for RunTracker {
    fn default() -> Self {
        Self::new()
    }
}
