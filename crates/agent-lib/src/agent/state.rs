//! Agent lifecycle states

use crate::error::{GlideinError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Starting,
    Probing,
    Advertising,
    Running,
    Draining,
    Terminated,
}

impl AgentState {
    /// Forward-only lifecycle; any state may fall straight to `Terminated`
    pub fn can_transition_to(self, next: AgentState) -> bool {
        use AgentState::*;
        matches!(
            (self, next),
            (Starting, Probing)
                | (Probing, Advertising)
                | (Advertising, Running)
                | (Running, Draining)
                | (Draining, Terminated)
        ) || (next == Terminated && self != Terminated)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentState::Starting => "starting",
            AgentState::Probing => "probing",
            AgentState::Advertising => "advertising",
            AgentState::Running => "running",
            AgentState::Draining => "draining",
            AgentState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Current state plus when each state was entered
#[derive(Debug, Clone)]
pub struct StateMachine {
    current: AgentState,
    history: Vec<(AgentState, i64)>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            current: AgentState::Starting,
            history: vec![(AgentState::Starting, chrono::Utc::now().timestamp())],
        }
    }

    pub fn current(&self) -> AgentState {
        self.current
    }

    pub fn history(&self) -> &[(AgentState, i64)] {
        &self.history
    }

    /// Move to `next`, returning the previous state
    pub fn transition(&mut self, next: AgentState) -> Result<AgentState> {
        if !self.current.can_transition_to(next) {
            return Err(GlideinError::InvalidTransition {
                from: self.current,
                to: next,
            });
        }
        let previous = self.current;
        self.current = next;
        self.history.push((next, chrono::Utc::now().timestamp()));
        Ok(previous)
    }
}
