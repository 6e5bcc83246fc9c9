//! Agent lifecycle states

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Initializing,
    Idle,
    Busy,
    Error,
    ShuttingDown,
    Shutdown,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Initializing => "initializing",
            AgentState::Idle => "idle",
            AgentState::Busy => "busy",
            AgentState::Error => "error",
            AgentState::ShuttingDown => "shutting_down",
            AgentState::Shutdown => "shutdown",
        }
    }

    /// Whether the agent may move from `self` to `next`.
    ///
    /// `Initializing -> ShuttingDown` is allowed so an agent that never
    /// finished initialising can still be shut down cleanly.
    pub fn can_transition_to(&self, next: AgentState) -> bool {
        use AgentState::*;
        match (self, next) {
            (Shutdown, _) => false,
            (Initializing, Idle) => true,
            (Idle, Busy) | (Busy, Idle) => true,
            (Initializing | Idle | Busy | ShuttingDown, Error) => true,
            (Initializing | Idle | Busy | Error, ShuttingDown) => true,
            (ShuttingDown, Shutdown) => true,
            _ => false,
        }
    }

    /// States in which messages are accepted
    pub fn accepts_messages(&self) -> bool {
        matches!(self, AgentState::Idle | AgentState::Busy)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentState::Shutdown)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::AgentState::*;

    #[test]
    fn test_happy_path_transitions() {
        assert!(Initializing.can_transition_to(Idle));
        assert!(Idle.can_transition_to(Busy));
        assert!(Busy.can_transition_to(Idle));
        assert!(Idle.can_transition_to(ShuttingDown));
        assert!(ShuttingDown.can_transition_to(Shutdown));
    }

    #[test]
    fn test_error_transitions() {
        assert!(Idle.can_transition_to(Error));
        assert!(Busy.can_transition_to(Error));
        assert!(Error.can_transition_to(ShuttingDown));
        assert!(!Error.can_transition_to(Idle));
        assert!(!Error.can_transition_to(Busy));
    }

    #[test]
    fn test_shutdown_is_terminal() {
        for next in [Initializing, Idle, Busy, Error, ShuttingDown, Shutdown] {
            assert!(!Shutdown.can_transition_to(next));
        }
        assert!(Shutdown.is_terminal());
    }

    #[test]
    fn test_illegal_shortcuts() {
        assert!(!Idle.can_transition_to(Shutdown));
        assert!(!Initializing.can_transition_to(Busy));
        assert!(!ShuttingDown.can_transition_to(Idle));
        assert!(Initializing.can_transition_to(ShuttingDown));
    }

    #[test]
    fn test_accepts_messages() {
        assert!(Idle.accepts_messages());
        assert!(Busy.accepts_messages());
        assert!(!Initializing.accepts_messages());
        assert!(!Error.accepts_messages());
        assert!(!ShuttingDown.accepts_messages());
    }
}
