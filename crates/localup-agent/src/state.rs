use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of an agent, ordered by progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    /// Created, not started
    Initial,
    /// Dialing and setting up the connection
    Connecting,
    /// Connection established, duties running
    Connected,
    /// Terminal
    Closed,
}

impl AgentState {
    /// Only the next state in sequence, or `Closed` from any live state
    pub fn can_transition_to(self, next: AgentState) -> bool {
        matches!(
            (self, next),
            (AgentState::Initial, AgentState::Connecting)
                | (AgentState::Connecting, AgentState::Connected)
                | (AgentState::Initial, AgentState::Closed)
                | (AgentState::Connecting, AgentState::Closed)
                | (AgentState::Connected, AgentState::Closed)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == AgentState::Closed
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentState::Initial => "initial",
            AgentState::Connecting => "connecting",
            AgentState::Connected => "connected",
            AgentState::Closed => "closed",
        };
        f.write_str(name)
    }
}
