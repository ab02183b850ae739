use crate::AgentState;
use localup_transport::TransportError;
use thiserror::Error;

/// Errors that can occur in the agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Invalid agent state transition: {from} -> {to}")]
    InvalidTransition { from: AgentState, to: AgentState },

    #[error("Failed to dial {addr}: {source}")]
    Dial {
        addr: String,
        source: TransportError,
    },

    #[error("Failed to claim proxy: {principals:?}")]
    ClaimConflict { principals: Vec<String> },

    #[error("Failed to open heartbeat channel: {0}")]
    ChannelOpen(#[source] TransportError),

    #[error("Heartbeat failed: {0}")]
    Liveness(#[source] TransportError),

    #[error("Agent start cancelled")]
    Cancelled,

    #[error("Failed to resolve version: {0}")]
    Version(String),

    #[error("Invalid agent configuration: {0}")]
    InvalidConfig(String),
}
