//! LocalUp - Reverse tunnel agents for network-isolated nodes
//!
//! A node that cannot accept inbound connections runs a pool of agents that
//! dial out to a proxy and keep those connections alive. The proxy reaches the
//! node by opening channels back over them.
//!
//! # Quick Start
//!
//! ```ignore
//! use localup::{AgentPool, AgentPoolConfig, StaticVersion};
//! use std::sync::Arc;
//!
//! # async fn example(dialer: Arc<dyn localup::Dialer>,
//! #                  transporter: Arc<dyn localup::TransportBuilder>)
//! #     -> Result<(), Box<dyn std::error::Error>> {
//! let config = AgentPoolConfig::new("proxy.example.com:3024", "example");
//! let pool = AgentPool::new(config, dialer, transporter, Arc::new(StaticVersion::current()))?;
//!
//! pool.start();
//! // ...
//! pool.stop().await;
//! pool.wait().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Crates
//!
//! - **`localup-transport`**: Secure connection, channel and dialer abstractions
//! - **`localup-track`**: Lease tracker deduplicating proxies across a pool
//! - **`localup-agent`**: Agent lifecycle, duties and the agent pool
//!
//! All types from these crates are re-exported here for convenience.

// Re-export transport layer
pub use localup_transport::{
    Channel, Connection, Dialer, NewChannel, Request, RequestReply, SecureConnection,
    TransportBuilder, TransportError, TransportResult, TunnelTransport,
};

// Re-export lease tracking
pub use localup_track::{Lease, LeaseSupply, TrackError, Tracker, TrackerConfig};

// Re-export agent types
pub use localup_agent::{
    Agent, AgentConfig, AgentError, AgentEvent, AgentPool, AgentPoolConfig, AgentState,
    ConfigError, ReconnectConfig, StateCallback, StaticVersion, UnknownRequestPolicy,
    VersionResolver, HEARTBEAT_CHANNEL, PING_REQUEST, TRANSPORT_CHANNEL, VERSION_REQUEST,
};
