//! LocalUp Agent - Reverse tunnel agent for network-isolated nodes
//!
//! The agent dials out from a node that accepts no inbound connections and
//! keeps a secure connection to a proxy open, so the proxy can route traffic
//! back to the node over channels it opens on that connection.
//!
//! # Features
//!
//! - **Lifecycle state machine**: `Initial → Connecting → Connected → Closed`,
//!   reported to the owner through a state callback
//! - **Proxy deduplication**: every agent holds a lease from a shared
//!   [`Tracker`] and claims the principals of the proxy it reached
//! - **Heartbeat**: periodic fire-and-forget pings on a dedicated channel
//! - **Version handshake**: answers the proxy's `version` global requests
//! - **Pool management**: [`AgentPool`] keeps the desired number of agents
//!   connected with reconnect backoff
//!
//! # Example Usage
//!
//! ```ignore
//! use localup_agent::{AgentPool, AgentPoolConfig, StaticVersion};
//! use std::sync::Arc;
//!
//! # async fn example(dialer: Arc<dyn localup_transport::Dialer>,
//! #                  transporter: Arc<dyn localup_transport::TransportBuilder>)
//! #     -> Result<(), Box<dyn std::error::Error>> {
//! let config = AgentPoolConfig::from_file("agent-pool.yaml")?;
//! let pool = AgentPool::new(config, dialer, transporter, Arc::new(StaticVersion::current()))?;
//!
//! pool.start();
//! tokio::signal::ctrl_c().await?;
//! pool.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! 1. **Lease**: the pool takes a lease from the tracker's supply
//! 2. **Dial**: the agent connects to the proxy address
//! 3. **Claim**: the proxy's principals are claimed on the lease
//! 4. **Duties**: global requests, transport channels and heartbeats are
//!    served on their own tasks
//! 5. **Teardown**: stop, a failed ping or a lost connection closes the
//!    agent and releases its lease, which lets the pool dial again

mod agent;
mod config;
mod error;
mod heartbeat;
mod pool;
mod reconnect;
mod requests;
mod state;
mod version;

pub use agent::{Agent, AgentConfig, StateCallback};
pub use config::{AgentPoolConfig, ConfigError, UnknownRequestPolicy};
pub use error::AgentError;
pub use pool::{AgentEvent, AgentPool};
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectManager};
pub use state::AgentState;
pub use version::{StaticVersion, VersionResolver};

pub use localup_track::{Lease, LeaseSupply, Tracker, TrackerConfig};

/// Global request the proxy sends to learn the agent's version
pub const VERSION_REQUEST: &str = "version";

/// Request sent on the heartbeat channel
pub const PING_REQUEST: &str = "ping";

/// Channel opened by the agent to carry heartbeats
pub const HEARTBEAT_CHANNEL: &str = "heartbeat";

/// Channel type opened by the proxy to carry proxied traffic
pub const TRANSPORT_CHANNEL: &str = "transport";
