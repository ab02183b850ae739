//! A single reverse tunnel agent

use crate::config::validate_address;
use crate::{
    heartbeat, requests, AgentError, AgentState, UnknownRequestPolicy, VersionResolver,
};
use localup_track::{Lease, Tracker};
use localup_transport::{Connection, Dialer, SecureConnection, TransportBuilder};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Observer notified with the new state after every successful transition
///
/// Invoked while the agent's state lock is held, so notifications arrive in
/// transition order. It must not call back into the agent.
pub type StateCallback = Arc<dyn Fn(AgentState) + Send + Sync>;

type UnclaimFn = Box<dyn FnOnce() + Send>;

/// Everything an agent needs to run
pub struct AgentConfig {
    /// Defaults to a random `agent-<uuid>` id
    pub id: Option<String>,
    /// Proxy address in `host:port` form
    pub addr: String,
    /// Heartbeat interval
    pub keep_alive: Duration,
    pub dialer: Arc<dyn Dialer>,
    pub transporter: Arc<dyn TransportBuilder>,
    pub version: Arc<dyn VersionResolver>,
    pub tracker: Tracker,
    pub lease: Lease,
    pub state_callback: Option<StateCallback>,
    pub unknown_requests: UnknownRequestPolicy,
}

impl fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfig")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("keep_alive", &self.keep_alive)
            .field("lease", &self.lease)
            .field("unknown_requests", &self.unknown_requests)
            .finish_non_exhaustive()
    }
}

pub(crate) struct AgentInner {
    pub(crate) id: String,
    pub(crate) addr: String,
    pub(crate) keep_alive: Duration,
    dialer: Arc<dyn Dialer>,
    pub(crate) transporter: Arc<dyn TransportBuilder>,
    pub(crate) version: Arc<dyn VersionResolver>,
    pub(crate) unknown_requests: UnknownRequestPolicy,
    tracker: Tracker,
    lease: Arc<Lease>,
    state: Mutex<AgentState>,
    state_callback: Mutex<Option<StateCallback>>,
    unclaim: Mutex<Option<UnclaimFn>>,
    client: Mutex<Option<Arc<dyn SecureConnection>>>,
    // Held for the whole teardown so a second caller returns only after the close.
    closing: tokio::sync::Mutex<()>,
    cancel: Mutex<CancellationToken>,
    pub(crate) tasks: TaskTracker,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl AgentInner {
    pub(crate) fn state(&self) -> AgentState {
        *lock(&self.state)
    }

    /// Move to `next` and notify the callback. Returns the previous state.
    pub(crate) fn update_state(&self, next: AgentState) -> Result<AgentState, AgentError> {
        let mut state = lock(&self.state);
        let prev = *state;

        if !prev.can_transition_to(next) {
            return Err(AgentError::InvalidTransition {
                from: prev,
                to: next,
            });
        }
        *state = next;

        debug!(agent_id = %self.id, from = %prev, to = %next, "Agent state changed");

        let callback = lock(&self.state_callback).clone();
        if let Some(callback) = callback {
            callback(next);
        }

        Ok(prev)
    }

    /// Close the connection, release the claim and move to `Closed`
    ///
    /// Safe to call from any task and any number of times; only the first
    /// call that finds a live state performs the transition. Concurrent
    /// callers wait for the connection close already in flight.
    pub(crate) async fn teardown(&self, reason: &str) {
        lock(&self.cancel).cancel();

        let _closing = self.closing.lock().await;

        let client = lock(&self.client).take();
        if let Some(client) = client {
            if let Err(e) = client.close().await {
                debug!(agent_id = %self.id, error = %e, "Connection already closed");
            }
        }

        let unclaim = lock(&self.unclaim).take();
        if let Some(unclaim) = unclaim {
            unclaim();
        }

        if let Ok(prev) = self.update_state(AgentState::Closed) {
            info!(
                agent_id = %self.id,
                proxy = %self.addr,
                from = %prev,
                reason,
                "Agent closed"
            );
        }
    }
}

/// A reverse tunnel agent holding one connection to one proxy
///
/// Clones share the same agent.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        validate_address(&config.addr).map_err(AgentError::InvalidConfig)?;
        if config.keep_alive.is_zero() {
            return Err(AgentError::InvalidConfig(
                "keep_alive must be greater than zero".to_string(),
            ));
        }

        let id = config
            .id
            .unwrap_or_else(|| format!("agent-{}", Uuid::new_v4()));
        let lease = Arc::new(config.lease);
        let release = lease.clone();

        Ok(Self {
            inner: Arc::new(AgentInner {
                id,
                addr: config.addr,
                keep_alive: config.keep_alive,
                dialer: config.dialer,
                transporter: config.transporter,
                version: config.version,
                unknown_requests: config.unknown_requests,
                tracker: config.tracker,
                lease,
                state: Mutex::new(AgentState::Initial),
                state_callback: Mutex::new(config.state_callback),
                unclaim: Mutex::new(Some(Box::new(move || release.release()))),
                client: Mutex::new(None),
                closing: tokio::sync::Mutex::new(()),
                cancel: Mutex::new(CancellationToken::new()),
                tasks: TaskTracker::new(),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    pub fn state(&self) -> AgentState {
        self.inner.state()
    }

    /// Cluster this agent's lease belongs to
    pub fn cluster_name(&self) -> &str {
        self.inner.tracker.cluster_name()
    }

    /// Principals claimed for the proxy this agent reached
    pub fn claimed_principals(&self) -> Vec<String> {
        self.inner.lease.claimed()
    }

    pub fn set_state_callback<F>(&self, callback: F)
    where
        F: Fn(AgentState) + Send + Sync + 'static,
    {
        *lock(&self.inner.state_callback) = Some(Arc::new(callback));
    }

    /// Replace the action run once at teardown (releasing the lease by default)
    pub fn set_unclaim<F>(&self, unclaim: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *lock(&self.inner.unclaim) = Some(Box::new(unclaim));
    }

    /// Connect to the proxy and start serving it
    ///
    /// Returns once the agent is `Connected`. On any failure the agent is
    /// torn down and ends `Closed`. Cancelling `ctx` aborts a pending start
    /// and later closes a connected agent.
    pub async fn start(&self, ctx: &CancellationToken) -> Result<(), AgentError> {
        self.inner.update_state(AgentState::Connecting)?;

        let duties = ctx.child_token();
        *lock(&self.inner.cancel) = duties.clone();
        if self.state().is_terminal() {
            duties.cancel();
        }

        info!(agent_id = %self.inner.id, proxy = %self.inner.addr, "Agent connecting");

        let result = tokio::select! {
            biased;
            _ = duties.cancelled() => Err(AgentError::Cancelled),
            result = self.connect(&duties) => result,
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(
                    agent_id = %self.inner.id,
                    proxy = %self.inner.addr,
                    error = %e,
                    "Agent failed to start"
                );
                self.inner.teardown("start failed").await;
                Err(e)
            }
        }
    }

    async fn connect(&self, duties: &CancellationToken) -> Result<(), AgentError> {
        let inner = &self.inner;

        let Connection {
            handle,
            requests: global_requests,
            channels,
        } = inner
            .dialer
            .dial(&inner.addr)
            .await
            .map_err(|source| AgentError::Dial {
                addr: inner.addr.clone(),
                source,
            })?;

        *lock(&inner.client) = Some(handle.clone());

        let principals = handle.principals();
        if !inner.lease.claim(&principals) {
            return Err(AgentError::ClaimConflict { principals });
        }

        debug!(
            agent_id = %inner.id,
            principals = ?principals,
            remote = %handle.remote_address(),
            "Claimed proxy"
        );

        // The proxy may send its version request before it accepts the
        // heartbeat channel, so requests must be served first.
        inner.tasks.spawn(requests::serve_global_requests(
            inner.clone(),
            global_requests,
            duties.clone(),
        ));
        inner.tasks.spawn(requests::serve_channels(
            inner.clone(),
            channels,
            handle.clone(),
            duties.clone(),
        ));

        let (channel, heartbeat_requests) = heartbeat::open(&handle).await?;
        inner.tasks.spawn(heartbeat::run(
            inner.clone(),
            channel,
            heartbeat_requests,
            duties.clone(),
        ));

        inner.update_state(AgentState::Connected)?;

        info!(
            agent_id = %inner.id,
            proxy = %inner.addr,
            cluster = %inner.tracker.cluster_name(),
            "Agent connected"
        );

        Ok(())
    }

    /// Close the agent. Stopping a closed agent is a no-op.
    ///
    /// Returns once the connection is closed, even when a failing duty
    /// started the teardown first.
    pub async fn stop(&self) -> Result<(), AgentError> {
        if self.state().is_terminal() {
            debug!(agent_id = %self.inner.id, "Agent already stopped");
            return Ok(());
        }
        self.inner.teardown("stopped").await;
        Ok(())
    }

    /// Wait for every task the agent spawned to finish
    pub async fn wait(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &AgentInner {
        &self.inner
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.inner.id)
            .field("addr", &self.inner.addr)
            .field("state", &self.state())
            .finish()
    }
}
