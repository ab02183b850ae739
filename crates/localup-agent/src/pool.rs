//! Pool keeping one agent per lease connected

use crate::{
    Agent, AgentConfig, AgentError, AgentPoolConfig, AgentState, ReconnectError,
    ReconnectManager, VersionResolver,
};
use localup_track::{Lease, Tracker};
use localup_transport::{Dialer, TransportBuilder};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// State change reported by one of the pool's agents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentEvent {
    pub agent_id: String,
    pub state: AgentState,
}

struct PoolInner {
    config: AgentPoolConfig,
    tracker: Tracker,
    dialer: Arc<dyn Dialer>,
    transporter: Arc<dyn TransportBuilder>,
    version: Arc<dyn VersionResolver>,
    agents: Mutex<HashMap<String, Agent>>,
    events_tx: mpsc::UnboundedSender<AgentEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<AgentEvent>>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<AgentEvent>>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

/// Runs an agent for every lease the tracker supplies
///
/// A failed or closed agent releases its lease, and the tracker supplies a
/// new one, so the pool redials after a backoff.
#[derive(Clone)]
pub struct AgentPool {
    inner: Arc<PoolInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl AgentPool {
    pub fn new(
        config: AgentPoolConfig,
        dialer: Arc<dyn Dialer>,
        transporter: Arc<dyn TransportBuilder>,
        version: Arc<dyn VersionResolver>,
    ) -> Result<Self, AgentError> {
        config
            .validate()
            .map_err(|e| AgentError::InvalidConfig(e.to_string()))?;
        let tracker = Tracker::new(config.tracker_config())
            .map_err(|e| AgentError::InvalidConfig(e.to_string()))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                tracker,
                dialer,
                transporter,
                version,
                agents: Mutex::new(HashMap::new()),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                subscribers: Mutex::new(Vec::new()),
                cancel: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        })
    }

    /// The tracker shared by the pool's agents
    pub fn tracker(&self) -> &Tracker {
        &self.inner.tracker
    }

    /// Start supplying leases and running agents. Calling it again has no effect.
    pub fn start(&self) {
        let Some(events) = lock(&self.inner.events_rx).take() else {
            return;
        };

        info!(
            cluster = %self.inner.config.cluster_name,
            proxy = %self.inner.config.proxy_addr,
            "Starting agent pool"
        );

        self.inner.tracker.start();
        self.inner.tasks.spawn(self.inner.clone().run());
        self.inner
            .tasks
            .spawn(self.inner.clone().watch_events(events));
    }

    /// Receive every agent state change from now on
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<AgentEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.inner.subscribers).push(tx);
        rx
    }

    /// Number of live agents
    pub fn count(&self) -> usize {
        lock(&self.inner.agents).len()
    }

    pub fn count_in_state(&self, state: AgentState) -> usize {
        lock(&self.inner.agents)
            .values()
            .filter(|agent| agent.state() == state)
            .count()
    }

    /// Stop every agent and release every lease
    pub async fn stop(&self) {
        info!(cluster = %self.inner.config.cluster_name, "Stopping agent pool");

        self.inner.tracker.stop_all();

        let agents: Vec<Agent> = lock(&self.inner.agents).drain().map(|(_, a)| a).collect();
        for agent in agents {
            if let Err(e) = agent.stop().await {
                warn!(agent_id = %agent.id(), error = %e, "Failed to stop agent");
            }
        }

        self.inner.cancel.cancel();
    }

    /// Wait for the pool and its agents to finish after [`AgentPool::stop`]
    pub async fn wait(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }
}

impl PoolInner {
    async fn run(self: Arc<Self>) {
        let supply = self.tracker.acquire();
        let mut backoff = ReconnectManager::new(self.config.reconnect.clone());

        loop {
            let lease = tokio::select! {
                _ = self.cancel.cancelled() => break,
                lease = supply.next() => lease,
            };
            let Some(lease) = lease else {
                debug!(cluster = %self.config.cluster_name, "Lease supply closed");
                break;
            };

            let agent = match self.new_agent(lease) {
                Ok(agent) => agent,
                Err(e) => {
                    error!(error = %e, "Failed to create agent");
                    break;
                }
            };
            lock(&self.agents).insert(agent.id().to_string(), agent.clone());

            match agent.start(&self.cancel).await {
                Ok(()) => {
                    backoff.reset();
                    let agent = agent.clone();
                    self.tasks.spawn(async move { agent.wait().await });
                }
                Err(e) => {
                    lock(&self.agents).remove(agent.id());
                    debug!(agent_id = %agent.id(), error = %e, "Agent did not connect");

                    match backoff.wait(&self.cancel).await {
                        Ok(()) => {}
                        Err(ReconnectError::Cancelled) => break,
                        Err(e @ ReconnectError::MaxAttemptsReached) => {
                            error!(
                                cluster = %self.config.cluster_name,
                                proxy = %self.config.proxy_addr,
                                error = %e,
                                "Giving up on proxy"
                            );
                            break;
                        }
                    }
                }
            }
        }

        debug!(cluster = %self.config.cluster_name, "Agent pool loop stopped");
    }

    fn new_agent(&self, lease: Lease) -> Result<Agent, AgentError> {
        let agent_id = format!("agent-{}", Uuid::new_v4());
        let events = self.events_tx.clone();
        let callback_id = agent_id.clone();

        Agent::new(AgentConfig {
            id: Some(agent_id),
            addr: self.config.proxy_addr.clone(),
            keep_alive: self.config.keep_alive,
            dialer: self.dialer.clone(),
            transporter: self.transporter.clone(),
            version: self.version.clone(),
            tracker: self.tracker.clone(),
            lease,
            state_callback: Some(Arc::new(move |state| {
                let _ = events.send(AgentEvent {
                    agent_id: callback_id.clone(),
                    state,
                });
            })),
            unknown_requests: self.config.unknown_requests,
        })
    }

    async fn watch_events(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<AgentEvent>) {
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = self.cancel.cancelled() => {
                    // Closed events from the final stop are already queued.
                    while let Ok(event) = events.try_recv() {
                        self.publish(event);
                    }
                    break;
                }
            };
            let Some(event) = event else {
                break;
            };
            self.publish(event);
        }
    }

    fn publish(&self, event: AgentEvent) {
        if event.state == AgentState::Closed {
            lock(&self.agents).remove(&event.agent_id);
        }

        debug!(
            agent_id = %event.agent_id,
            state = %event.state,
            agents = lock(&self.agents).len(),
            "Agent state changed"
        );

        lock(&self.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }
}
