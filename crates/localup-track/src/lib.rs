//! Lease tracking for reverse tunnel agent pools
//!
//! A pool runs several agents that each dial the same proxy address. Behind
//! a load balancer those dials may land on any proxy instance, so the pool
//! needs a coordinator that stops two agents from holding a connection to
//! the same proxy. The [`Tracker`] is that coordinator:
//!
//! 1. **Supply**: [`Tracker::acquire`] yields leases while fewer live leases
//!    exist than the pool wants.
//! 2. **Claim**: once connected, an agent claims the proxy principals on its
//!    lease. The claim fails if another holder already owns one of them.
//! 3. **Release**: releasing (or dropping) a lease frees its principals and
//!    its supply slot, which lets the tracker issue a replacement.

mod lease;

pub use lease::{Lease, LeaseSupply};

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

/// Tracker errors
#[derive(Debug, Error)]
pub enum TrackError {
    #[error("Invalid tracker configuration: {0}")]
    InvalidConfig(String),
}

/// Configuration for a [`Tracker`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Cluster the pool connects to, used in logs
    pub cluster_name: String,

    /// Fixed number of concurrent leases. When unset, the tracker wants one
    /// lease per known proxy that is not claimed elsewhere (at least one while
    /// no proxy is known).
    #[serde(default)]
    pub connection_count: Option<usize>,
}

impl TrackerConfig {
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            connection_count: None,
        }
    }

    /// Use a fixed number of concurrent leases
    pub fn with_connection_count(mut self, count: usize) -> Self {
        self.connection_count = Some(count);
        self
    }

    pub fn validate(&self) -> Result<(), TrackError> {
        if self.cluster_name.is_empty() {
            return Err(TrackError::InvalidConfig(
                "cluster name cannot be empty".to_string(),
            ));
        }
        if self.connection_count == Some(0) {
            return Err(TrackError::InvalidConfig(
                "connection count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Who holds a claimed proxy identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Holder {
    Lease(u64),
    External,
}

#[derive(Debug, Default)]
pub(crate) struct TrackState {
    next_id: u64,
    /// Unreleased lease id -> principals it claimed
    pub(crate) leases: HashMap<u64, Option<Vec<String>>>,
    /// Proxy identity -> current holder
    pub(crate) claims: HashMap<String, Holder>,
    /// Proxies known to exist in the cluster
    expected: HashSet<String>,
}

#[derive(Debug)]
pub(crate) struct Inner {
    cluster_name: String,
    connection_count: Option<usize>,
    state: Mutex<TrackState>,
    changed: Notify,
    cancel: CancellationToken,
    supply_tx: Mutex<Option<mpsc::Sender<Lease>>>,
    supply: LeaseSupply,
}

impl Inner {
    pub(crate) fn lock(&self) -> MutexGuard<'_, TrackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn notify_changed(&self) {
        self.changed.notify_one();
    }

    fn desired(&self, state: &TrackState) -> usize {
        if let Some(count) = self.connection_count {
            return count;
        }
        if state.expected.is_empty() {
            return 1;
        }
        state
            .expected
            .iter()
            .filter(|proxy| state.claims.get(*proxy) != Some(&Holder::External))
            .count()
    }

    fn needs_lease(&self) -> bool {
        let state = self.lock();
        state.leases.len() < self.desired(&state)
    }

    fn issue(self: &Arc<Self>) -> Option<Lease> {
        let mut state = self.lock();
        if self.cancel.is_cancelled() || state.leases.len() >= self.desired(&state) {
            return None;
        }

        state.next_id += 1;
        let id = state.next_id;
        state.leases.insert(id, None);

        tracing::debug!(
            cluster = %self.cluster_name,
            lease_id = id,
            outstanding = state.leases.len(),
            "Issued lease"
        );

        Some(Lease::new(id, self.clone()))
    }

    async fn run_supply(self: Arc<Self>, tx: mpsc::Sender<Lease>) {
        tracing::debug!(cluster = %self.cluster_name, "Lease supply started");

        loop {
            if self.needs_lease() {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = self.changed.notified() => continue,
                    permit = tx.reserve() => {
                        let Ok(permit) = permit else {
                            break;
                        };
                        if let Some(lease) = self.issue() {
                            permit.send(lease);
                        }
                    }
                }
            } else {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = self.changed.notified() => {}
                }
            }
        }

        tracing::debug!(cluster = %self.cluster_name, "Lease supply stopped");
    }
}

/// Pool-wide coordinator handing out exclusive proxy leases
///
/// Cheap to clone; all clones share the same state.
#[derive(Debug, Clone)]
pub struct Tracker {
    inner: Arc<Inner>,
}

impl Tracker {
    /// Create a tracker. Call [`Tracker::start`] to begin supplying leases.
    pub fn new(config: TrackerConfig) -> Result<Self, TrackError> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(1);

        tracing::info!(cluster = %config.cluster_name, "Creating lease tracker");

        Ok(Self {
            inner: Arc::new(Inner {
                cluster_name: config.cluster_name,
                connection_count: config.connection_count,
                state: Mutex::new(TrackState::default()),
                changed: Notify::new(),
                cancel: CancellationToken::new(),
                supply_tx: Mutex::new(Some(tx)),
                supply: LeaseSupply::new(rx),
            }),
        })
    }

    /// Cluster name this tracker was created for
    pub fn cluster_name(&self) -> &str {
        &self.inner.cluster_name
    }

    /// Start supplying leases. Must be called within a tokio runtime;
    /// calling it again has no effect.
    pub fn start(&self) {
        let tx = self
            .inner
            .supply_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(tx) = tx {
            let inner = self.inner.clone();
            tokio::spawn(inner.run_supply(tx));
        }
    }

    /// The supply of leases. Every clone draws from the same supply.
    pub fn acquire(&self) -> LeaseSupply {
        self.inner.supply.clone()
    }

    /// Mark a proxy identity as claimed outside the lease flow
    ///
    /// Returns `false` if the identity was already claimed.
    pub fn claim(&self, identity: impl Into<String>) -> bool {
        let identity = identity.into();
        let mut state = self.inner.lock();

        if state.claims.contains_key(&identity) {
            return false;
        }

        tracing::debug!(
            cluster = %self.inner.cluster_name,
            proxy = %identity,
            "Proxy claimed externally"
        );
        state.claims.insert(identity, Holder::External);
        drop(state);

        self.inner.notify_changed();
        true
    }

    /// Drop an external claim. Claims held by leases are left untouched.
    pub fn unclaim(&self, identity: &str) -> bool {
        let mut state = self.inner.lock();

        if state.claims.get(identity) != Some(&Holder::External) {
            return false;
        }
        state.claims.remove(identity);
        drop(state);

        self.inner.notify_changed();
        true
    }

    /// Check whether any holder claims the identity
    pub fn is_claimed(&self, identity: &str) -> bool {
        self.inner.lock().claims.contains_key(identity)
    }

    /// Replace the set of proxies known to exist in the cluster
    pub fn track_expected<I, S>(&self, proxies: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let expected: HashSet<String> = proxies.into_iter().map(Into::into).collect();

        tracing::debug!(
            cluster = %self.inner.cluster_name,
            proxies = expected.len(),
            "Tracking expected proxies"
        );

        self.inner.lock().expected = expected;
        self.inner.notify_changed();
    }

    /// Number of unreleased leases, including one waiting in the supply
    pub fn outstanding(&self) -> usize {
        self.inner.lock().leases.len()
    }

    /// Number of leases the tracker currently wants outstanding
    pub fn desired_leases(&self) -> usize {
        let state = self.inner.lock();
        self.inner.desired(&state)
    }

    /// Stop the supply and release every outstanding lease
    pub fn stop_all(&self) {
        self.inner.cancel.cancel();

        let released = {
            let mut state = self.inner.lock();
            let released = state.leases.len();
            state.leases.clear();
            state.claims.retain(|_, holder| *holder == Holder::External);
            released
        };

        self.inner.supply.close();

        tracing::info!(
            cluster = %self.inner.cluster_name,
            released,
            "Released all leases"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn started_tracker(config: TrackerConfig) -> Tracker {
        let tracker = Tracker::new(config).unwrap();
        tracker.start();
        tracker
    }

    async fn next_lease(supply: &LeaseSupply) -> Lease {
        tokio::time::timeout(Duration::from_secs(5), supply.next())
            .await
            .expect("timed out waiting for lease")
            .expect("lease supply closed")
    }

    async fn assert_no_lease(supply: &LeaseSupply) {
        let result = tokio::time::timeout(Duration::from_millis(100), supply.next()).await;
        assert!(result.is_err(), "Expected no lease to be available");
    }

    #[test]
    fn test_invalid_config() {
        assert!(Tracker::new(TrackerConfig::new("")).is_err());

        let err = Tracker::new(TrackerConfig::new("test").with_connection_count(0)).unwrap_err();
        assert!(err.to_string().contains("connection count"));
    }

    #[tokio::test]
    async fn test_acquire_single_lease_by_default() {
        let tracker = started_tracker(TrackerConfig::new("test"));
        let supply = tracker.acquire();

        let _lease = next_lease(&supply).await;
        assert_eq!(tracker.outstanding(), 1);
        assert_no_lease(&supply).await;
    }

    #[tokio::test]
    async fn test_release_resupplies() {
        let tracker = started_tracker(TrackerConfig::new("test"));
        let supply = tracker.acquire();

        let lease = next_lease(&supply).await;
        let first_id = lease.id();
        lease.release();
        assert!(lease.is_released());

        let lease = next_lease(&supply).await;
        assert_ne!(lease.id(), first_id);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let tracker = started_tracker(TrackerConfig::new("test").with_connection_count(2));
        let supply = tracker.acquire();

        let a = next_lease(&supply).await;
        let b = next_lease(&supply).await;
        assert!(a.claim(&["proxy-a".to_string()]));

        a.release();
        a.release();

        assert!(!tracker.is_claimed("proxy-a"));
        assert!(!b.is_released());
    }

    #[tokio::test]
    async fn test_connection_count_bounds_supply() {
        let tracker = started_tracker(TrackerConfig::new("test").with_connection_count(3));
        let supply = tracker.acquire();

        let mut leases = Vec::new();
        for _ in 0..3 {
            leases.push(next_lease(&supply).await);
        }
        assert_no_lease(&supply).await;
        assert_eq!(tracker.outstanding(), 3);
    }

    #[tokio::test]
    async fn test_claim_conflict_between_leases() {
        let tracker = started_tracker(TrackerConfig::new("test").with_connection_count(2));
        let supply = tracker.acquire();

        let a = next_lease(&supply).await;
        let b = next_lease(&supply).await;

        assert!(a.claim(&["proxy-1".to_string()]));
        assert!(!b.claim(&["proxy-1".to_string()]));
        assert!(b.claim(&["proxy-2".to_string()]));

        assert_eq!(a.claimed(), vec!["proxy-1".to_string()]);
        assert_eq!(b.claimed(), vec!["proxy-2".to_string()]);
    }

    #[tokio::test]
    async fn test_lease_claims_once() {
        let tracker = started_tracker(TrackerConfig::new("test"));
        let lease = next_lease(&tracker.acquire()).await;

        assert!(lease.claim(&["proxy-1".to_string()]));
        assert!(!lease.claim(&["proxy-2".to_string()]));
        assert!(!tracker.is_claimed("proxy-2"));
    }

    #[tokio::test]
    async fn test_external_claim_blocks_lease() {
        let tracker = started_tracker(TrackerConfig::new("test"));
        assert!(tracker.claim("claimed-proxy"));
        assert!(!tracker.claim("claimed-proxy"));

        let lease = next_lease(&tracker.acquire()).await;
        assert!(!lease.claim(&["claimed-proxy".to_string()]));

        // Releasing the lease leaves the external claim in place
        lease.release();
        assert!(tracker.is_claimed("claimed-proxy"));

        assert!(tracker.unclaim("claimed-proxy"));
        assert!(!tracker.is_claimed("claimed-proxy"));
    }

    #[tokio::test]
    async fn test_unclaim_ignores_lease_claims() {
        let tracker = started_tracker(TrackerConfig::new("test"));
        let lease = next_lease(&tracker.acquire()).await;
        assert!(lease.claim(&["proxy-1".to_string()]));

        assert!(!tracker.unclaim("proxy-1"));
        assert!(tracker.is_claimed("proxy-1"));
    }

    #[tokio::test]
    async fn test_expected_proxies_size_supply() {
        let tracker = started_tracker(TrackerConfig::new("test"));
        tracker.track_expected(["proxy-1", "proxy-2", "proxy-3"]);
        assert_eq!(tracker.desired_leases(), 3);

        tracker.claim("proxy-3");
        assert_eq!(tracker.desired_leases(), 2);

        let supply = tracker.acquire();
        let _a = next_lease(&supply).await;
        let _b = next_lease(&supply).await;
        assert_no_lease(&supply).await;
    }

    #[tokio::test]
    async fn test_dropped_lease_is_released() {
        let tracker = started_tracker(TrackerConfig::new("test"));
        let supply = tracker.acquire();

        {
            let lease = next_lease(&supply).await;
            assert!(lease.claim(&["proxy-1".to_string()]));
        }

        assert!(!tracker.is_claimed("proxy-1"));
        let _lease = next_lease(&supply).await;
    }

    #[tokio::test]
    async fn test_stop_all_releases_everything() {
        let tracker = started_tracker(TrackerConfig::new("test").with_connection_count(2));
        let supply = tracker.acquire();

        let a = next_lease(&supply).await;
        let b = next_lease(&supply).await;
        assert!(a.claim(&["proxy-1".to_string()]));
        tracker.claim("external");

        tracker.stop_all();

        assert_eq!(tracker.outstanding(), 0);
        assert!(a.is_released());
        assert!(b.is_released());
        assert!(!tracker.is_claimed("proxy-1"));
        assert!(tracker.is_claimed("external"));
        assert!(!b.claim(&["proxy-2".to_string()]));

        let next = tokio::time::timeout(Duration::from_secs(5), supply.next())
            .await
            .unwrap();
        assert!(next.is_none());
    }
}
