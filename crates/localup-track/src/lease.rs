//! Leases and the lease supply

use crate::{Holder, Inner};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// An exclusive, single-use claim token issued by a [`crate::Tracker`]
///
/// A lease starts unkeyed. [`Lease::claim`] binds it to the principals of
/// the proxy the agent actually reached. Dropping a lease releases it.
pub struct Lease {
    id: u64,
    tracker: Arc<Inner>,
}

impl Lease {
    pub(crate) fn new(id: u64, tracker: Arc<Inner>) -> Self {
        Self { id, tracker }
    }

    /// Unique id of this lease within its tracker
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Claim the given proxy principals for this lease
    ///
    /// Succeeds only if the lease is live, has not claimed before, and none
    /// of the principals is held by another lease or an external claim.
    /// Either every principal is claimed or none is.
    pub fn claim(&self, principals: &[String]) -> bool {
        let mut state = self.tracker.lock();

        match state.leases.get(&self.id) {
            Some(None) => {}
            Some(Some(_)) => {
                tracing::warn!(lease_id = self.id, "Lease already claimed");
                return false;
            }
            None => {
                tracing::debug!(lease_id = self.id, "Cannot claim a released lease");
                return false;
            }
        }

        if let Some(taken) = principals
            .iter()
            .find(|p| matches!(state.claims.get(*p), Some(h) if *h != Holder::Lease(self.id)))
        {
            tracing::debug!(
                lease_id = self.id,
                proxy = %taken,
                "Proxy already claimed by another holder"
            );
            return false;
        }

        for principal in principals {
            state
                .claims
                .insert(principal.clone(), Holder::Lease(self.id));
        }
        state.leases.insert(self.id, Some(principals.to_vec()));

        tracing::debug!(lease_id = self.id, principals = ?principals, "Lease claimed");
        true
    }

    /// Principals this lease has claimed (empty until claimed or after release)
    pub fn claimed(&self) -> Vec<String> {
        self.tracker
            .lock()
            .leases
            .get(&self.id)
            .cloned()
            .flatten()
            .unwrap_or_default()
    }

    /// Return the lease to the tracker. Repeated calls are no-ops.
    pub fn release(&self) {
        let mut state = self.tracker.lock();

        let Some(claimed) = state.leases.remove(&self.id) else {
            return;
        };

        for principal in claimed.unwrap_or_default() {
            if state.claims.get(&principal) == Some(&Holder::Lease(self.id)) {
                state.claims.remove(&principal);
            }
        }
        drop(state);

        tracing::debug!(lease_id = self.id, "Lease released");
        self.tracker.notify_changed();
    }

    /// Check whether the lease has been released
    pub fn is_released(&self) -> bool {
        !self.tracker.lock().leases.contains_key(&self.id)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease").field("id", &self.id).finish()
    }
}

/// Shared receiving end of a tracker's lease supply
#[derive(Clone)]
pub struct LeaseSupply {
    rx: Arc<Mutex<mpsc::Receiver<Lease>>>,
}

impl LeaseSupply {
    pub(crate) fn new(rx: mpsc::Receiver<Lease>) -> Self {
        Self {
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Wait for the next lease. Returns `None` once the tracker is stopped.
    pub async fn next(&self) -> Option<Lease> {
        self.rx.lock().await.recv().await
    }

    /// Close the supply and drop any lease waiting in it
    pub(crate) fn close(&self) {
        if let Ok(mut rx) = self.rx.try_lock() {
            rx.close();
            while rx.try_recv().is_ok() {}
        }
    }
}

impl fmt::Debug for LeaseSupply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseSupply").finish_non_exhaustive()
    }
}
