//! Atomic claim, heartbeat renewal and (implicit) reclamation of expired
//! leases (spec.md §4.3).
//!
//! There is no sweeper: an expired lease is simply visible again to
//! `Store::select_eligible`, so the next poller to look claims it. The
//! combination of the claim's WHERE predicate and the values it sets is
//! the entire safety gate; no higher-level lock is used.

use crate::clock::SharedClock;
use crate::error::Result;
use crate::store::Store;
use std::sync::Arc;
use uuid::Uuid;

pub struct LeaseManager<S> {
    store: Arc<S>,
    clock: SharedClock,
    lease_seconds: i64,
}

impl<S: Store> LeaseManager<S> {
    pub fn new(store: Arc<S>, clock: SharedClock, lease_seconds: i64) -> Self {
        Self {
            store,
            clock,
            lease_seconds,
        }
    }

    pub fn lease_seconds(&self) -> i64 {
        self.lease_seconds
    }

    /// Attempts to claim `input_id`. Returns `true` iff this call won the
    /// claim.
    pub async fn try_claim(&self, input_id: Uuid, worker_id: &str) -> Result<bool> {
        self.store
            .claim(input_id, worker_id, self.clock.now(), self.lease_seconds)
            .await
    }

    /// Extends the lease; intended to be called at roughly
    /// `lease_seconds / 2` for long-running units. Returns `false` if the
    /// lease was already lost.
    pub async fn renew(&self, input_id: Uuid, worker_id: &str) -> Result<bool> {
        self.store
            .renew(input_id, worker_id, self.clock.now(), self.lease_seconds)
            .await
    }

    /// The interval at which a long-running unit should call `renew`.
    pub fn renewal_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs((self.lease_seconds / 2).max(1) as u64)
    }
}
