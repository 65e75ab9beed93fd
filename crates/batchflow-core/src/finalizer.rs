//! Job completion reconciliation (spec.md §4.8): two idempotent guard
//! predicates, invoked both opportunistically (fast path, after a terminal
//! unit transition) and periodically (to guarantee eventual correctness
//! even if the fast path never fires).

use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct JobFinalizer<S> {
    store: Arc<S>,
}

impl<S: Store> JobFinalizer<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Attempts both transitions for one job. The fail guard is checked
    /// first so a DLQ unit can never be masked by a late completion
    /// (spec.md §4.8).
    pub async fn try_complete(&self, job_id: Uuid) {
        match self.store.try_fail_job_from_dlq(job_id).await {
            Ok(true) => {
                debug!(%job_id, "job failed via DLQ guard");
                return;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(%job_id, error = %e, "try_fail_job_from_dlq errored");
                return;
            }
        }

        match self.store.try_complete_job(job_id).await {
            Ok(true) => debug!(%job_id, "job completed"),
            Ok(false) => {}
            Err(e) => warn!(%job_id, error = %e, "try_complete_job errored"),
        }
    }

    /// Periodic sweep over every non-terminal job, run every
    /// `finalizer.intervalMs` (spec.md §6). Guarantees S6: a missed fast
    /// path is corrected within one cycle.
    pub async fn run_periodic(&self, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        warn!(error = %e, "finalizer sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn sweep_once(&self) -> crate::error::Result<()> {
        for job_id in self.store.non_terminal_job_ids().await? {
            self.try_complete(job_id).await;
        }
        Ok(())
    }
}
