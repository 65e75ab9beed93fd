//! Per-worker claim loop (spec.md §4.6): selects eligible units, claims
//! them through [`crate::lease::LeaseManager`], and hands each claim won to
//! [`crate::executor::Executor`] under a bounded concurrency budget.

use crate::clock::{SharedClock, WorkerId};
use crate::executor::Executor;
use crate::finalizer::JobFinalizer;
use crate::lease::LeaseManager;
use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct PollerConfig {
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub max_in_flight: usize,
}

pub struct Poller<S> {
    store: Arc<S>,
    clock: SharedClock,
    lease_manager: Arc<LeaseManager<S>>,
    executor: Arc<Executor<S>>,
    finalizer: Arc<JobFinalizer<S>>,
    worker_id: WorkerId,
    config: PollerConfig,
}

impl<S: Store + 'static> Poller<S> {
    pub fn new(
        store: Arc<S>,
        clock: SharedClock,
        lease_manager: Arc<LeaseManager<S>>,
        executor: Arc<Executor<S>>,
        finalizer: Arc<JobFinalizer<S>>,
        worker_id: WorkerId,
        config: PollerConfig,
    ) -> Self {
        Self {
            store,
            clock,
            lease_manager,
            executor,
            finalizer,
            worker_id,
            config,
        }
    }

    /// Runs forever (until `shutdown` signals true). Pollers never block on
    /// the database connection pool by admission control design; only
    /// `max_in_flight` governs how much work is outstanding at once.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_in_flight));

        loop {
            if *shutdown.borrow() {
                return;
            }

            let available = semaphore.available_permits();
            if available == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(20)) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            let eligible = match self.store.select_eligible(
                self.config.batch_size.min(available),
                self.clock.now(),
            ).await {
                Ok(ids) => ids,
                Err(e) => {
                    warn!(error = %e, "select_eligible failed, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                    continue;
                }
            };

            let mut claimed_any = false;
            for input_id in eligible {
                match self.lease_manager.try_claim(input_id, self.worker_id.as_str()).await {
                    Ok(true) => {
                        claimed_any = true;
                        self.dispatch(input_id, semaphore.clone());
                    }
                    Ok(false) => {
                        // stolen, not yet due, or already finalized; skip.
                    }
                    Err(e) => {
                        warn!(%input_id, error = %e, "claim failed");
                    }
                }
            }

            if !claimed_any {
                tokio::select! {
                    _ = tokio::time::sleep(jittered(self.config.poll_interval)) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }

    fn dispatch(&self, input_id: uuid::Uuid, semaphore: Arc<Semaphore>) {
        let store = self.store.clone();
        let executor = self.executor.clone();
        let finalizer = self.finalizer.clone();
        let worker_id = self.worker_id.clone();

        tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("semaphore is never closed");

            match store.get_unit(input_id).await {
                Ok(Some(unit)) => {
                    executor.execute(unit, worker_id.as_str(), &finalizer).await;
                }
                Ok(None) => debug!(%input_id, "claimed unit vanished before execution"),
                Err(e) => warn!(%input_id, error = %e, "failed to reload claimed unit"),
            }
        });
    }
}

fn jittered(base: Duration) -> Duration {
    let millis = base.as_millis() as u64;
    let jitter = fastrand::u64(0..=(millis / 10).max(1));
    base + Duration::from_millis(jitter)
}
