//! Per-unit execution to a terminal state (spec.md §4.5).

use crate::artifact_index::{ArtifactIndex, ReuseDecision};
use crate::clock::SharedClock;
use crate::error::{BatchflowError, Result};
use crate::export::ExportProcedure;
use crate::finalizer::JobFinalizer;
use crate::lease::LeaseManager;
use crate::model::{Artifact, JobStatus, Unit, UnitStatus};
use crate::path::deterministic_path;
use crate::retry::{Decision, RetryPolicy};
use crate::store::Store;
use crate::upload::{stream_csv_to_uploader, Uploader};
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub struct Executor<S> {
    store: Arc<S>,
    clock: SharedClock,
    artifact_index: ArtifactIndex<S>,
    retry_policy: RetryPolicy,
    export: Arc<dyn ExportProcedure>,
    uploader: Arc<dyn Uploader>,
    base_path: String,
    lease_manager: Option<Arc<LeaseManager<S>>>,
}

impl<S: Store + 'static> Executor<S> {
    pub fn new(
        store: Arc<S>,
        clock: SharedClock,
        artifact_index: ArtifactIndex<S>,
        retry_policy: RetryPolicy,
        export: Arc<dyn ExportProcedure>,
        uploader: Arc<dyn Uploader>,
        base_path: impl Into<String>,
    ) -> Self {
        Self {
            store,
            clock,
            artifact_index,
            retry_policy,
            export,
            uploader,
            base_path: base_path.into(),
            lease_manager: None,
        }
    }

    /// Attaches a [`LeaseManager`] so long-running GENERATE units renew
    /// their lease at `leaseSeconds / 2` while the export/upload is in
    /// flight (spec.md §4.3: "Executor renews at leaseSeconds/2"). Without
    /// one, a unit whose export+upload outruns the lease risks a second
    /// worker claiming it concurrently (tolerated at the storage layer via
    /// the deterministic path, but best avoided).
    pub fn with_lease_manager(mut self, lease_manager: Arc<LeaseManager<S>>) -> Self {
        self.lease_manager = Some(lease_manager);
        self
    }

    /// Executes `unit` (already claimed by `worker_id`) to a terminal
    /// state, then invokes `JobFinalizer::try_complete` best-effort on the
    /// fast path (spec.md §4.5 step 6).
    #[instrument(skip(self, finalizer, unit), fields(input_id = %unit.input_id, job_id = %unit.job_id, worker_id = worker_id))]
    pub async fn execute(&self, unit: Unit, worker_id: &str, finalizer: &JobFinalizer<S>) {
        let job_id = unit.job_id;

        // Step 1: job guard. If the parent job is already terminal (and not
        // COMPLETED, which cannot happen for a job with a non-terminal
        // unit), short-circuit straight to DLQ rather than leaving the unit
        // to lease expiry. Decided consistently per spec.md §9 open question.
        match self.store.job_status(job_id).await {
            Ok(Some(JobStatus::Failed)) | Ok(Some(JobStatus::Cancelled)) => {
                let _ = self
                    .store
                    .move_to_dlq(unit.input_id, worker_id, "job-terminal")
                    .await;
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "failed to read job status before executing unit");
                return;
            }
        }

        let renewal = self.spawn_lease_renewal(&unit, worker_id);
        let outcome = self.run_unit(&unit, worker_id).await;
        if let Some(handle) = renewal {
            handle.abort();
        }

        match outcome {
            Ok(()) => {
                info!("unit completed");
            }
            Err(e) => {
                self.handle_failure(&unit, worker_id, e).await;
            }
        }

        finalizer.try_complete(job_id).await;
    }

    /// Spawns a background task that calls `LeaseManager::renew` on an
    /// interval for the duration of `run_unit`, aborted once it returns.
    /// A no-op when no `LeaseManager` was configured (e.g. in tests driving
    /// `execute` directly against a `MemoryStore`).
    fn spawn_lease_renewal(&self, unit: &Unit, worker_id: &str) -> Option<tokio::task::JoinHandle<()>> {
        let lease_manager = self.lease_manager.clone()?;
        let input_id = unit.input_id;
        let worker_id = worker_id.to_string();
        let interval = lease_manager.renewal_interval();
        Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if !lease_manager.renew(input_id, &worker_id).await.unwrap_or(false) {
                    return;
                }
            }
        }))
    }

    async fn run_unit(&self, unit: &Unit, worker_id: &str) -> Result<()> {
        match self.artifact_index.decide(&unit.key).await? {
            ReuseDecision::Reuse => {
                let artifact = self
                    .store
                    .lookup_artifact(&unit.key)
                    .await?
                    .ok_or_else(|| {
                        BatchflowError::TransientUnit(
                            "reuse decided but artifact disappeared".to_string(),
                        )
                    })?;
                let affected = self
                    .store
                    .mark_succeeded_reused(unit.input_id, worker_id, &artifact.s3_path)
                    .await?;
                if !affected {
                    return Err(BatchflowError::LeaseLost);
                }
                Ok(())
            }
            ReuseDecision::Generate => {
                let path = deterministic_path(&self.base_path, &unit.key, unit.job_id);
                stream_csv_to_uploader(self.export.as_ref(), self.uploader.as_ref(), &unit.key, &path)
                    .await?;

                self.store
                    .upsert_artifact(Artifact {
                        key: unit.key.clone(),
                        s3_path: path.clone(),
                        source_job_id: unit.job_id,
                        generated_at: self.clock.now(),
                    })
                    .await?;

                let affected = self
                    .store
                    .mark_succeeded_generated(unit.input_id, worker_id, &path)
                    .await?;
                if !affected {
                    return Err(BatchflowError::LeaseLost);
                }
                Ok(())
            }
        }
    }

    async fn handle_failure(&self, unit: &Unit, worker_id: &str, error: BatchflowError) {
        if matches!(error, BatchflowError::LeaseLost) {
            // Someone else already took this unit over; nothing to do.
            return;
        }

        let classification = self.retry_policy.classify(&error);
        match self
            .retry_policy
            .decide(classification, unit.attempt_count)
        {
            Decision::Retry => {
                let next_retry_at = self.retry_policy.next_attempt(unit.attempt_count, self.clock.now());
                let _ = self
                    .store
                    .schedule_retry(unit.input_id, worker_id, next_retry_at, &error.to_string())
                    .await;
            }
            Decision::Dlq => {
                let moved = self
                    .store
                    .move_to_dlq(unit.input_id, worker_id, &error.to_string())
                    .await
                    .unwrap_or(false);
                if moved {
                    // Fail-fast: a single DLQ unit fails the whole job.
                    let _ = self
                        .store
                        .fail_job(unit.job_id, "One or more inputs moved to DLQ")
                        .await;
                }
            }
        }
    }
}

/// Invariant helper used by tests and by `MemoryStore`: a unit is only
/// eligible to execute once it is RUNNING under the given owner.
pub fn assert_claimed(unit: &Unit, worker_id: &str) {
    debug_assert_eq!(unit.status, UnitStatus::Running);
    debug_assert_eq!(unit.lease_owner.as_deref(), Some(worker_id));
}

#[cfg(test)]
mod tests {
    use super::assert_claimed;
    use crate::model::{Unit, UnitKey};
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn assert_claimed_holds_for_freshly_claimed_unit() {
        let mut unit = Unit::new_pending(
            Uuid::new_v4(),
            UnitKey {
                index_key: "ABC".to_string(),
                effective_date: chrono::NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
                asof_indicator: "CLS".to_string(),
            },
        );
        unit.status = crate::model::UnitStatus::Running;
        unit.lease_owner = Some("w1".to_string());
        unit.lease_until = Some(Utc::now());
        assert_claimed(&unit, "w1");
    }
}
