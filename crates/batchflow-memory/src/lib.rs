//! In-process `Store` used by `batchflow-testing` fixtures and by anyone
//! running the coordination engine without a database.
//!
//! Holds everything behind one `tokio::sync::Mutex`, traded for simplicity
//! over the concurrency a real database gives `PgStore`: fine for tests
//! and local development, not for production load.

use async_trait::async_trait;
use batchflow_core::error::{BatchflowError, Result};
use batchflow_core::model::{Artifact, Job, JobCounts, JobStatus, Unit, UnitKey, UnitStatus};
use batchflow_core::store::{NewJob, Store};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    job_keys: HashMap<String, Uuid>,
    units: HashMap<Uuid, Unit>,
    artifacts: HashMap<(String, chrono::NaiveDate, String), Artifact>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn artifact_key(key: &UnitKey) -> (String, chrono::NaiveDate, String) {
    (
        key.index_key.clone(),
        key.effective_date,
        key.asof_indicator.clone(),
    )
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_job(&self, job: NewJob, max_units_per_job: usize) -> Result<()> {
        if job.units.len() > max_units_per_job {
            return Err(BatchflowError::TooManyUnits {
                count: job.units.len(),
                cap: max_units_per_job,
            });
        }

        let mut inner = self.inner.lock().await;
        if inner.job_keys.contains_key(&job.job_key) {
            return Err(BatchflowError::JobKeyConflict(job.job_key));
        }

        inner.job_keys.insert(job.job_key.clone(), job.job_id);
        inner.jobs.insert(
            job.job_id,
            Job {
                job_id: job.job_id,
                job_key: job.job_key,
                status: JobStatus::Submitted,
                total_inputs: job.units.len() as i64,
                requested_at: job.requested_at,
                started_at: None,
                completed_at: None,
                error_message: None,
            },
        );

        for unit_key in job.units {
            let unit = Unit::new_pending(job.job_id, unit_key);
            inner.units.insert(unit.input_id, unit);
        }

        Ok(())
    }

    async fn select_eligible(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let inner = self.inner.lock().await;
        let mut candidates: Vec<&Unit> = inner
            .units
            .values()
            .filter(|u| {
                let job_active = inner
                    .jobs
                    .get(&u.job_id)
                    .map(|j| !j.status.is_terminal())
                    .unwrap_or(false);
                if !job_active {
                    return false;
                }
                match u.status {
                    UnitStatus::Pending => true,
                    UnitStatus::RetryWait => u.next_retry_at.map(|t| t <= now).unwrap_or(false),
                    UnitStatus::Running => u.lease_until.map(|t| t <= now).unwrap_or(false),
                    _ => false,
                }
            })
            .collect();

        candidates.sort_by_key(|u| {
            (
                inner
                    .jobs
                    .get(&u.job_id)
                    .map(|j| j.requested_at)
                    .unwrap_or(now),
                u.input_id,
            )
        });

        Ok(candidates
            .into_iter()
            .take(limit)
            .map(|u| u.input_id)
            .collect())
    }

    async fn claim(
        &self,
        input_id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_seconds: i64,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let job_active = match inner.units.get(&input_id) {
            Some(u) => inner
                .jobs
                .get(&u.job_id)
                .map(|j| !j.status.is_terminal())
                .unwrap_or(false),
            None => return Ok(false),
        };
        if !job_active {
            return Ok(false);
        }

        let job_id = {
            let Some(unit) = inner.units.get_mut(&input_id) else {
                return Ok(false);
            };
            let eligible = match unit.status {
                UnitStatus::Pending => true,
                UnitStatus::RetryWait => unit.next_retry_at.map(|t| t <= now).unwrap_or(false),
                UnitStatus::Running => unit.lease_until.map(|t| t <= now).unwrap_or(false),
                _ => false,
            };
            if !eligible {
                return Ok(false);
            }

            unit.status = UnitStatus::Running;
            unit.lease_owner = Some(worker_id.to_string());
            unit.lease_until = Some(now + chrono::Duration::seconds(lease_seconds));
            unit.attempt_count += 1;
            unit.job_id
        };

        if let Some(job) = inner.jobs.get_mut(&job_id) {
            if job.started_at.is_none() {
                job.started_at = Some(now);
            }
            if job.status == JobStatus::Submitted {
                job.status = JobStatus::Running;
            }
        }

        Ok(true)
    }

    async fn renew(
        &self,
        input_id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_seconds: i64,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(unit) = inner.units.get_mut(&input_id) else {
            return Ok(false);
        };
        if unit.status != UnitStatus::Running || unit.lease_owner.as_deref() != Some(worker_id) {
            return Ok(false);
        }
        unit.lease_until = Some(now + chrono::Duration::seconds(lease_seconds));
        Ok(true)
    }

    async fn mark_succeeded_reused(
        &self,
        input_id: Uuid,
        worker_id: &str,
        s3_path: &str,
    ) -> Result<bool> {
        self.mark_succeeded(input_id, worker_id, s3_path, true).await
    }

    async fn mark_succeeded_generated(
        &self,
        input_id: Uuid,
        worker_id: &str,
        s3_path: &str,
    ) -> Result<bool> {
        self.mark_succeeded(input_id, worker_id, s3_path, false).await
    }

    async fn schedule_retry(
        &self,
        input_id: Uuid,
        worker_id: &str,
        next_retry_at: DateTime<Utc>,
        error_message: &str,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(unit) = inner.units.get_mut(&input_id) else {
            return Ok(false);
        };
        if unit.lease_owner.as_deref() != Some(worker_id) {
            return Ok(false);
        }
        unit.status = UnitStatus::RetryWait;
        unit.next_retry_at = Some(next_retry_at);
        unit.error_message = Some(error_message.to_string());
        unit.lease_owner = None;
        unit.lease_until = None;
        Ok(true)
    }

    async fn move_to_dlq(
        &self,
        input_id: Uuid,
        worker_id: &str,
        error_message: &str,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(unit) = inner.units.get_mut(&input_id) else {
            return Ok(false);
        };
        if unit.lease_owner.as_deref() != Some(worker_id) {
            return Ok(false);
        }
        unit.status = UnitStatus::Dlq;
        unit.error_message = Some(error_message.to_string());
        unit.lease_owner = None;
        unit.lease_until = None;
        Ok(true)
    }

    async fn lookup_artifact(&self, key: &UnitKey) -> Result<Option<Artifact>> {
        let inner = self.inner.lock().await;
        Ok(inner.artifacts.get(&artifact_key(key)).cloned())
    }

    async fn upsert_artifact(&self, artifact: Artifact) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .artifacts
            .insert(artifact_key(&artifact.key), artifact);
        Ok(())
    }

    async fn fail_job(&self, job_id: Uuid, error_message: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.jobs.get_mut(&job_id) {
            if !job.status.is_terminal() {
                job.status = JobStatus::Failed;
                job.completed_at = Some(Utc::now());
                job.error_message = Some(error_message.to_string());
            }
        }
        Ok(())
    }

    async fn try_complete_job(&self, job_id: Uuid) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let counts = Self::counts_locked(&inner, job_id);
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if matches!(job.status, JobStatus::Submitted | JobStatus::Running) && counts.all_succeeded() {
            job.status = JobStatus::Completed;
            job.completed_at = Some(Utc::now());
            return Ok(true);
        }
        Ok(false)
    }

    async fn try_fail_job_from_dlq(&self, job_id: Uuid) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let counts = Self::counts_locked(&inner, job_id);
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if matches!(job.status, JobStatus::Submitted | JobStatus::Running) && counts.any_dlq() {
            job.status = JobStatus::Failed;
            job.completed_at = Some(Utc::now());
            job.error_message = Some("One or more inputs moved to DLQ".to_string());
            return Ok(true);
        }
        Ok(false)
    }

    async fn reset_unit_for_redrive(&self, input_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(unit) = inner.units.get_mut(&input_id) else {
            return Err(BatchflowError::Validation(format!(
                "unit {input_id} does not exist"
            )));
        };
        if unit.status != UnitStatus::Dlq {
            return Err(BatchflowError::Validation(format!(
                "unit {input_id} is not in DLQ"
            )));
        }
        unit.status = UnitStatus::Pending;
        unit.attempt_count = 0;
        unit.error_message = None;
        unit.next_retry_at = None;
        unit.lease_owner = None;
        unit.lease_until = None;
        Ok(())
    }

    async fn job_counts(&self, job_id: Uuid) -> Result<JobCounts> {
        let inner = self.inner.lock().await;
        Ok(Self::counts_locked(&inner, job_id))
    }

    async fn job_detail(&self, job_id: Uuid) -> Result<Option<(Job, Vec<Unit>)>> {
        let inner = self.inner.lock().await;
        let Some(job) = inner.jobs.get(&job_id).cloned() else {
            return Ok(None);
        };
        let mut units: Vec<Unit> = inner
            .units
            .values()
            .filter(|u| u.job_id == job_id)
            .cloned()
            .collect();
        units.sort_by(|a, b| a.key.index_key.cmp(&b.key.index_key));
        Ok(Some((job, units)))
    }

    async fn job_by_key(&self, job_key: &str) -> Result<Option<Job>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .job_keys
            .get(job_key)
            .and_then(|id| inner.jobs.get(id))
            .cloned())
    }

    async fn get_unit(&self, input_id: Uuid) -> Result<Option<Unit>> {
        let inner = self.inner.lock().await;
        Ok(inner.units.get(&input_id).cloned())
    }

    async fn job_status(&self, job_id: Uuid) -> Result<Option<JobStatus>> {
        let inner = self.inner.lock().await;
        Ok(inner.jobs.get(&job_id).map(|j| j.status))
    }

    async fn non_terminal_job_ids(&self) -> Result<Vec<Uuid>> {
        let inner = self.inner.lock().await;
        let mut jobs: Vec<&Job> = inner
            .jobs
            .values()
            .filter(|j| !j.status.is_terminal())
            .collect();
        jobs.sort_by_key(|j| j.requested_at);
        Ok(jobs.into_iter().map(|j| j.job_id).collect())
    }
}

impl MemoryStore {
    async fn mark_succeeded(
        &self,
        input_id: Uuid,
        worker_id: &str,
        s3_path: &str,
        reused: bool,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(unit) = inner.units.get_mut(&input_id) else {
            return Ok(false);
        };
        if unit.lease_owner.as_deref() != Some(worker_id) {
            return Ok(false);
        }
        unit.status = UnitStatus::Succeeded;
        unit.s3_path = Some(s3_path.to_string());
        unit.is_reused = Some(reused);
        unit.lease_owner = None;
        unit.lease_until = None;
        unit.error_message = None;
        Ok(true)
    }

    fn counts_locked(inner: &Inner, job_id: Uuid) -> JobCounts {
        let mut counts = JobCounts::default();
        for unit in inner.units.values().filter(|u| u.job_id == job_id) {
            counts.total += 1;
            match unit.status {
                UnitStatus::Pending => counts.pending += 1,
                UnitStatus::Running => counts.running += 1,
                UnitStatus::RetryWait => counts.retry_wait += 1,
                UnitStatus::Succeeded => {
                    counts.succeeded += 1;
                    match unit.is_reused {
                        Some(true) => counts.files_reused += 1,
                        Some(false) => counts.files_generated += 1,
                        None => {}
                    }
                }
                UnitStatus::Dlq => counts.dlq += 1,
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn unit_key(k: &str) -> UnitKey {
        UnitKey {
            index_key: k.to_string(),
            effective_date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            asof_indicator: "CLS".to_string(),
        }
    }

    #[tokio::test]
    async fn create_job_rejects_duplicate_key() {
        let store = MemoryStore::new();
        let job_id = Uuid::new_v4();
        let new_job = NewJob {
            job_id,
            job_key: "job-1".to_string(),
            requested_at: Utc::now(),
            units: vec![unit_key("A")],
        };
        store.create_job(new_job.clone(), 100).await.unwrap();
        let err = store.create_job(new_job, 100).await.unwrap_err();
        assert!(matches!(err, BatchflowError::JobKeyConflict(_)));
    }

    #[tokio::test]
    async fn claim_then_renew_then_succeed_round_trip() {
        let store = MemoryStore::new();
        let job_id = Uuid::new_v4();
        store
            .create_job(
                NewJob {
                    job_id,
                    job_key: "job-2".to_string(),
                    requested_at: Utc::now(),
                    units: vec![unit_key("A")],
                },
                100,
            )
            .await
            .unwrap();

        let now = Utc::now();
        let ids = store.select_eligible(10, now).await.unwrap();
        assert_eq!(ids.len(), 1);
        let input_id = ids[0];

        assert!(store.claim(input_id, "w1", now, 30).await.unwrap());
        assert!(!store.claim(input_id, "w2", now, 30).await.unwrap());
        assert!(store.renew(input_id, "w1", now, 30).await.unwrap());
        assert!(!store.renew(input_id, "w2", now, 30).await.unwrap());

        assert!(store
            .mark_succeeded_generated(input_id, "w1", "s3://bucket/a.csv")
            .await
            .unwrap());

        assert!(store.try_complete_job(job_id).await.unwrap());
        let job = store.job_by_key("job-2").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn dlq_unit_fails_job_and_redrive_resets_it() {
        let store = MemoryStore::new();
        let job_id = Uuid::new_v4();
        store
            .create_job(
                NewJob {
                    job_id,
                    job_key: "job-3".to_string(),
                    requested_at: Utc::now(),
                    units: vec![unit_key("A")],
                },
                100,
            )
            .await
            .unwrap();
        let now = Utc::now();
        let input_id = store.select_eligible(10, now).await.unwrap()[0];
        store.claim(input_id, "w1", now, 30).await.unwrap();
        store.move_to_dlq(input_id, "w1", "boom").await.unwrap();

        assert!(store.try_fail_job_from_dlq(job_id).await.unwrap());
        let job = store.job_by_key("job-3").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);

        store.reset_unit_for_redrive(input_id).await.unwrap();
        let unit = store.get_unit(input_id).await.unwrap().unwrap();
        assert_eq!(unit.status, UnitStatus::Pending);
        assert_eq!(unit.attempt_count, 0);
    }
}
