//! Status projection and re-drive operations (spec.md component 10,
//! SPEC_FULL.md §4.14).

use crate::error::{BatchflowError, Result};
use crate::model::{Job, JobCounts, JobStatus, Unit, UnitStatus};
use crate::store::Store;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// The external rendering of job status: `IN_PROGRESS` is not a stored
/// status, only a display refinement of SUBMITTED/RUNNING once at least
/// one unit has left PENDING (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisplayStatus {
    Submitted,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    pub job_id: Uuid,
    pub job_key: String,
    pub status: DisplayStatus,
    pub counts: JobCounts,
    pub error_message: Option<String>,
    /// Present only when the job is terminal.
    pub unit_paths: Option<Vec<UnitPath>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitPath {
    pub input_id: Uuid,
    pub index_key: String,
    pub s3_path: Option<String>,
    pub is_reused: Option<bool>,
}

pub struct Admin<S> {
    store: Arc<S>,
}

impl<S: Store> Admin<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn status_by_key(&self, job_key: &str) -> Result<Option<JobStatusView>> {
        let Some(job) = self.store.job_by_key(job_key).await? else {
            return Ok(None);
        };
        self.status(job.job_id).await
    }

    pub async fn status(&self, job_id: Uuid) -> Result<Option<JobStatusView>> {
        let Some((job, units)) = self.store.job_detail(job_id).await? else {
            return Ok(None);
        };
        let counts = self.store.job_counts(job_id).await?;
        Ok(Some(project(job, units, counts)))
    }

    /// Resets a DLQ unit back to PENDING with a clean attempt history.
    /// Errors if the unit is not currently DLQ. The parent job's status is
    /// not recomputed here; `JobFinalizer`'s next cycle handles that
    /// (spec.md §7 Re-drive).
    pub async fn redrive(&self, input_id: Uuid) -> Result<()> {
        let unit = self
            .store
            .get_unit(input_id)
            .await?
            .ok_or_else(|| BatchflowError::Validation(format!("unit {input_id} not found")))?;
        if unit.status != UnitStatus::Dlq {
            return Err(BatchflowError::Validation(format!(
                "unit {input_id} is not in DLQ (status = {:?})",
                unit.status
            )));
        }
        self.store.reset_unit_for_redrive(input_id).await
    }
}

fn project(job: Job, units: Vec<Unit>, counts: JobCounts) -> JobStatusView {
    let display = match job.status {
        JobStatus::Completed => DisplayStatus::Completed,
        JobStatus::Failed => DisplayStatus::Failed,
        JobStatus::Cancelled => DisplayStatus::Cancelled,
        JobStatus::Submitted | JobStatus::Running => {
            let any_started = units.iter().any(|u| u.status != UnitStatus::Pending);
            if any_started {
                DisplayStatus::InProgress
            } else {
                DisplayStatus::Submitted
            }
        }
    };

    let unit_paths = job.status.is_terminal().then(|| {
        units
            .iter()
            .map(|u| UnitPath {
                input_id: u.input_id,
                index_key: u.key.index_key.clone(),
                s3_path: u.s3_path.clone(),
                is_reused: u.is_reused,
            })
            .collect()
    });

    JobStatusView {
        job_id: job.job_id,
        job_key: job.job_key,
        status: display,
        counts,
        error_message: job.error_message,
        unit_paths,
    }
}
