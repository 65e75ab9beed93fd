//! Job, Unit and Artifact: the three entities of the coordination schema.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Client-visible job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Submitted,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses are absorbing: once reached, a job never changes
    /// status again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_db_str(self) -> &'static str {
        match self {
            JobStatus::Submitted => "SUBMITTED",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        Some(match s {
            "SUBMITTED" => JobStatus::Submitted,
            "RUNNING" => JobStatus::Running,
            "COMPLETED" => JobStatus::Completed,
            "FAILED" => JobStatus::Failed,
            "CANCELLED" => JobStatus::Cancelled,
            _ => return None,
        })
    }
}

/// A submitted batch of export requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub job_key: String,
    pub status: JobStatus,
    pub total_inputs: i64,
    pub requested_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// One `(job, indexKey, effectiveDate, asofIndicator)` unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitStatus {
    Pending,
    Running,
    Succeeded,
    RetryWait,
    Dlq,
}

impl UnitStatus {
    /// SUCCEEDED and DLQ are the only terminal unit statuses.
    pub fn is_terminal(self) -> bool {
        matches!(self, UnitStatus::Succeeded | UnitStatus::Dlq)
    }

    pub fn as_db_str(self) -> &'static str {
        match self {
            UnitStatus::Pending => "PENDING",
            UnitStatus::Running => "RUNNING",
            UnitStatus::Succeeded => "SUCCEEDED",
            UnitStatus::RetryWait => "RETRY_WAIT",
            UnitStatus::Dlq => "DLQ",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        Some(match s {
            "PENDING" => UnitStatus::Pending,
            "RUNNING" => UnitStatus::Running,
            "SUCCEEDED" => UnitStatus::Succeeded,
            "RETRY_WAIT" => UnitStatus::RetryWait,
            "DLQ" => UnitStatus::Dlq,
            _ => return None,
        })
    }
}

/// The natural key of a unit: the thing that determines its artifact and
/// its deterministic output path, independent of which job produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitKey {
    pub index_key: String,
    pub effective_date: NaiveDate,
    pub asof_indicator: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unit {
    pub input_id: Uuid,
    pub job_id: Uuid,
    pub key: UnitKey,
    pub status: UnitStatus,
    pub attempt_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub lease_owner: Option<String>,
    pub lease_until: Option<DateTime<Utc>>,
    pub s3_path: Option<String>,
    pub is_reused: Option<bool>,
    pub error_message: Option<String>,
}

impl Unit {
    /// Construct a brand-new unit in its initial PENDING state, as
    /// `Store::CreateJob` does for every item of a submission.
    pub fn new_pending(job_id: Uuid, key: UnitKey) -> Self {
        Self {
            input_id: Uuid::new_v4(),
            job_id,
            key,
            status: UnitStatus::Pending,
            attempt_count: 0,
            next_retry_at: None,
            lease_owner: None,
            lease_until: None,
            s3_path: None,
            is_reused: None,
            error_message: None,
        }
    }

    /// §8 invariant 1: RUNNING iff both lease fields are set.
    pub fn lease_invariant_holds(&self) -> bool {
        (self.status == UnitStatus::Running)
            == (self.lease_owner.is_some() && self.lease_until.is_some())
    }

    /// §8 invariant 2: RETRY_WAIT iff `next_retry_at` is set.
    pub fn retry_invariant_holds(&self) -> bool {
        (self.status == UnitStatus::RetryWait) == self.next_retry_at.is_some()
    }

    /// §8 invariant 3: SUCCEEDED implies `s3_path` is set.
    pub fn succeeded_invariant_holds(&self) -> bool {
        self.status != UnitStatus::Succeeded || self.s3_path.is_some()
    }
}

/// The reuse registry row for a unit's natural key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub key: UnitKey,
    pub s3_path: String,
    pub source_job_id: Uuid,
    pub generated_at: DateTime<Utc>,
}

/// Aggregate projection used by `JobFinalizer` and the admin surface.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct JobCounts {
    pub total: i64,
    pub pending: i64,
    pub running: i64,
    pub retry_wait: i64,
    pub succeeded: i64,
    pub dlq: i64,
    pub files_generated: i64,
    pub files_reused: i64,
}

impl JobCounts {
    /// §4.8 complete guard: all units succeeded, none DLQ/pending/running/retry.
    pub fn all_succeeded(&self) -> bool {
        self.total > 0
            && self.succeeded == self.total
            && self.dlq == 0
            && self.pending == 0
            && self.running == 0
            && self.retry_wait == 0
    }

    /// §4.8 fail guard: any unit is DLQ.
    pub fn any_dlq(&self) -> bool {
        self.dlq > 0
    }
}
