//! The transactional interface every coordination component talks to.
//!
//! Every operation is specified by its contract, not its SQL (spec.md
//! §4.1). `batchflow-postgres::PgStore` and `batchflow-memory::MemoryStore`
//! both implement this trait and must both satisfy the guard-predicate
//! semantics documented on each method.

use crate::error::Result;
use crate::model::{Artifact, Job, JobCounts, Unit, UnitKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Everything `Submission::submit` needs to hand the store in one
/// transaction.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_id: Uuid,
    pub job_key: String,
    pub requested_at: DateTime<Utc>,
    pub units: Vec<UnitKey>,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Inserts one Job row and all Unit rows (PENDING, attempt 0) in a
    /// single transaction.
    ///
    /// Errors: `JobKeyConflict` if `job_key` already exists, `TooManyUnits`
    /// if `units.len()` exceeds the configured cap, both surfaced as
    /// [`crate::error::BatchflowError::Validation`] since by the time this is
    /// called the cap has already been checked by `Submission`; a race on
    /// `job_key` uniqueness is still possible and must be reported.
    async fn create_job(&self, job: NewJob, max_units_per_job: usize) -> Result<()>;

    /// Up to `limit` unit ids eligible for claim: parent job non-terminal,
    /// and the unit PENDING, or RETRY_WAIT with `next_retry_at <= now`, or
    /// with an expired lease (`lease_until < now`). Ordered by the parent
    /// job's `requested_at` ascending, then `input_id`, for FIFO fairness
    /// across jobs.
    async fn select_eligible(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<Uuid>>;

    /// Atomically claims one unit: the guard is the eligibility predicate
    /// of `select_eligible`; on success the row becomes RUNNING with
    /// `lease_owner`/`lease_until` set, `attempt_count` incremented, and
    /// `started_at` set if it was null. Returns `true` iff exactly one row
    /// was affected; a `false` means the unit was claimed first, is no
    /// longer eligible, or does not exist.
    async fn claim(
        &self,
        input_id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_seconds: i64,
    ) -> Result<bool>;

    /// Extends `lease_until` on a unit this worker still owns. Returns
    /// `false` if the lease was already lost.
    async fn renew(
        &self,
        input_id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_seconds: i64,
    ) -> Result<bool>;

    /// RUNNING -> SUCCEEDED via reuse: no generation took place. Guard:
    /// `lease_owner = worker_id`. Returns `false` on lease loss.
    async fn mark_succeeded_reused(
        &self,
        input_id: Uuid,
        worker_id: &str,
        s3_path: &str,
    ) -> Result<bool>;

    /// RUNNING -> SUCCEEDED via fresh generation. Same guard as
    /// `mark_succeeded_reused`.
    async fn mark_succeeded_generated(
        &self,
        input_id: Uuid,
        worker_id: &str,
        s3_path: &str,
    ) -> Result<bool>;

    /// RUNNING -> RETRY_WAIT: clears the lease, sets `next_retry_at` and
    /// `error_message`. Does not touch `attempt_count` (already incremented
    /// at claim time). Guard: `lease_owner = worker_id`.
    async fn schedule_retry(
        &self,
        input_id: Uuid,
        worker_id: &str,
        next_retry_at: DateTime<Utc>,
        error_message: &str,
    ) -> Result<bool>;

    /// RUNNING -> DLQ: clears the lease, sets `error_message`. Guard:
    /// `lease_owner = worker_id`.
    async fn move_to_dlq(&self, input_id: Uuid, worker_id: &str, error_message: &str)
        -> Result<bool>;

    /// Looks up the reuse-registry row for a unit's natural key.
    async fn lookup_artifact(&self, key: &UnitKey) -> Result<Option<Artifact>>;

    /// Inserts or updates the artifact row for `artifact.key`, on-conflict
    /// updating `s3_path`, `source_job_id`, `generated_at`.
    async fn upsert_artifact(&self, artifact: Artifact) -> Result<()>;

    /// SUBMITTED|RUNNING -> FAILED, idempotent no-op if already
    /// FAILED/CANCELLED.
    async fn fail_job(&self, job_id: Uuid, error_message: &str) -> Result<()>;

    /// §4.8 complete guard: SUBMITTED|RUNNING -> COMPLETED iff all units
    /// SUCCEEDED and none DLQ/PENDING/RUNNING/RETRY_WAIT. Returns `true`
    /// iff the transition happened.
    async fn try_complete_job(&self, job_id: Uuid) -> Result<bool>;

    /// §4.8 fail guard: SUBMITTED|RUNNING -> FAILED iff any unit is DLQ.
    /// Returns `true` iff the transition happened.
    async fn try_fail_job_from_dlq(&self, job_id: Uuid) -> Result<bool>;

    /// Operator re-drive: DLQ -> PENDING, `attempt_count = 0`,
    /// `error_message = NULL`, lease cleared. Errors if the unit is not
    /// currently DLQ.
    async fn reset_unit_for_redrive(&self, input_id: Uuid) -> Result<()>;

    /// Single aggregate query backing `JobFinalizer` and the admin surface.
    async fn job_counts(&self, job_id: Uuid) -> Result<JobCounts>;

    /// Full projection: the Job row plus all of its Units.
    async fn job_detail(&self, job_id: Uuid) -> Result<Option<(Job, Vec<Unit>)>>;

    /// Looks a job up by its client-visible key.
    async fn job_by_key(&self, job_key: &str) -> Result<Option<Job>>;

    /// Fetches a single unit by id, for `Executor` to re-read job/unit
    /// state before acting.
    async fn get_unit(&self, input_id: Uuid) -> Result<Option<Unit>>;

    /// Fetches the parent job's status, used by `Executor`'s job-terminal
    /// guard (spec.md §4.5 step 1).
    async fn job_status(&self, job_id: Uuid) -> Result<Option<crate::model::JobStatus>>;

    /// All non-terminal job ids with `requested_at` ascending, for the
    /// periodic `JobFinalizer` sweep.
    async fn non_terminal_job_ids(&self) -> Result<Vec<Uuid>>;
}
