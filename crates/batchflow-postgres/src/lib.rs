//! PostgreSQL implementation of the batchflow work-coordination `Store`.
//!
//! This crate provides the only place in the workspace that speaks SQL.
//! Every mutation is the conditional update spec.md §4.1 describes: a
//! guard predicate plus a `RETURNING`/row-count check, never a
//! read-then-write round trip that could race.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE jobs (
//!     job_id          UUID PRIMARY KEY,
//!     job_key         TEXT NOT NULL UNIQUE,
//!     status          TEXT NOT NULL,
//!     total_inputs    BIGINT NOT NULL,
//!     requested_at    TIMESTAMPTZ NOT NULL,
//!     started_at      TIMESTAMPTZ,
//!     completed_at    TIMESTAMPTZ,
//!     error_message   TEXT
//! );
//! CREATE INDEX idx_jobs_status_requested ON jobs (status, requested_at);
//!
//! CREATE TABLE units (
//!     input_id        UUID PRIMARY KEY,
//!     job_id          UUID NOT NULL REFERENCES jobs(job_id) ON DELETE CASCADE,
//!     index_key       TEXT NOT NULL,
//!     effective_date  DATE NOT NULL,
//!     asof_indicator  TEXT NOT NULL,
//!     status          TEXT NOT NULL,
//!     attempt_count   INTEGER NOT NULL DEFAULT 0,
//!     next_retry_at   TIMESTAMPTZ,
//!     lease_owner     TEXT,
//!     lease_until     TIMESTAMPTZ,
//!     s3_path         TEXT,
//!     is_reused       BOOLEAN,
//!     error_message   TEXT,
//!     UNIQUE (job_id, index_key, effective_date, asof_indicator)
//! );
//! CREATE INDEX idx_units_poll ON units (status, next_retry_at, lease_until);
//! CREATE INDEX idx_units_job ON units (job_id);
//!
//! CREATE TABLE artifacts (
//!     index_key       TEXT NOT NULL,
//!     effective_date  DATE NOT NULL,
//!     asof_indicator  TEXT NOT NULL,
//!     s3_path         TEXT NOT NULL,
//!     source_job_id   UUID NOT NULL,
//!     generated_at    TIMESTAMPTZ NOT NULL,
//!     PRIMARY KEY (index_key, effective_date, asof_indicator)
//! );
//! ```

use async_trait::async_trait;
use batchflow_core::error::{BatchflowError, Result};
use batchflow_core::export::{ExportProcedure, ExportRow};
use batchflow_core::model::{Artifact, Job, JobCounts, JobStatus, Unit, UnitKey, UnitStatus};
use batchflow_core::store::{NewJob, Store};
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use sqlx::{PgPool, Row};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn store_err(e: sqlx::Error) -> BatchflowError {
    BatchflowError::StoreUnavailable(e.into())
}

#[async_trait]
impl Store for PgStore {
    async fn create_job(&self, job: NewJob, max_units_per_job: usize) -> Result<()> {
        if job.units.len() > max_units_per_job {
            return Err(BatchflowError::TooManyUnits {
                count: job.units.len(),
                cap: max_units_per_job,
            });
        }

        let mut tx = self.pool.begin().await.map_err(store_err)?;

        let existing = sqlx::query("SELECT 1 FROM jobs WHERE job_key = $1")
            .bind(&job.job_key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(store_err)?;
        if existing.is_some() {
            return Err(BatchflowError::JobKeyConflict(job.job_key));
        }

        sqlx::query(
            r#"
            INSERT INTO jobs (job_id, job_key, status, total_inputs, requested_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(job.job_id)
        .bind(&job.job_key)
        .bind(JobStatus::Submitted.as_db_str())
        .bind(job.units.len() as i64)
        .bind(job.requested_at)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        for unit_key in &job.units {
            sqlx::query(
                r#"
                INSERT INTO units
                    (input_id, job_id, index_key, effective_date, asof_indicator, status, attempt_count)
                VALUES ($1, $2, $3, $4, $5, $6, 0)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(job.job_id)
            .bind(&unit_key.index_key)
            .bind(unit_key.effective_date)
            .bind(&unit_key.asof_indicator)
            .bind(UnitStatus::Pending.as_db_str())
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        }

        tx.commit().await.map_err(store_err)?;
        Ok(())
    }

    async fn select_eligible(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            r#"
            SELECT u.input_id
            FROM units u
            JOIN jobs j ON j.job_id = u.job_id
            WHERE j.status NOT IN ('COMPLETED', 'FAILED', 'CANCELLED')
              AND (
                    u.status = 'PENDING'
                 OR (u.status = 'RETRY_WAIT' AND u.next_retry_at <= $2)
                 OR (u.status = 'RUNNING' AND u.lease_until <= $2)
              )
            ORDER BY j.requested_at ASC, u.input_id ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(rows.into_iter().map(|r| r.get("input_id")).collect())
    }

    async fn claim(
        &self,
        input_id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_seconds: i64,
    ) -> Result<bool> {
        let lease_until = now + chrono::Duration::seconds(lease_seconds);
        let result = sqlx::query(
            r#"
            UPDATE units
            SET status = 'RUNNING',
                lease_owner = $2,
                lease_until = $3,
                attempt_count = attempt_count + 1
            WHERE input_id = $1
              AND job_id IN (
                  SELECT job_id FROM jobs
                  WHERE job_id = units.job_id
                    AND status NOT IN ('COMPLETED', 'FAILED', 'CANCELLED')
              )
              AND (
                    status = 'PENDING'
                 OR (status = 'RETRY_WAIT' AND next_retry_at <= $4)
                 OR (status = 'RUNNING' AND lease_until <= $4)
              )
            "#,
        )
        .bind(input_id)
        .bind(worker_id)
        .bind(lease_until)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        if result.rows_affected() == 1 {
            sqlx::query(
                r#"
                UPDATE jobs
                SET started_at = COALESCE(started_at, $2),
                    status = CASE WHEN status = 'SUBMITTED' THEN 'RUNNING' ELSE status END
                WHERE job_id = (SELECT job_id FROM units WHERE input_id = $1)
                "#,
            )
            .bind(input_id)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        }

        Ok(result.rows_affected() == 1)
    }

    async fn renew(
        &self,
        input_id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_seconds: i64,
    ) -> Result<bool> {
        let lease_until = now + chrono::Duration::seconds(lease_seconds);
        let result = sqlx::query(
            r#"
            UPDATE units
            SET lease_until = $3
            WHERE input_id = $1 AND lease_owner = $2 AND status = 'RUNNING'
            "#,
        )
        .bind(input_id)
        .bind(worker_id)
        .bind(lease_until)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_succeeded_reused(
        &self,
        input_id: Uuid,
        worker_id: &str,
        s3_path: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE units
            SET status = 'SUCCEEDED', s3_path = $3, is_reused = TRUE,
                lease_owner = NULL, lease_until = NULL, error_message = NULL
            WHERE input_id = $1 AND lease_owner = $2
            "#,
        )
        .bind(input_id)
        .bind(worker_id)
        .bind(s3_path)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_succeeded_generated(
        &self,
        input_id: Uuid,
        worker_id: &str,
        s3_path: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE units
            SET status = 'SUCCEEDED', s3_path = $3, is_reused = FALSE,
                lease_owner = NULL, lease_until = NULL, error_message = NULL
            WHERE input_id = $1 AND lease_owner = $2
            "#,
        )
        .bind(input_id)
        .bind(worker_id)
        .bind(s3_path)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn schedule_retry(
        &self,
        input_id: Uuid,
        worker_id: &str,
        next_retry_at: DateTime<Utc>,
        error_message: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE units
            SET status = 'RETRY_WAIT', next_retry_at = $3, error_message = $4,
                lease_owner = NULL, lease_until = NULL
            WHERE input_id = $1 AND lease_owner = $2
            "#,
        )
        .bind(input_id)
        .bind(worker_id)
        .bind(next_retry_at)
        .bind(error_message)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn move_to_dlq(
        &self,
        input_id: Uuid,
        worker_id: &str,
        error_message: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE units
            SET status = 'DLQ', error_message = $3,
                lease_owner = NULL, lease_until = NULL
            WHERE input_id = $1 AND lease_owner = $2
            "#,
        )
        .bind(input_id)
        .bind(worker_id)
        .bind(error_message)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn lookup_artifact(&self, key: &UnitKey) -> Result<Option<Artifact>> {
        let row = sqlx::query(
            r#"
            SELECT index_key, effective_date, asof_indicator, s3_path, source_job_id, generated_at
            FROM artifacts
            WHERE index_key = $1 AND effective_date = $2 AND asof_indicator = $3
            "#,
        )
        .bind(&key.index_key)
        .bind(key.effective_date)
        .bind(&key.asof_indicator)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(row.map(|r| Artifact {
            key: UnitKey {
                index_key: r.get("index_key"),
                effective_date: r.get("effective_date"),
                asof_indicator: r.get("asof_indicator"),
            },
            s3_path: r.get("s3_path"),
            source_job_id: r.get("source_job_id"),
            generated_at: r.get("generated_at"),
        }))
    }

    async fn upsert_artifact(&self, artifact: Artifact) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO artifacts (index_key, effective_date, asof_indicator, s3_path, source_job_id, generated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (index_key, effective_date, asof_indicator)
            DO UPDATE SET s3_path = EXCLUDED.s3_path,
                          source_job_id = EXCLUDED.source_job_id,
                          generated_at = EXCLUDED.generated_at
            "#,
        )
        .bind(&artifact.key.index_key)
        .bind(artifact.key.effective_date)
        .bind(&artifact.key.asof_indicator)
        .bind(&artifact.s3_path)
        .bind(artifact.source_job_id)
        .bind(artifact.generated_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn fail_job(&self, job_id: Uuid, error_message: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'FAILED', completed_at = now(), error_message = $2
            WHERE job_id = $1 AND status NOT IN ('FAILED', 'CANCELLED', 'COMPLETED')
            "#,
        )
        .bind(job_id)
        .bind(error_message)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn try_complete_job(&self, job_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'COMPLETED', completed_at = now()
            WHERE job_id = $1
              AND status IN ('SUBMITTED', 'RUNNING')
              AND NOT EXISTS (
                  SELECT 1 FROM units
                  WHERE job_id = $1 AND status <> 'SUCCEEDED'
              )
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn try_fail_job_from_dlq(&self, job_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'FAILED', completed_at = now(),
                error_message = 'One or more inputs moved to DLQ'
            WHERE job_id = $1
              AND status IN ('SUBMITTED', 'RUNNING')
              AND EXISTS (SELECT 1 FROM units WHERE job_id = $1 AND status = 'DLQ')
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn reset_unit_for_redrive(&self, input_id: Uuid) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE units
            SET status = 'PENDING', attempt_count = 0, error_message = NULL,
                next_retry_at = NULL, lease_owner = NULL, lease_until = NULL
            WHERE input_id = $1 AND status = 'DLQ'
            "#,
        )
        .bind(input_id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        if result.rows_affected() != 1 {
            return Err(BatchflowError::Validation(format!(
                "unit {input_id} is not in DLQ"
            )));
        }
        Ok(())
    }

    async fn job_counts(&self, job_id: Uuid) -> Result<JobCounts> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE status = 'PENDING') AS pending,
                COUNT(*) FILTER (WHERE status = 'RUNNING') AS running,
                COUNT(*) FILTER (WHERE status = 'RETRY_WAIT') AS retry_wait,
                COUNT(*) FILTER (WHERE status = 'SUCCEEDED') AS succeeded,
                COUNT(*) FILTER (WHERE status = 'DLQ') AS dlq,
                COUNT(*) FILTER (WHERE status = 'SUCCEEDED' AND is_reused = FALSE) AS files_generated,
                COUNT(*) FILTER (WHERE status = 'SUCCEEDED' AND is_reused = TRUE) AS files_reused
            FROM units
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(JobCounts {
            total: row.get("total"),
            pending: row.get("pending"),
            running: row.get("running"),
            retry_wait: row.get("retry_wait"),
            succeeded: row.get("succeeded"),
            dlq: row.get("dlq"),
            files_generated: row.get("files_generated"),
            files_reused: row.get("files_reused"),
        })
    }

    async fn job_detail(&self, job_id: Uuid) -> Result<Option<(Job, Vec<Unit>)>> {
        let Some(job) = self.fetch_job_by_id(job_id).await? else {
            return Ok(None);
        };
        let units = self.fetch_units(job_id).await?;
        Ok(Some((job, units)))
    }

    async fn job_by_key(&self, job_key: &str) -> Result<Option<Job>> {
        let row = sqlx::query(
            r#"
            SELECT job_id, job_key, status, total_inputs, requested_at, started_at, completed_at, error_message
            FROM jobs WHERE job_key = $1
            "#,
        )
        .bind(job_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(row.map(row_to_job))
    }

    async fn get_unit(&self, input_id: Uuid) -> Result<Option<Unit>> {
        let row = sqlx::query(
            r#"
            SELECT input_id, job_id, index_key, effective_date, asof_indicator, status,
                   attempt_count, next_retry_at, lease_owner, lease_until, s3_path, is_reused, error_message
            FROM units WHERE input_id = $1
            "#,
        )
        .bind(input_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(row.map(row_to_unit))
    }

    async fn job_status(&self, job_id: Uuid) -> Result<Option<JobStatus>> {
        let row = sqlx::query("SELECT status FROM jobs WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(row.and_then(|r| JobStatus::from_db_str(r.get::<&str, _>("status"))))
    }

    async fn non_terminal_job_ids(&self) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            r#"
            SELECT job_id FROM jobs
            WHERE status NOT IN ('COMPLETED', 'FAILED', 'CANCELLED')
            ORDER BY requested_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(rows.into_iter().map(|r| r.get("job_id")).collect())
    }
}

impl PgStore {
    async fn fetch_job_by_id(&self, job_id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(
            r#"
            SELECT job_id, job_key, status, total_inputs, requested_at, started_at, completed_at, error_message
            FROM jobs WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(row.map(row_to_job))
    }

    async fn fetch_units(&self, job_id: Uuid) -> Result<Vec<Unit>> {
        let rows = sqlx::query(
            r#"
            SELECT input_id, job_id, index_key, effective_date, asof_indicator, status,
                   attempt_count, next_retry_at, lease_owner, lease_until, s3_path, is_reused, error_message
            FROM units WHERE job_id = $1
            ORDER BY index_key ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(rows.into_iter().map(row_to_unit).collect())
    }
}

fn row_to_job(row: sqlx::postgres::PgRow) -> Job {
    Job {
        job_id: row.get("job_id"),
        job_key: row.get("job_key"),
        status: JobStatus::from_db_str(row.get::<&str, _>("status")).unwrap_or(JobStatus::Submitted),
        total_inputs: row.get("total_inputs"),
        requested_at: row.get("requested_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        error_message: row.get("error_message"),
    }
}

/// Invokes a pre-existing database export procedure by name and streams
/// its row set back as [`ExportRow`]s.
///
/// The procedure's own SQL is someone else's concern (spec.md §1's
/// non-goal). This just calls it with `(index_key, effective_date,
/// asof_indicator)` and reads every returned column as text, which is the
/// only shape the core's [`ExportRow`] understands. A procedure returning
/// non-text columns should `CAST` them in SQL.
///
/// Rows are never collected into a `Vec`: a background task drives the
/// `sqlx` cursor directly against its own pooled connection and forwards
/// each row over a bounded channel, the same producer/consumer shape
/// `batchflow_core::upload::stream_csv_to_uploader` uses on the write side.
pub struct PgExportProcedure {
    pool: PgPool,
    procedure_sql: String,
}

impl PgExportProcedure {
    /// `procedure_sql` must be a complete query with three positional
    /// parameters, e.g. `"SELECT * FROM export_procedure($1, $2, $3)"`.
    pub fn new(pool: PgPool, procedure_sql: impl Into<String>) -> Self {
        Self {
            pool,
            procedure_sql: procedure_sql.into(),
        }
    }
}

#[async_trait]
impl ExportProcedure for PgExportProcedure {
    async fn stream(&self, key: &UnitKey) -> Result<BoxStream<'static, Result<ExportRow>>> {
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<ExportRow>>(32);
        let pool = self.pool.clone();
        let sql = self.procedure_sql.clone();
        let index_key = key.index_key.clone();
        let effective_date = key.effective_date;
        let asof_indicator = key.asof_indicator.clone();

        tokio::spawn(async move {
            let mut rows = sqlx::query(&sql)
                .bind(index_key)
                .bind(effective_date)
                .bind(asof_indicator)
                .fetch(&pool);

            while let Some(row) = rows.next().await {
                let outcome = match row {
                    Ok(row) => row_to_export_row(row),
                    Err(e) => Err(classify_export_error(e)),
                };
                if tx.send(outcome).await.is_err() {
                    return;
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}

fn row_to_export_row(row: sqlx::postgres::PgRow) -> Result<ExportRow> {
    let mut cells = Vec::with_capacity(row.columns().len());
    for i in 0..row.columns().len() {
        let cell: Option<String> = row
            .try_get(i)
            .map_err(|e| BatchflowError::PermanentUnit(format!("export row column {i}: {e}")))?;
        cells.push(cell.unwrap_or_default());
    }
    Ok(ExportRow(cells))
}

/// Connection-level and transient-transaction failures retry; everything
/// else (constraint violations, bad arguments the procedure itself
/// rejected) does not (SPEC_FULL.md §4.13).
fn classify_export_error(e: sqlx::Error) -> BatchflowError {
    match &e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            BatchflowError::TransientUnit(e.to_string())
        }
        sqlx::Error::Database(db_err) => {
            let transient = matches!(
                db_err.code().as_deref(),
                Some("40001") | Some("40P01") | Some("53300") | Some("57P03")
            );
            if transient {
                BatchflowError::TransientUnit(e.to_string())
            } else {
                BatchflowError::PermanentUnit(e.to_string())
            }
        }
        _ => BatchflowError::PermanentUnit(e.to_string()),
    }
}

fn row_to_unit(row: sqlx::postgres::PgRow) -> Unit {
    Unit {
        input_id: row.get("input_id"),
        job_id: row.get("job_id"),
        key: UnitKey {
            index_key: row.get("index_key"),
            effective_date: row.get("effective_date"),
            asof_indicator: row.get("asof_indicator"),
        },
        status: UnitStatus::from_db_str(row.get::<&str, _>("status")).unwrap_or(UnitStatus::Pending),
        attempt_count: row.get("attempt_count"),
        next_retry_at: row.get("next_retry_at"),
        lease_owner: row.get("lease_owner"),
        lease_until: row.get("lease_until"),
        s3_path: row.get("s3_path"),
        is_reused: row.get("is_reused"),
        error_message: row.get("error_message"),
    }
}
