//! Shared fixtures for exercising the coordination engine without a real
//! clock, database, export procedure or object store.
//!
//! Grounded on the teacher's `seesaw-testing` crate's role: the engine
//! itself never has test-only code paths, everything below is built purely
//! from the public `Clock`/`ExportProcedure`/`Uploader`/`Store` seams.

use async_trait::async_trait;
use batchflow_core::error::{BatchflowError, Result, UploadErrorKind};
use batchflow_core::export::{ExportProcedure, ExportRow};
use batchflow_core::model::UnitKey;
use batchflow_core::store::NewJob;
use batchflow_core::upload::Uploader;
use batchflow_core::Clock;
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::Mutex;
use uuid::Uuid;

/// A `Clock` a test can pin or advance, so reuse-window and lease-expiry
/// boundaries (spec.md §8) can be asserted exactly on the edge.
pub struct TestClock {
    now: Mutex<DateTime<Utc>>,
}

impl TestClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap() = at;
    }

    pub fn advance(&self, delta: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += delta;
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Builds a `UnitKey` fluently for test submissions.
#[derive(Debug, Clone)]
pub struct UnitBuilder {
    index_key: String,
    effective_date: NaiveDate,
    asof_indicator: String,
}

impl UnitBuilder {
    pub fn new(index_key: impl Into<String>) -> Self {
        Self {
            index_key: index_key.into(),
            effective_date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            asof_indicator: "CLOSE".to_string(),
        }
    }

    pub fn effective_date(mut self, date: NaiveDate) -> Self {
        self.effective_date = date;
        self
    }

    pub fn asof(mut self, asof: impl Into<String>) -> Self {
        self.asof_indicator = asof.into();
        self
    }

    pub fn build(self) -> UnitKey {
        UnitKey {
            index_key: self.index_key,
            effective_date: self.effective_date,
            asof_indicator: self.asof_indicator,
        }
    }
}

/// Builds a `NewJob` fluently for `Store::create_job` in tests, bypassing
/// `Submission`'s HTTP-shaped validation when a test wants to set up state
/// directly.
#[derive(Debug, Clone)]
pub struct JobBuilder {
    job_key: String,
    units: Vec<UnitKey>,
}

impl JobBuilder {
    pub fn new(job_key: impl Into<String>) -> Self {
        Self {
            job_key: job_key.into(),
            units: Vec::new(),
        }
    }

    pub fn with_unit(mut self, unit: UnitKey) -> Self {
        self.units.push(unit);
        self
    }

    pub fn build(self, requested_at: DateTime<Utc>) -> NewJob {
        NewJob {
            job_id: Uuid::new_v4(),
            job_key: self.job_key,
            requested_at,
            units: self.units,
        }
    }
}

/// One scripted response for a `StubExportProcedure` call.
pub enum ScriptedOutcome {
    Rows(Vec<ExportRow>),
    TransientError(String),
    PermanentError(String),
}

/// An `ExportProcedure` whose response per unit key is scripted call by
/// call, so `RetryPolicy` scenarios (fail twice, then succeed) can be
/// driven deterministically.
#[derive(Default)]
pub struct StubExportProcedure {
    scripts: DashMap<UnitKey, Mutex<VecDeque<ScriptedOutcome>>>,
}

impl StubExportProcedure {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues outcomes for `key`, consumed front-to-back by successive
    /// `stream` calls. A key with no remaining script yields zero rows.
    pub fn script(&self, key: UnitKey, outcomes: Vec<ScriptedOutcome>) {
        self.scripts
            .insert(key, Mutex::new(outcomes.into_iter().collect()));
    }
}

#[async_trait]
impl ExportProcedure for StubExportProcedure {
    async fn stream(&self, key: &UnitKey) -> Result<BoxStream<'static, Result<ExportRow>>> {
        let next = self
            .scripts
            .get(key)
            .and_then(|queue| queue.lock().unwrap().pop_front());

        match next {
            Some(ScriptedOutcome::Rows(rows)) => {
                Ok(stream::iter(rows.into_iter().map(Ok)).boxed())
            }
            Some(ScriptedOutcome::TransientError(msg)) => Err(BatchflowError::TransientUnit(msg)),
            Some(ScriptedOutcome::PermanentError(msg)) => Err(BatchflowError::PermanentUnit(msg)),
            None => Ok(stream::iter(Vec::<Result<ExportRow>>::new()).boxed()),
        }
    }
}

/// An `Uploader` that keeps uploaded bytes in memory for assertion, with
/// optional one-shot failure injection per path.
#[derive(Default)]
pub struct MemoryUploader {
    objects: DashMap<String, Vec<u8>>,
    fail_next: DashMap<String, UploadErrorKind>,
}

impl MemoryUploader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.objects.get(path).map(|v| v.clone())
    }

    /// The next `put_stream` call for `path` fails with `kind` instead of
    /// succeeding; subsequent calls for the same path succeed normally.
    pub fn fail_next(&self, path: impl Into<String>, kind: UploadErrorKind) {
        self.fail_next.insert(path.into(), kind);
    }
}

#[async_trait]
impl Uploader for MemoryUploader {
    async fn put_stream(
        &self,
        path: &str,
        mut chunks: BoxStream<'static, Result<Bytes>>,
    ) -> Result<()> {
        if let Some((_, kind)) = self.fail_next.remove(path) {
            // Drain the stream so the producer task isn't left awaiting a
            // receiver that will never read.
            while chunks.next().await.is_some() {}
            return Err(BatchflowError::Upload {
                kind,
                source: anyhow::anyhow!("scripted upload failure for {path}"),
            });
        }

        let mut buf = Vec::new();
        while let Some(chunk) = chunks.next().await {
            buf.extend_from_slice(&chunk?);
        }
        self.objects.insert(path.to_string(), buf);
        Ok(())
    }
}

/// Drives a `MemoryStore` to quiescence: repeatedly claims every currently
/// eligible unit and executes it, until no unit is eligible at the clock's
/// current time, then runs one finalizer sweep. A unit in `RETRY_WAIT` with
/// a `next_retry_at` in the future is, correctly, never picked up; callers
/// that need to observe a retry firing must `TestClock::advance` past it
/// and call this again.
pub async fn run_to_quiescence<S: batchflow_core::Store + 'static>(
    store: &std::sync::Arc<S>,
    executor: &batchflow_core::Executor<S>,
    finalizer: &batchflow_core::JobFinalizer<S>,
    clock: &batchflow_core::clock::SharedClock,
    worker_id: &str,
) -> Result<()> {
    loop {
        let now = clock.now();
        let eligible = store.select_eligible(1_000, now).await?;
        if eligible.is_empty() {
            break;
        }

        for input_id in eligible {
            if store.claim(input_id, worker_id, now, 30).await? {
                if let Some(unit) = store.get_unit(input_id).await? {
                    executor.execute(unit, worker_id, finalizer).await;
                }
            }
        }
    }

    for job_id in store.non_terminal_job_ids().await? {
        finalizer.try_complete(job_id).await;
    }
    Ok(())
}

#[cfg(test)]
mod scenario_tests {
    use super::*;
    use batchflow_core::artifact_index::{ArtifactIndex, ReusePolicy};
    use batchflow_core::model::{JobStatus, UnitStatus};
    use batchflow_core::retry::{RetryConfig, RetryPolicy};
    use batchflow_core::{Executor, JobFinalizer};
    use batchflow_memory::MemoryStore;
    use std::sync::Arc;

    fn setup() -> (
        Arc<MemoryStore>,
        Arc<TestClock>,
        Arc<StubExportProcedure>,
        Arc<MemoryUploader>,
    ) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(TestClock::new(
            "2026-01-10T00:00:00Z".parse().unwrap(),
        ));
        let export = Arc::new(StubExportProcedure::new());
        let uploader = Arc::new(MemoryUploader::new());
        (store, clock, export, uploader)
    }

    fn make_executor(
        store: Arc<MemoryStore>,
        clock: Arc<TestClock>,
        export: Arc<StubExportProcedure>,
        uploader: Arc<MemoryUploader>,
    ) -> (Executor<MemoryStore>, JobFinalizer<MemoryStore>) {
        let shared_clock: batchflow_core::clock::SharedClock = clock;
        let artifact_index = ArtifactIndex::new(store.clone(), shared_clock.clone(), ReusePolicy::default());
        let retry_policy = RetryPolicy::new(RetryConfig::default());
        let executor = Executor::new(
            store.clone(),
            shared_clock,
            artifact_index,
            retry_policy,
            export,
            uploader,
            "s3://bucket/exports".to_string(),
        );
        let finalizer = JobFinalizer::new(store);
        (executor, finalizer)
    }

    // S1: a single-unit job generates fresh and completes.
    #[tokio::test]
    async fn scenario_single_unit_generates_and_completes() {
        let (store, clock, export, uploader) = setup();
        let key = UnitBuilder::new("AAPL").build();
        export.script(
            key.clone(),
            vec![ScriptedOutcome::Rows(vec![ExportRow(vec![
                "AAPL".to_string(),
                "190.50".to_string(),
            ])])],
        );

        let job = JobBuilder::new("job-s1").with_unit(key).build(clock.now());
        store.create_job(job.clone(), 100).await.unwrap();

        let (executor, finalizer) = make_executor(store.clone(), clock.clone(), export, uploader.clone());
        let shared_clock: batchflow_core::clock::SharedClock = clock;
        run_to_quiescence(&store, &executor, &finalizer, &shared_clock, "worker-1")
            .await
            .unwrap();

        let result = store.job_by_key("job-s1").await.unwrap().unwrap();
        assert_eq!(result.status, JobStatus::Completed);
    }

    // S2: two jobs share the same unit key within the reuse window; the
    // second reuses the first's artifact instead of regenerating.
    #[tokio::test]
    async fn scenario_second_job_reuses_artifact() {
        let (store, clock, export, uploader) = setup();
        let key = UnitBuilder::new("MSFT").build();
        export.script(
            key.clone(),
            vec![ScriptedOutcome::Rows(vec![ExportRow(vec![
                "MSFT".to_string(),
            ])])],
        );

        let job1 = JobBuilder::new("job-s2-a").with_unit(key.clone()).build(clock.now());
        store.create_job(job1, 100).await.unwrap();

        let (executor, finalizer) = make_executor(store.clone(), clock.clone(), export.clone(), uploader.clone());
        let shared_clock: batchflow_core::clock::SharedClock = clock.clone();
        run_to_quiescence(&store, &executor, &finalizer, &shared_clock, "worker-1")
            .await
            .unwrap();

        // No script queued for the second job's call to the same key.
        // If it actually invoked the export procedure, it would get zero
        // rows and a different (empty) artifact path. Success depends on
        // it reusing instead.
        let job2 = JobBuilder::new("job-s2-b").with_unit(key).build(clock.now());
        store.create_job(job2, 100).await.unwrap();
        run_to_quiescence(&store, &executor, &finalizer, &shared_clock, "worker-1")
            .await
            .unwrap();

        let (_, units) = store
            .job_detail(store.job_by_key("job-s2-b").await.unwrap().unwrap().job_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].is_reused, Some(true));
    }

    // S3: a unit fails transiently twice then succeeds on the third
    // attempt, within the retry budget.
    #[tokio::test]
    async fn scenario_transient_failure_then_success_via_retry() {
        let (store, clock, export, uploader) = setup();
        let key = UnitBuilder::new("GOOG").build();
        export.script(
            key.clone(),
            vec![
                ScriptedOutcome::TransientError("db busy".to_string()),
                ScriptedOutcome::TransientError("db busy".to_string()),
                ScriptedOutcome::Rows(vec![ExportRow(vec!["GOOG".to_string()])]),
            ],
        );

        let job = JobBuilder::new("job-s3").with_unit(key).build(clock.now());
        store.create_job(job, 100).await.unwrap();

        let (executor, finalizer) = make_executor(store.clone(), clock.clone(), export, uploader);
        let shared_clock: batchflow_core::clock::SharedClock = clock.clone();

        for _ in 0..3 {
            run_to_quiescence(&store, &executor, &finalizer, &shared_clock, "worker-1")
                .await
                .unwrap();
            clock.advance(chrono::Duration::minutes(5));
        }

        let result = store.job_by_key("job-s3").await.unwrap().unwrap();
        assert_eq!(result.status, JobStatus::Completed);
    }

    // S4: a permanent failure moves the unit straight to DLQ and fails the
    // job, with no retries spent.
    #[tokio::test]
    async fn scenario_permanent_failure_dlqs_immediately() {
        let (store, clock, export, uploader) = setup();
        let key = UnitBuilder::new("BAD").build();
        export.script(
            key.clone(),
            vec![ScriptedOutcome::PermanentError("bad ticker".to_string())],
        );

        let job = JobBuilder::new("job-s4").with_unit(key).build(clock.now());
        store.create_job(job, 100).await.unwrap();

        let (executor, finalizer) = make_executor(store.clone(), clock.clone(), export, uploader);
        let shared_clock: batchflow_core::clock::SharedClock = clock;
        run_to_quiescence(&store, &executor, &finalizer, &shared_clock, "worker-1")
            .await
            .unwrap();

        let result = store.job_by_key("job-s4").await.unwrap().unwrap();
        assert_eq!(result.status, JobStatus::Failed);
    }

    // S5: a re-driven DLQ unit goes back to PENDING and can complete the
    // job on a subsequent run.
    #[tokio::test]
    async fn scenario_redrive_recovers_dlq_unit() {
        let (store, clock, export, uploader) = setup();
        let key = UnitBuilder::new("RETRY").build();
        export.script(
            key.clone(),
            vec![ScriptedOutcome::PermanentError("first try fails".to_string())],
        );

        let job = JobBuilder::new("job-s5").with_unit(key.clone()).build(clock.now());
        store.create_job(job, 100).await.unwrap();

        let (executor, finalizer) = make_executor(store.clone(), clock.clone(), export.clone(), uploader);
        let shared_clock: batchflow_core::clock::SharedClock = clock;
        run_to_quiescence(&store, &executor, &finalizer, &shared_clock, "worker-1")
            .await
            .unwrap();

        let job_id = store.job_by_key("job-s5").await.unwrap().unwrap().job_id;
        let (_, units) = store.job_detail(job_id).await.unwrap().unwrap();
        let dlq_unit = units.iter().find(|u| u.status == UnitStatus::Dlq).unwrap();

        export.script(key, vec![ScriptedOutcome::Rows(vec![ExportRow(vec!["RETRY".to_string()])])]);
        store.reset_unit_for_redrive(dlq_unit.input_id).await.unwrap();

        run_to_quiescence(&store, &executor, &finalizer, &shared_clock, "worker-1")
            .await
            .unwrap();

        let result = store.job_by_key("job-s5").await.unwrap().unwrap();
        assert_eq!(result.status, JobStatus::Completed);
    }

    // S6: the periodic finalizer sweep (not the fast path) is what
    // completes a job when invoked directly against non-terminal jobs.
    #[tokio::test]
    async fn scenario_periodic_sweep_completes_job() {
        let (store, clock, export, uploader) = setup();
        let key = UnitBuilder::new("SWEEP").build();
        export.script(
            key.clone(),
            vec![ScriptedOutcome::Rows(vec![ExportRow(vec!["SWEEP".to_string()])])],
        );

        let job = JobBuilder::new("job-s6").with_unit(key).build(clock.now());
        store.create_job(job, 100).await.unwrap();

        let now = clock.now();
        let input_id = store.select_eligible(10, now).await.unwrap()[0];
        assert!(store.claim(input_id, "worker-1", now, 30).await.unwrap());
        let unit = store.get_unit(input_id).await.unwrap().unwrap();

        let (executor, finalizer) = make_executor(store.clone(), clock, export, uploader);
        // Run the unit directly without the fast-path finalizer call by
        // constructing a throwaway finalizer for execute(), then rely on
        // the real finalizer's sweep to observe completion afterward.
        executor.execute(unit, "worker-1", &finalizer).await;

        let job_id = store.job_by_key("job-s6").await.unwrap().unwrap().job_id;
        for id in store.non_terminal_job_ids().await.unwrap() {
            finalizer.try_complete(id).await;
        }
        let result = store.job_by_key("job-s6").await.unwrap().unwrap();
        assert_eq!(result.job_id, job_id);
        assert_eq!(result.status, JobStatus::Completed);
    }
}
