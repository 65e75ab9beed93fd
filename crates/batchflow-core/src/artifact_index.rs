//! The reuse decision (spec.md §4.2), evaluated before any database
//! procedure call or object-storage work.

use crate::clock::SharedClock;
use crate::error::Result;
use crate::model::UnitKey;
use crate::store::Store;
use chrono::NaiveDate;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReuseDecision {
    Generate,
    Reuse,
}

#[derive(Debug, Clone)]
pub struct ReusePolicy {
    pub enabled: bool,
    /// Effective dates strictly older than `today - days` may reuse an
    /// existing artifact; `today - days` itself regenerates.
    pub days: i64,
    pub timezone: chrono_tz::Tz,
}

impl Default for ReusePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            days: 7,
            timezone: chrono_tz::UTC,
        }
    }
}

pub struct ArtifactIndex<S> {
    store: Arc<S>,
    clock: SharedClock,
    policy: ReusePolicy,
}

impl<S: Store> ArtifactIndex<S> {
    pub fn new(store: Arc<S>, clock: SharedClock, policy: ReusePolicy) -> Self {
        Self {
            store,
            clock,
            policy,
        }
    }

    /// Returns `Reuse` with the artifact's stored path, or `Generate`.
    /// Callers that get `Reuse` must still fetch the artifact row
    /// themselves for the path (kept separate so the decision is cheap to
    /// reason about and test independent of the lookup's exact row shape).
    pub async fn decide(&self, key: &UnitKey) -> Result<ReuseDecision> {
        if !self.policy.enabled {
            return Ok(ReuseDecision::Generate);
        }

        let existing = self.store.lookup_artifact(key).await?;
        if existing.is_none() {
            return Ok(ReuseDecision::Generate);
        }

        let today = self.today();
        if key.effective_date >= today - chrono::Duration::days(self.policy.days) {
            return Ok(ReuseDecision::Generate);
        }

        Ok(ReuseDecision::Reuse)
    }

    fn today(&self) -> NaiveDate {
        self.clock.now().with_timezone(&self.policy.timezone).date_naive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::model::Artifact;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::Mutex;
    use uuid::Uuid;

    struct FixedClock(DateTime<Utc>);
    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    struct FakeStore {
        artifact: Mutex<Option<Artifact>>,
    }

    #[async_trait]
    impl Store for FakeStore {
        async fn create_job(&self, _job: crate::store::NewJob, _cap: usize) -> Result<()> {
            unimplemented!()
        }
        async fn select_eligible(&self, _limit: usize, _now: DateTime<Utc>) -> Result<Vec<Uuid>> {
            unimplemented!()
        }
        async fn claim(&self, _: Uuid, _: &str, _: DateTime<Utc>, _: i64) -> Result<bool> {
            unimplemented!()
        }
        async fn renew(&self, _: Uuid, _: &str, _: DateTime<Utc>, _: i64) -> Result<bool> {
            unimplemented!()
        }
        async fn mark_succeeded_reused(&self, _: Uuid, _: &str, _: &str) -> Result<bool> {
            unimplemented!()
        }
        async fn mark_succeeded_generated(&self, _: Uuid, _: &str, _: &str) -> Result<bool> {
            unimplemented!()
        }
        async fn schedule_retry(
            &self,
            _: Uuid,
            _: &str,
            _: DateTime<Utc>,
            _: &str,
        ) -> Result<bool> {
            unimplemented!()
        }
        async fn move_to_dlq(&self, _: Uuid, _: &str, _: &str) -> Result<bool> {
            unimplemented!()
        }
        async fn lookup_artifact(&self, _key: &UnitKey) -> Result<Option<Artifact>> {
            Ok(self.artifact.lock().unwrap().clone())
        }
        async fn upsert_artifact(&self, _artifact: Artifact) -> Result<()> {
            unimplemented!()
        }
        async fn fail_job(&self, _: Uuid, _: &str) -> Result<()> {
            unimplemented!()
        }
        async fn try_complete_job(&self, _: Uuid) -> Result<bool> {
            unimplemented!()
        }
        async fn try_fail_job_from_dlq(&self, _: Uuid) -> Result<bool> {
            unimplemented!()
        }
        async fn reset_unit_for_redrive(&self, _: Uuid) -> Result<()> {
            unimplemented!()
        }
        async fn job_counts(&self, _: Uuid) -> Result<crate::model::JobCounts> {
            unimplemented!()
        }
        async fn job_detail(
            &self,
            _: Uuid,
        ) -> Result<Option<(crate::model::Job, Vec<crate::model::Unit>)>> {
            unimplemented!()
        }
        async fn job_by_key(&self, _: &str) -> Result<Option<crate::model::Job>> {
            unimplemented!()
        }
        async fn get_unit(&self, _: Uuid) -> Result<Option<crate::model::Unit>> {
            unimplemented!()
        }
        async fn job_status(&self, _: Uuid) -> Result<Option<crate::model::JobStatus>> {
            unimplemented!()
        }
        async fn non_terminal_job_ids(&self) -> Result<Vec<Uuid>> {
            unimplemented!()
        }
    }

    fn key(day: (i32, u32, u32)) -> UnitKey {
        UnitKey {
            index_key: "ABC".to_string(),
            effective_date: chrono::NaiveDate::from_ymd_opt(day.0, day.1, day.2).unwrap(),
            asof_indicator: "CLS".to_string(),
        }
    }

    #[tokio::test]
    async fn no_artifact_means_generate() {
        let store = Arc::new(FakeStore {
            artifact: Mutex::new(None),
        });
        let clock: SharedClock = Arc::new(FixedClock(Utc.with_ymd_and_hms(2026, 1, 17, 0, 0, 0).unwrap()));
        let idx = ArtifactIndex::new(store, clock, ReusePolicy::default());
        assert_eq!(
            idx.decide(&key((2020, 1, 1))).await.unwrap(),
            ReuseDecision::Generate
        );
    }

    #[tokio::test]
    async fn boundary_at_exactly_today_minus_days_regenerates() {
        let artifact = Artifact {
            key: key((2026, 1, 10)),
            s3_path: "s3://b/x.csv".to_string(),
            source_job_id: Uuid::new_v4(),
            generated_at: Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap(),
        };
        let store = Arc::new(FakeStore {
            artifact: Mutex::new(Some(artifact)),
        });
        // today = 2026-01-17, reuse.days = 7 -> boundary is 2026-01-10
        let clock: SharedClock = Arc::new(FixedClock(Utc.with_ymd_and_hms(2026, 1, 17, 0, 0, 0).unwrap()));
        let idx = ArtifactIndex::new(store, clock, ReusePolicy::default());
        assert_eq!(
            idx.decide(&key((2026, 1, 10))).await.unwrap(),
            ReuseDecision::Generate
        );
    }

    #[tokio::test]
    async fn one_day_older_than_boundary_reuses() {
        let artifact = Artifact {
            key: key((2026, 1, 9)),
            s3_path: "s3://b/x.csv".to_string(),
            source_job_id: Uuid::new_v4(),
            generated_at: Utc.with_ymd_and_hms(2026, 1, 9, 0, 0, 0).unwrap(),
        };
        let store = Arc::new(FakeStore {
            artifact: Mutex::new(Some(artifact)),
        });
        let clock: SharedClock = Arc::new(FixedClock(Utc.with_ymd_and_hms(2026, 1, 17, 0, 0, 0).unwrap()));
        let idx = ArtifactIndex::new(store, clock, ReusePolicy::default());
        assert_eq!(
            idx.decide(&key((2026, 1, 9))).await.unwrap(),
            ReuseDecision::Reuse
        );
    }

    #[tokio::test]
    async fn disabled_policy_always_generates() {
        let artifact = Artifact {
            key: key((2020, 1, 1)),
            s3_path: "s3://b/x.csv".to_string(),
            source_job_id: Uuid::new_v4(),
            generated_at: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
        };
        let store = Arc::new(FakeStore {
            artifact: Mutex::new(Some(artifact)),
        });
        let clock: SharedClock = Arc::new(FixedClock(Utc.with_ymd_and_hms(2026, 1, 17, 0, 0, 0).unwrap()));
        let mut policy = ReusePolicy::default();
        policy.enabled = false;
        let idx = ArtifactIndex::new(store, clock, policy);
        assert_eq!(
            idx.decide(&key((2020, 1, 1))).await.unwrap(),
            ReuseDecision::Generate
        );
    }
}
