//! Job-creation transaction (spec.md §4.7): validates the request, builds
//! the job and unit rows, and writes them atomically through the store.

use crate::clock::SharedClock;
use crate::error::{BatchflowError, Result};
use crate::model::UnitKey;
use crate::store::{NewJob, Store};
use chrono::NaiveDate;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// One item of a submission request, as it arrives off the HTTP surface.
#[derive(Debug, Clone)]
pub struct SubmissionItem {
    pub index_key: String,
    pub effective_date: i32,
    pub asof_indicator: String,
}

#[derive(Debug, Clone)]
pub struct SubmissionRequest {
    pub items: Vec<SubmissionItem>,
}

pub struct Submission<S> {
    store: Arc<S>,
    clock: SharedClock,
    max_units_per_job: usize,
    sequence: AtomicU64,
}

impl<S: Store> Submission<S> {
    pub fn new(store: Arc<S>, clock: SharedClock, max_units_per_job: usize) -> Self {
        Self {
            store,
            clock,
            max_units_per_job,
            sequence: AtomicU64::new(0),
        }
    }

    /// Validates the request, assigns a `job_key`, and writes the job and
    /// all of its units in one transaction. Returns the client-visible
    /// `job_key`.
    pub async fn submit(&self, request: SubmissionRequest) -> Result<String> {
        if request.items.is_empty() {
            return Err(BatchflowError::Validation(
                "items must not be empty".to_string(),
            ));
        }
        if request.items.len() > self.max_units_per_job {
            return Err(BatchflowError::TooManyUnits {
                count: request.items.len(),
                cap: self.max_units_per_job,
            });
        }

        let mut seen = HashSet::new();
        let mut units = Vec::with_capacity(request.items.len());
        for item in &request.items {
            let index_key = item.index_key.trim();
            if index_key.is_empty() {
                return Err(BatchflowError::Validation(
                    "indexKey must be non-empty".to_string(),
                ));
            }
            let asof = item.asof_indicator.trim();
            if asof.is_empty() {
                return Err(BatchflowError::Validation(
                    "asofIndicator must be non-empty".to_string(),
                ));
            }
            let effective_date = parse_yyyymmdd(item.effective_date)?;

            let key = UnitKey {
                index_key: index_key.to_string(),
                effective_date,
                asof_indicator: asof.to_string(),
            };
            if !seen.insert(key.clone()) {
                return Err(BatchflowError::Validation(format!(
                    "duplicate key ({}, {}, {})",
                    key.index_key, item.effective_date, key.asof_indicator
                )));
            }
            units.push(key);
        }

        let job_id = Uuid::new_v4();
        let now = self.clock.now();
        let job_key = self.next_job_key(now);

        self.store
            .create_job(
                NewJob {
                    job_id,
                    job_key: job_key.clone(),
                    requested_at: now,
                    units,
                },
                self.max_units_per_job,
            )
            .await?;

        Ok(job_key)
    }

    /// `J<YYYYMMDD>_<seq>`, monotonic within the process per spec.md §4.7.
    fn next_job_key(&self, now: chrono::DateTime<chrono::Utc>) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("J{}_{seq}", now.format("%Y%m%d"))
    }
}

fn parse_yyyymmdd(value: i32) -> Result<NaiveDate> {
    if !(10_000_101..=99_991_231).contains(&value) {
        return Err(BatchflowError::Validation(format!(
            "effectiveDate {value} is not a calendar-valid yyyymmdd"
        )));
    }
    let year = value / 10_000;
    let month = (value / 100) % 100;
    let day = value % 100;
    NaiveDate::from_ymd_opt(year, month as u32, day as u32)
        .ok_or_else(|| BatchflowError::Validation(format!("effectiveDate {value} is not calendar-valid")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_garbage_dates() {
        assert!(parse_yyyymmdd(20260230).is_err()); // Feb 30 never exists
        assert!(parse_yyyymmdd(99999999).is_err());
    }

    #[test]
    fn accepts_valid_date() {
        let d = parse_yyyymmdd(20260117).unwrap();
        assert_eq!(d, NaiveDate::from_ymd_opt(2026, 1, 17).unwrap());
    }
}
