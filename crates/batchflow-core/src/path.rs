//! The deterministic object-storage path (spec.md §3):
//!
//! ```text
//! <basePath>/YYYY/MM/DD/<job_id>/<indexKey>_<YYYYMMDD>_<asofIndicator>.csv
//! ```
//!
//! The date segments come from the unit's `effective_date`, never from the
//! current date, so re-running the same unit (from any worker, at any
//! time) always overwrites the same object.

use crate::model::UnitKey;
use uuid::Uuid;

pub fn deterministic_path(base_path: &str, key: &UnitKey, job_id: Uuid) -> String {
    let d = key.effective_date;
    let base = base_path.trim_end_matches('/');
    format!(
        "{base}/{year:04}/{month:02}/{day:02}/{job_id}/{index_key}_{year:04}{month:02}{day:02}_{asof}.csv",
        year = d.format("%Y"),
        month = d.format("%m"),
        day = d.format("%d"),
        job_id = job_id,
        index_key = key.index_key,
        asof = key.asof_indicator,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn matches_the_spec_example() {
        let key = UnitKey {
            index_key: "DEF".to_string(),
            effective_date: NaiveDate::from_ymd_opt(2026, 1, 10).unwrap(),
            asof_indicator: "CLS".to_string(),
        };
        let job_id = Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap();
        let path = deterministic_path("s3://b/exports", &key, job_id);
        assert_eq!(
            path,
            format!("s3://b/exports/2026/01/10/{job_id}/DEF_20260110_CLS.csv")
        );
    }

    #[test]
    fn strips_trailing_slash_on_base_path() {
        let key = UnitKey {
            index_key: "ABC".to_string(),
            effective_date: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
            asof_indicator: "CLS".to_string(),
        };
        let job_id = Uuid::nil();
        let path = deterministic_path("s3://b/exports/", &key, job_id);
        assert!(!path.contains("//2020"));
    }
}
