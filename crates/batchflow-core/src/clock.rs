//! Wall-clock source and per-process worker identity.
//!
//! The coordination core never calls `Utc::now()` directly. Every
//! time-sensitive decision (lease expiry, retry scheduling, the reuse
//! window) goes through a [`Clock`] so tests can pin "now" exactly on a
//! boundary (spec boundary behaviors: lease expiry at `lease_until = now`,
//! reuse window at `today - reuse.days`).

use chrono::{DateTime, Utc};
use std::sync::Arc;

/// A source of the current wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub type SharedClock = Arc<dyn Clock>;

/// Per-process worker identity, used as `lease_owner` and as the identity
/// stamped on outbox publications.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerId(String);

impl WorkerId {
    /// Build a fresh identity as `hostname:pid:uuid`, stable for the life
    /// of the process.
    pub fn generate() -> Self {
        let host = hostname();
        let pid = std::process::id();
        let unique = uuid::Uuid::new_v4();
        Self(format!("{host}:{pid}:{unique}"))
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown-host".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_id_is_distinct_per_call() {
        let a = WorkerId::generate();
        let b = WorkerId::generate();
        assert_ne!(a, b);
    }
}
