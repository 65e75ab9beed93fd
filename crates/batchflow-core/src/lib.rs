//! # batchflow-core
//!
//! The work-coordination and execution engine behind a batch CSV export
//! service: a single client submission fans out into independent units of
//! work, each executed at most once against a non-paginated database
//! export procedure, each producing a CSV artifact at a deterministic
//! object-storage path.
//!
//! ## Why this exists
//!
//! The naive version of this system lets clients issue many concurrent
//! paginated queries directly against the database. That overloads the
//! database under load. Here the database sees exactly one function call
//! per unit of work, and the artifact is produced asynchronously by a
//! pool of workers coordinating entirely through the database itself.
//!
//! ## Architecture
//!
//! ```text
//! Submission ──► Store (Job + Units, one transaction)
//!                   │
//!                   ▼
//!   ┌────────────────────────────────────────┐
//!   │  Poller (per worker process)            │
//!   │    select_eligible ──► LeaseManager     │
//!   │                           │ try_claim   │
//!   │                           ▼             │
//!   │                       Executor ◄── ArtifactIndex (reuse?)
//!   │                           │             │
//!   │              generate ────┤── reuse     │
//!   │            (export+upload)│             │
//!   │                           ▼             │
//!   │                    terminal mutation    │
//!   │                           │             │
//!   │                           ▼             │
//!   │                    JobFinalizer (fast path)
//!   └────────────────────────────────────────┘
//!                   ▲
//!                   │ every finalizer.intervalMs
//!          JobFinalizer (periodic sweep)
//! ```
//!
//! ## Guarantees
//!
//! - At most one worker executes a given unit at a time (the claim's guard
//!   predicate is the only safety gate, no higher-level lock).
//! - A crashed worker's work is recovered by lease expiry, not by a
//!   separate sweeper.
//! - Retries are bounded and scheduled in time, never spun.
//! - A prior artifact is reused instead of regenerated when it is still
//!   within policy, and reuse is resolved through the artifact registry,
//!   never by reconstructing a path from a unit's own key.
//! - A job reaches a terminal state exactly once, even under concurrent
//!   worker completions.
//!
//! ## What this is not
//!
//! - Not a message broker: a broker, if wired up via `batchflow-notify`, is
//!   a latency optimization only. Losing its "poll now" hint is harmless
//!   because pollers run periodically regardless.
//! - Not exactly-once at the transport layer, not cross-region consistent,
//!   and does not cancel in-flight work: cancellation is honored only at
//!   unit boundaries.

pub mod admin;
pub mod artifact_index;
pub mod clock;
pub mod config;
pub mod error;
pub mod executor;
pub mod export;
pub mod finalizer;
pub mod lease;
pub mod model;
pub mod path;
pub mod poller;
pub mod retry;
pub mod store;
pub mod submission;
pub mod upload;

#[cfg(feature = "s3-uploader")]
pub mod s3_uploader;

#[cfg(feature = "http")]
pub mod http;

pub use admin::{Admin, DisplayStatus, JobStatusView};
pub use artifact_index::{ArtifactIndex, ReuseDecision, ReusePolicy};
pub use clock::{Clock, SharedClock, SystemClock, WorkerId};
pub use config::Config;
pub use error::{BatchflowError, Categorizable, ErrorClass, Result};
pub use executor::Executor;
pub use export::{ExportProcedure, ExportRow};
pub use finalizer::JobFinalizer;
pub use lease::LeaseManager;
pub use model::{Artifact, Job, JobCounts, JobStatus, Unit, UnitKey, UnitStatus};
pub use poller::{Poller, PollerConfig};
pub use retry::{Decision, RetryConfig, RetryPolicy};
pub use store::{NewJob, Store};
pub use submission::{Submission, SubmissionItem, SubmissionRequest};
pub use upload::{stream_csv_to_uploader, Uploader};

#[cfg(feature = "s3-uploader")]
pub use s3_uploader::S3Uploader;
