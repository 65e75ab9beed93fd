//! Error taxonomy (spec §7), split the way the teacher splits
//! `SeesawError`/`Categorizable`/`SafeErrorCategory`: one enum carries every
//! failure mode, and a separate classification decides what a caller is
//! allowed to do with it (retry it, surface it, or just log it).

use thiserror::Error;

/// Coarse shape of an object-storage failure, enough for `RetryPolicy` to
/// classify it without depending on a specific SDK's error type (spec.md
/// §4.4: "storage 5xx" is Transient, "storage 4xx other than throttling"
/// is Permanent, throttling is Transient).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadErrorKind {
    ServerError,
    Throttled,
    ClientError,
    Timeout,
}

#[derive(Debug, Error)]
pub enum BatchflowError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("job_key {0} already exists")]
    JobKeyConflict(String),

    #[error("{count} units exceeds the configured cap of {cap}")]
    TooManyUnits { count: usize, cap: usize },

    #[error("transient unit error: {0}")]
    TransientUnit(String),

    #[error("permanent unit error: {0}")]
    PermanentUnit(String),

    #[error("lease lost: unit was claimed by another worker or already finalized")]
    LeaseLost,

    #[error("job {0} is already terminal")]
    JobTerminalGuardViolation(uuid::Uuid),

    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] anyhow::Error),

    #[error("upload failed ({kind:?}): {source}")]
    Upload {
        kind: UploadErrorKind,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// The two-way split spec.md §4.4's `RetryPolicy::Classify` needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

/// Errors know their own retry classification; `RetryPolicy` just asks.
pub trait Categorizable {
    fn classify(&self) -> ErrorClass;
}

impl Categorizable for BatchflowError {
    fn classify(&self) -> ErrorClass {
        match self {
            BatchflowError::TransientUnit(_) | BatchflowError::StoreUnavailable(_) => {
                ErrorClass::Transient
            }
            BatchflowError::Upload { kind, .. } => match kind {
                UploadErrorKind::ServerError
                | UploadErrorKind::Throttled
                | UploadErrorKind::Timeout => ErrorClass::Transient,
                UploadErrorKind::ClientError => ErrorClass::Permanent,
            },
            BatchflowError::PermanentUnit(_)
            | BatchflowError::Validation(_)
            | BatchflowError::JobKeyConflict(_)
            | BatchflowError::TooManyUnits { .. }
            | BatchflowError::LeaseLost
            | BatchflowError::JobTerminalGuardViolation(_)
            | BatchflowError::Config(_) => ErrorClass::Permanent,
        }
    }
}

pub type Result<T> = std::result::Result<T, BatchflowError>;
