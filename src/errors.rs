//! Error taxonomy for the knowledge graph engine
//!
//! Component boundaries return `anyhow::Result` with a structured `KgError`
//! underneath. The executor and coordinator downcast to `KgError` to decide
//! whether a failure is retryable, routable to conflict resolution, or fatal.

use thiserror::Error;

/// Structured error carried across component boundaries.
#[derive(Debug, Error)]
pub enum KgError {
    /// Recoverable infrastructure failure (network reset, deadlock, lock
    /// timeout). Retried with jittered exponential backoff.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Deadline exceeded. The operation is failed and rolled back.
    #[error("deadline exceeded after {elapsed_ms}ms: {operation}")]
    Timeout { operation: String, elapsed_ms: u64 },

    /// Malformed input rejected at the boundary.
    #[error("validation failed for {field}: {reason}")]
    Validation { field: String, reason: String },

    /// Canonical id collision with an incompatible resolution class, or
    /// entity version drift. Routed to the conflict resolver.
    #[error("conflict on {subject}: {reason}")]
    Conflict { subject: String, reason: String },

    /// Missing entity or relationship for an operation that requires
    /// presence. No partial writes.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Embedding provider unavailable; callers fall back to marker vectors.
    #[error("embedding provider failure: {0}")]
    ProviderFailure(String),

    /// Corrupted store or permanent authorization failure. Stops the
    /// coordinator and raises a critical alert.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl KgError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn conflict(subject: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Conflict {
            subject: subject.into(),
            reason: reason.into(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether the executor may retry the failed attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Classify an error chain for retry decisions.
///
/// Only errors that carry a `KgError::Transient` anywhere in the chain are
/// retried; everything else propagates immediately.
pub fn is_transient_error(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<KgError>())
        .any(KgError::is_transient)
}

/// Classify an error chain as fatal (stops the coordinator).
pub fn is_fatal_error(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<KgError>())
        .any(KgError::is_fatal)
}

/// Process exit codes for the operational CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    InvalidArguments = 2,
    StorageUnavailable = 3,
    PartialFailure = 4,
}

impl ExitCode {
    /// Map a top-level error chain onto a CLI exit code.
    pub fn from_error(err: &anyhow::Error) -> Self {
        for cause in err.chain() {
            if let Some(kg) = cause.downcast_ref::<KgError>() {
                return match kg {
                    KgError::Validation { .. } => Self::InvalidArguments,
                    KgError::Transient(_) | KgError::Timeout { .. } | KgError::Fatal(_) => {
                        Self::StorageUnavailable
                    }
                    _ => Self::PartialFailure,
                };
            }
        }
        Self::PartialFailure
    }
}
