//! Error taxonomy for the service
//!
//! Stage executors distinguish retryable (`Transient`) from terminal
//! (`Permanent`) failures; the orchestrator converts exhausted retries and
//! job timeouts into permanent failures. Cleanup failures are logged and
//! never escalate to the job.

use crate::{job::StageKind, SessionId};
use thiserror::Error;

/// Top-level service errors
#[derive(Debug, Error)]
pub enum InsightError {
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    #[error("session {0} already has an active job")]
    SessionBusy(SessionId),

    #[error("stage {stage} failed: {source}")]
    Stage {
        stage: StageKind,
        #[source]
        source: StageError,
    },

    #[error("job exceeded wall-clock ceiling of {0}s")]
    Timeout(u64),

    #[error("cleanup failure: {0}")]
    CleanupFailure(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Failure classification driving the retry policy.
///
/// `Transient` errors are retried with backoff up to the attempt ceiling;
/// `Permanent` errors end the stage (and the job) immediately.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("permanent: {0}")]
    Permanent(String),
}

impl StageError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Convert an exhausted transient failure into a permanent one.
    #[must_use]
    pub fn into_permanent(self) -> Self {
        match self {
            Self::Transient(msg) => Self::Permanent(format!("retries exhausted: {msg}")),
            permanent => permanent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StageError::transient("socket reset").is_transient());
        assert!(!StageError::permanent("bad media").is_transient());
    }

    #[test]
    fn test_into_permanent_converts_transient() {
        let err = StageError::transient("timeout").into_permanent();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("retries exhausted"));
    }

    #[test]
    fn test_into_permanent_keeps_permanent() {
        let err = StageError::permanent("unreadable").into_permanent();
        assert_eq!(err.to_string(), "permanent: unreadable");
    }
}
