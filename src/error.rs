//! Crate-level error taxonomy.
//!
//! Only two error classes are recovered inside the orchestrator:
//! compensation failures (recorded, then swallowed) and quarantine-write
//! failures (logged). Everything else surfaces to the queue so attempt
//! counting and observability reflect reality.

use thiserror::Error;

use crate::kv::KvError;
use crate::queue::QueueError;

/// Saga orchestration errors.
///
/// The display strings of [`SagaError::ResourceBusy`] and
/// [`SagaError::StepFunctionNotFound`] are load-bearing: the quarantine
/// classifier matches on them to mark those failures retryable.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The resource locks could not be acquired; another saga holds them.
    #[error("other transaction in progress on {resources}")]
    ResourceBusy { resources: String },

    /// A persisted job references a step name this process has not
    /// registered. Retryable: the step may come back on the next deploy.
    #[error("Step function not found: {0}")]
    StepFunctionNotFound(String),

    /// A step's execute action failed. The success trail has already been
    /// compensated by the time this propagates.
    #[error("step '{step}' failed: {message}")]
    StepExecution { step: String, message: String },

    /// A compensate action failed. Recorded per step; never aborts
    /// compensation of earlier steps.
    #[error("compensation of step '{step}' failed: {message}")]
    Compensation { step: String, message: String },

    /// The quarantine record itself could not be persisted.
    #[error("failed to persist quarantine record: {0}")]
    QuarantineWrite(String),

    /// Key-value service failure.
    #[error(transparent)]
    Kv(#[from] KvError),

    /// Queue failure.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Payload (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for SagaError {
    fn from(err: serde_json::Error) -> Self {
        SagaError::Serialization(err.to_string())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_busy_display() {
        let err = SagaError::ResourceBusy {
            resources: "user/42".to_string(),
        };
        assert_eq!(err.to_string(), "other transaction in progress on user/42");
    }

    #[test]
    fn test_step_not_found_display() {
        let err = SagaError::StepFunctionNotFound("grant_bonus".to_string());
        assert_eq!(err.to_string(), "Step function not found: grant_bonus");
    }

    #[test]
    fn test_wrapped_errors() {
        let err: SagaError = KvError::Connection("refused".to_string()).into();
        assert!(err.to_string().contains("kv connection error"));

        let err: SagaError = QueueError::JobNotFound("j1".to_string()).into();
        assert!(err.to_string().contains("job not found"));

        let bad = serde_json::from_str::<serde_json::Value>("{");
        let err: SagaError = bad.unwrap_err().into();
        assert!(matches!(err, SagaError::Serialization(_)));
    }
}
