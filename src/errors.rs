//! Typed error hierarchy for the Zeule orchestrator.
//!
//! Two top-level enums cover the two failure domains:
//! - `PipelineError` - command, catalog and store failures reported to callers
//! - `ExecutorError` - phase work failures, recorded on the pipeline instead of
//!   being propagated to the gateway

use thiserror::Error;

use crate::pipeline::models::PipelineId;

/// Errors from orchestrator commands and the pipeline store.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Pipeline {id}: {message}")]
    InvalidState { id: PipelineId, message: String },

    #[error("Pipeline {id} not found")]
    NotFound { id: PipelineId },

    #[error("Pipeline {id} has no phase {phase_index} (phase count {phase_count})")]
    PhaseOutOfRange {
        id: PipelineId,
        phase_index: usize,
        phase_count: usize,
    },

    #[error("Invalid phase catalog: {0}")]
    Catalog(String),

    #[error("Pipeline {id} would violate an invariant: {message}")]
    Invariant { id: PipelineId, message: String },

    #[error("Store error: {0}")]
    Store(#[source] anyhow::Error),
}

impl PipelineError {
    pub fn invalid_state(id: PipelineId, message: impl Into<String>) -> Self {
        Self::InvalidState {
            id,
            message: message.into(),
        }
    }
}

/// Errors from a single phase execution.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("Transient executor failure: {0}")]
    Transient(String),

    #[error("Executor failure: {0}")]
    Permanent(String),

    #[error("Phase execution timed out after {after_ms}ms")]
    TimedOut { after_ms: u64 },

    #[error("Executor panicked: {0}")]
    Panicked(String),
}

impl ExecutorError {
    /// Only transient failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_state_carries_id_and_message() {
        let id = PipelineId::new();
        let err = PipelineError::invalid_state(id, "pipeline is completed");
        match &err {
            PipelineError::InvalidState { id: got, message } => {
                assert_eq!(*got, id);
                assert_eq!(message, "pipeline is completed");
            }
            _ => panic!("Expected InvalidState"),
        }
        assert!(err.to_string().contains(&id.to_string()));
    }

    #[test]
    fn phase_out_of_range_mentions_counts() {
        let err = PipelineError::PhaseOutOfRange {
            id: PipelineId::new(),
            phase_index: 9,
            phase_count: 8,
        };
        let msg = err.to_string();
        assert!(msg.contains("phase 9"));
        assert!(msg.contains("phase count 8"));
    }

    #[test]
    fn only_transient_executor_errors_are_retryable() {
        assert!(ExecutorError::Transient("503".into()).is_retryable());
        assert!(!ExecutorError::Permanent("400".into()).is_retryable());
        assert!(!ExecutorError::TimedOut { after_ms: 10 }.is_retryable());
        assert!(!ExecutorError::Panicked("boom".into()).is_retryable());
    }

    #[test]
    fn store_error_exposes_source() {
        use std::error::Error as _;
        let err = PipelineError::Store(anyhow::anyhow!("disk full"));
        assert!(err.source().is_some());
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&PipelineError::Validation("x".into()));
        assert_std_error(&ExecutorError::Permanent("x".into()));
    }
}
