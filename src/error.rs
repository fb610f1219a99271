//! Error types for the job limiter.

use thiserror::Error;

use crate::decision::Decision;

/// Main error type for limiter operations.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// The lock store failed or timed out. Never mapped to a decision.
    #[error("Lock store unavailable: {0}")]
    StoreUnavailable(String),

    /// Configuration names a lock store backend that is not implemented.
    #[error("Unsupported lock store backend: {0}")]
    UnsupportedBackend(String),

    /// The resource extractor failed or produced an unusable id.
    #[error("Misconfigured resource extractor: {0}")]
    MisconfiguredResourceExtractor(String),

    /// The job scheduler refused or failed a submission
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// The enqueue lock could not be released before performing.
    ///
    /// `decision` is the outcome of the perform attempt that ran anyway; it has
    /// already been acted upon by the gate.
    #[error("Failed to release enqueue lock before perform (decision: {decision:?}): {source}")]
    EnqueueReleaseFailed {
        decision: Decision,
        #[source]
        source: Box<LimiterError>,
    },

    /// The enqueue lock could not be released, and the perform attempt that
    /// followed failed too.
    #[error("Perform attempt failed after enqueue lock release failure ({release}): {source}")]
    PerformAfterReleaseFailed {
        release: Box<LimiterError>,
        #[source]
        source: Box<LimiterError>,
    },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Job argument serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LimiterError {
    /// Short stable label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            LimiterError::StoreUnavailable(_) => "store_unavailable",
            LimiterError::UnsupportedBackend(_) => "unsupported_backend",
            LimiterError::MisconfiguredResourceExtractor(_) => "misconfigured_resource_extractor",
            LimiterError::Scheduler(_) => "scheduler",
            LimiterError::EnqueueReleaseFailed { .. } => "enqueue_release_failed",
            LimiterError::PerformAfterReleaseFailed { .. } => "perform_after_release_failed",
            LimiterError::Config(_) => "config",
            LimiterError::Serialization(_) => "serialization",
            LimiterError::Io(_) => "io",
        }
    }
}

/// Result type alias for limiter operations.
pub type Result<T> = std::result::Result<T, LimiterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_are_stable() {
        assert_eq!(
            LimiterError::StoreUnavailable("down".into()).as_label(),
            "store_unavailable"
        );
        assert_eq!(
            LimiterError::UnsupportedBackend("sidekiq".into()).as_label(),
            "unsupported_backend"
        );
    }

    #[test]
    fn test_release_failure_keeps_decision_and_source() {
        let err = LimiterError::EnqueueReleaseFailed {
            decision: Decision::Proceed,
            source: Box::new(LimiterError::StoreUnavailable("timeout".into())),
        };

        let message = err.to_string();
        assert!(message.contains("Proceed"));
        assert!(message.contains("timeout"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
