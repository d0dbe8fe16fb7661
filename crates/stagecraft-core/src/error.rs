//! Error types for stagecraft-core

use thiserror::Error;

use crate::pipeline::FailureKind;

/// Main error type for stagecraft-core
#[derive(Error, Debug)]
pub enum Error {
    /// Bad pipeline definition, unresolved input reference, loader failure.
    /// Never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Completion provider error: {0}")]
    Provider(String),

    #[error("Stage '{stage}' timed out after {timeout_ms}ms")]
    Timeout { stage: String, timeout_ms: u64 },

    /// Stage output failed a post-condition
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Stage '{stage}' aborted after {attempts} attempt(s)")]
    StageAbort { stage: String, attempts: u32 },

    #[error("Pipeline run cancelled")]
    Cancelled,

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Classify the error for a stage retry policy.
    ///
    /// `None` means the error is fatal and must not be retried.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Provider(_) | Self::Http(_) => Some(FailureKind::Error),
            Self::Timeout { .. } => Some(FailureKind::Timeout),
            Self::Validation(_) => Some(FailureKind::ValidationFailed),
            _ => None,
        }
    }

    /// Whether this error can be handled by a retry policy at all
    pub fn is_retryable(&self) -> bool {
        self.failure_kind().is_some()
    }
}

/// Result type alias for stagecraft-core
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_classification() {
        assert_eq!(
            Error::Provider("503".into()).failure_kind(),
            Some(FailureKind::Error)
        );
        assert_eq!(
            Error::Timeout {
                stage: "plan".into(),
                timeout_ms: 10
            }
            .failure_kind(),
            Some(FailureKind::Timeout)
        );
        assert_eq!(
            Error::Validation("missing key".into()).failure_kind(),
            Some(FailureKind::ValidationFailed)
        );
        assert!(Error::config("bad reference").failure_kind().is_none());
        assert!(!Error::Cancelled.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = Error::Timeout {
            stage: "review".into(),
            timeout_ms: 250,
        };
        assert_eq!(err.to_string(), "Stage 'review' timed out after 250ms");
    }
}
