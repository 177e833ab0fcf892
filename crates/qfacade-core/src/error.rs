//! Error taxonomy.
//!
//! [`FacadeError`] is the closed set of failures a completion request can
//! resolve with. [`ProcessError`] covers process-management failures that are
//! not tied to a request (spawn, stop, I/O).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::template::EncodingError;

/// Where a request was when its deadline passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutPhase {
    /// Waiting for admission.
    Queued,
    /// Admitted and talking to the model runner.
    Executing,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => f.write_str("queued"),
            Self::Executing => f.write_str("executing"),
        }
    }
}

/// Failure of a single completion request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FacadeError {
    /// The readiness gate is closed; rejected before queuing.
    #[error("Service not ready: {detail}")]
    NotReady { detail: String },

    /// Admission would exceed the queue capacity.
    #[error("Request queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// Deadline exceeded.
    #[error("Request timed out while {phase} (after {after:?})")]
    RequestTimeout { phase: TimeoutPhase, after: Duration },

    /// The model runner exited or stopped answering during the request.
    #[error("Process '{name}' crashed during the request: {reason}")]
    ProcessCrashed { name: String, reason: String },

    /// The supervisor gave up restarting a process.
    #[error("Process '{name}' gave up after {attempts} consecutive restarts")]
    RestartExhausted { name: String, attempts: u32 },

    /// Tokenizer gate closed, or the HTTP call failed after its retry.
    #[error("Tokenizer unavailable: {0}")]
    TokenizerUnavailable(String),

    /// Malformed conversation.
    #[error("Invalid conversation: {0}")]
    EncodingValidation(#[from] EncodingError),
}

/// Stable discriminant of [`FacadeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotReady,
    QueueFull,
    RequestTimeout,
    ProcessCrashed,
    RestartExhausted,
    TokenizerUnavailable,
    EncodingValidation,
}

impl ErrorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotReady => "not_ready",
            Self::QueueFull => "queue_full",
            Self::RequestTimeout => "request_timeout",
            Self::ProcessCrashed => "process_crashed",
            Self::RestartExhausted => "restart_exhausted",
            Self::TokenizerUnavailable => "tokenizer_unavailable",
            Self::EncodingValidation => "encoding_validation",
        }
    }
}

impl FacadeError {
    pub fn not_ready(detail: impl Into<String>) -> Self {
        Self::NotReady {
            detail: detail.into(),
        }
    }

    pub fn crashed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ProcessCrashed {
            name: name.into(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotReady { .. } => ErrorKind::NotReady,
            Self::QueueFull { .. } => ErrorKind::QueueFull,
            Self::RequestTimeout { .. } => ErrorKind::RequestTimeout,
            Self::ProcessCrashed { .. } => ErrorKind::ProcessCrashed,
            Self::RestartExhausted { .. } => ErrorKind::RestartExhausted,
            Self::TokenizerUnavailable(_) => ErrorKind::TokenizerUnavailable,
            Self::EncodingValidation(_) => ErrorKind::EncodingValidation,
        }
    }

    /// Suggested HTTP status for the public surface.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::NotReady | ErrorKind::RestartExhausted | ErrorKind::TokenizerUnavailable => {
                503
            }
            ErrorKind::QueueFull => 429,
            ErrorKind::RequestTimeout => 504,
            ErrorKind::ProcessCrashed => 502,
            ErrorKind::EncodingValidation => 400,
        }
    }

    /// Whether the condition clears on its own (restart, queue draining).
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        !matches!(
            self,
            Self::RestartExhausted { .. } | Self::EncodingValidation(_)
        )
    }
}

/// Process-management failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessError {
    /// Failed to start the process.
    #[error("Failed to start: {0}")]
    StartFailed(String),

    /// Failed to stop the process.
    #[error("Failed to stop: {0}")]
    StopFailed(String),

    /// The process is not running.
    #[error("Process not running: {0}")]
    NotRunning(String),

    /// The supervisor was stopped and cannot be reused.
    #[error("Supervisor for '{0}' has been stopped")]
    Terminated(String),

    /// I/O on the child's pipes or files.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ProcessError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn all() -> Vec<FacadeError> {
        vec![
            FacadeError::not_ready("tokenizer: starting"),
            FacadeError::QueueFull { capacity: 4 },
            FacadeError::RequestTimeout {
                phase: TimeoutPhase::Queued,
                after: Duration::from_secs(1),
            },
            FacadeError::crashed("model", "exited"),
            FacadeError::RestartExhausted {
                name: "model".to_string(),
                attempts: 3,
            },
            FacadeError::TokenizerUnavailable("connection refused".to_string()),
            FacadeError::EncodingValidation(EncodingError::EmptyConversation),
        ]
    }

    #[test]
    fn test_every_kind_is_distinct() {
        let kinds: HashSet<_> = all().iter().map(FacadeError::kind).collect();
        assert_eq!(kinds.len(), 7);
    }

    #[test]
    fn test_status_codes() {
        let codes: Vec<u16> = all().iter().map(FacadeError::status_code).collect();
        assert_eq!(codes, vec![503, 429, 504, 502, 503, 503, 400]);
    }

    #[test]
    fn test_timeout_message_names_phase() {
        let err = FacadeError::RequestTimeout {
            phase: TimeoutPhase::Executing,
            after: Duration::from_millis(250),
        };
        assert!(err.to_string().contains("executing"));
    }

    #[test]
    fn test_restart_exhausted_is_not_transient() {
        let err = FacadeError::RestartExhausted {
            name: "tokenizer".to_string(),
            attempts: 5,
        };
        assert!(!err.is_transient());
        assert!(FacadeError::QueueFull { capacity: 1 }.is_transient());
    }
}
