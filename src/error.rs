//! Error types for the job orchestration core.
//!
//! [`JobError`] is what callers of the store, runner and facade see on the
//! synchronous path. Failures that happen *inside* a job's execution never
//! surface as a `JobError`; they are captured as a [`JobFailure`] and written
//! into that job's terminal state.

use serde::{Deserialize, Serialize};
use std::fmt;

pub type JobResult<T> = std::result::Result<T, JobError>;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Bad job type or parameter shape. Nothing was created.
    #[error("invalid request: {0}")]
    Validation(String),

    /// A credential envelope could not be opened.
    #[error("credential could not be decrypted: {0}")]
    Decryption(String),

    #[error("job not found: {0}")]
    NotFound(String),

    /// Mutation attempted against a job whose status does not allow it.
    #[error("job {id} is {status}, cannot {action}")]
    InvalidState {
        id: String,
        status: String,
        action: &'static str,
    },

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl JobError {
    pub fn validation(msg: impl Into<String>) -> Self {
        JobError::Validation(msg.into())
    }
}

/// Classification of a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Parameters no longer validate at execution time.
    ValidationError,
    /// The credential envelope was unusable; resubmit with a fresh secret.
    DecryptionError,
    /// The external engine reported a definitive failure.
    AdapterError,
    /// The process stopped while the job was running, or the job's secret
    /// was lost with the previous process.
    Interrupted,
    /// A cancellation request was honoured.
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::DecryptionError => "DecryptionError",
            ErrorKind::AdapterError => "AdapterError",
            ErrorKind::Interrupted => "Interrupted",
            ErrorKind::Cancelled => "Cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ValidationError" => Some(ErrorKind::ValidationError),
            "DecryptionError" => Some(ErrorKind::DecryptionError),
            "AdapterError" => Some(ErrorKind::AdapterError),
            "Interrupted" => Some(ErrorKind::Interrupted),
            "Cancelled" => Some(ErrorKind::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure stored on a `failed` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}
