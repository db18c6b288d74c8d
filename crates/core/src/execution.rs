//! Failure taxonomy for job execution.

use thiserror::Error;

use crate::error::DomainError;
use crate::job::JobError;

/// Why a handler could not finish a job.
///
/// Storage conflicts are not part of this taxonomy: stores retry them
/// locally against fresh state and never surface them to handlers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// The job input (or a plugin result) was malformed. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// The selected plugin does not declare the capability the job needs.
    #[error("capability not supported: {0}")]
    CapabilityNotSupported(String),

    /// A failure that may succeed on a later attempt.
    #[error("transient execution error: {0}")]
    Transient(String),

    /// The deadline elapsed before the handler finished.
    #[error("timed out after {0} ms")]
    Timeout(u64),
}

impl ExecutionError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn capability_not_supported(msg: impl Into<String>) -> Self {
        Self::CapabilityNotSupported(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecutionError::Transient(_))
    }

    /// Stable machine-readable code stored on the job.
    pub fn code(&self) -> &'static str {
        match self {
            ExecutionError::Validation(_) => "validation_error",
            ExecutionError::CapabilityNotSupported(_) => "capability_not_supported",
            ExecutionError::Transient(_) => "transient_error",
            ExecutionError::Timeout(_) => "timeout_error",
        }
    }

    pub fn to_job_error(&self) -> JobError {
        JobError {
            message: self.to_string(),
            code: Some(self.code().to_string()),
            details: None,
        }
    }
}

/// Domain rejections of job input are never worth retrying.
impl From<DomainError> for ExecutionError {
    fn from(err: DomainError) -> Self {
        ExecutionError::Validation(err.to_string())
    }
}
