//! Pipeline error taxonomy
//!
//! Every failure belongs to exactly one category, and every category maps to
//! exactly one [`RetryPolicy`]:
//!
//! | Category            | Policy                                   |
//! |---------------------|------------------------------------------|
//! | `Validation`        | dead-letter, never retried in place      |
//! | `TransientStorage`  | bounded backoff, batch requeued whole    |
//! | `DataUnavailable`   | recorded as a skip reason on the output  |
//! | `ReliabilityBreach` | degraded-mode transition                 |
//! | `Fatal`             | exit and restart from checkpoint + replay|

use crate::data::ValidationError;
use crate::persistence::StorageError;
use crate::state::CheckpointError;
use thiserror::Error;

/// What the caller does with an error of a given category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Route to dead-letter and move on
    DeadLetter,
    /// Retry with exponential backoff, requeueing the whole unit of work
    Backoff,
    /// Record as an explicit skip reason, do not raise
    RecordSkip,
    /// Feed the degraded-mode controller, keep running
    Degrade,
    /// Exit and let external supervision restart the process
    Restart,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("transient storage failure: {0}")]
    TransientStorage(#[from] StorageError),

    #[error("data unavailable: {0}")]
    DataUnavailable(String),

    #[error("reliability breach: {0}")]
    ReliabilityBreach(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl PipelineError {
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            PipelineError::Validation(_) => RetryPolicy::DeadLetter,
            PipelineError::TransientStorage(_) => RetryPolicy::Backoff,
            PipelineError::DataUnavailable(_) => RetryPolicy::RecordSkip,
            PipelineError::ReliabilityBreach(_) => RetryPolicy::Degrade,
            PipelineError::Fatal(_) => RetryPolicy::Restart,
        }
    }

    /// Short label for logs and metrics
    pub fn category(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "validation",
            PipelineError::TransientStorage(_) => "transient_storage",
            PipelineError::DataUnavailable(_) => "data_unavailable",
            PipelineError::ReliabilityBreach(_) => "reliability_breach",
            PipelineError::Fatal(_) => "fatal",
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.retry_policy() == RetryPolicy::Restart
    }
}

impl From<CheckpointError> for PipelineError {
    fn from(err: CheckpointError) -> Self {
        PipelineError::Fatal(format!("checkpoint: {err}"))
    }
}

impl From<crate::config::ConfigError> for PipelineError {
    fn from(err: crate::config::ConfigError) -> Self {
        PipelineError::Fatal(format!("config: {err}"))
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
