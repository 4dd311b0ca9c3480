use thiserror::Error;

/// Custom Result type for this crate.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// The Error type for orchestration operations.
///
/// The taxonomy matters for the dispatch loop: `Validation` is rejected before
/// any side effect, `Duplicate` is a no-op signal rather than a failure,
/// `StageExecution` and `Timeout` count against a job's retry budget, and
/// `Backend`/`Queue` are retried by the caller with backoff.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Configuration validation error: {0}")]
    ConfigValidationError(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Duplicate operation for key '{key}'")]
    Duplicate { key: String },

    #[error("Quota '{quota}' exceeded for org '{org_id}'")]
    QuotaExceeded { org_id: String, quota: String },

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Queueing system error: {0}")]
    QueueError(String),

    #[error("Stage '{step}' failed for job '{job_id}': {message}")]
    StageExecution {
        step: String,
        job_id: String,
        message: String,
    },

    #[error("Job '{job_id}' timed out: {reason}")]
    Timeout { job_id: String, reason: String },

    #[error("I/O error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },

    #[error("Serialization/Deserialization error: {source}")]
    SerializationError {
        #[from]
        source: serde_json::Error,
    },

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

// lapin errors are flattened to strings here; mapping them at the call site
// keeps the queue implementation swappable behind the TaskQueue trait.
impl From<lapin::Error> for PipelineError {
    fn from(err: lapin::Error) -> Self {
        PipelineError::QueueError(err.to_string())
    }
}
