use std::time::Duration;

use shot_permit::AcquireError;
use tower::BoxError;

/// Errors produced by the pool infrastructure.
///
/// These are caller mistakes or lifecycle outcomes. Failures of individual
/// jobs never show up here; they travel through the outcome stream as
/// [`JobError`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// A job was submitted after submission was closed.
    #[error("job queue is closed; no more jobs can be submitted")]
    Closed,

    /// Submission was closed twice.
    #[error("job queue was already closed")]
    AlreadyClosed,

    /// A non-blocking submission found the queue at capacity.
    #[error("job queue is full")]
    Full,

    /// A bounded submission could not find room in time.
    #[error("timed out after {0:?} waiting for room in the job queue")]
    SubmitTimeout(Duration),

    /// A drain hit its deadline before enough outcomes arrived.
    ///
    /// The outcomes received so far are kept for the next drain.
    #[error("timed out with {received} of {expected} outcomes collected")]
    Timeout { expected: usize, received: usize },

    /// Every worker finished before the expected number of outcomes arrived.
    #[error("workers finished with {received} of {expected} outcomes collected")]
    Incomplete { expected: usize, received: usize },

    /// Submission is closed and the requested count can never be reached.
    #[error("asked for {expected} outcomes but only {outstanding} can still arrive")]
    Unreachable { expected: usize, outstanding: usize },

    /// A blocked operation was cancelled.
    #[error("operation was cancelled")]
    Cancelled,

    /// The pool configuration is unusable.
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
}

/// Why a single job did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    /// The work function returned an error.
    ///
    /// The string contains the `Display` representation of that error.
    #[error("job failed: {0}")]
    Failed(String),

    /// The work function ran longer than the per-job timeout.
    #[error("job timed out after {0:?}")]
    TimedOut(Duration),

    /// The work function panicked.
    #[error("job panicked: {0}")]
    Panicked(String),

    /// The pool was cancelled while the job waited for a permit.
    #[error("job was cancelled before it was admitted")]
    Cancelled,

    /// The permit source stopped while the job waited for a permit.
    #[error("permit source stopped before the job was admitted")]
    SourceStopped,
}

impl JobError {
    /// Short label used for logs and metric attributes.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Failed(_) => "failed",
            Self::TimedOut(_) => "timed_out",
            Self::Panicked(_) => "panicked",
            Self::Cancelled => "cancelled",
            Self::SourceStopped => "source_stopped",
        }
    }

    /// True if the job never started executing.
    pub fn is_unadmitted(&self) -> bool {
        matches!(self, Self::Cancelled | Self::SourceStopped)
    }

    /// Maps an error surfaced by the worker's service stack.
    pub(crate) fn from_boxed(err: BoxError) -> Self {
        match err.downcast::<JobError>() {
            Ok(job_err) => *job_err,
            Err(err) => match err.downcast::<AcquireError>() {
                Ok(acquire) => (*acquire).into(),
                Err(err) => Self::Failed(err.to_string()),
            },
        }
    }
}

impl From<AcquireError> for JobError {
    fn from(err: AcquireError) -> Self {
        match err {
            AcquireError::Cancelled => Self::Cancelled,
            AcquireError::Stopped => Self::SourceStopped,
        }
    }
}
