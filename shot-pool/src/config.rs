use std::time::Duration;

use shot_permit::RateLimit;

use crate::error::PoolError;

/// Default number of workers.
pub const DEFAULT_WORKERS: usize = 3;

/// Default job queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

/// Settings for a [`Pool`](crate::Pool).
///
/// The defaults give three workers, a queue of ten jobs, no rate limit and
/// no per-job timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub rate_limit: Option<RateLimit>,
    pub job_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            rate_limit: None,
            job_timeout: None,
        }
    }
}

impl PoolConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Gate every job on a token bucket.
    pub fn with_rate_limit(mut self, limit: RateLimit) -> Self {
        self.rate_limit = Some(limit);
        self
    }

    /// Fail jobs whose work function runs longer than `timeout`.
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    /// Checks the settings can be used to start a pool.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidConfig`] naming the first bad setting.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.workers == 0 {
            return Err(PoolError::InvalidConfig(
                "worker count must be at least 1".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(PoolError::InvalidConfig(
                "queue capacity must be at least 1".to_string(),
            ));
        }
        if let Some(timeout) = self.job_timeout
            && timeout.is_zero()
        {
            return Err(PoolError::InvalidConfig(
                "job timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
