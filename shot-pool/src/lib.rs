//! # Shot Pool
//!
//! `shot-pool` runs jobs on a fixed number of tokio workers, with every job
//! admitted through a rate limiting [`shot_permit::TokenSource`].
//!
//! ## How it fits together
//!
//! 1. **Submission**: Jobs enter a bounded FIFO queue. A full queue makes
//!    [`Pool::submit`] wait, [`Pool::try_submit`] fail with
//!    [`PoolError::Full`] and [`Pool::submit_timeout`] give up after a while.
//! 2. **Admission**: A worker that has claimed a job takes one permit before it
//!    runs the work function. The permit wait is implemented as a Tower
//!    [`AdmissionLayer`], so any [`tower::Service`] can be the work function.
//! 3. **Collection**: Every submitted job that a worker claims produces exactly one
//!    [`Outcome`], carrying either the value or a tagged [`JobError`].
//!    [`Pool::drain`] gathers them with a timeout and fails fast when the
//!    requested count can no longer be reached.
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//!
//! use shot_pool::Pool;
//! use shot_pool::PoolConfig;
//! use shot_pool::shot_permit::RateLimit;
//! use tower::BoxError;
//! use tower::service_fn;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), shot_pool::PoolError> {
//! let config = PoolConfig::default()
//!     .with_workers(2)
//!     .with_rate_limit(RateLimit::new(5, Duration::from_millis(10)));
//! let pool = Pool::start(config, service_fn(|n: u64| async move { Ok::<_, BoxError>(n * n) }))?;
//!
//! for n in 0..5 {
//!     pool.submit(n).await?;
//! }
//! pool.close_submission()?;
//!
//! let outcomes = pool.drain(5, Duration::from_secs(1)).await?;
//! assert_eq!(outcomes.len(), 5);
//! # Ok(())
//! # }
//! ```

mod collector;
mod config;
mod error;
mod layer;
mod pool;
mod queue;
mod service;
mod stats;
mod worker;

#[cfg(test)]
mod tests;

pub use collector::Outcome;
pub use collector::ResultCollector;
pub use collector::ResultSink;
pub use collector::result_channel;
pub use config::DEFAULT_QUEUE_CAPACITY;
pub use config::DEFAULT_WORKERS;
pub use config::PoolConfig;
pub use error::JobError;
pub use error::PoolError;
pub use layer::AdmissionLayer;
pub use pool::Pool;
pub use queue::Claim;
pub use queue::Envelope;
pub use queue::JobQueue;
pub use queue::JobReceiver;
pub use queue::job_queue;
pub use service::AdmissionService;
pub use service::ResponseFuture;
pub use stats::PoolStats;
pub use worker::WorkerOptions;
pub use worker::WorkerPool;
pub use worker::WorkerState;

pub use shot_permit;
