//! # shot-permit
//!
//! `shot-permit` provides admission permits for bounded worker pools.
//!
//! ## Core Philosophy
//!
//! A worker asks a [`TokenSource`] for a permit before it starts a unit of work.
//! The source decides how quickly permits become available. Waiting is always
//! cancellable, so a blocked worker can be released without leaking a permit.
//!
//! ## Key Concepts
//!
//! * **Token Bucket**: A background refill task adds one permit per interval, up to
//!   a fixed capacity. A full bucket discards the tick instead of blocking.
//! * **Bursts**: A bucket can start pre-filled so the first permits are free.
//! * **Unlimited**: A source that never makes anyone wait.
//!
//! ## Example
//!
//! ```rust
//! use shot_permit::TokenBucket;
//! use shot_permit::TokenSource;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let bucket = TokenBucket::new(3, Duration::from_millis(200));
//! let cancel = CancellationToken::new();
//!
//! // The first three permits come straight out of the initial burst.
//! for _ in 0..3 {
//!     bucket.acquire(&cancel).await.unwrap();
//! }
//! # }
//! ```

use std::fmt::Debug;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

mod token_bucket;
mod unlimited;

pub use token_bucket::TokenBucket;
pub use unlimited::Unlimited;

/// Reasons why a permit could not be taken without waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// No permit is stored right now; one may arrive on a later refill.
    Exhausted,
    /// The source has been stopped and will never produce another permit.
    Stopped,
}

/// Errors returned by a blocking [`TokenSource::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AcquireError {
    /// The caller's cancellation token fired before a permit arrived.
    #[error("permit acquisition was cancelled")]
    Cancelled,

    /// The source was stopped while (or before) the caller was waiting.
    #[error("permit source has been stopped")]
    Stopped,
}

/// The core trait for everything that hands out admission permits.
///
/// Sources must be `Send` and `Sync` so a single instance can be shared by
/// every worker via `Arc`.
#[async_trait]
pub trait TokenSource: Debug + Send + Sync {
    /// Attempts to take a single permit without waiting.
    ///
    /// # Errors
    ///
    /// Breaks with a [`Reason`] if no permit could be taken.
    fn try_acquire(&self) -> ControlFlow<Reason>;

    /// Waits until a permit is available and consumes it.
    ///
    /// # Errors
    ///
    /// Returns [`AcquireError::Cancelled`] if `cancel` fires first and
    /// [`AcquireError::Stopped`] if the source stops.
    async fn acquire(&self, cancel: &CancellationToken) -> Result<(), AcquireError>;

    /// Stops producing permits. Waiters are released with [`AcquireError::Stopped`].
    fn stop(&self) {}
}

/// Token bucket settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    /// Maximum number of permits that can be stored.
    pub capacity: usize,
    /// Time between refill ticks.
    pub interval: Duration,
    /// Permits available at start. Clamped to `capacity`.
    pub initial: usize,
}

impl RateLimit {
    /// A bucket of `capacity` permits that starts full.
    pub fn new(capacity: usize, interval: Duration) -> Self {
        Self {
            capacity,
            interval,
            initial: capacity,
        }
    }

    /// Paces callers to one permit per `interval` with no burst.
    pub fn ticker(interval: Duration) -> Self {
        Self::new(0, interval)
    }

    pub fn with_initial(mut self, initial: usize) -> Self {
        self.initial = initial;
        self
    }
}

/// Builds the permit source described by `limit`.
///
/// `None` or a zero interval disables rate limiting. A bucket must be built
/// from within a tokio runtime because it spawns its refill task.
pub fn build_source(limit: Option<RateLimit>) -> Arc<dyn TokenSource> {
    match limit {
        Some(limit) if !limit.interval.is_zero() => Arc::new(TokenBucket::from_limit(limit)),
        _ => Arc::new(Unlimited),
    }
}
