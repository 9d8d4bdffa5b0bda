use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio::time::interval_at;
use tokio_util::sync::CancellationToken;

use super::AcquireError;
use super::RateLimit;
use super::Reason;
use super::TokenSource;

/// A token bucket refilled by a background ticker.
///
/// Every `interval` the refill task produces one permit. A blocked caller gets
/// it directly (longest waiter first); otherwise it is stored if fewer than
/// `capacity` permits are held, and discarded if the bucket is full.
///
/// A capacity of zero stores nothing, so every caller waits for a fresh tick.
#[derive(Debug)]
pub struct TokenBucket {
    shared: Arc<Shared>,
    stop: CancellationToken,
}

#[derive(Debug)]
struct Shared {
    capacity: usize,
    interval: Duration,
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    remaining: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
    stopped: bool,
}

#[derive(Debug, PartialEq)]
enum Deposit {
    Handed,
    Stored,
    Discarded,
    Stopped,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deposit(&self) -> Deposit {
        let mut state = self.state();
        if state.stopped {
            return Deposit::Stopped;
        }
        // Senders whose receiver has gone away belong to cancelled callers.
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.send(()).is_ok() {
                return Deposit::Handed;
            }
        }
        if state.remaining < self.capacity {
            state.remaining += 1;
            Deposit::Stored
        } else {
            Deposit::Discarded
        }
    }

    fn shut_down(&self) {
        let mut state = self.state();
        state.stopped = true;
        state.remaining = 0;
        // Dropping the senders wakes every waiter with a receive error.
        state.waiters.clear();
    }
}

/// A caller blocked in `acquire`.
///
/// If the caller gives up (cancelled or dropped) after a permit was already
/// handed over, the permit goes back to the bucket.
struct Waiter<'a> {
    shared: &'a Shared,
    granted: oneshot::Receiver<()>,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.granted.close();
        if self.granted.try_recv().is_ok() {
            self.shared.deposit();
        }
    }
}

#[async_trait]
impl TokenSource for TokenBucket {
    fn try_acquire(&self) -> ControlFlow<Reason> {
        let mut state = self.shared.state();
        if state.stopped {
            ControlFlow::Break(Reason::Stopped)
        } else if state.remaining > 0 {
            state.remaining -= 1;
            ControlFlow::Continue(())
        } else {
            ControlFlow::Break(Reason::Exhausted)
        }
    }

    async fn acquire(&self, cancel: &CancellationToken) -> Result<(), AcquireError> {
        let mut waiter = {
            let mut state = self.shared.state();
            if state.stopped {
                return Err(AcquireError::Stopped);
            }
            if cancel.is_cancelled() {
                return Err(AcquireError::Cancelled);
            }
            if state.remaining > 0 {
                state.remaining -= 1;
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.retain(|waiter| !waiter.is_closed());
            state.waiters.push_back(tx);
            Waiter {
                shared: &self.shared,
                granted: rx,
            }
        };

        tokio::select! {
            biased;
            res = &mut waiter.granted => res.map_err(|_| AcquireError::Stopped),
            _ = cancel.cancelled() => Err(AcquireError::Cancelled),
        }
    }

    fn stop(&self) {
        self.shared.shut_down();
        self.stop.cancel();
    }
}

impl TokenBucket {
    /// Creates a bucket that starts full and gains one permit per `interval`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if `interval` is zero.
    pub fn new(capacity: usize, interval: Duration) -> Self {
        Self::from_limit(RateLimit::new(capacity, interval))
    }

    /// Creates a bucket from [`RateLimit`] settings.
    ///
    /// # Panics
    ///
    /// Panics if `limit.interval` is zero.
    pub fn from_limit(limit: RateLimit) -> Self {
        assert!(
            !limit.interval.is_zero(),
            "token bucket refill interval must be non-zero"
        );
        let shared = Arc::new(Shared {
            capacity: limit.capacity,
            interval: limit.interval,
            state: Mutex::new(State {
                remaining: limit.initial.min(limit.capacity),
                waiters: VecDeque::new(),
                stopped: false,
            }),
        });
        let stop = CancellationToken::new();
        tokio::spawn(refill(ShutDownOnDrop(Arc::clone(&shared)), stop.clone()));
        Self { shared, stop }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn interval(&self) -> Duration {
        self.shared.interval
    }

    /// Permits stored right now.
    pub fn available(&self) -> usize {
        self.shared.state().remaining
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.state().stopped
    }
}

impl Drop for TokenBucket {
    fn drop(&mut self) {
        self.stop.cancel();
        self.shared.shut_down();
    }
}

/// Owned by the refill task. The bucket is shut down and its waiters released
/// whenever the task ends, even if it is dropped along with its runtime.
struct ShutDownOnDrop(Arc<Shared>);

impl Drop for ShutDownOnDrop {
    fn drop(&mut self) {
        self.0.shut_down();
        tracing::debug!("token bucket refill stopped");
    }
}

async fn refill(guard: ShutDownOnDrop, stop: CancellationToken) {
    let shared = &guard.0;
    let mut ticker = interval_at(Instant::now() + shared.interval, shared.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                let deposit = shared.deposit();
                tracing::trace!(?deposit, "refill tick");
                if deposit == Deposit::Stopped {
                    break;
                }
            }
        }
    }
}
