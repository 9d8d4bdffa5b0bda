//! Collects one outcome per claimed job.

use std::collections::VecDeque;
use std::time::Duration;

use futures::Stream;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio::time::sleep_until;
use tokio_util::sync::CancellationToken;

use crate::error::JobError;
use crate::error::PoolError;

/// The result of processing one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome<R> {
    /// Submission sequence number of the job.
    pub seq: u64,
    /// Worker that ran the job.
    pub worker: usize,
    /// Time spent waiting for a permit.
    pub permit_wait: Duration,
    /// When the job was admitted. `None` if it never was.
    pub admitted_at: Option<Instant>,
    pub result: Result<R, JobError>,
}

impl<R> Outcome<R> {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn is_err(&self) -> bool {
        self.result.is_err()
    }

    pub fn into_result(self) -> Result<R, JobError> {
        self.result
    }
}

/// Creates a connected sink/collector pair.
pub fn result_channel<R>() -> (ResultSink<R>, ResultCollector<R>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let collector = ResultCollector {
        inbox: Mutex::new(Inbox {
            rx,
            stash: VecDeque::new(),
        }),
    };
    (ResultSink { tx }, collector)
}

/// Write side handed to each worker.
#[derive(Debug)]
pub struct ResultSink<R> {
    tx: mpsc::UnboundedSender<Outcome<R>>,
}

impl<R> Clone for ResultSink<R> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<R> ResultSink<R> {
    /// Hands an outcome to the collector. Returns `false` if the collector is gone.
    pub fn emit(&self, outcome: Outcome<R>) -> bool {
        self.tx.send(outcome).is_ok()
    }
}

/// Read side. Safe to share; concurrent drains are served one at a time.
#[derive(Debug)]
pub struct ResultCollector<R> {
    inbox: Mutex<Inbox<R>>,
}

#[derive(Debug)]
struct Inbox<R> {
    rx: mpsc::UnboundedReceiver<Outcome<R>>,
    /// Outcomes received by a drain that has not returned them yet.
    stash: VecDeque<Outcome<R>>,
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl<R> ResultCollector<R> {
    /// Waits for `expected` outcomes and returns them in arrival order.
    ///
    /// # Errors
    ///
    /// * [`PoolError::Timeout`] if `timeout` passes first.
    /// * [`PoolError::Incomplete`] if every sink is dropped first.
    /// * [`PoolError::Cancelled`] if `cancel` fires first.
    ///
    /// Outcomes gathered before an error, or before the returned future is
    /// dropped, are kept for the next call. Outcomes that have already arrived
    /// are handed out even after `cancel` has fired.
    pub async fn collect(
        &self,
        expected: usize,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<Outcome<R>>, PoolError> {
        let mut inbox = self.inbox.lock().await;
        let until = Instant::now().checked_add(timeout);

        // Received outcomes go straight into the stash so a dropped drain loses nothing.
        while inbox.stash.len() < expected {
            if let Ok(outcome) = inbox.rx.try_recv() {
                inbox.stash.push_back(outcome);
                continue;
            }

            let received = inbox.stash.len();
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(PoolError::Cancelled),
                outcome = inbox.rx.recv() => {
                    outcome.ok_or(PoolError::Incomplete { expected, received })
                }
                _ = deadline(until) => Err(PoolError::Timeout { expected, received }),
            };

            match next {
                Ok(outcome) => inbox.stash.push_back(outcome),
                Err(err) => {
                    tracing::debug!(%err, "drain stopped early");
                    return Err(err);
                }
            }
        }

        Ok(inbox.stash.drain(..expected).collect())
    }

    /// Next outcome, or `None` once every sink is gone and nothing is left.
    pub async fn next(&self) -> Option<Outcome<R>> {
        let mut inbox = self.inbox.lock().await;
        match inbox.stash.pop_front() {
            Some(outcome) => Some(outcome),
            None => inbox.rx.recv().await,
        }
    }

    /// Consumes the collector as a lazy stream of outcomes.
    pub fn into_stream(self) -> impl Stream<Item = Outcome<R>> {
        futures::stream::unfold(self, |collector| async move {
            let outcome = collector.next().await?;
            Some((outcome, collector))
        })
    }
}
