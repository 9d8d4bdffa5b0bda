//! Bounded FIFO job queue shared by producers and workers.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_channel::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::error::PoolError;

/// A job together with its submission sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope<T> {
    /// Position in submission order, starting at zero.
    pub seq: u64,
    pub job: T,
}

/// What a consumer gets back from [`JobReceiver::claim`].
#[derive(Debug, PartialEq, Eq)]
pub enum Claim<T> {
    /// A job this consumer now owns.
    Job(Envelope<T>),
    /// The queue is closed and every job has been claimed.
    Exhausted,
}

/// Creates a queue holding at most `capacity` pending jobs.
pub fn job_queue<T>(capacity: NonZeroUsize) -> (JobQueue<T>, JobReceiver<T>) {
    let (tx, rx) = async_channel::bounded(capacity.get());
    let queue = JobQueue {
        tx,
        next_seq: Arc::new(AtomicU64::new(0)),
        accepted: Arc::new(AtomicU64::new(0)),
    };
    (queue, JobReceiver { rx })
}

/// The producer half. Cheap to clone; every clone feeds the same queue.
#[derive(Debug)]
pub struct JobQueue<T> {
    tx: async_channel::Sender<Envelope<T>>,
    next_seq: Arc<AtomicU64>,
    accepted: Arc<AtomicU64>,
}

impl<T> Clone for JobQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            next_seq: Arc::clone(&self.next_seq),
            accepted: Arc::clone(&self.accepted),
        }
    }
}

/// Counts a job as accepted from the moment it gets its `seq` until the send
/// fails or is abandoned.
struct Reservation<'a> {
    accepted: &'a AtomicU64,
    kept: bool,
}

impl Reservation<'_> {
    fn keep(mut self) {
        self.kept = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.kept {
            self.accepted.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl<T> JobQueue<T> {
    fn seal(&self, job: T) -> (Envelope<T>, Reservation<'_>) {
        self.accepted.fetch_add(1, Ordering::AcqRel);
        let envelope = Envelope {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            job,
        };
        let reservation = Reservation {
            accepted: &self.accepted,
            kept: false,
        };
        (envelope, reservation)
    }

    /// Adds a job, waiting while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Closed`] if the queue has been closed. The job is
    /// dropped.
    pub async fn enqueue(&self, job: T) -> Result<u64, PoolError> {
        let (envelope, reservation) = self.seal(job);
        let seq = envelope.seq;
        self.tx
            .send(envelope)
            .await
            .map_err(|_| PoolError::Closed)?;
        reservation.keep();
        Ok(seq)
    }

    /// Like [`enqueue`](Self::enqueue), but gives up after `timeout`.
    pub async fn enqueue_timeout(&self, job: T, timeout: Duration) -> Result<u64, PoolError> {
        tokio::time::timeout(timeout, self.enqueue(job))
            .await
            .map_err(|_| PoolError::SubmitTimeout(timeout))?
    }

    /// Adds a job only if there is room right now.
    pub fn try_enqueue(&self, job: T) -> Result<u64, PoolError> {
        let (envelope, reservation) = self.seal(job);
        let seq = envelope.seq;
        match self.tx.try_send(envelope) {
            Ok(()) => {
                reservation.keep();
                Ok(seq)
            }
            Err(TrySendError::Full(_)) => Err(PoolError::Full),
            Err(TrySendError::Closed(_)) => Err(PoolError::Closed),
        }
    }

    /// Signals that no more jobs will be added.
    ///
    /// Jobs already queued stay claimable.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::AlreadyClosed`] on a second call.
    pub fn close(&self) -> Result<(), PoolError> {
        if self.tx.close() {
            Ok(())
        } else {
            Err(PoolError::AlreadyClosed)
        }
    }

    /// Jobs accepted so far, including any whose send is still in progress.
    ///
    /// A job is counted before it becomes claimable, so this never lags
    /// behind what workers can see.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Jobs waiting to be claimed.
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.tx.capacity().unwrap_or(usize::MAX)
    }
}

/// The consumer half. Each clone competes for the same jobs.
#[derive(Debug)]
pub struct JobReceiver<T> {
    rx: async_channel::Receiver<Envelope<T>>,
}

impl<T> Clone for JobReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl<T> JobReceiver<T> {
    /// Takes the oldest queued job, waiting while the queue is empty but open.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Cancelled`] if `cancel` fires first. No job is
    /// claimed in that case.
    pub async fn claim(&self, cancel: &CancellationToken) -> Result<Claim<T>, PoolError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PoolError::Cancelled),
            res = self.rx.recv() => Ok(match res {
                Ok(envelope) => Claim::Job(envelope),
                Err(_) => Claim::Exhausted,
            }),
        }
    }
}
