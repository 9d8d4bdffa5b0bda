use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::Stream;
use shot_permit::TokenSource;
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tower::Service;

use crate::collector::Outcome;
use crate::collector::ResultCollector;
use crate::collector::result_channel;
use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::queue::JobQueue;
use crate::queue::job_queue;
use crate::stats::PoolStats;
use crate::stats::Recorder;
use crate::worker::WorkerOptions;
use crate::worker::WorkerPool;
use crate::worker::WorkerState;

/// An admission controlled worker pool.
///
/// Jobs go in through [`submit`](Self::submit), wait in a bounded queue, are
/// picked up by a fixed set of workers that each take a permit before running
/// the work function, and come back out through [`drain`](Self::drain) or
/// [`next`](Self::next) as one [`Outcome`] per job.
pub struct Pool<T, R> {
    queue: JobQueue<T>,
    collector: ResultCollector<R>,
    workers: WorkerPool,
    source: Arc<dyn TokenSource>,
    /// Whether `shutdown` stops `source`.
    owns_source: bool,
    cancel: CancellationToken,
    recorder: Arc<Recorder>,
    delivered: AtomicU64,
}

impl<T, R> std::fmt::Debug for Pool<T, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("workers", &self.workers.len())
            .field("queued", &self.queue.len())
            .field("source", &self.source)
            .field("stats", &self.recorder.snapshot())
            .finish()
    }
}

impl<T, R> Pool<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    /// Starts a pool running `service` on every job.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidConfig`] if `config` does not validate.
    pub fn start<S>(config: PoolConfig, service: S) -> Result<Self, PoolError>
    where
        S: Service<T, Response = R, Error = BoxError> + Clone + Send + 'static,
        S::Future: Send,
    {
        config.validate()?;
        let source = shot_permit::build_source(config.rate_limit);
        let mut pool = Self::start_with_source(config, source, service)?;
        pool.owns_source = true;
        Ok(pool)
    }

    /// Starts a pool gated by a caller supplied permit source.
    ///
    /// `config.rate_limit` is ignored. The source stays the caller's:
    /// [`shutdown`](Self::shutdown) does not stop it, so it can be shared
    /// between pools.
    pub fn start_with_source<S>(
        config: PoolConfig,
        source: Arc<dyn TokenSource>,
        service: S,
    ) -> Result<Self, PoolError>
    where
        S: Service<T, Response = R, Error = BoxError> + Clone + Send + 'static,
        S::Future: Send,
    {
        config.validate()?;
        let workers = NonZeroUsize::new(config.workers)
            .ok_or_else(|| PoolError::InvalidConfig("worker count must be at least 1".into()))?;
        let capacity = NonZeroUsize::new(config.queue_capacity)
            .ok_or_else(|| PoolError::InvalidConfig("queue capacity must be at least 1".into()))?;

        let (queue, jobs) = job_queue(capacity);
        let (sink, collector) = result_channel();
        let cancel = CancellationToken::new();
        let recorder = Arc::new(Recorder::new());

        let options = WorkerOptions {
            job_timeout: config.job_timeout,
            cancel: cancel.clone(),
            recorder: Arc::clone(&recorder),
        };
        let workers = WorkerPool::spawn(
            workers,
            jobs,
            Arc::clone(&source),
            sink,
            service,
            options,
        );

        tracing::info!(
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            source = ?source,
            "pool started"
        );

        Ok(Self {
            queue,
            collector,
            workers,
            source,
            owns_source: false,
            cancel,
            recorder,
            delivered: AtomicU64::new(0),
        })
    }

    /// Submits a job, waiting while the queue is full.
    ///
    /// Returns the job's sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Closed`] after [`close_submission`](Self::close_submission).
    pub async fn submit(&self, job: T) -> Result<u64, PoolError> {
        let seq = self.queue.enqueue(job).await?;
        self.recorder.submitted();
        Ok(seq)
    }

    /// Submits a job only if the queue has room right now.
    pub fn try_submit(&self, job: T) -> Result<u64, PoolError> {
        let seq = self.queue.try_enqueue(job)?;
        self.recorder.submitted();
        Ok(seq)
    }

    /// Submits a job, giving up after `timeout` if the queue stays full.
    pub async fn submit_timeout(&self, job: T, timeout: Duration) -> Result<u64, PoolError> {
        let seq = self.queue.enqueue_timeout(job, timeout).await?;
        self.recorder.submitted();
        Ok(seq)
    }

    /// Declares that no more jobs will be submitted.
    ///
    /// Workers finish the queued jobs and then stop.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::AlreadyClosed`] if called twice.
    pub fn close_submission(&self) -> Result<(), PoolError> {
        self.queue.close()?;
        tracing::debug!(submitted = self.recorder.snapshot().submitted, "submission closed");
        Ok(())
    }

    /// Waits for `expected` outcomes, at most `timeout`.
    ///
    /// Outcomes are returned in arrival order.
    ///
    /// # Errors
    ///
    /// * [`PoolError::Unreachable`] straight away if submission is closed and
    ///   fewer than `expected` outcomes can still arrive.
    /// * [`PoolError::Timeout`], [`PoolError::Incomplete`] or
    ///   [`PoolError::Cancelled`] as for [`ResultCollector::collect`]. The
    ///   outcomes received so far are kept for the next call.
    pub async fn drain(
        &self,
        expected: usize,
        timeout: Duration,
    ) -> Result<Vec<Outcome<R>>, PoolError> {
        if self.queue.is_closed() {
            let submitted = self.queue.accepted();
            let outstanding = submitted.saturating_sub(self.delivered.load(Ordering::Acquire));
            if expected as u64 > outstanding {
                return Err(PoolError::Unreachable {
                    expected,
                    outstanding: outstanding as usize,
                });
            }
        }

        let outcomes = self.collector.collect(expected, timeout, &self.cancel).await?;
        self.delivered
            .fetch_add(outcomes.len() as u64, Ordering::AcqRel);
        Ok(outcomes)
    }

    /// Next outcome, or `None` once every worker has stopped and all outcomes
    /// have been handed out.
    pub async fn next(&self) -> Option<Outcome<R>> {
        let outcome = self.collector.next().await?;
        self.delivered.fetch_add(1, Ordering::AcqRel);
        Some(outcome)
    }

    /// Outcomes as a lazy stream. See [`next`](Self::next).
    pub fn outcomes(&self) -> impl Stream<Item = Outcome<R>> + '_ {
        futures::stream::unfold(self, |pool| async move {
            let outcome = pool.next().await?;
            Some((outcome, pool))
        })
    }

    /// Releases every blocked worker and drain.
    ///
    /// Jobs still queued are abandoned. A job that was claimed but not yet
    /// admitted produces a [`JobError::Cancelled`](crate::JobError::Cancelled) outcome.
    pub fn cancel(&self) {
        tracing::info!("pool cancelled");
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn stats(&self) -> PoolStats {
        self.recorder.snapshot()
    }

    /// Current state of each worker, indexed by worker id.
    pub fn states(&self) -> Vec<WorkerState> {
        self.workers.states()
    }

    /// Jobs waiting in the queue.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// The source workers take permits from.
    pub fn source(&self) -> &Arc<dyn TokenSource> {
        &self.source
    }

    /// Closes submission if still open, waits for the workers to finish and
    /// returns any outcomes not yet handed out.
    ///
    /// The permit source is stopped only if the pool built it in
    /// [`start`](Self::start).
    pub async fn shutdown(mut self) -> Vec<Outcome<R>> {
        if !self.queue.is_closed() {
            // Only fails if someone else closed it in the meantime
            let _ = self.queue.close();
        }
        self.workers.join().await;
        if self.owns_source {
            self.source.stop();
        }

        let mut rest = Vec::new();
        while let Some(outcome) = self.next().await {
            rest.push(outcome);
        }
        tracing::info!(stats = ?self.recorder.snapshot(), leftover = rest.len(), "pool shut down");
        rest
    }
}
