//! Fixed set of workers draining the job queue.

use std::any::Any;
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::FutureExt;
use shot_permit::TokenSource;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tower::Layer;
use tower::Service;
use tower::ServiceExt;
use tracing::Instrument;

use crate::collector::Outcome;
use crate::collector::ResultSink;
use crate::error::JobError;
use crate::layer::AdmissionLayer;
use crate::queue::Claim;
use crate::queue::Envelope;
use crate::queue::JobReceiver;
use crate::stats::PoolStats;
use crate::stats::Recorder;

/// Where a worker is in its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Idle,
    AwaitingJob,
    AwaitingPermit,
    Executing,
    Emitting,
    Stopped,
}

impl WorkerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::AwaitingJob,
            2 => Self::AwaitingPermit,
            3 => Self::Executing,
            4 => Self::Emitting,
            _ => Self::Stopped,
        }
    }
}

/// Per-pool worker settings.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Fail jobs that run longer than this.
    pub job_timeout: Option<Duration>,
    /// Fires to stop workers waiting for a job or a permit.
    pub cancel: CancellationToken,
    pub(crate) recorder: Arc<Recorder>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            job_timeout: None,
            cancel: CancellationToken::new(),
            recorder: Arc::new(Recorder::new()),
        }
    }
}

#[derive(Clone)]
struct StateCell {
    states: Arc<[AtomicU8]>,
    id: usize,
}

impl StateCell {
    fn set(&self, state: WorkerState) {
        self.states[self.id].store(state as u8, Ordering::Release);
    }
}

/// Handles to a running set of workers.
#[derive(Debug)]
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    states: Arc<[AtomicU8]>,
    recorder: Arc<Recorder>,
}

impl WorkerPool {
    /// Spawns `workers` tasks on the current tokio runtime.
    ///
    /// Each worker claims a job from `jobs`, waits for a permit from `source`,
    /// runs its own clone of `service` on the job and emits exactly one
    /// [`Outcome`] to `sink`. Workers stop once the queue is closed and
    /// drained, or when `options.cancel` fires.
    pub fn spawn<T, R, L, S>(
        workers: NonZeroUsize,
        jobs: JobReceiver<T>,
        source: Arc<L>,
        sink: ResultSink<R>,
        service: S,
        options: WorkerOptions,
    ) -> Self
    where
        T: Send + 'static,
        R: Send + 'static,
        L: TokenSource + ?Sized + 'static,
        S: Service<T, Response = R, Error = BoxError> + Clone + Send + 'static,
        S::Future: Send,
    {
        let states: Arc<[AtomicU8]> = (0..workers.get())
            .map(|_| AtomicU8::new(WorkerState::Idle as u8))
            .collect();

        let mut layer = AdmissionLayer::new(source).with_cancellation(options.cancel.clone());
        if let Some(timeout) = options.job_timeout {
            layer = layer.with_timeout(timeout);
        }

        let handles = (0..workers.get())
            .map(|id| {
                let worker = Worker {
                    id,
                    jobs: jobs.clone(),
                    sink: sink.clone(),
                    cancel: options.cancel.clone(),
                    state: StateCell {
                        states: Arc::clone(&states),
                        id,
                    },
                    recorder: Arc::clone(&options.recorder),
                };
                let svc = layer.layer(service.clone());
                tokio::spawn(
                    worker
                        .run(svc)
                        .instrument(tracing::debug_span!("worker", id)),
                )
            })
            .collect();

        tracing::debug!(workers = workers.get(), "worker pool started");

        Self {
            handles,
            states,
            recorder: options.recorder,
        }
    }

    /// Number of workers.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Current state of each worker, indexed by worker id.
    pub fn states(&self) -> Vec<WorkerState> {
        self.states
            .iter()
            .map(|state| WorkerState::from_u8(state.load(Ordering::Acquire)))
            .collect()
    }

    pub fn stats(&self) -> PoolStats {
        self.recorder.snapshot()
    }

    /// True once every worker has stopped.
    pub fn is_finished(&self) -> bool {
        self.handles.iter().all(JoinHandle::is_finished)
    }

    /// Waits for every worker to stop.
    pub async fn join(&mut self) {
        for res in futures::future::join_all(self.handles.drain(..)).await {
            if let Err(err) = res {
                tracing::error!(%err, "worker task failed");
            }
        }
    }
}

struct Worker<T, R> {
    id: usize,
    jobs: JobReceiver<T>,
    sink: ResultSink<R>,
    cancel: CancellationToken,
    state: StateCell,
    recorder: Arc<Recorder>,
}

impl<T, R> Worker<T, R> {
    async fn run<S>(self, mut svc: S)
    where
        S: Service<T, Response = R, Error = BoxError>,
    {
        loop {
            self.state.set(WorkerState::AwaitingJob);
            let Envelope { seq, job } = match self.jobs.claim(&self.cancel).await {
                Ok(Claim::Job(envelope)) => envelope,
                Ok(Claim::Exhausted) => {
                    tracing::debug!("job queue exhausted");
                    break;
                }
                Err(_) => {
                    tracing::debug!("cancelled while waiting for a job");
                    break;
                }
            };
            tracing::debug!(seq, "claimed job");

            self.state.set(WorkerState::AwaitingPermit);
            let wait_start = Instant::now();
            let admission = ServiceExt::<T>::ready(&mut svc).await;
            let permit_wait = wait_start.elapsed();

            let (admitted_at, result) = match admission {
                Ok(ready) => {
                    self.recorder.admitted(self.id, permit_wait);
                    let admitted_at = Instant::now();
                    self.state.set(WorkerState::Executing);
                    let call = AssertUnwindSafe(async { ready.call(job).await })
                        .catch_unwind()
                        .await;
                    let result = match call {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(err)) => Err(JobError::from_boxed(err)),
                        Err(panic) => Err(JobError::Panicked(panic_message(panic.as_ref()))),
                    };
                    (Some(admitted_at), result)
                }
                Err(err) => (None, Err(JobError::from_boxed(err))),
            };

            let unadmitted = match &result {
                Ok(_) => {
                    tracing::debug!(seq, ?permit_wait, "job completed");
                    false
                }
                Err(err) => {
                    tracing::warn!(seq, kind = err.kind(), %err, "job failed");
                    err.is_unadmitted()
                }
            };
            self.recorder.finished(&result);

            self.state.set(WorkerState::Emitting);
            let delivered = self.sink.emit(Outcome {
                seq,
                worker: self.id,
                permit_wait,
                admitted_at,
                result,
            });
            if !delivered {
                tracing::debug!(seq, "collector is gone; outcome dropped");
            }
            self.state.set(WorkerState::Idle);

            // Without admission there is nothing left for this worker to do.
            if unadmitted {
                break;
            }
        }

        self.state.set(WorkerState::Stopped);
        tracing::debug!("worker stopped");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
