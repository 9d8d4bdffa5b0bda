use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use opentelemetry::metrics::Histogram;

use crate::error::JobError;

#[derive(Clone, Debug)]
struct PoolMetrics {
    submitted: Counter<u64>,
    completed: Counter<u64>,
    failed: Counter<u64>,
    permit_wait: Histogram<f64>,
}

/// Running totals for a pool.
///
/// Local counts are kept in atomics; the same events are also reported to
/// the global opentelemetry meter `shot_pool`.
#[derive(Debug)]
pub(crate) struct Recorder {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    instruments: PoolMetrics,
}

/// A point-in-time copy of a pool's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Jobs accepted by the queue.
    pub submitted: u64,
    /// Jobs that produced a value.
    pub completed: u64,
    /// Jobs that produced a [`JobError`].
    pub failed: u64,
}

impl PoolStats {
    /// Jobs that have been submitted but have no outcome yet.
    pub fn in_flight(&self) -> u64 {
        self.submitted
            .saturating_sub(self.completed)
            .saturating_sub(self.failed)
    }
}

impl Recorder {
    pub(crate) fn new() -> Self {
        let meter = global::meter("shot_pool");
        let instruments = PoolMetrics {
            submitted: meter.u64_counter("jobs_submitted").build(),
            completed: meter.u64_counter("jobs_completed").build(),
            failed: meter.u64_counter("jobs_failed").build(),
            permit_wait: meter
                .f64_histogram("permit_wait")
                .with_unit("s")
                .build(),
        };

        Self {
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            instruments,
        }
    }

    pub(crate) fn submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        self.instruments.submitted.add(1, &[]);
    }

    pub(crate) fn admitted(&self, worker: usize, waited: Duration) {
        self.instruments.permit_wait.record(
            waited.as_secs_f64(),
            &[KeyValue::new("worker", worker as i64)],
        );
    }

    pub(crate) fn finished<R>(&self, result: &Result<R, JobError>) {
        match result {
            Ok(_) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                self.instruments.completed.add(1, &[]);
            }
            Err(err) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.instruments
                    .failed
                    .add(1, &[KeyValue::new("kind", err.kind())]);
            }
        }
    }

    pub(crate) fn snapshot(&self) -> PoolStats {
        PoolStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}
