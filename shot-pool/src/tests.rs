use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use futures::StreamExt;
use futures::future::Ready;
use futures::future::ready;
use more_asserts::assert_ge;
use more_asserts::assert_lt;
use shot_permit::RateLimit;
use shot_permit::Reason;
use shot_permit::TokenBucket;
use shot_permit::TokenSource;
use shot_permit::Unlimited;
use tokio::time::Instant;
use tokio::time::advance;
use tokio::time::pause;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tower::Layer;
use tower::Service;
use tower::ServiceExt;
use tower::service_fn;

use super::*;

#[derive(Clone, Debug, Default)]
struct MockService {
    pub count: Arc<AtomicUsize>,
}

impl Service<()> for MockService {
    type Response = ();
    type Error = BoxError;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: ()) -> Self::Future {
        self.count.fetch_add(1, Ordering::SeqCst);
        ready(Ok(()))
    }
}

async fn echo(n: u32) -> Result<u32, BoxError> {
    Ok(n)
}

async fn slow(n: u32) -> Result<u32, BoxError> {
    sleep(Duration::from_secs(1)).await;
    Ok(n)
}

async fn flaky(n: u32) -> Result<u32, BoxError> {
    match n {
        1 => Err("bad input".into()),
        2 => panic!("worker exploded"),
        3 => {
            sleep(Duration::from_secs(60)).await;
            Ok(n)
        }
        _ => Ok(n),
    }
}

async fn wait_for_states<T, R>(pool: &Pool<T, R>, want: WorkerState)
where
    T: Send + 'static,
    R: Send + 'static,
{
    let settled = tokio::time::timeout(Duration::from_secs(5), async {
        while pool.states().iter().any(|state| *state != want) {
            tokio::task::yield_now().await;
        }
    })
    .await;
    if settled.is_err() {
        panic!("workers never reached {want:?}: {:?}", pool.states());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_job_yields_exactly_one_outcome() {
    let config = PoolConfig::default()
        .with_workers(8)
        .with_queue_capacity(4);
    let pool = Arc::new(Pool::start(config, service_fn(echo)).unwrap());

    let mut submitters = vec![];
    for part in 0..4u32 {
        let pool = pool.clone();
        submitters.push(tokio::spawn(async move {
            for n in 0..50 {
                pool.submit(part * 50 + n).await.unwrap();
            }
        }));
    }
    for submitter in futures::future::join_all(submitters).await {
        submitter.unwrap();
    }
    pool.close_submission().unwrap();

    let outcomes = pool.drain(200, Duration::from_secs(10)).await.unwrap();

    let mut seqs: Vec<u64> = outcomes.iter().map(|o| o.seq).collect();
    seqs.sort();
    assert_eq!(seqs, (0..200).collect::<Vec<_>>());

    let mut values: Vec<u32> = outcomes.into_iter().map(|o| o.result.unwrap()).collect();
    values.sort();
    assert_eq!(values, (0..200).collect::<Vec<_>>());

    assert_eq!(
        pool.stats(),
        PoolStats {
            submitted: 200,
            completed: 200,
            failed: 0
        }
    );
}

#[tokio::test]
async fn test_single_worker_preserves_submission_order() {
    let pool = Pool::start(PoolConfig::default().with_workers(1), service_fn(echo)).unwrap();
    for n in [5, 3, 9, 1] {
        pool.submit(n).await.unwrap();
    }
    pool.close_submission().unwrap();

    let outcomes = pool.drain(4, Duration::from_secs(1)).await.unwrap();
    let seqs: Vec<u64> = outcomes.iter().map(|o| o.seq).collect();
    let values: Vec<u32> = outcomes.into_iter().map(|o| o.result.unwrap()).collect();
    assert_eq!(seqs, vec![0, 1, 2, 3]);
    assert_eq!(values, vec![5, 3, 9, 1]);
}

#[tokio::test]
async fn test_burst_then_refill_paces_admission() {
    pause();
    let start = Instant::now();

    let config = PoolConfig::default()
        .with_workers(1)
        .with_rate_limit(RateLimit::new(3, Duration::from_secs(1)));
    let pool = Pool::start(config, service_fn(echo)).unwrap();

    for n in 0..5 {
        pool.submit(n).await.unwrap();
    }
    pool.close_submission().unwrap();

    let outcomes = pool.drain(5, Duration::from_secs(10)).await.unwrap();
    let admitted: Vec<Duration> = outcomes
        .iter()
        .map(|o| o.admitted_at.unwrap() - start)
        .collect();

    // The initial burst goes straight through
    for at in &admitted[..3] {
        assert_lt!(*at, Duration::from_millis(10));
    }
    // then one job per refill
    assert_ge!(admitted[3], Duration::from_secs(1));
    assert_lt!(admitted[3], Duration::from_millis(1010));
    assert_ge!(admitted[4], Duration::from_secs(2));
    assert_lt!(admitted[4], Duration::from_millis(2010));

    assert_ge!(outcomes[4].permit_wait, Duration::from_millis(990));
}

#[tokio::test]
async fn test_ticker_paces_every_job() {
    pause();
    let start = Instant::now();

    let config = PoolConfig::default()
        .with_workers(2)
        .with_rate_limit(RateLimit::ticker(Duration::from_millis(100)));
    let pool = Pool::start(config, service_fn(echo)).unwrap();

    for n in 0..3 {
        pool.submit(n).await.unwrap();
    }
    pool.close_submission().unwrap();

    let outcomes = pool.drain(3, Duration::from_secs(5)).await.unwrap();
    let mut admitted: Vec<Duration> = outcomes
        .iter()
        .map(|o| o.admitted_at.unwrap() - start)
        .collect();
    admitted.sort();

    // No burst: even the first job waits for a tick
    assert_ge!(admitted[0], Duration::from_millis(100));
    for pair in admitted.windows(2) {
        assert_ge!(pair[1] - pair[0], Duration::from_millis(90));
    }
}

#[tokio::test]
async fn test_failures_are_tagged_outcomes() {
    pause();

    let config = PoolConfig::default()
        .with_workers(1)
        .with_job_timeout(Duration::from_secs(1));
    let pool = Pool::start(config, service_fn(flaky)).unwrap();

    for n in 0..5 {
        pool.submit(n).await.unwrap();
    }
    pool.close_submission().unwrap();

    let results: Vec<Result<u32, JobError>> = pool
        .drain(5, Duration::from_secs(120))
        .await
        .unwrap()
        .into_iter()
        .map(Outcome::into_result)
        .collect();

    assert_eq!(
        results,
        vec![
            Ok(0),
            Err(JobError::Failed("bad input".to_string())),
            Err(JobError::Panicked("worker exploded".to_string())),
            Err(JobError::TimedOut(Duration::from_secs(1))),
            Ok(4),
        ]
    );
    assert_eq!(
        pool.stats(),
        PoolStats {
            submitted: 5,
            completed: 2,
            failed: 3
        }
    );

    // A panicking job does not take its worker down
    assert!(pool.shutdown().await.is_empty());
}

#[tokio::test]
async fn test_closing_submission_is_guarded() {
    let pool = Pool::start(PoolConfig::default(), service_fn(echo)).unwrap();
    pool.submit(1).await.unwrap();

    pool.close_submission().unwrap();
    assert_eq!(pool.close_submission(), Err(PoolError::AlreadyClosed));
    assert_eq!(pool.submit(2).await, Err(PoolError::Closed));
    assert_eq!(pool.try_submit(3), Err(PoolError::Closed));
    assert_eq!(pool.stats().submitted, 1);

    let outcomes = pool.drain(1, Duration::from_secs(1)).await.unwrap();
    assert!(outcomes[0].is_ok());
}

#[tokio::test]
async fn test_drain_fails_fast_when_unreachable() {
    let pool = Pool::start(PoolConfig::default(), service_fn(echo)).unwrap();
    pool.submit(1).await.unwrap();
    pool.submit(2).await.unwrap();
    pool.close_submission().unwrap();

    assert_eq!(
        pool.drain(3, Duration::from_secs(3600)).await.unwrap_err(),
        PoolError::Unreachable {
            expected: 3,
            outstanding: 2
        }
    );

    assert_eq!(pool.drain(2, Duration::from_secs(1)).await.unwrap().len(), 2);

    assert_eq!(
        pool.drain(1, Duration::from_secs(3600)).await.unwrap_err(),
        PoolError::Unreachable {
            expected: 1,
            outstanding: 0
        }
    );
    // Asking for nothing always succeeds
    assert!(pool.drain(0, Duration::ZERO).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_drain_timeout_keeps_partial_results() {
    pause();

    let pool = Pool::start(PoolConfig::default().with_workers(1), service_fn(slow)).unwrap();
    for n in 0..3 {
        pool.submit(n).await.unwrap();
    }

    assert_eq!(
        pool.drain(3, Duration::from_millis(1500)).await.unwrap_err(),
        PoolError::Timeout {
            expected: 3,
            received: 1
        }
    );

    // The outcome received before the deadline is handed out next time
    let outcomes = pool.drain(3, Duration::from_secs(10)).await.unwrap();
    let seqs: Vec<u64> = outcomes.iter().map(|o| o.seq).collect();
    assert_eq!(seqs, vec![0, 1, 2]);
}

#[tokio::test]
async fn test_abandoned_drain_loses_nothing() {
    pause();

    let pool = Pool::start(PoolConfig::default().with_workers(1), service_fn(slow)).unwrap();
    for n in 0..3 {
        pool.submit(n).await.unwrap();
    }

    // Two jobs finish before the caller stops waiting
    let abandoned = tokio::time::timeout(
        Duration::from_millis(2500),
        pool.drain(3, Duration::MAX),
    )
    .await;
    assert!(abandoned.is_err());

    let mut seqs: Vec<u64> = pool.shutdown().await.iter().map(|o| o.seq).collect();
    seqs.sort();
    assert_eq!(seqs, vec![0, 1, 2]);
}

#[tokio::test]
async fn test_shutdown_leaves_a_shared_source_running() {
    let bucket = Arc::new(TokenBucket::new(10, Duration::from_secs(3600)));

    let first = Pool::start_with_source(
        PoolConfig::default().with_workers(1),
        bucket.clone(),
        service_fn(echo),
    )
    .unwrap();
    let second = Pool::start_with_source(
        PoolConfig::default().with_workers(1),
        bucket.clone(),
        service_fn(echo),
    )
    .unwrap();

    first.submit(1).await.unwrap();
    assert_eq!(first.shutdown().await.len(), 1);
    assert!(!bucket.is_stopped());

    second.submit(2).await.unwrap();
    let outcomes = second.drain(1, Duration::from_secs(5)).await.unwrap();
    assert_eq!(outcomes[0].result, Ok(2));
}

#[tokio::test]
async fn test_shutdown_stops_a_source_the_pool_built() {
    let pool = Pool::start(
        PoolConfig::default().with_rate_limit(RateLimit::ticker(Duration::from_secs(3600))),
        service_fn(echo),
    )
    .unwrap();
    let source = Arc::clone(pool.source());
    assert!(pool.shutdown().await.is_empty());
    assert_eq!(source.try_acquire(), ControlFlow::Break(Reason::Stopped));
}

#[tokio::test]
async fn test_drain_reports_incomplete_when_workers_quit() {
    let bucket = Arc::new(TokenBucket::new(0, Duration::from_secs(3600)));
    let pool = Pool::start_with_source(
        PoolConfig::default().with_workers(1),
        bucket.clone(),
        service_fn(echo),
    )
    .unwrap();

    pool.submit(1).await.unwrap();
    pool.submit(2).await.unwrap();
    wait_for_states(&pool, WorkerState::AwaitingPermit).await;

    // The only worker gives up after its job is refused, leaving job 2 behind
    bucket.stop();
    assert_eq!(
        pool.drain(2, Duration::from_secs(5)).await.unwrap_err(),
        PoolError::Incomplete {
            expected: 2,
            received: 1
        }
    );

    let outcome = pool.next().await.unwrap();
    assert_eq!(outcome.result, Err(JobError::SourceStopped));
    assert!(outcome.admitted_at.is_none());
    assert_eq!(pool.states(), vec![WorkerState::Stopped]);
}

#[tokio::test]
async fn test_cancel_releases_workers_waiting_for_permits() {
    let config = PoolConfig::default()
        .with_workers(2)
        .with_rate_limit(RateLimit::ticker(Duration::from_secs(3600)));
    let pool = Pool::start(config, service_fn(echo)).unwrap();

    pool.submit(1).await.unwrap();
    pool.submit(2).await.unwrap();
    wait_for_states(&pool, WorkerState::AwaitingPermit).await;

    pool.cancel();
    assert!(pool.is_cancelled());
    // Outcomes that already arrived are still handed out; otherwise the drain
    // is released by the cancellation.
    let mut outcomes = match pool.drain(2, Duration::from_secs(1)).await {
        Ok(outcomes) => outcomes,
        Err(err) => {
            assert_eq!(err, PoolError::Cancelled);
            vec![]
        }
    };

    outcomes.extend(pool.shutdown().await);
    assert_eq!(outcomes.len(), 2);
    for outcome in outcomes {
        assert_eq!(outcome.result, Err(JobError::Cancelled));
        assert!(outcome.admitted_at.is_none());
    }
}

#[tokio::test]
async fn test_full_queue_rejects_nonblocking_submission() {
    let config = PoolConfig::default()
        .with_workers(1)
        .with_queue_capacity(1)
        .with_rate_limit(RateLimit::ticker(Duration::from_secs(3600)));
    let pool = Pool::start(config, service_fn(echo)).unwrap();

    // Job 0 is claimed and parks its worker on the permit wait
    pool.submit(0).await.unwrap();
    wait_for_states(&pool, WorkerState::AwaitingPermit).await;

    assert_eq!(pool.try_submit(1), Ok(1));
    assert_eq!(pool.queued(), 1);
    assert_eq!(pool.try_submit(2), Err(PoolError::Full));
    assert_eq!(
        pool.submit_timeout(3, Duration::from_millis(50)).await,
        Err(PoolError::SubmitTimeout(Duration::from_millis(50)))
    );
    assert_eq!(pool.stats().submitted, 2);

    pool.cancel();
    let rest = pool.shutdown().await;
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].seq, 0);
}

#[tokio::test]
async fn test_outcome_stream_ends_once_workers_stop() {
    let pool = Pool::start(PoolConfig::default(), service_fn(echo)).unwrap();
    for n in 0..6 {
        pool.submit(n).await.unwrap();
    }
    pool.close_submission().unwrap();

    let mut values: Vec<u32> = pool
        .outcomes()
        .map(|outcome| outcome.result.unwrap())
        .collect()
        .await;
    values.sort();
    assert_eq!(values, vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(pool.stats().in_flight(), 0);
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let err = Pool::<u32, u32>::start(PoolConfig::default().with_workers(0), service_fn(echo))
        .unwrap_err();
    assert!(matches!(err, PoolError::InvalidConfig(_)));
}

mod admission {
    use super::*;

    #[tokio::test]
    async fn test_poll_ready_backpressure() {
        pause();

        let bucket = TokenBucket::new(2, Duration::from_millis(100));
        let mock = MockService::default();
        let mut service = AdmissionService::new(mock.clone(), Arc::new(bucket));

        ServiceExt::<()>::ready(&mut service).await.unwrap();
        service.call(()).await.unwrap();
        ServiceExt::<()>::ready(&mut service).await.unwrap();
        service.call(()).await.unwrap();

        // Bucket is empty, so this poll must stay pending
        let mut ready_fut = ServiceExt::<()>::ready(&mut service);
        tokio::select! {
            _ = &mut ready_fut => panic!("Should be throttled!"),
            _ = sleep(Duration::from_millis(10)) => {}
        }

        advance(Duration::from_millis(100)).await;

        ready_fut.await.expect("Should recover after a refill");
        service.call(()).await.unwrap();
        assert_eq!(mock.count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_shared_bucket_across_clones() {
        let layer = AdmissionLayer::new(Arc::new(TokenBucket::new(1, Duration::from_secs(10))));

        let mut svc1 = layer.layer(MockService::default());
        let mut svc2 = layer.layer(MockService::default());

        ServiceExt::<()>::ready(&mut svc1)
            .await
            .unwrap()
            .call(())
            .await
            .unwrap();

        // svc2 should now be throttled because svc1 took the only permit
        assert!(futures::poll!(ServiceExt::<()>::ready(&mut svc2)).is_pending());
    }

    #[tokio::test]
    async fn test_cancelled_readiness_is_an_admission_error() {
        let cancel = CancellationToken::new();
        let mut service = AdmissionService::new(
            MockService::default(),
            Arc::new(TokenBucket::new(0, Duration::from_secs(3600))),
        )
        .with_cancellation(cancel.clone());

        let mut ready_fut = ServiceExt::<()>::ready(&mut service);
        assert!(futures::poll!(&mut ready_fut).is_pending());

        cancel.cancel();
        let err = ready_fut.await.unwrap_err();
        assert_eq!(JobError::from_boxed(err), JobError::Cancelled);
    }

    #[tokio::test]
    async fn test_call_timeout_is_tagged() {
        pause();

        let mut service = AdmissionLayer::new(Arc::new(Unlimited))
            .with_timeout(Duration::from_millis(100))
            .layer(service_fn(|_: ()| async {
                sleep(Duration::from_secs(1)).await;
                Ok::<_, BoxError>(())
            }));

        let err = ServiceExt::<()>::ready(&mut service)
            .await
            .unwrap()
            .call(())
            .await
            .unwrap_err();
        assert_eq!(
            JobError::from_boxed(err),
            JobError::TimedOut(Duration::from_millis(100))
        );
    }

    #[tokio::test]
    async fn test_source_stop_fails_readiness() {
        let bucket = Arc::new(TokenBucket::new(0, Duration::from_secs(3600)));
        let mut service = AdmissionService::new(MockService::default(), bucket.clone());

        let mut ready_fut = ServiceExt::<()>::ready(&mut service);
        assert!(futures::poll!(&mut ready_fut).is_pending());

        bucket.stop();
        let err = ready_fut.await.unwrap_err();
        assert_eq!(JobError::from_boxed(err), JobError::SourceStopped);
    }
}
