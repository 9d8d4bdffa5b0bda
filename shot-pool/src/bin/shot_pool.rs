use std::time::Duration;
use std::time::Instant;

use clap::Parser;
use clap::Subcommand;
use hdrhistogram::Histogram;
use shot_pool::DEFAULT_QUEUE_CAPACITY;
use shot_pool::DEFAULT_WORKERS;
use shot_pool::Pool;
use shot_pool::PoolConfig;
use shot_pool::shot_permit::RateLimit;
use tokio::time::sleep;
use tower::BoxError;
use tower::Service;
use tower::service_fn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Runs jobs through a rate limited worker pool and reports how they fared.
#[derive(Debug, Parser)]
#[command(name = "shot_pool", version)]
struct Cli {
    /// Number of workers
    #[arg(long, env = "SHOT_POOL_WORKERS", default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// Jobs that can wait in the queue before submission blocks
    #[arg(long, env = "SHOT_POOL_QUEUE_CAPACITY", default_value_t = DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,

    /// Fail jobs that run longer than this, e.g. "750ms"
    #[arg(long, env = "SHOT_POOL_JOB_TIMEOUT", value_parser = humantime::parse_duration)]
    job_timeout: Option<Duration>,

    /// Give up waiting for outcomes after this long
    #[arg(
        long,
        env = "SHOT_POOL_DRAIN_TIMEOUT",
        value_parser = humantime::parse_duration,
        default_value = "60s"
    )]
    drain_timeout: Duration,

    #[command(subcommand)]
    scenario: Scenario,
}

#[derive(Debug, Subcommand)]
enum Scenario {
    /// Jobs that sleep for a while and then double their input
    Workers {
        #[arg(long, default_value_t = 5)]
        jobs: u64,

        /// Time each job spends working
        #[arg(long, value_parser = humantime::parse_duration, default_value = "1s")]
        work: Duration,
    },
    /// Instant jobs paced by a token bucket
    Bucket {
        #[arg(long, default_value_t = 5)]
        jobs: u64,

        /// Permits the bucket can hold
        #[arg(long, env = "SHOT_POOL_BUCKET_CAPACITY", default_value_t = 3)]
        capacity: usize,

        /// Time between refills
        #[arg(
            long,
            env = "SHOT_POOL_BUCKET_INTERVAL",
            value_parser = humantime::parse_duration,
            default_value = "200ms"
        )]
        interval: Duration,

        /// Permits available at start (defaults to a full bucket)
        #[arg(long)]
        initial: Option<usize>,
    },
}

async fn run_scenario<S>(
    name: &str,
    config: PoolConfig,
    svc: S,
    jobs: u64,
    drain_timeout: Duration,
) -> Result<(), BoxError>
where
    S: Service<u64, Response = u64, Error = BoxError> + Clone + Send + 'static,
    S::Future: Send,
{
    let mut hist_wait = Histogram::<u64>::new_with_bounds(1, 60_000_000, 3)?;
    let start = Instant::now();

    let pool = Pool::start(config, svc)?;
    for n in 1..=jobs {
        pool.submit(n).await?;
    }
    pool.close_submission()?;

    let expected = usize::try_from(jobs)?;
    let outcomes = pool.drain(expected, drain_timeout).await?;
    let total_duration = start.elapsed();

    for outcome in &outcomes {
        hist_wait.saturating_record(outcome.permit_wait.as_micros() as u64);
        match &outcome.result {
            Ok(value) => println!(
                "job {:>4} worker {:>2} waited {:>10.2?} -> {}",
                outcome.seq, outcome.worker, outcome.permit_wait, value
            ),
            Err(err) => println!(
                "job {:>4} worker {:>2} waited {:>10.2?} !! {}",
                outcome.seq, outcome.worker, outcome.permit_wait, err
            ),
        }
    }

    let stats = pool.stats();
    let leftover = pool.shutdown().await;
    let throughput = outcomes.len() as f64 / total_duration.as_secs_f64();

    println!();
    println!("--- {} ---", name);
    println!("Total Duration:  {:.2?}", total_duration);
    println!("Success/Total:   {}/{}", stats.completed, stats.submitted);
    println!("Failed:          {}", stats.failed);
    println!("Rate:            {:.2} jobs/sec", throughput);
    if !outcomes.is_empty() {
        println!("P50 (Wait):      {}µs", hist_wait.value_at_quantile(0.5));
        println!("P99 (Wait):      {}µs", hist_wait.value_at_quantile(0.99));
        println!("Max (Wait):      {}µs", hist_wait.max());
    }
    if !leftover.is_empty() {
        println!("Leftover:        {}", leftover.len());
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shot_pool=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    tracing::debug!(?cli, "parsed arguments");

    let mut config = PoolConfig::default()
        .with_workers(cli.workers)
        .with_queue_capacity(cli.queue_capacity);
    if let Some(timeout) = cli.job_timeout {
        config = config.with_job_timeout(timeout);
    }

    match cli.scenario {
        Scenario::Workers { jobs, work } => {
            let doubler = service_fn(move |n: u64| async move {
                tracing::info!(n, "started job");
                sleep(work).await;
                tracing::info!(n, "finished job");
                Ok::<_, BoxError>(n * 2)
            });
            run_scenario("Workers", config, doubler, jobs, cli.drain_timeout).await?;
        }
        Scenario::Bucket {
            jobs,
            capacity,
            interval,
            initial,
        } => {
            let limit = RateLimit::new(capacity, interval).with_initial(initial.unwrap_or(capacity));
            let config = config.with_rate_limit(limit);
            let echo = service_fn(|n: u64| async move { Ok::<_, BoxError>(n) });
            run_scenario("Token Bucket", config, echo, jobs, cli.drain_timeout).await?;
        }
    }

    Ok(())
}
