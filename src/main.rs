use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use job_limiter::clock::ManualClock;
use job_limiter::config::{LimiterConfig, ThrottleConfig};
use job_limiter::metrics::RecordingMetrics;
use job_limiter::scheduler::InMemoryScheduler;
use job_limiter::store::{self, InMemoryLockStore};
use job_limiter::{Gated, Job, Limiter};

#[derive(Debug, Parser)]
#[command(name = "job-limiter", version, about = "Dedup and throttle gates for background jobs")]
struct Cli {
    /// Path to the limiter configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load and validate the configuration and resolve the lock store
    Check,
    /// Replay a throttle scenario against in-memory collaborators
    Demo {
        /// Throttle window in seconds
        #[arg(long, default_value_t = 60)]
        duration_secs: u64,
    },
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => LimiterConfig::from_file(path)?,
        None => LimiterConfig::default(),
    };

    match cli.command {
        Command::Check => check(&config),
        Command::Demo { duration_secs } => demo(config, duration_secs).await,
    }
}

fn check(config: &LimiterConfig) -> anyhow::Result<()> {
    config.validate()?;
    let lock_store = store::connect(&config.backend, config.store_timeout())?;

    info!(
        namespace = %config.namespace,
        backend = %lock_store.name(),
        reschedule_multiplier = config.reschedule_multiplier,
        "Configuration loaded"
    );
    for (job_class, policy) in &config.jobs {
        info!(
            job_class = %job_class,
            dedup_expiration = ?policy.dedup.as_ref().map(|d| d.expiration()),
            throttle_duration = ?policy.throttle.as_ref().map(|t| t.duration()),
            resource_arguments = ?policy.throttle.as_ref().map(|t| &t.resource_arguments),
            "Job policy"
        );
    }
    Ok(())
}

/// Replays: job1 enqueued, job2 dropped, job1 performs, job3 enqueued while
/// job1 holds the perform lock, job4 dropped, job3 rescheduled, then the
/// retry runs once the window has passed.
async fn demo(mut config: LimiterConfig, duration_secs: u64) -> anyhow::Result<()> {
    const JOB_CLASS: &str = "ThrottledJob";

    config.jobs.entry(JOB_CLASS.to_string()).or_default().throttle = Some(ThrottleConfig {
        duration_secs,
        resource_arguments: vec![0],
    });

    let clock = ManualClock::default();
    let lock_store = Arc::new(InMemoryLockStore::new(clock.clone()));
    let scheduler = Arc::new(InMemoryScheduler::new(clock.clone()));
    let metrics = Arc::new(RecordingMetrics::new());
    let limiter = Limiter::from_config(&config, lock_store, scheduler.clone(), metrics.clone())?;

    let request = || Job::new(JOB_CLASS, vec![json!("A")]);

    let job1 = request();
    limiter.enqueue(job1.clone(), None).await?;
    limiter.enqueue(request(), None).await?;
    scheduler.take_due();
    limiter
        .around_perform(job1, |job| async move {
            info!(job_id = ?job.job_id, "Performing job1");
        })
        .await?;

    let job3 = request();
    limiter.enqueue(job3.clone(), None).await?;
    limiter.enqueue(request(), None).await?;
    scheduler.take_due();
    if let Gated::Rescheduled { delay } = limiter.around_perform(job3, |_| async {}).await? {
        info!(delay = ?delay, "job3 rescheduled");
        clock.advance(delay);
    }

    for scheduled in scheduler.take_due() {
        if let Gated::Ran(()) = limiter.around_perform(scheduled.job, |_| async {}).await? {
            info!("Retry performed");
        }
    }

    for tag in metrics.tags() {
        println!("{}", tag);
    }
    Ok(())
}
