//! CLI command definitions for iquery-sweep.
//!
//! Each subcommand builds the components it needs from `SweepConfig`
//! (environment first, then flags) and runs one role: the scheduler daemon,
//! a worker pool, or a one-shot operator action.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::future::try_join_all;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::backfill::{BackfillOutcome, DocketSaved, SignalBackfill, SweepTrigger};
use crate::config::SweepConfig;
use crate::coordination::{redact_url, Coordinator, Rate, Watermark};
use crate::error::CoordinationError;
use crate::metrics;
use crate::probing::{FrontierProber, PacerReportClient, ReportSource};
use crate::queue::{JobQueue, JobRunner, QueueStats, WorkerPool, WorkerPoolConfig};
use crate::storage::{CaseStore, CourtSource, Database, MigrationRunner};
use crate::sweep::{seed_watermarks, CourtRegistry, SweepScheduler};

/// How often the metrics textfile is rewritten by long-running commands.
const METRICS_WRITE_INTERVAL: Duration = Duration::from_secs(15);

/// PACER iquery case-discovery sweep.
#[derive(Parser)]
#[command(name = "iquery-sweep")]
#[command(about = "Discover new PACER cases by sweeping and probing caselink IDs")]
#[command(version)]
#[command(
    long_about = "iquery-sweep walks each court's caselink ID space, queueing one rate-limited crawl per ID and probing for the frontier once caught up.\n\nExample usage:\n  iquery-sweep daemon --courts nysd,cand --iterations 10\n  iquery-sweep worker --workers 8"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Redis URL for the coordination store and job queue.
    #[arg(long, env = "REDIS_URL", global = true)]
    pub redis_url: Option<String>,

    /// PostgreSQL URL for the docket store.
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,

    /// Job queue name.
    #[arg(long, global = true)]
    pub queue: Option<String>,

    /// Write Prometheus metrics to this node-exporter textfile.
    #[arg(long, global = true)]
    pub metrics_textfile: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the sweep scheduler loop.
    Daemon(DaemonArgs),

    /// Run a pool of workers executing crawl and probe jobs.
    Worker(WorkerArgs),

    /// Seed each court's sweep bounds from its latest case filed in a year.
    #[command(name = "set-case-ids")]
    SetCaseIds(SetCaseIdsArgs),

    /// Queue crawls for every ID up to and including a target.
    Backfill(BackfillArgs),

    /// Run the post-commit backfill hook for a docket saved elsewhere.
    Notify(NotifyArgs),

    /// Show watermarks, cooldowns and queue depth.
    Status(StatusArgs),

    /// Probe one court's frontier in this process.
    Probe(ProbeArgs),

    /// Create the docket schema.
    Migrate,
}

/// Arguments for `iquery-sweep daemon`.
#[derive(Parser, Debug)]
pub struct DaemonArgs {
    /// Courts to sweep, comma separated. Defaults to every PACER court.
    #[arg(long, value_delimiter = ',')]
    pub courts: Vec<String>,

    /// Passes over all courts; 0 runs until interrupted.
    #[arg(long, alias = "testing-iterations", default_value = "0")]
    pub iterations: u64,

    /// Seconds between passes.
    #[arg(long)]
    pub iteration_delay: Option<u64>,

    /// Seconds between courts within a pass.
    #[arg(long)]
    pub court_delay: Option<u64>,

    /// Consecutive empty probes after which a court is dropped for the run.
    #[arg(long)]
    pub stop_threshold: Option<u32>,

    /// Queue backlog lower bound (default: twice the number of courts).
    #[arg(long)]
    pub throttle_min_items: Option<usize>,

    /// Remove cooldowns after every tick (testing only).
    #[arg(long)]
    pub clear_cooldowns: bool,

    /// Print the run summary as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `iquery-sweep worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Number of concurrent workers.
    #[arg(short = 'w', long, default_value = "4")]
    pub workers: usize,

    /// Per-court crawl rate, e.g. 1/4s.
    #[arg(long)]
    pub crawl_rate: Option<Rate>,

    /// Seconds before a running job is abandoned.
    #[arg(long, default_value = "900")]
    pub job_timeout: u64,

    /// Do not run reactive backfill for dockets created by crawls.
    #[arg(long)]
    pub no_backfill: bool,
}

/// Arguments for `iquery-sweep set-case-ids`.
#[derive(Parser, Debug)]
pub struct SetCaseIdsArgs {
    /// Courts to seed, comma separated. Defaults to every PACER court.
    #[arg(long, value_delimiter = ',')]
    pub courts: Vec<String>,

    /// Filing year whose latest case seeds the bounds.
    #[arg(long)]
    pub year: i32,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `iquery-sweep backfill`.
#[derive(Parser, Debug)]
pub struct BackfillArgs {
    #[arg(long)]
    pub court: String,

    /// Last caselink ID to crawl.
    #[arg(long)]
    pub target: i64,
}

/// Arguments for `iquery-sweep notify`.
#[derive(Parser, Debug)]
pub struct NotifyArgs {
    #[arg(long)]
    pub court: String,

    /// Caselink ID of the newly created docket.
    #[arg(long)]
    pub case_id: i64,
}

/// Arguments for `iquery-sweep status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Courts to show, comma separated. Defaults to every seeded court.
    #[arg(long, value_delimiter = ',')]
    pub courts: Vec<String>,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `iquery-sweep probe`.
#[derive(Parser, Debug)]
pub struct ProbeArgs {
    #[arg(long)]
    pub court: String,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = build_config(&cli)?;
    let textfile = cli.metrics_textfile.clone();

    match cli.command {
        Commands::Daemon(args) => run_daemon_command(config, args, textfile).await,
        Commands::Worker(args) => run_worker_command(config, args, textfile).await,
        Commands::SetCaseIds(args) => run_set_case_ids_command(config, args).await,
        Commands::Backfill(args) => run_backfill_command(config, args).await,
        Commands::Notify(args) => run_notify_command(config, args).await,
        Commands::Status(args) => run_status_command(config, args).await,
        Commands::Probe(args) => run_probe_command(config, args).await,
        Commands::Migrate => run_migrate_command(config).await,
    }
}

/// Environment configuration with the global flags applied on top.
fn build_config(cli: &Cli) -> anyhow::Result<SweepConfig> {
    let mut config = SweepConfig::from_env()?;
    if let Some(url) = &cli.redis_url {
        config = config.with_redis_url(url.clone());
    }
    if let Some(url) = &cli.database_url {
        config = config.with_database_url(url.clone());
    }
    if let Some(queue) = &cli.queue {
        config = config.with_queue_name(queue.clone());
    }
    config.validate()?;
    Ok(config)
}

// ============================================================================
// Shared construction
// ============================================================================

struct Components {
    coordinator: Coordinator,
    queue: Arc<JobQueue>,
    database: Arc<Database>,
}

async fn connect(config: &SweepConfig) -> anyhow::Result<Components> {
    info!(redis = %redact_url(&config.redis_url), "Connecting to coordination store");
    let coordinator = Coordinator::connect(&config.redis_url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to Redis: {}", e))?;
    let queue = Arc::new(JobQueue::from_backend(
        coordinator.backend(),
        &config.queue_name,
    ));

    info!(database = %redact_url(&config.database_url), "Connecting to docket store");
    let database = Arc::new(
        Database::connect(&config.database_url)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to database: {}", e))?,
    );

    Ok(Components {
        coordinator,
        queue,
        database,
    })
}

async fn court_registry(
    config: &SweepConfig,
    database: &Arc<Database>,
    only: &[String],
) -> anyhow::Result<Arc<CourtRegistry>> {
    let source: Arc<dyn CourtSource> = database.clone();
    let mut registry = CourtRegistry::new(source, config.court_refresh_interval);
    if !only.is_empty() {
        registry = registry.restrict_to(only.iter().cloned());
    }
    let count = registry.refresh_courts().await?;
    if count == 0 {
        warn!("No courts to work on");
    }
    Ok(Arc::new(registry))
}

fn report_client(config: &SweepConfig) -> anyhow::Result<Arc<dyn ReportSource>> {
    let client = PacerReportClient::new(
        config.report_base_url.clone(),
        config.pacer_cookie.clone(),
        config.report_timeout,
    )?;
    Ok(Arc::new(client))
}

fn signal_backfill(
    config: &SweepConfig,
    parts: &Components,
    courts: Arc<CourtRegistry>,
) -> SignalBackfill {
    SignalBackfill::new(
        parts.coordinator.clone(),
        Arc::clone(&parts.queue),
        courts,
        config.backfill_config(),
    )
}

/// Channel that turns true on Ctrl-C.
fn shutdown_channel() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            let _ = tx.send(true);
        }
    });
    rx
}

/// Periodically rewrites the metrics textfile until the task is aborted.
fn spawn_metrics_writer(path: Option<PathBuf>) -> Option<JoinHandle<()>> {
    let path = path?;
    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(METRICS_WRITE_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(e) = metrics::write_textfile(&path) {
                warn!(path = %path.display(), error = %e, "Failed to write metrics textfile");
            }
        }
    }))
}

fn finish_metrics(writer: Option<JoinHandle<()>>, path: Option<&Path>) {
    if let Some(writer) = writer {
        writer.abort();
    }
    if let Some(path) = path {
        if let Err(e) = metrics::write_textfile(path) {
            warn!(path = %path.display(), error = %e, "Failed to write metrics textfile");
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| anyhow::anyhow!("Failed to serialize JSON output: {}", e))?;
    println!("{}", json);
    Ok(())
}

// ============================================================================
// Daemon and worker
// ============================================================================

async fn run_daemon_command(
    mut config: SweepConfig,
    args: DaemonArgs,
    textfile: Option<PathBuf>,
) -> anyhow::Result<()> {
    if let Some(secs) = args.iteration_delay {
        config = config.with_iteration_delay(Duration::from_secs(secs));
    }
    if let Some(secs) = args.court_delay {
        config = config.with_court_delay(Duration::from_secs(secs));
    }
    if let Some(threshold) = args.stop_threshold {
        config = config.with_stop_threshold(threshold);
    }
    if args.throttle_min_items.is_some() {
        config.throttle_min_items = args.throttle_min_items;
    }
    config.validate()?;

    metrics::init_metrics()?;
    let parts = connect(&config).await?;
    let courts = court_registry(&config, &parts.database, &args.courts).await?;
    let store: Arc<dyn CaseStore> = parts.database.clone();

    let scheduler_config = config
        .scheduler_config()
        .with_iterations(args.iterations)
        .with_clear_cooldowns(args.clear_cooldowns);
    let mut scheduler = SweepScheduler::new(
        parts.coordinator.clone(),
        Arc::clone(&parts.queue),
        store,
        courts,
        scheduler_config,
    );

    let writer = spawn_metrics_writer(textfile.clone());
    let result = scheduler.run(shutdown_channel()).await;
    finish_metrics(writer, textfile.as_deref());
    let summary = result?;

    if args.json {
        return print_json(&summary);
    }
    println!(
        "Sweep finished after {} iterations: {} crawls queued, {} final advances, {} probes launched, {} errors",
        summary.iterations,
        summary.enqueued,
        summary.final_advanced,
        summary.probes_launched,
        summary.errors
    );
    if !summary.abandoned.is_empty() {
        println!("Dropped after empty probes: {}", summary.abandoned.join(", "));
    }
    Ok(())
}

async fn run_worker_command(
    mut config: SweepConfig,
    args: WorkerArgs,
    textfile: Option<PathBuf>,
) -> anyhow::Result<()> {
    if let Some(rate) = args.crawl_rate {
        config = config.with_crawl_rate(rate);
    }

    metrics::init_metrics()?;
    let parts = connect(&config).await?;
    let reports = report_client(&config)?;
    let store: Arc<dyn CaseStore> = parts.database.clone();

    let prober = Arc::new(FrontierProber::new(
        parts.coordinator.clone(),
        Arc::clone(&reports),
        Arc::clone(&store),
        config.probe_config(),
    ));
    let mut runner = JobRunner::new(
        parts.coordinator.clone(),
        reports,
        store,
        prober,
        config.crawl_rate,
    );
    if !args.no_backfill {
        let courts = court_registry(&config, &parts.database, &[]).await?;
        runner = runner.with_backfill(Arc::new(signal_backfill(&config, &parts, courts)));
    }

    let pool_config = WorkerPoolConfig::new(args.workers)
        .with_job_timeout(Duration::from_secs(args.job_timeout));
    let mut pool = WorkerPool::with_queue(pool_config, Arc::clone(&parts.queue), Arc::new(runner));

    let writer = spawn_metrics_writer(textfile.clone());
    pool.start().await?;
    info!(crawl_rate = %config.crawl_rate, "Workers running; press Ctrl-C to stop");

    let mut shutdown = shutdown_channel();
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }

    let result = pool.shutdown().await;
    finish_metrics(writer, textfile.as_deref());
    result?;

    let stats = pool.stats();
    println!(
        "Processed {} jobs ({} failed, {} deferred), {:.1}% success, {:?} per job",
        stats.processed(),
        stats.failed,
        stats.deferred,
        stats.success_rate(),
        stats.mean_job_time()
    );
    Ok(())
}

// ============================================================================
// Operator commands
// ============================================================================

async fn run_set_case_ids_command(config: SweepConfig, args: SetCaseIdsArgs) -> anyhow::Result<()> {
    let parts = connect(&config).await?;
    let courts = court_registry(&config, &parts.database, &args.courts).await?;

    let report = seed_watermarks(
        &parts.coordinator,
        parts.database.as_ref(),
        &courts.courts(),
        args.year,
    )
    .await?;

    if args.json {
        return print_json(&report);
    }
    for (court, id) in &report.seeded {
        println!("{court:<8} {id}");
    }
    for court in &report.cleared {
        println!("{court:<8} (no case in {}; cleared)", args.year);
    }
    Ok(())
}

async fn run_backfill_command(config: SweepConfig, args: BackfillArgs) -> anyhow::Result<()> {
    let parts = connect(&config).await?;
    let courts = court_registry(&config, &parts.database, &[]).await?;
    if !courts.contains(&args.court) {
        anyhow::bail!("{} is not a PACER court", args.court);
    }

    let backfill = signal_backfill(&config, &parts, courts);
    let outcome = backfill
        .schedule(&SweepTrigger::Fixed {
            court: args.court.clone(),
            target: args.target,
        })
        .await?;
    report_backfill(&args.court, &outcome)
}

async fn run_notify_command(config: SweepConfig, args: NotifyArgs) -> anyhow::Result<()> {
    let parts = connect(&config).await?;
    let courts = court_registry(&config, &parts.database, &[]).await?;

    let backfill = signal_backfill(&config, &parts, courts);
    let outcome = backfill
        .on_docket_saved(&DocketSaved::created(args.court.clone(), args.case_id))
        .await?;
    report_backfill(&args.court, &outcome)
}

fn report_backfill(court: &str, outcome: &BackfillOutcome) -> anyhow::Result<()> {
    match outcome {
        BackfillOutcome::Scheduled { first, last, count } => {
            println!("{court}: queued {count} crawls for {first}..={last}");
        }
        BackfillOutcome::Advanced { highest_known } => {
            println!("{court}: highest known is now {highest_known}, no gap to fill");
        }
        BackfillOutcome::NotHigher { highest_known } => {
            println!("{court}: nothing to do, highest known is {highest_known}");
        }
        BackfillOutcome::LockHeld => {
            anyhow::bail!("{court}: another backfill holds the lock, try again shortly");
        }
        BackfillOutcome::GapTooLarge { requested, max_gap } => {
            anyhow::bail!("{court}: gap of {requested} exceeds the maximum of {max_gap}");
        }
        BackfillOutcome::Skipped { reason } => {
            println!("{court}: skipped ({reason:?})");
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct CourtStatus {
    court: String,
    #[serde(flatten)]
    marks: Watermark,
    cooldown_ms: Option<u64>,
    probe_in_flight: bool,
}

#[derive(Debug, Serialize)]
struct StatusOutput {
    queue: QueueStats,
    courts: Vec<CourtStatus>,
}

async fn run_status_command(config: SweepConfig, args: StatusArgs) -> anyhow::Result<()> {
    let coordinator = Coordinator::connect(&config.redis_url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to Redis: {}", e))?;
    let queue = JobQueue::from_backend(coordinator.backend(), &config.queue_name);
    let marks = coordinator.watermarks();

    let mut court_names = if args.courts.is_empty() {
        marks.seeded_courts().await?
    } else {
        args.courts.clone()
    };
    court_names.sort();

    let courts = try_join_all(court_names.into_iter().map(|court| {
        let marks = marks.clone();
        let coordinator = coordinator.clone();
        async move {
            Ok::<_, CoordinationError>(CourtStatus {
                marks: marks.snapshot(&court).await?,
                cooldown_ms: coordinator
                    .cooldowns()
                    .remaining(&court)
                    .await?
                    .map(|d| d.as_millis() as u64),
                probe_in_flight: coordinator.locks().probe_in_flight(&court).await?,
                court,
            })
        }
    }))
    .await?;
    let output = StatusOutput {
        queue: queue.stats().await?,
        courts,
    };

    if args.json {
        return print_json(&output);
    }

    println!(
        "Queue {}: {} pending, {} scheduled, {} processing, {} dead",
        output.queue.queue_name,
        output.queue.pending_jobs,
        output.queue.scheduled_jobs,
        output.queue.processing_jobs,
        output.queue.dead_letter_jobs
    );
    println!(
        "{:<8} {:>10} {:>10} {:>10} {:>8} {:>6} {:>10} {:>6}",
        "court", "init", "final", "highest", "pending", "empty", "cooldown", "probe"
    );
    for status in &output.courts {
        let cooldown = status
            .cooldown_ms
            .map(|ms| format!("{:.1}s", ms as f64 / 1000.0))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<8} {:>10} {:>10} {:>10} {:>8} {:>6} {:>10} {:>6}",
            status.court,
            status.marks.init,
            status.marks.final_id,
            status.marks.highest_known,
            status.marks.pending(),
            status.marks.empty_probes,
            cooldown,
            if status.probe_in_flight { "yes" } else { "no" }
        );
    }
    Ok(())
}

async fn run_probe_command(config: SweepConfig, args: ProbeArgs) -> anyhow::Result<()> {
    let parts = connect(&config).await?;
    if !parts
        .coordinator
        .locks()
        .claim_probe(&args.court, config.probe_semaphore_ttl)
        .await?
    {
        anyhow::bail!("A probe is already in flight for {}", args.court);
    }

    let store: Arc<dyn CaseStore> = parts.database.clone();
    let prober = FrontierProber::new(
        parts.coordinator.clone(),
        report_client(&config)?,
        store,
        config.probe_config(),
    );
    let outcome = prober.probe(&args.court).await?;
    print_json(&outcome)
}

async fn run_migrate_command(config: SweepConfig) -> anyhow::Result<()> {
    let database = Database::connect(&config.database_url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to database: {}", e))?;
    let applied = database.run_migrations().await?;
    println!("Applied {} new migrations", applied);

    let runner = MigrationRunner::new(database.pool().clone());
    for migration in runner.list_applied_migrations().await? {
        println!("  {} (applied {})", migration.name, migration.applied_at.to_rfc3339());
    }
    Ok(())
}
