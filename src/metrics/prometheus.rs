//! Prometheus metrics registration and export.
//!
//! All sweep metrics live in one registry behind `OnceLock`s. Recording
//! helpers are no-ops until [`init_metrics`] has run, so library code can
//! record unconditionally.

use std::path::Path;
use std::sync::OnceLock;

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};

/// Global Prometheus registry for all sweep metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Crawl tasks enqueued by the sweep scheduler, labeled by court.
pub static SWEEP_ENQUEUED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Scheduler ticks, labeled by court and outcome.
pub static SWEEP_TICKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Probe jobs launched by the scheduler, labeled by court.
pub static PROBES_LAUNCHED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Finished probes, labeled by court and result (found/empty).
pub static PROBES_COMPLETED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Report requests made while probing, labeled by court.
pub static PROBE_REQUESTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Crawl tasks scheduled by the reactive backfill, labeled by court.
pub static BACKFILL_SCHEDULED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Jobs deferred by the per-court task throttle, labeled by court.
pub static THROTTLE_DEFERRALS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Jobs processed by workers, labeled by kind and outcome.
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Job execution time in seconds, labeled by kind.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Coordination store failures, labeled by operation.
pub static COORDINATION_ERRORS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Pending jobs, labeled by queue name.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of active workers.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Creates every metric and registers it with the global registry.
///
/// Calling this more than once is harmless; later calls keep the metrics
/// from the first one.
///
/// # Errors
///
/// Returns a `prometheus::Error` if a metric definition is invalid.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let sweep_enqueued_total = CounterVec::new(
        Opts::new(
            "iquery_sweep_enqueued_total",
            "Crawl tasks enqueued by the sweep scheduler",
        ),
        &["court"],
    )?;

    let sweep_ticks_total = CounterVec::new(
        Opts::new("iquery_sweep_ticks_total", "Scheduler ticks by outcome"),
        &["court", "outcome"],
    )?;

    let probes_launched_total = CounterVec::new(
        Opts::new("iquery_probes_launched_total", "Probe jobs launched"),
        &["court"],
    )?;

    let probes_completed_total = CounterVec::new(
        Opts::new("iquery_probes_completed_total", "Finished probes by result"),
        &["court", "result"],
    )?;

    let probe_requests_total = CounterVec::new(
        Opts::new(
            "iquery_probe_requests_total",
            "Report requests made while probing",
        ),
        &["court"],
    )?;

    let backfill_scheduled_total = CounterVec::new(
        Opts::new(
            "iquery_backfill_scheduled_total",
            "Crawl tasks scheduled by reactive backfill",
        ),
        &["court"],
    )?;

    let throttle_deferrals_total = CounterVec::new(
        Opts::new(
            "iquery_throttle_deferrals_total",
            "Jobs deferred by the per-court task throttle",
        ),
        &["court"],
    )?;

    let jobs_total = CounterVec::new(
        Opts::new("iquery_jobs_total", "Jobs processed by workers"),
        &["kind", "outcome"],
    )?;

    let job_duration = HistogramVec::new(
        HistogramOpts::new("iquery_job_duration_seconds", "Job execution time in seconds")
            .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 15.0, 60.0, 300.0]),
        &["kind"],
    )?;

    let coordination_errors_total = CounterVec::new(
        Opts::new(
            "iquery_coordination_errors_total",
            "Coordination store failures",
        ),
        &["operation"],
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("iquery_queue_depth", "Pending jobs in queue"),
        &["queue_name"],
    )?;

    let active_workers = Gauge::new("iquery_active_workers", "Number of active workers")?;

    registry.register(Box::new(sweep_enqueued_total.clone()))?;
    registry.register(Box::new(sweep_ticks_total.clone()))?;
    registry.register(Box::new(probes_launched_total.clone()))?;
    registry.register(Box::new(probes_completed_total.clone()))?;
    registry.register(Box::new(probe_requests_total.clone()))?;
    registry.register(Box::new(backfill_scheduled_total.clone()))?;
    registry.register(Box::new(throttle_deferrals_total.clone()))?;
    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(coordination_errors_total.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // A second call loses these races and keeps the first set.
    let _ = REGISTRY.set(registry);
    let _ = SWEEP_ENQUEUED_TOTAL.set(sweep_enqueued_total);
    let _ = SWEEP_TICKS_TOTAL.set(sweep_ticks_total);
    let _ = PROBES_LAUNCHED_TOTAL.set(probes_launched_total);
    let _ = PROBES_COMPLETED_TOTAL.set(probes_completed_total);
    let _ = PROBE_REQUESTS_TOTAL.set(probe_requests_total);
    let _ = BACKFILL_SCHEDULED_TOTAL.set(backfill_scheduled_total);
    let _ = THROTTLE_DEFERRALS_TOTAL.set(throttle_deferrals_total);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = COORDINATION_ERRORS_TOTAL.set(coordination_errors_total);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Renders the registry in the Prometheus text format.
fn encode_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// Writes the current metrics to a node-exporter textfile.
///
/// The file is written next to its destination and renamed into place so the
/// collector never reads a partial file.
pub fn write_textfile(path: &Path) -> std::io::Result<()> {
    let tmp = path.with_extension("prom.tmp");
    std::fs::write(&tmp, encode_metrics())?;
    std::fs::rename(&tmp, path)
}

fn inc(metric: &OnceLock<CounterVec>, labels: &[&str]) {
    if let Some(counter) = metric.get() {
        counter.with_label_values(labels).inc();
    }
}

pub fn record_sweep_enqueue(court: &str) {
    inc(&SWEEP_ENQUEUED_TOTAL, &[court]);
}

pub fn record_tick(court: &str, outcome: &str) {
    inc(&SWEEP_TICKS_TOTAL, &[court, outcome]);
}

pub fn record_probe_launched(court: &str) {
    inc(&PROBES_LAUNCHED_TOTAL, &[court]);
}

pub fn record_probe(court: &str, found: bool) {
    let result = if found { "found" } else { "empty" };
    inc(&PROBES_COMPLETED_TOTAL, &[court, result]);
}

pub fn record_probe_request(court: &str) {
    inc(&PROBE_REQUESTS_TOTAL, &[court]);
}

pub fn record_backfill(court: &str, count: u64) {
    if let Some(counter) = BACKFILL_SCHEDULED_TOTAL.get() {
        counter.with_label_values(&[court]).inc_by(count as f64);
    }
}

pub fn record_throttle_deferral(court: &str) {
    inc(&THROTTLE_DEFERRALS_TOTAL, &[court]);
}

pub fn record_job(kind: &str, outcome: &str, duration_secs: f64) {
    inc(&JOBS_TOTAL, &[kind, outcome]);
    if let Some(histogram) = JOB_DURATION.get() {
        histogram.with_label_values(&[kind]).observe(duration_secs);
    }
    tracing::trace!(kind, outcome, duration_secs, "Recorded job metric");
}

pub fn record_coordination_error(operation: &str) {
    inc(&COORDINATION_ERRORS_TOTAL, &[operation]);
}

pub fn set_queue_depth(queue_name: &str, depth: usize) {
    if let Some(gauge) = QUEUE_DEPTH.get() {
        gauge.with_label_values(&[queue_name]).set(depth as f64);
    }
}

pub fn set_active_workers(count: usize) {
    if let Some(gauge) = ACTIVE_WORKERS.get() {
        gauge.set(count as f64);
    }
}
