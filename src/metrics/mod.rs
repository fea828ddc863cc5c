//! Prometheus metrics for the sweep, probe and backfill paths.
//!
//! # Example
//!
//! ```ignore
//! use std::path::Path;
//!
//! use iquery_sweep::metrics::{init_metrics, record_sweep_enqueue, write_textfile};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! record_sweep_enqueue("nysd");
//! write_textfile(Path::new("/var/lib/node_exporter/iquery.prom"))?;
//! ```

pub mod prometheus;

pub use prometheus::{
    init_metrics, record_backfill, record_coordination_error, record_job,
    record_probe, record_probe_launched, record_probe_request, record_sweep_enqueue,
    record_throttle_deferral, record_tick, set_active_workers, set_queue_depth, write_textfile,
};

pub use prometheus::{
    ACTIVE_WORKERS, BACKFILL_SCHEDULED_TOTAL, COORDINATION_ERRORS_TOTAL, JOBS_TOTAL,
    JOB_DURATION, PROBES_COMPLETED_TOTAL, PROBES_LAUNCHED_TOTAL, PROBE_REQUESTS_TOTAL,
    QUEUE_DEPTH, REGISTRY, SWEEP_ENQUEUED_TOTAL, SWEEP_TICKS_TOTAL, THROTTLE_DEFERRALS_TOTAL,
};
