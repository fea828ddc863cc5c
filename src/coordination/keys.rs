//! Key names in the coordination store.
//!
//! These names are shared with every other process that reads the sweep
//! state, so they are fixed strings rather than configuration.

/// Per-court hash field: highest caselink ID already issued for crawling.
pub const INIT_HASH: &str = "pacer_case_id_init";

/// Per-court hash field: highest caselink ID believed to exist.
pub const FINAL_HASH: &str = "pacer_case_id_final";

/// Per-court hash field: largest ID recorded by the reactive backfill.
pub const HIGHEST_KNOWN_HASH: &str = "iquery:highest_known_pacer_case_id";

/// Per-court hash field: last ID the reactive backfill has scheduled.
pub const SWEEP_CURSOR_HASH: &str = "iquery:pacer_case_id_current";

/// Per-court hash field: consecutive probes that found nothing new.
pub const EMPTY_PROBES_HASH: &str = "iquery_empty_results";

/// Separator between a queue name and its priority step.
pub const PRIORITY_SEPARATOR: &str = "\x06\x16";

/// Priority steps a queue is split into, highest priority first.
pub const PRIORITY_STEPS: [u8; 4] = [0, 3, 6, 9];

/// Cooldown marker for a court.
pub fn cooldown(court: &str) -> String {
    format!("court_limiter:{court}")
}

/// Semaphore held while a frontier probe for `court` is in flight.
pub fn probe_semaphore(court: &str) -> String {
    format!("iquery:probe:{court}")
}

/// Lock serializing reactive backfill updates for `court`.
pub fn backfill_lock(court: &str) -> String {
    format!("iquery:update_pacer_case_id:{court}")
}

/// Lock serializing scheduler ticks for `court` across daemons.
pub fn tick_lock(court: &str) -> String {
    format!("iquery_sweep_tick:{court}")
}

/// Counter key for a rate-limited task, optionally narrowed by a sub-key.
pub fn throttle_counter(task: &str, sub_key: Option<&str>) -> String {
    match sub_key {
        Some(sub_key) => format!("celery_throttle:{task}:{sub_key}"),
        None => format!("celery_throttle:{task}"),
    }
}

/// Next-slot timestamp paired with a throttle counter.
pub fn throttle_schedule(counter_key: &str) -> String {
    format!("{counter_key}.schedule")
}

/// List holding `queue` jobs at the given priority step.
///
/// Step 0 is the bare queue name.
pub fn priority_queue(queue: &str, step: u8) -> String {
    if step == 0 {
        queue.to_string()
    } else {
        format!("{queue}{PRIORITY_SEPARATOR}{step}")
    }
}

/// List of jobs a worker has claimed but not finished.
pub fn processing_queue(queue: &str) -> String {
    format!("{queue}:processing")
}

/// Sorted set of delayed jobs, scored by due time in epoch milliseconds.
pub fn scheduled_queue(queue: &str) -> String {
    format!("{queue}:scheduled")
}

/// List of jobs that exhausted their attempts.
pub fn dead_letter_queue(queue: &str) -> String {
    format!("{queue}:dead_letter")
}
