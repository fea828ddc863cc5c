//! Runtime configuration for the sweep daemon, workers and backfill hooks.
//!
//! Values come from defaults, then `IQUERY_*` environment variables, then
//! command-line overrides applied by the CLI layer through the builders.

use std::time::Duration;
use thiserror::Error;

use crate::backfill::BackfillConfig;
use crate::coordination::Rate;
use crate::probing::ProbeConfig;
use crate::sweep::SchedulerConfig;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration shared by every sweep process.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    // Connections
    /// Redis URL for the coordination store and the job queue.
    pub redis_url: String,
    /// PostgreSQL URL for the docket store.
    pub database_url: String,
    /// Name of the job queue crawl and probe jobs go to.
    pub queue_name: String,

    // Scheduler cadence
    /// Cooldown after a tick that made progress.
    pub short_wait: Duration,
    /// Cooldown after a tick that found the court caught up.
    pub long_wait: Duration,
    /// Pause between two courts in one pass.
    pub court_delay: Duration,
    /// Pause between two passes over all courts.
    pub iteration_delay: Duration,
    /// Pause after losing the coordination store connection.
    pub redis_backoff: Duration,
    /// How often the court list is re-read from the database.
    pub court_refresh_interval: Duration,
    /// Consecutive empty probes after which a court is abandoned (0 disables).
    pub stop_threshold: u32,
    /// Lower bound of the queue backlog kept by the scheduler. `None` means
    /// twice the number of courts.
    pub throttle_min_items: Option<usize>,
    /// How often a waiting scheduler re-reads the queue depth.
    pub throttle_poll_interval: Duration,

    // Probing
    /// Expiry of the "probe in flight" semaphore.
    pub probe_semaphore_ttl: Duration,
    /// Number of geometric offsets tried per probe.
    pub probe_iterations: u32,
    /// Consecutive missing IDs treated as the end of the sequence.
    pub probe_gap_tolerance: u32,
    /// Upper bound of the random offset added to each geometric probe.
    pub probe_jitter: i64,
    /// Pause between two report requests within one probe.
    pub probe_request_delay: Duration,
    /// Hard cap on report requests made by one probe.
    pub probe_max_requests: u32,

    // Reactive backfill
    /// Largest gap a single trigger may schedule.
    pub backfill_max_gap: i64,
    /// Spacing between the countdowns of consecutive gap-fill jobs.
    pub backfill_spacing: Duration,
    /// Expiry of the per-court update lock.
    pub backfill_lock_ttl: Duration,

    // Worker
    /// Per-court rate limit for crawl jobs.
    pub crawl_rate: Rate,
    /// Base URL template for the report endpoint. `{court}` is substituted.
    pub report_base_url: String,
    /// Session cookie sent with report requests.
    pub pacer_cookie: Option<String>,
    /// Timeout for one report request.
    pub report_timeout: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            database_url: "postgres://localhost/courtlistener".to_string(),
            queue_name: "iquery".to_string(),

            short_wait: Duration::from_secs(1),
            long_wait: Duration::from_secs(60),
            court_delay: Duration::ZERO,
            iteration_delay: Duration::from_secs(1),
            redis_backoff: Duration::from_secs(10),
            court_refresh_interval: Duration::from_secs(3600),
            stop_threshold: 0,
            throttle_min_items: None,
            throttle_poll_interval: Duration::from_secs(5),

            probe_semaphore_ttl: Duration::from_secs(600),
            probe_iterations: 9,
            probe_gap_tolerance: 3,
            probe_jitter: 3,
            probe_request_delay: Duration::from_secs(1),
            probe_max_requests: 64,

            backfill_max_gap: 600,
            backfill_spacing: Duration::from_secs(1),
            backfill_lock_ttl: Duration::from_secs(60),

            crawl_rate: Rate::new(1, Duration::from_secs(4)),
            report_base_url: "https://ecf.{court}.uscourts.gov".to_string(),
            pacer_cookie: None,
            report_timeout: Duration::from_secs(30),
        }
    }
}

impl SweepConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `REDIS_URL`: Redis connection URL (default: redis://localhost:6379)
    /// - `DATABASE_URL`: PostgreSQL connection URL
    /// - `IQUERY_QUEUE`: Job queue name (default: iquery)
    /// - `IQUERY_SHORT_WAIT_SECS`: Cooldown after progress (default: 1)
    /// - `IQUERY_LONG_WAIT_SECS`: Cooldown when caught up (default: 60)
    /// - `IQUERY_COURT_WAIT_SECS`: Pause between courts (default: 0)
    /// - `IQUERY_ITERATION_DELAY_SECS`: Pause between passes (default: 1)
    /// - `IQUERY_REDIS_BACKOFF_SECS`: Pause after a lost connection (default: 10)
    /// - `IQUERY_STOP_THRESHOLD`: Empty probes before abandoning a court (default: 0)
    /// - `IQUERY_THROTTLE_MIN_ITEMS`: Queue backlog lower bound (default: 2 x courts)
    /// - `IQUERY_PROBE_WAIT_SECS`: Probe semaphore expiry (default: 600)
    /// - `IQUERY_PROBE_ITERATIONS`: Geometric probe count (default: 9)
    /// - `IQUERY_PROBE_GAP_TOLERANCE`: Missing run treated as the end (default: 3)
    /// - `IQUERY_PROBE_MAX_REQUESTS`: Requests per probe (default: 64)
    /// - `IQUERY_BACKFILL_MAX_GAP`: Largest reactive backfill (default: 600)
    /// - `IQUERY_CRAWL_RATE`: Per-court crawl rate, e.g. `1/4s` (default: 1/4s)
    /// - `IQUERY_REPORT_BASE_URL`: Report endpoint template
    /// - `PACER_COOKIE`: Session cookie for report requests
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // Connections
        if let Ok(val) = std::env::var("REDIS_URL") {
            config.redis_url = val;
        }

        if let Ok(val) = std::env::var("DATABASE_URL") {
            config.database_url = val;
        }

        if let Ok(val) = std::env::var("IQUERY_QUEUE") {
            config.queue_name = val;
        }

        // Scheduler cadence
        if let Some(d) = env_secs("IQUERY_SHORT_WAIT_SECS")? {
            config.short_wait = d;
        }

        if let Some(d) = env_secs("IQUERY_LONG_WAIT_SECS")? {
            config.long_wait = d;
        }

        if let Some(d) = env_secs("IQUERY_COURT_WAIT_SECS")? {
            config.court_delay = d;
        }

        if let Some(d) = env_secs("IQUERY_ITERATION_DELAY_SECS")? {
            config.iteration_delay = d;
        }

        if let Some(d) = env_secs("IQUERY_REDIS_BACKOFF_SECS")? {
            config.redis_backoff = d;
        }

        if let Ok(val) = std::env::var("IQUERY_STOP_THRESHOLD") {
            config.stop_threshold = parse_env_value(&val, "IQUERY_STOP_THRESHOLD")?;
        }

        if let Ok(val) = std::env::var("IQUERY_THROTTLE_MIN_ITEMS") {
            config.throttle_min_items = Some(parse_env_value(&val, "IQUERY_THROTTLE_MIN_ITEMS")?);
        }

        // Probing
        if let Some(d) = env_secs("IQUERY_PROBE_WAIT_SECS")? {
            config.probe_semaphore_ttl = d;
        }

        if let Ok(val) = std::env::var("IQUERY_PROBE_ITERATIONS") {
            config.probe_iterations = parse_env_value(&val, "IQUERY_PROBE_ITERATIONS")?;
        }

        if let Ok(val) = std::env::var("IQUERY_PROBE_GAP_TOLERANCE") {
            config.probe_gap_tolerance = parse_env_value(&val, "IQUERY_PROBE_GAP_TOLERANCE")?;
        }

        if let Ok(val) = std::env::var("IQUERY_PROBE_MAX_REQUESTS") {
            config.probe_max_requests = parse_env_value(&val, "IQUERY_PROBE_MAX_REQUESTS")?;
        }

        // Reactive backfill
        if let Ok(val) = std::env::var("IQUERY_BACKFILL_MAX_GAP") {
            config.backfill_max_gap = parse_env_value(&val, "IQUERY_BACKFILL_MAX_GAP")?;
        }

        // Worker
        if let Ok(val) = std::env::var("IQUERY_CRAWL_RATE") {
            config.crawl_rate = parse_env_value(&val, "IQUERY_CRAWL_RATE")?;
        }

        if let Ok(val) = std::env::var("IQUERY_REPORT_BASE_URL") {
            config.report_base_url = val;
        }

        if let Ok(val) = std::env::var("PACER_COOKIE") {
            if !val.is_empty() {
                config.pacer_cookie = Some(val);
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url cannot be empty".to_string(),
            ));
        }

        if self.queue_name.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "queue_name cannot be empty".to_string(),
            ));
        }

        if self.short_wait.is_zero() || self.long_wait.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "short_wait and long_wait must be greater than 0".to_string(),
            ));
        }

        if self.short_wait > self.long_wait {
            return Err(ConfigError::ValidationFailed(
                "short_wait cannot exceed long_wait".to_string(),
            ));
        }

        if self.probe_semaphore_ttl.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "probe_semaphore_ttl must be greater than 0".to_string(),
            ));
        }

        if self.probe_iterations == 0 || self.probe_iterations > 40 {
            return Err(ConfigError::ValidationFailed(
                "probe_iterations must be between 1 and 40".to_string(),
            ));
        }

        if self.probe_gap_tolerance == 0 {
            return Err(ConfigError::ValidationFailed(
                "probe_gap_tolerance must be greater than 0".to_string(),
            ));
        }

        if self.probe_jitter < 0 {
            return Err(ConfigError::ValidationFailed(
                "probe_jitter cannot be negative".to_string(),
            ));
        }

        if self.probe_max_requests == 0 {
            return Err(ConfigError::ValidationFailed(
                "probe_max_requests must be greater than 0".to_string(),
            ));
        }

        if self.backfill_max_gap <= 0 {
            return Err(ConfigError::ValidationFailed(
                "backfill_max_gap must be greater than 0".to_string(),
            ));
        }

        if self.throttle_min_items == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "throttle_min_items must be greater than 0".to_string(),
            ));
        }

        if !self.report_base_url.contains("{court}") {
            return Err(ConfigError::ValidationFailed(
                "report_base_url must contain a {court} placeholder".to_string(),
            ));
        }

        Ok(())
    }

    /// Scheduler settings derived from this configuration.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            short_wait: self.short_wait,
            long_wait: self.long_wait,
            probe_semaphore_ttl: self.probe_semaphore_ttl,
            court_delay: self.court_delay,
            iteration_delay: self.iteration_delay,
            redis_backoff: self.redis_backoff,
            stop_threshold: self.stop_threshold,
            throttle_min_items: self.throttle_min_items,
            throttle_poll_interval: self.throttle_poll_interval,
            ..SchedulerConfig::default()
        }
    }

    /// Probe settings derived from this configuration.
    pub fn probe_config(&self) -> ProbeConfig {
        ProbeConfig {
            iterations: self.probe_iterations,
            gap_tolerance: self.probe_gap_tolerance,
            jitter: self.probe_jitter,
            request_delay: self.probe_request_delay,
            max_requests: self.probe_max_requests,
        }
    }

    /// Reactive backfill settings derived from this configuration.
    pub fn backfill_config(&self) -> BackfillConfig {
        BackfillConfig {
            max_gap: self.backfill_max_gap,
            spacing: self.backfill_spacing,
            lock_ttl: self.backfill_lock_ttl,
        }
    }

    /// Builder method to set the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Builder method to set the database URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    /// Builder method to set the queue name.
    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    /// Builder method to set both scheduler cooldowns.
    pub fn with_cooldowns(mut self, short_wait: Duration, long_wait: Duration) -> Self {
        self.short_wait = short_wait;
        self.long_wait = long_wait;
        self
    }

    /// Builder method to set the pause between courts.
    pub fn with_court_delay(mut self, delay: Duration) -> Self {
        self.court_delay = delay;
        self
    }

    /// Builder method to set the pause between passes.
    pub fn with_iteration_delay(mut self, delay: Duration) -> Self {
        self.iteration_delay = delay;
        self
    }

    /// Builder method to set the abandonment threshold.
    pub fn with_stop_threshold(mut self, threshold: u32) -> Self {
        self.stop_threshold = threshold;
        self
    }

    /// Builder method to set the crawl rate.
    pub fn with_crawl_rate(mut self, rate: Rate) -> Self {
        self.crawl_rate = rate;
        self
    }

    /// Builder method to set the probe request budget.
    pub fn with_probe_max_requests(mut self, max: u32) -> Self {
        self.probe_max_requests = max;
        self
    }

    /// Builder method to set the report endpoint template.
    pub fn with_report_base_url(mut self, url: impl Into<String>) -> Self {
        self.report_base_url = url.into();
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Read an environment variable holding whole seconds.
fn env_secs(key: &str) -> Result<Option<Duration>, ConfigError> {
    match std::env::var(key) {
        Ok(val) => {
            let secs: u64 = parse_env_value(&val, key)?;
            Ok(Some(Duration::from_secs(secs)))
        }
        Err(_) => Ok(None),
    }
}
