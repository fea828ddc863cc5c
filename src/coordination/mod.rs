//! Shared coordination state for the sweep.
//!
//! Schedulers, workers and backfill hooks run in separate processes and only
//! meet in the key-value store. [`Coordinator`] is the single entry point to
//! that state; callers use its typed views rather than raw keys.
//!
//! - [`WatermarkStore`]: per-court `init`/`final`/`highest_known` marks
//! - [`Locks`]: probe semaphores and owner-checked locks
//! - [`Cooldowns`]: per-court scheduler cooldowns
//! - [`TaskThrottle`]: per-task distributed rate limiting

pub mod backend;
pub mod cooldown;
pub mod keys;
pub mod locks;
pub mod memory;
pub mod retry;
pub mod throttle;
pub mod watermark;

use std::sync::Arc;

pub use backend::{redact_url, KeyValueBackend, RedisBackend};
pub use cooldown::Cooldowns;
pub use locks::{LockToken, Locks};
pub use memory::MemoryBackend;
pub use retry::{RetryPolicy, Transient};
pub use throttle::{ParseRateError, Rate, TaskThrottle};
pub use watermark::{Mark, Watermark, WatermarkStore};

use crate::error::CoordinationError;

/// Handle to the coordination store.
#[derive(Clone)]
pub struct Coordinator {
    backend: Arc<dyn KeyValueBackend>,
    retry: RetryPolicy,
}

impl Coordinator {
    pub fn new(backend: Arc<dyn KeyValueBackend>) -> Self {
        Self {
            backend,
            retry: RetryPolicy::default(),
        }
    }

    /// Connects to Redis at `redis_url`.
    pub async fn connect(redis_url: &str) -> Result<Self, CoordinationError> {
        let backend = RedisBackend::connect(redis_url).await?;
        Ok(Self::new(Arc::new(backend)))
    }

    /// Coordinator over a fresh in-memory store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn backend(&self) -> Arc<dyn KeyValueBackend> {
        Arc::clone(&self.backend)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn watermarks(&self) -> WatermarkStore {
        WatermarkStore::new(self.backend())
    }

    pub fn locks(&self) -> Locks {
        Locks::new(self.backend())
    }

    pub fn cooldowns(&self) -> Cooldowns {
        Cooldowns::new(self.backend())
    }

    pub fn task_throttle(&self) -> TaskThrottle {
        TaskThrottle::new(self.backend(), self.retry)
    }
}
