//! Semaphores and owner-checked locks.
//!
//! A semaphore is a bare expiring marker: whoever creates it may proceed, and
//! it disappears on release or expiry. A lock additionally records a random
//! owner token so that only the holder can release it.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::backend::KeyValueBackend;
use super::keys;
use crate::error::CoordinationError;

/// Interval between acquisition attempts while waiting for a held lock.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Proof of ownership for an acquired lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    key: String,
    identifier: String,
}

impl LockToken {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }
}

/// Semaphore and lock operations over the coordination store.
#[derive(Clone)]
pub struct Locks {
    backend: Arc<dyn KeyValueBackend>,
}

impl Locks {
    pub fn new(backend: Arc<dyn KeyValueBackend>) -> Self {
        Self { backend }
    }

    /// Creates the semaphore `key` if it does not exist.
    ///
    /// Returns true when this caller created it. Existence check and creation
    /// are a single store command, so at most one concurrent caller wins.
    pub async fn create_semaphore(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<bool, CoordinationError> {
        let created = self.backend.set_nx(key, "1", ttl).await?;
        debug!(key, created, "Semaphore requested");
        Ok(created)
    }

    pub async fn release_semaphore(&self, key: &str) -> Result<(), CoordinationError> {
        self.backend.del(key).await?;
        Ok(())
    }

    /// Tries to take the lock `key` until `acquire_timeout` elapses.
    ///
    /// A zero timeout makes exactly one attempt. Returns `None` when the lock
    /// stayed held by someone else.
    pub async fn acquire_lock(
        &self,
        key: &str,
        ttl: Duration,
        acquire_timeout: Duration,
    ) -> Result<Option<LockToken>, CoordinationError> {
        let identifier = Uuid::new_v4().to_string();
        let deadline = Instant::now() + acquire_timeout;

        loop {
            if self.backend.set_nx(key, &identifier, ttl).await? {
                return Ok(Some(LockToken {
                    key: key.to_string(),
                    identifier,
                }));
            }
            if Instant::now() >= deadline {
                debug!(key, "Lock is held elsewhere");
                return Ok(None);
            }
            tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
        }
    }

    /// Releases a lock if the token still owns it.
    ///
    /// Returns false when the lock expired and was taken by someone else in
    /// the meantime; their lock is left untouched.
    pub async fn release_lock(&self, token: &LockToken) -> Result<bool, CoordinationError> {
        let released = self
            .backend
            .compare_and_delete(&token.key, &token.identifier)
            .await?;
        if !released {
            warn!(key = %token.key, "Lock expired before release");
        }
        Ok(released)
    }

    /// Claims the right to launch a frontier probe for `court`.
    pub async fn claim_probe(&self, court: &str, ttl: Duration) -> Result<bool, CoordinationError> {
        self.create_semaphore(&keys::probe_semaphore(court), ttl)
            .await
    }

    pub async fn release_probe(&self, court: &str) -> Result<(), CoordinationError> {
        self.release_semaphore(&keys::probe_semaphore(court)).await
    }

    pub async fn probe_in_flight(&self, court: &str) -> Result<bool, CoordinationError> {
        self.backend.exists(&keys::probe_semaphore(court)).await
    }

    /// Takes the reactive backfill lock for `court` without waiting.
    pub async fn lock_backfill(
        &self,
        court: &str,
        ttl: Duration,
    ) -> Result<Option<LockToken>, CoordinationError> {
        self.acquire_lock(&keys::backfill_lock(court), ttl, Duration::ZERO)
            .await
    }

    /// Takes the scheduler tick lock for `court` without waiting.
    pub async fn lock_tick(
        &self,
        court: &str,
        ttl: Duration,
    ) -> Result<Option<LockToken>, CoordinationError> {
        self.acquire_lock(&keys::tick_lock(court), ttl, Duration::ZERO)
            .await
    }
}
