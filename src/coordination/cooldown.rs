//! Per-court cooldown markers.

use std::sync::Arc;
use std::time::Duration;

use super::backend::KeyValueBackend;
use super::keys;
use crate::error::CoordinationError;

/// Expiring markers that make the scheduler skip a court until they lapse.
#[derive(Clone)]
pub struct Cooldowns {
    backend: Arc<dyn KeyValueBackend>,
}

impl Cooldowns {
    pub fn new(backend: Arc<dyn KeyValueBackend>) -> Self {
        Self { backend }
    }

    pub async fn is_cooling(&self, court: &str) -> Result<bool, CoordinationError> {
        self.backend.exists(&keys::cooldown(court)).await
    }

    /// Starts (or restarts) a cooldown for `court`.
    pub async fn start(&self, court: &str, ttl: Duration) -> Result<(), CoordinationError> {
        self.backend.set(&keys::cooldown(court), "1", Some(ttl)).await
    }

    pub async fn clear(&self, court: &str) -> Result<(), CoordinationError> {
        self.backend.del(&keys::cooldown(court)).await?;
        Ok(())
    }

    /// Time left on the cooldown, if any.
    pub async fn remaining(&self, court: &str) -> Result<Option<Duration>, CoordinationError> {
        self.backend.ttl(&keys::cooldown(court)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryBackend;

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_lapses() {
        let cooldowns = Cooldowns::new(Arc::new(MemoryBackend::new()));
        assert!(!cooldowns.is_cooling("nysd").await.unwrap());

        cooldowns.start("nysd", Duration::from_secs(60)).await.unwrap();
        assert!(cooldowns.is_cooling("nysd").await.unwrap());
        assert_eq!(
            cooldowns.remaining("nysd").await.unwrap(),
            Some(Duration::from_secs(60))
        );

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!cooldowns.is_cooling("nysd").await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_removes_cooldown() {
        let cooldowns = Cooldowns::new(Arc::new(MemoryBackend::new()));
        cooldowns.start("cand", Duration::from_secs(60)).await.unwrap();
        cooldowns.clear("cand").await.unwrap();
        assert!(!cooldowns.is_cooling("cand").await.unwrap());
    }
}
