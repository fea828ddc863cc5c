//! The set of courts the sweep runs over.
//!
//! Courts are loaded from the case store and can be re-listed while the
//! daemon runs, so a newly added court is picked up without a restart.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::storage::{CourtSource, DatabaseError};

#[derive(Debug, Default)]
struct RegistryState {
    courts: Vec<String>,
    refreshed_at: Option<Instant>,
}

/// Cached court list with explicit refresh.
pub struct CourtRegistry {
    source: Arc<dyn CourtSource>,
    // Operator-selected subset; `None` means every PACER court.
    only: Option<BTreeSet<String>>,
    refresh_interval: Duration,
    state: RwLock<RegistryState>,
}

impl CourtRegistry {
    pub fn new(source: Arc<dyn CourtSource>, refresh_interval: Duration) -> Self {
        Self {
            source,
            only: None,
            refresh_interval,
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// Restricts the registry to `courts`. Names the source does not list
    /// are dropped at refresh time.
    pub fn restrict_to<I, S>(mut self, courts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.only = Some(courts.into_iter().map(Into::into).collect());
        self
    }

    /// Re-lists courts from the source. Returns the number of courts now
    /// in the registry. On failure the previous list is kept.
    pub async fn refresh_courts(&self) -> Result<usize, DatabaseError> {
        let listed = self.source.list_pacer_courts().await?;
        let mut courts: Vec<String> = match &self.only {
            Some(only) => {
                for unknown in only.iter().filter(|c| !listed.contains(c)) {
                    warn!(court = %unknown, "Requested court is not a PACER court; skipping");
                }
                listed.into_iter().filter(|c| only.contains(c)).collect()
            }
            None => listed,
        };
        courts.sort();
        courts.dedup();

        let mut state = self.write();
        let added = courts.iter().filter(|c| !state.courts.contains(c)).count();
        let removed = state.courts.iter().filter(|c| !courts.contains(c)).count();
        if added > 0 || removed > 0 {
            info!(total = courts.len(), added, removed, "Court list changed");
        }
        state.courts = courts;
        state.refreshed_at = Some(Instant::now());
        Ok(state.courts.len())
    }

    /// Refreshes if the list was never loaded or is older than the refresh
    /// interval. Returns whether a refresh happened.
    pub async fn refresh_if_stale(&self) -> Result<bool, DatabaseError> {
        let stale = match self.read().refreshed_at {
            Some(at) => at.elapsed() >= self.refresh_interval,
            None => true,
        };
        if stale {
            self.refresh_courts().await?;
        }
        Ok(stale)
    }

    pub fn courts(&self) -> Vec<String> {
        self.read().courts.clone()
    }

    pub fn contains(&self, court: &str) -> bool {
        self.read().courts.iter().any(|c| c == court)
    }

    pub fn len(&self) -> usize {
        self.read().courts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().courts.is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryCaseStore;

    #[tokio::test]
    async fn test_refresh_picks_up_new_courts() {
        let store = Arc::new(MemoryCaseStore::with_courts(["nysd", "cand"]));
        let registry = CourtRegistry::new(store.clone(), Duration::from_secs(3600));
        assert!(registry.is_empty());

        assert_eq!(registry.refresh_courts().await.unwrap(), 2);
        assert_eq!(registry.courts(), vec!["cand", "nysd"]);

        store.add_court("txnb");
        store.remove_court("cand");
        registry.refresh_courts().await.unwrap();
        assert_eq!(registry.courts(), vec!["nysd", "txnb"]);
        assert!(registry.contains("txnb"));
        assert!(!registry.contains("cand"));
    }

    #[tokio::test]
    async fn test_restrict_to_subset() {
        let store = Arc::new(MemoryCaseStore::with_courts(["nysd", "cand", "txnb"]));
        let registry = CourtRegistry::new(store, Duration::from_secs(3600))
            .restrict_to(["nysd", "txnb", "zzzz"]);

        registry.refresh_courts().await.unwrap();
        assert_eq!(registry.courts(), vec!["nysd", "txnb"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_if_stale() {
        let store = Arc::new(MemoryCaseStore::with_courts(["nysd"]));
        let registry = CourtRegistry::new(store.clone(), Duration::from_secs(60));

        assert!(registry.refresh_if_stale().await.unwrap());
        assert!(!registry.refresh_if_stale().await.unwrap());

        store.add_court("cand");
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(registry.refresh_if_stale().await.unwrap());
        assert_eq!(registry.len(), 2);
    }
}
