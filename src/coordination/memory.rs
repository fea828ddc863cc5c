//! In-process coordination backend.
//!
//! Mirrors the Redis semantics the sweep relies on, including key expiry,
//! so schedulers and workers can be exercised without a server. Expiry is
//! measured on the tokio clock, which lets tests drive TTLs with
//! `tokio::time::pause` and `advance`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::backend::KeyValueBackend;
use crate::error::CoordinationError;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    List(VecDeque<String>),
    // member -> score
    ZSet(BTreeMap<String, i64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Coordination backend held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, Entry>>,
    failures_pending: AtomicUsize,
    // Commands that still succeed before pending failures kick in.
    failures_after: AtomicUsize,
    commands: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` commands fail with a connection error.
    pub fn inject_connection_failures(&self, count: usize) {
        self.inject_connection_failures_after(0, count);
    }

    /// Lets `skip` more commands through, then fails the following `count`.
    pub fn inject_connection_failures_after(&self, skip: usize, count: usize) {
        self.failures_after.store(skip, Ordering::SeqCst);
        self.failures_pending.store(count, Ordering::SeqCst);
    }

    /// Number of commands served so far, including failed ones.
    pub fn command_count(&self) -> usize {
        self.commands.load(Ordering::SeqCst)
    }

    /// Number of live keys.
    pub fn key_count(&self) -> usize {
        let now = Instant::now();
        self.lock().values().filter(|e| !e.is_expired(now)).count()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Locks the map after applying pending failure injection and purging
    /// every expired key.
    fn begin(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>, CoordinationError> {
        self.commands.fetch_add(1, Ordering::SeqCst);
        let skipped = self
            .failures_after
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let injected = !skipped
            && self
                .failures_pending
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if injected {
            return Err(CoordinationError::Connection(
                "injected connection failure".to_string(),
            ));
        }

        let mut entries = self.lock();
        let now = Instant::now();
        entries.retain(|_, entry| !entry.is_expired(now));
        Ok(entries)
    }
}

fn wrong_type(key: &str) -> CoordinationError {
    CoordinationError::WrongType(key.to_string())
}

fn parse_int(key: &str, raw: &str) -> Result<i64, CoordinationError> {
    raw.parse().map_err(|_| CoordinationError::InvalidValue {
        key: key.to_string(),
        value: raw.to_string(),
    })
}

fn hash_mut<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
) -> Result<&'a mut HashMap<String, String>, CoordinationError> {
    let entry = entries
        .entry(key.to_string())
        .or_insert_with(|| Entry::new(Value::Hash(HashMap::new())));
    match &mut entry.value {
        Value::Hash(h) => Ok(h),
        _ => Err(wrong_type(key)),
    }
}

fn list_mut<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
) -> Result<&'a mut VecDeque<String>, CoordinationError> {
    let entry = entries
        .entry(key.to_string())
        .or_insert_with(|| Entry::new(Value::List(VecDeque::new())));
    match &mut entry.value {
        Value::List(l) => Ok(l),
        _ => Err(wrong_type(key)),
    }
}

fn prune_empty(entries: &mut HashMap<String, Entry>, key: &str) {
    let empty = match entries.get(key).map(|e| &e.value) {
        Some(Value::Hash(h)) => h.is_empty(),
        Some(Value::List(l)) => l.is_empty(),
        Some(Value::ZSet(z)) => z.is_empty(),
        _ => false,
    };
    if empty {
        entries.remove(key);
    }
}

#[async_trait]
impl KeyValueBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, CoordinationError> {
        let entries = self.begin()?;
        match entries.get(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), CoordinationError> {
        let mut entries = self.begin()?;
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CoordinationError> {
        let mut entries = self.begin()?;
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn exists(&self, key: &str) -> Result<bool, CoordinationError> {
        let entries = self.begin()?;
        Ok(entries.contains_key(key))
    }

    async fn del(&self, key: &str) -> Result<bool, CoordinationError> {
        let mut entries = self.begin()?;
        Ok(entries.remove(key).is_some())
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64, CoordinationError> {
        let mut entries = self.begin()?;
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Str("0".to_string())));
        match &mut entry.value {
            Value::Str(s) => {
                let next = parse_int(key, s)? + delta;
                *s = next.to_string();
                Ok(next)
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CoordinationError> {
        let mut entries = self.begin()?;
        match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CoordinationError> {
        let entries = self.begin()?;
        let now = Instant::now();
        Ok(entries
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn compare_and_delete(
        &self,
        key: &str,
        expected: &str,
    ) -> Result<bool, CoordinationError> {
        let mut entries = self.begin()?;
        let matches = matches!(
            entries.get(key).map(|e| &e.value),
            Some(Value::Str(s)) if s == expected
        );
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn hget(&self, hash: &str, field: &str) -> Result<Option<String>, CoordinationError> {
        let entries = self.begin()?;
        match entries.get(hash).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Hash(h)) => Ok(h.get(field).cloned()),
            Some(_) => Err(wrong_type(hash)),
        }
    }

    async fn hset(&self, hash: &str, field: &str, value: &str) -> Result<(), CoordinationError> {
        let mut entries = self.begin()?;
        hash_mut(&mut entries, hash)?.insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hdel(&self, hash: &str, field: &str) -> Result<bool, CoordinationError> {
        let mut entries = self.begin()?;
        let removed = match entries.get_mut(hash).map(|e| &mut e.value) {
            None => false,
            Some(Value::Hash(h)) => h.remove(field).is_some(),
            Some(_) => return Err(wrong_type(hash)),
        };
        prune_empty(&mut entries, hash);
        Ok(removed)
    }

    async fn hincr(&self, hash: &str, field: &str, delta: i64) -> Result<i64, CoordinationError> {
        let mut entries = self.begin()?;
        let fields = hash_mut(&mut entries, hash)?;
        let current = match fields.get(field) {
            Some(raw) => parse_int(hash, raw)?,
            None => 0,
        };
        let next = current + delta;
        fields.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn hkeys(&self, hash: &str) -> Result<Vec<String>, CoordinationError> {
        let entries = self.begin()?;
        match entries.get(hash).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::Hash(h)) => {
                let mut keys: Vec<String> = h.keys().cloned().collect();
                keys.sort();
                Ok(keys)
            }
            Some(_) => Err(wrong_type(hash)),
        }
    }

    async fn lpush(&self, list: &str, value: &str) -> Result<usize, CoordinationError> {
        let mut entries = self.begin()?;
        let items = list_mut(&mut entries, list)?;
        items.push_front(value.to_string());
        Ok(items.len())
    }

    async fn rpoplpush(&self, src: &str, dst: &str) -> Result<Option<String>, CoordinationError> {
        let mut entries = self.begin()?;
        let popped = match entries.get_mut(src).map(|e| &mut e.value) {
            None => return Ok(None),
            Some(Value::List(items)) => items.pop_back(),
            Some(_) => return Err(wrong_type(src)),
        };
        prune_empty(&mut entries, src);
        if let Some(value) = &popped {
            list_mut(&mut entries, dst)?.push_front(value.clone());
        }
        Ok(popped)
    }

    async fn lrem(&self, list: &str, value: &str) -> Result<usize, CoordinationError> {
        let mut entries = self.begin()?;
        let removed = match entries.get_mut(list).map(|e| &mut e.value) {
            None => 0,
            Some(Value::List(items)) => match items.iter().position(|v| v == value) {
                Some(idx) => {
                    items.remove(idx);
                    1
                }
                None => 0,
            },
            Some(_) => return Err(wrong_type(list)),
        };
        prune_empty(&mut entries, list);
        Ok(removed)
    }

    async fn lrange_all(&self, list: &str) -> Result<Vec<String>, CoordinationError> {
        let entries = self.begin()?;
        match entries.get(list).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::List(items)) => Ok(items.iter().cloned().collect()),
            Some(_) => Err(wrong_type(list)),
        }
    }

    async fn llen(&self, list: &str) -> Result<usize, CoordinationError> {
        let entries = self.begin()?;
        match entries.get(list).map(|e| &e.value) {
            None => Ok(0),
            Some(Value::List(items)) => Ok(items.len()),
            Some(_) => Err(wrong_type(list)),
        }
    }

    async fn zadd(&self, zset: &str, member: &str, score: i64) -> Result<(), CoordinationError> {
        let mut entries = self.begin()?;
        let entry = entries
            .entry(zset.to_string())
            .or_insert_with(|| Entry::new(Value::ZSet(BTreeMap::new())));
        match &mut entry.value {
            Value::ZSet(members) => {
                members.insert(member.to_string(), score);
                Ok(())
            }
            _ => Err(wrong_type(zset)),
        }
    }

    async fn zrem(&self, zset: &str, member: &str) -> Result<bool, CoordinationError> {
        let mut entries = self.begin()?;
        let removed = match entries.get_mut(zset).map(|e| &mut e.value) {
            None => false,
            Some(Value::ZSet(members)) => members.remove(member).is_some(),
            Some(_) => return Err(wrong_type(zset)),
        };
        prune_empty(&mut entries, zset);
        Ok(removed)
    }

    async fn zrange_by_score(
        &self,
        zset: &str,
        max_score: i64,
        limit: usize,
    ) -> Result<Vec<String>, CoordinationError> {
        let entries = self.begin()?;
        match entries.get(zset).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::ZSet(members)) => {
                let mut due: Vec<(&String, i64)> = members
                    .iter()
                    .filter(|(_, score)| **score <= max_score)
                    .map(|(m, s)| (m, *s))
                    .collect();
                due.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));
                Ok(due
                    .into_iter()
                    .take(limit)
                    .map(|(m, _)| m.clone())
                    .collect())
            }
            Some(_) => Err(wrong_type(zset)),
        }
    }

    async fn zcard(&self, zset: &str) -> Result<usize, CoordinationError> {
        let entries = self.begin()?;
        match entries.get(zset).map(|e| &e.value) {
            None => Ok(0),
            Some(Value::ZSet(members)) => Ok(members.len()),
            Some(_) => Err(wrong_type(zset)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_set_nx_respects_expiry() {
        let backend = MemoryBackend::new();
        assert!(backend
            .set_nx("iquery:probe:nysd", "1", Duration::from_secs(600))
            .await
            .unwrap());
        assert!(!backend
            .set_nx("iquery:probe:nysd", "1", Duration::from_secs(600))
            .await
            .unwrap());

        tokio::time::advance(Duration::from_secs(601)).await;
        assert!(!backend.exists("iquery:probe:nysd").await.unwrap());
        assert!(backend
            .set_nx("iquery:probe:nysd", "1", Duration::from_secs(600))
            .await
            .unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_reports_remaining_time() {
        let backend = MemoryBackend::new();
        backend
            .set("court_limiter:cand", "1", Some(Duration::from_secs(60)))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(15)).await;

        let ttl = backend.ttl("court_limiter:cand").await.unwrap().unwrap();
        assert_eq!(ttl, Duration::from_secs(45));

        backend.set("no_expiry", "1", None).await.unwrap();
        assert!(backend.ttl("no_expiry").await.unwrap().is_none());
        assert!(backend.ttl("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_incr_and_hincr() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.incr("counter", 1).await.unwrap(), 1);
        assert_eq!(backend.incr("counter", 4).await.unwrap(), 5);
        assert_eq!(backend.incr("counter", -2).await.unwrap(), 3);

        assert_eq!(backend.hincr("pacer_case_id_init", "nysd", 1).await.unwrap(), 1);
        assert_eq!(backend.hincr("pacer_case_id_init", "nysd", 9).await.unwrap(), 10);
        assert_eq!(
            backend.hget("pacer_case_id_init", "nysd").await.unwrap(),
            Some("10".to_string())
        );
    }

    #[tokio::test]
    async fn test_wrong_type_is_reported() {
        let backend = MemoryBackend::new();
        backend.hset("hash", "field", "1").await.unwrap();
        let err = backend.get("hash").await.unwrap_err();
        assert!(matches!(err, CoordinationError::WrongType(_)));

        backend.set("text", "abc", None).await.unwrap();
        assert!(matches!(
            backend.incr("text", 1).await.unwrap_err(),
            CoordinationError::InvalidValue { .. }
        ));
    }

    #[tokio::test]
    async fn test_compare_and_delete() {
        let backend = MemoryBackend::new();
        backend.set("lock", "token-a", None).await.unwrap();

        assert!(!backend.compare_and_delete("lock", "token-b").await.unwrap());
        assert!(backend.exists("lock").await.unwrap());
        assert!(backend.compare_and_delete("lock", "token-a").await.unwrap());
        assert!(!backend.exists("lock").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_operations() {
        let backend = MemoryBackend::new();
        backend.lpush("queue", "a").await.unwrap();
        backend.lpush("queue", "b").await.unwrap();
        assert_eq!(backend.llen("queue").await.unwrap(), 2);

        // Tail first, so FIFO order for lpush producers.
        let moved = backend.rpoplpush("queue", "processing").await.unwrap();
        assert_eq!(moved.as_deref(), Some("a"));
        assert_eq!(backend.lrange_all("processing").await.unwrap(), vec!["a"]);

        assert_eq!(backend.lrem("processing", "a").await.unwrap(), 1);
        assert_eq!(backend.llen("processing").await.unwrap(), 0);
        assert_eq!(backend.key_count(), 1);
    }

    #[tokio::test]
    async fn test_zset_due_members() {
        let backend = MemoryBackend::new();
        backend.zadd("scheduled", "late", 300).await.unwrap();
        backend.zadd("scheduled", "early", 100).await.unwrap();
        backend.zadd("scheduled", "middle", 200).await.unwrap();

        let due = backend.zrange_by_score("scheduled", 250, 10).await.unwrap();
        assert_eq!(due, vec!["early", "middle"]);

        let due = backend.zrange_by_score("scheduled", 250, 1).await.unwrap();
        assert_eq!(due, vec!["early"]);

        assert!(backend.zrem("scheduled", "early").await.unwrap());
        assert_eq!(backend.zcard("scheduled").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let backend = MemoryBackend::new();
        backend.inject_connection_failures(2);

        assert!(backend.get("key").await.unwrap_err().is_connection());
        assert!(backend.get("key").await.unwrap_err().is_connection());
        assert!(backend.get("key").await.unwrap().is_none());
        assert_eq!(backend.command_count(), 3);
    }

    #[tokio::test]
    async fn test_injected_failures_after_skip() {
        let backend = MemoryBackend::new();
        backend.inject_connection_failures_after(1, 1);

        assert!(backend.set("key", "v", None).await.is_ok());
        assert!(backend.get("key").await.unwrap_err().is_connection());
        assert_eq!(backend.get("key").await.unwrap().as_deref(), Some("v"));
    }
}
