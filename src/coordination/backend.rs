//! Key-value backend used for all cross-process coordination.
//!
//! The trait exposes the small subset of Redis commands the sweep needs. It is
//! implemented by [`RedisBackend`] for production and by
//! [`MemoryBackend`](super::MemoryBackend) for tests and single-process runs.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info};

use crate::error::CoordinationError;

/// Async key-value operations with Redis semantics.
///
/// Missing keys read as `None`/`0`/empty, expirations are honoured on every
/// read, and every method is a single atomic step on the store.
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CoordinationError>;

    /// Sets a string value, replacing any previous value and expiry.
    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), CoordinationError>;

    /// Sets a value only if the key does not exist. Returns whether it was set.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, CoordinationError>;

    async fn exists(&self, key: &str) -> Result<bool, CoordinationError>;

    /// Deletes a key. Returns whether it existed.
    async fn del(&self, key: &str) -> Result<bool, CoordinationError>;

    /// Atomically adds `delta` to an integer value, creating it at 0.
    async fn incr(&self, key: &str, delta: i64) -> Result<i64, CoordinationError>;

    /// Sets a key's expiry. Returns false when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CoordinationError>;

    /// Remaining time to live. `None` when the key is missing or has no expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CoordinationError>;

    /// Deletes `key` only if it still holds `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str)
        -> Result<bool, CoordinationError>;

    async fn hget(&self, hash: &str, field: &str) -> Result<Option<String>, CoordinationError>;

    async fn hset(&self, hash: &str, field: &str, value: &str) -> Result<(), CoordinationError>;

    async fn hdel(&self, hash: &str, field: &str) -> Result<bool, CoordinationError>;

    async fn hincr(&self, hash: &str, field: &str, delta: i64) -> Result<i64, CoordinationError>;

    async fn hkeys(&self, hash: &str) -> Result<Vec<String>, CoordinationError>;

    /// Pushes to the head of a list. Returns the new length.
    async fn lpush(&self, list: &str, value: &str) -> Result<usize, CoordinationError>;

    /// Moves the tail of `src` to the head of `dst` and returns it.
    async fn rpoplpush(&self, src: &str, dst: &str) -> Result<Option<String>, CoordinationError>;

    /// Removes the first occurrence of `value`. Returns the number removed.
    async fn lrem(&self, list: &str, value: &str) -> Result<usize, CoordinationError>;

    async fn lrange_all(&self, list: &str) -> Result<Vec<String>, CoordinationError>;

    async fn llen(&self, list: &str) -> Result<usize, CoordinationError>;

    async fn zadd(&self, zset: &str, member: &str, score: i64) -> Result<(), CoordinationError>;

    async fn zrem(&self, zset: &str, member: &str) -> Result<bool, CoordinationError>;

    /// Members with a score at or below `max_score`, lowest first.
    async fn zrange_by_score(
        &self,
        zset: &str,
        max_score: i64,
        limit: usize,
    ) -> Result<Vec<String>, CoordinationError>;

    async fn zcard(&self, zset: &str) -> Result<usize, CoordinationError>;
}

/// Redis-backed implementation over a reconnecting connection manager.
#[derive(Clone)]
pub struct RedisBackend {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisBackend {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns `CoordinationError::Connection` if the URL is invalid or the
    /// server cannot be reached.
    pub async fn connect(redis_url: &str) -> Result<Self, CoordinationError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| CoordinationError::Connection(e.to_string()))?;

        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| CoordinationError::Connection(e.to_string()))?;

        info!(url = %redact_url(redis_url), "Connected to Redis coordination store");

        Ok(Self { client, conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl KeyValueBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, CoordinationError> {
        let mut conn = self.conn();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), CoordinationError> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CoordinationError> {
        let mut conn = self.conn();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool, CoordinationError> {
        let mut conn = self.conn();
        let count: i64 = conn.exists(key).await?;
        Ok(count > 0)
    }

    async fn del(&self, key: &str) -> Result<bool, CoordinationError> {
        let mut conn = self.conn();
        let count: i64 = conn.del(key).await?;
        Ok(count > 0)
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64, CoordinationError> {
        let mut conn = self.conn();
        let value: i64 = conn.incr(key, delta).await?;
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CoordinationError> {
        let mut conn = self.conn();
        let updated: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CoordinationError> {
        let mut conn = self.conn();
        let millis: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        // -2: missing key, -1: no expiry
        if millis < 0 {
            Ok(None)
        } else {
            Ok(Some(Duration::from_millis(millis as u64)))
        }
    }

    async fn compare_and_delete(
        &self,
        key: &str,
        expected: &str,
    ) -> Result<bool, CoordinationError> {
        // WATCH is connection-scoped, so it needs a connection nobody else
        // multiplexes commands onto.
        let mut conn = self.client.get_async_connection().await?;

        let _: () = redis::cmd("WATCH").arg(key).query_async(&mut conn).await?;
        let current: Option<String> = conn.get(key).await?;
        if current.as_deref() != Some(expected) {
            let _: () = redis::cmd("UNWATCH").query_async(&mut conn).await?;
            return Ok(false);
        }

        let result: Option<(i64,)> = redis::pipe()
            .atomic()
            .del(key)
            .query_async(&mut conn)
            .await?;

        match result {
            Some((deleted,)) => Ok(deleted > 0),
            None => {
                debug!(key, "Key changed while releasing lock");
                Ok(false)
            }
        }
    }

    async fn hget(&self, hash: &str, field: &str) -> Result<Option<String>, CoordinationError> {
        let mut conn = self.conn();
        let value: Option<String> = conn.hget(hash, field).await?;
        Ok(value)
    }

    async fn hset(&self, hash: &str, field: &str, value: &str) -> Result<(), CoordinationError> {
        let mut conn = self.conn();
        let _: i64 = conn.hset(hash, field, value).await?;
        Ok(())
    }

    async fn hdel(&self, hash: &str, field: &str) -> Result<bool, CoordinationError> {
        let mut conn = self.conn();
        let removed: i64 = conn.hdel(hash, field).await?;
        Ok(removed > 0)
    }

    async fn hincr(&self, hash: &str, field: &str, delta: i64) -> Result<i64, CoordinationError> {
        let mut conn = self.conn();
        let value: i64 = conn.hincr(hash, field, delta).await?;
        Ok(value)
    }

    async fn hkeys(&self, hash: &str) -> Result<Vec<String>, CoordinationError> {
        let mut conn = self.conn();
        let keys: Vec<String> = conn.hkeys(hash).await?;
        Ok(keys)
    }

    async fn lpush(&self, list: &str, value: &str) -> Result<usize, CoordinationError> {
        let mut conn = self.conn();
        let len: usize = conn.lpush(list, value).await?;
        Ok(len)
    }

    async fn rpoplpush(&self, src: &str, dst: &str) -> Result<Option<String>, CoordinationError> {
        let mut conn = self.conn();
        let value: Option<String> = redis::cmd("RPOPLPUSH")
            .arg(src)
            .arg(dst)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn lrem(&self, list: &str, value: &str) -> Result<usize, CoordinationError> {
        let mut conn = self.conn();
        let removed: usize = conn.lrem(list, 1, value).await?;
        Ok(removed)
    }

    async fn lrange_all(&self, list: &str) -> Result<Vec<String>, CoordinationError> {
        let mut conn = self.conn();
        let values: Vec<String> = conn.lrange(list, 0, -1).await?;
        Ok(values)
    }

    async fn llen(&self, list: &str) -> Result<usize, CoordinationError> {
        let mut conn = self.conn();
        let len: usize = conn.llen(list).await?;
        Ok(len)
    }

    async fn zadd(&self, zset: &str, member: &str, score: i64) -> Result<(), CoordinationError> {
        let mut conn = self.conn();
        let _: i64 = conn.zadd(zset, member, score).await?;
        Ok(())
    }

    async fn zrem(&self, zset: &str, member: &str) -> Result<bool, CoordinationError> {
        let mut conn = self.conn();
        let removed: i64 = conn.zrem(zset, member).await?;
        Ok(removed > 0)
    }

    async fn zrange_by_score(
        &self,
        zset: &str,
        max_score: i64,
        limit: usize,
    ) -> Result<Vec<String>, CoordinationError> {
        let mut conn = self.conn();
        let members: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(zset)
            .arg("-inf")
            .arg(max_score)
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    async fn zcard(&self, zset: &str) -> Result<usize, CoordinationError> {
        let mut conn = self.conn();
        let count: usize = conn.zcard(zset).await?;
        Ok(count)
    }
}

/// Expiry in whole milliseconds, never below one so a TTL always applies.
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// Strips credentials from a connection URL before it is logged.
pub fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}
