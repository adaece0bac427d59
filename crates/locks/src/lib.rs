//! In-process and distributed locking primitives (spec §4.K).
//!
//! [`LockCache`] serializes per-alias projection within one process.
//! [`RedisLock`] coordinates across processes for the handful of
//! operations (dataset refresh, Google Drive sync) that must run on at
//! most one worker at a time cluster-wide.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use lru::LruCache;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::sleep;
use uuid::Uuid;

const DEFAULT_MAXSIZE: usize = 1000;

/// LRU-bounded map of `key -> Lock`, the in-process analogue of the
/// original `LockCache`. Evicts the least recently used key once the
/// capacity is exceeded so long-running processes never grow this map
/// unbounded across the full alias space they've ever projected.
pub struct LockCache {
    inner: StdMutex<LruCache<String, Arc<AsyncMutex<()>>>>,
}

impl LockCache {
    pub fn new(maxsize: usize) -> Self {
        let cap = NonZeroUsize::new(maxsize.max(1)).unwrap();
        Self { inner: StdMutex::new(LruCache::new(cap)) }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the lock for `key`, creating it on first use. Accessing a
    /// key promotes it to most-recently-used.
    pub fn get(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut cache = self.inner.lock().unwrap();
        if let Some(lock) = cache.get(key) {
            return lock.clone();
        }
        let lock = Arc::new(AsyncMutex::new(()));
        cache.put(key.to_string(), lock.clone());
        lock
    }
}

impl Default for LockCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAXSIZE)
    }
}

const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// `SET key token NX PX ttl` distributed lock with compare-and-del
/// release, so only the process holding the matching token can unlock
/// (spec §4.K invariant: a non-owner cannot release).
#[derive(Clone)]
pub struct RedisLock {
    conn: ConnectionManager,
}

/// Held while a distributed lock is acquired. Must be released with
/// [`LockGuard::release`]; dropping it without releasing leaves the key
/// to expire naturally via its TTL.
pub struct LockGuard {
    conn: ConnectionManager,
    key: String,
    token: String,
}

impl LockGuard {
    /// Releases the lock if this guard still holds it. Returns `false`
    /// (not an error) if the TTL already expired and somebody else has
    /// since acquired the key.
    pub async fn release(mut self) -> Result<bool, LockError> {
        let script = redis::Script::new(RELEASE_SCRIPT);
        let released: i64 = script
            .key(&self.key)
            .arg(&self.token)
            .invoke_async(&mut self.conn)
            .await?;
        Ok(released == 1)
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl RedisLock {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Attempts to acquire `key` once, non-blocking. Returns `None` if
    /// already held by someone else.
    pub async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockGuard>, LockError> {
        let token = Uuid::new_v4().to_string();
        let mut conn = self.conn.clone();
        let acquired: bool = conn
            .set_options(
                key,
                token.clone(),
                redis::SetOptions::default()
                    .with_expiration(redis::SetExpiry::PX(ttl.as_millis() as u64))
                    .conditional_set(redis::ExistenceCheck::NX),
            )
            .await?;
        if acquired {
            Ok(Some(LockGuard { conn: self.conn.clone(), key: key.to_string(), token }))
        } else {
            Ok(None)
        }
    }

    /// Spins on [`try_acquire`] until `wait_timeout` elapses. Used by the
    /// Google Drive sync path, which waits briefly rather than failing
    /// outright when another worker is mid-sync (spec §4.H).
    pub async fn acquire_with_timeout(
        &self,
        key: &str,
        ttl: Duration,
        wait_timeout: Duration,
    ) -> Result<Option<LockGuard>, LockError> {
        let deadline = tokio::time::Instant::now() + wait_timeout;
        loop {
            if let Some(guard) = self.try_acquire(key, ttl).await? {
                return Ok(Some(guard));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(Duration::from_millis(100)).await;
        }
    }

    /// Acquires `key`, runs `f`, releases on the way out — the context-manager
    /// shape of the original `redis_try_lock`. Returns `None` without
    /// running `f` when the lock could not be acquired in time.
    pub async fn with_lock<F, Fut, T>(
        &self,
        key: &str,
        ttl: Duration,
        wait_timeout: Duration,
        f: F,
    ) -> Result<Option<T>, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        match self.acquire_with_timeout(key, ttl, wait_timeout).await? {
            Some(guard) => {
                let result = f().await;
                guard.release().await?;
                Ok(Some(result))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_cache_reuses_same_lock_for_same_key() {
        let cache = LockCache::new(4);
        let a = cache.get("alias-1");
        let b = cache.get("alias-1");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn lock_cache_evicts_least_recently_used() {
        let cache = LockCache::new(2);
        let first = cache.get("a");
        cache.get("b");
        cache.get("c"); // evicts "a", the least recently touched
        let first_again = cache.get("a");
        assert!(!Arc::ptr_eq(&first, &first_again));
    }

    #[tokio::test]
    async fn lock_cache_serializes_concurrent_access() {
        let cache = Arc::new(LockCache::new(16));
        let lock = cache.get("alias-1");
        let _guard = lock.lock().await;
        assert!(lock.try_lock().is_err());
    }
}
