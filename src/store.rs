//! Counter store backing the rate limiter.
//!
//! The limiter only needs a handful of primitives: read an integer counter,
//! atomically increment one (setting its expiry on first increment), delete
//! keys by pattern, and ping. Anything providing those semantics works; the
//! gateway binary wires [`RedisStore`], tests use [`MemoryStore`].
//!
//! Store failures are surfaced as [`StoreError`] and never reach clients:
//! the limiter fails open on any of them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Redis(#[from] redis::RedisError),
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Current value of the counter, `None` when the key does not exist.
    async fn get_count(&self, key: &str) -> Result<Option<i64>, StoreError>;

    /// Increment the counter and set its expiry if this was the first
    /// increment. Returns the post-increment value.
    async fn incr_with_expiry(&self, key: &str, ttl_secs: i64) -> Result<i64, StoreError>;

    /// Delete every key matching the glob pattern; returns how many went.
    async fn delete_pattern(&self, pattern: &str) -> Result<u64, StoreError>;

    /// Liveness check, used by the readiness probe.
    async fn ping(&self) -> Result<(), StoreError>;
}

// ============================================================================
// Redis implementation
// ============================================================================

/// Redis-backed counter store on a shared `ConnectionManager`.
///
/// The manager is created lazily so the gateway can start while Redis is
/// down; every operation until then reports `Unavailable` and the limiter
/// fails open.
pub struct RedisStore {
    client: redis::Client,
    conn: tokio::sync::RwLock<Option<ConnectionManager>>,
}

impl RedisStore {
    pub fn new(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            conn: tokio::sync::RwLock::new(None),
        })
    }

    async fn manager(&self) -> Result<ConnectionManager, StoreError> {
        if let Some(conn) = self.conn.read().await.as_ref() {
            return Ok(conn.clone());
        }
        let mut guard = self.conn.write().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let manager = ConnectionManager::new(self.client.clone()).await?;
        tracing::info!("connected to counter store");
        *guard = Some(manager.clone());
        Ok(manager)
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn get_count(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let mut conn = self.manager().await?;
        Ok(conn.get(key).await?)
    }

    async fn incr_with_expiry(&self, key: &str, ttl_secs: i64) -> Result<i64, StoreError> {
        let mut conn = self.manager().await?;

        // INCR + EXPIRE on first increment, atomically
        let script = redis::Script::new(
            r"
            local count = redis.call('INCR', KEYS[1])
            if count == 1 then
                redis.call('EXPIRE', KEYS[1], ARGV[1])
            end
            return count
            ",
        );

        let count: i64 = script
            .key(key)
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64, StoreError> {
        let mut conn = self.manager().await?;
        let mut cursor: u64 = 0;
        let mut deleted: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            if !keys.is_empty() {
                let n: i64 = conn.del(keys).await?;
                deleted += n as u64;
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(deleted)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.manager().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

// ============================================================================
// In-process implementation
// ============================================================================

struct Counter {
    value: i64,
    expires_at: Option<Instant>,
}

/// In-process counter store with the same expiry semantics as Redis.
///
/// Used by the integration suite and as a dependency-free stand-in during
/// local development. `set_unavailable` lets tests force every operation to
/// fail and exercise the limiter's fail-open path.
#[derive(Default)]
pub struct MemoryStore {
    counters: Mutex<HashMap<String, Counter>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("forced offline".into()))
        } else {
            Ok(())
        }
    }

    fn live_value(counter: &Counter) -> Option<i64> {
        match counter.expires_at {
            Some(deadline) if Instant::now() >= deadline => None,
            _ => Some(counter.value),
        }
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn get_count(&self, key: &str) -> Result<Option<i64>, StoreError> {
        self.check_available()?;
        let counters = self.counters.lock().expect("counter lock poisoned");
        Ok(counters.get(key).and_then(Self::live_value))
    }

    async fn incr_with_expiry(&self, key: &str, ttl_secs: i64) -> Result<i64, StoreError> {
        self.check_available()?;
        let mut counters = self.counters.lock().expect("counter lock poisoned");
        let now = Instant::now();

        let entry = counters.entry(key.to_string()).or_insert(Counter {
            value: 0,
            expires_at: None,
        });
        // an expired counter restarts from zero, like Redis after eviction
        if matches!(entry.expires_at, Some(deadline) if now >= deadline) {
            entry.value = 0;
            entry.expires_at = None;
        }
        entry.value += 1;
        if entry.value == 1 {
            entry.expires_at = Some(now + std::time::Duration::from_secs(ttl_secs.max(0) as u64));
        }
        Ok(entry.value)
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut counters = self.counters.lock().expect("counter lock poisoned");
        let before = counters.len();
        counters.retain(|key, _| !glob_match(pattern, key));
        Ok((before - counters.len()) as u64)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }
}

/// Minimal glob: `*` matches any run of characters, everything else is
/// literal. Enough for the `prefix:*` patterns the limiter uses.
fn glob_match(pattern: &str, key: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == key;
    }

    let mut rest = key;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(tail) => rest = tail,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}
