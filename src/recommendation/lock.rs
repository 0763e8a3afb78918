//! Batch advisory lock
//!
//! One global lock guards the read-clear-write section of a batch
//! recomputation. It is best effort: acquisition never waits, and the TTL
//! frees the lock if its holder dies.

use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, Client};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;

/// Proof of holding the lock; only the holder's token releases it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub key: String,
    pub token: String,
}

#[async_trait]
pub trait BatchLock: Send + Sync {
    /// `None` when someone else holds the lock.
    async fn try_acquire(&self) -> Result<Option<LockToken>>;

    /// Release if still held by `token`; a lock that expired meanwhile is left alone.
    async fn release(&self, token: LockToken) -> Result<()>;
}

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

pub struct RedisBatchLock {
    conn: MultiplexedConnection,
    key: String,
    ttl: Duration,
    release: redis::Script,
}

impl RedisBatchLock {
    pub async fn connect(redis_url: &str, key: impl Into<String>, ttl: Duration) -> Result<Self> {
        let client = Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self::from_connection(conn, key, ttl))
    }

    pub fn from_connection(conn: MultiplexedConnection, key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            conn,
            key: key.into(),
            ttl,
            release: redis::Script::new(RELEASE_SCRIPT),
        }
    }
}

#[async_trait]
impl BatchLock for RedisBatchLock {
    async fn try_acquire(&self) -> Result<Option<LockToken>> {
        let mut conn = self.conn.clone();
        let token = Uuid::new_v4().to_string();

        let acquired: Option<String> = redis::cmd("SET")
            .arg(&self.key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(self.ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        Ok(acquired.map(|_| LockToken {
            key: self.key.clone(),
            token,
        }))
    }

    async fn release(&self, token: LockToken) -> Result<()> {
        let mut conn = self.conn.clone();
        let deleted: i32 = self
            .release
            .key(&token.key)
            .arg(&token.token)
            .invoke_async(&mut conn)
            .await?;

        if deleted == 0 {
            warn!(key = %token.key, "Batch lock expired before release");
        } else {
            debug!(key = %token.key, "Batch lock released");
        }
        Ok(())
    }
}

/// Process-local lock with the same expiry semantics.
pub struct MemoryBatchLock {
    key: String,
    ttl: Duration,
    held: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryBatchLock {
    pub fn new(key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            ttl,
            held: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl BatchLock for MemoryBatchLock {
    async fn try_acquire(&self) -> Result<Option<LockToken>> {
        let mut held = self.held.lock().await;
        let now = Instant::now();

        if let Some((_, expires)) = held.get(&self.key) {
            if *expires > now {
                return Ok(None);
            }
        }

        let token = Uuid::new_v4().to_string();
        held.insert(self.key.clone(), (token.clone(), now + self.ttl));
        Ok(Some(LockToken {
            key: self.key.clone(),
            token,
        }))
    }

    async fn release(&self, token: LockToken) -> Result<()> {
        let mut held = self.held.lock().await;
        if matches!(held.get(&token.key), Some((current, _)) if *current == token.token) {
            held.remove(&token.key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_lock_is_exclusive() {
        let lock = MemoryBatchLock::new("batch", Duration::from_secs(60));

        let token = lock.try_acquire().await.unwrap().expect("first acquire");
        assert!(lock.try_acquire().await.unwrap().is_none());

        lock.release(token).await.unwrap();
        assert!(lock.try_acquire().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_memory_lock_expires() {
        let lock = MemoryBatchLock::new("batch", Duration::from_millis(10));
        let _stale = lock.try_acquire().await.unwrap().expect("first acquire");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(lock.try_acquire().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stale_token_cannot_release_new_holder() {
        let lock = MemoryBatchLock::new("batch", Duration::from_millis(10));
        let stale = lock.try_acquire().await.unwrap().expect("first acquire");

        tokio::time::sleep(Duration::from_millis(20)).await;
        let _current = lock.try_acquire().await.unwrap().expect("second acquire");

        lock.release(stale).await.unwrap();
        assert!(lock.try_acquire().await.unwrap().is_none());
    }
}
