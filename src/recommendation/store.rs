//! Recommendation store
//!
//! Per-user id sets, keyed `user:<id>:<kind>:recommendations`. The store is
//! a disposable view fully rebuilt from behavioral data, so writers follow
//! last-write-wins and nothing here expires keys.

use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    /// Accounts to follow
    Follows,
    /// Posts to show
    Posts,
}

impl RecommendationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecommendationKind::Follows => "follows",
            RecommendationKind::Posts => "posts",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKey {
    Recommendations {
        user_id: i64,
        kind: RecommendationKind,
    },
    /// Recently viewed post ids, read by the post backfill
    ViewedPosts { user_id: i64 },
}

impl StoreKey {
    pub fn recommendations(user_id: i64, kind: RecommendationKind) -> Self {
        StoreKey::Recommendations { user_id, kind }
    }

    pub fn follows(user_id: i64) -> Self {
        Self::recommendations(user_id, RecommendationKind::Follows)
    }

    pub fn posts(user_id: i64) -> Self {
        Self::recommendations(user_id, RecommendationKind::Posts)
    }

    pub fn viewed_posts(user_id: i64) -> Self {
        StoreKey::ViewedPosts { user_id }
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKey::Recommendations { user_id, kind } => {
                write!(f, "user:{}:{}:recommendations", user_id, kind.as_str())
            }
            StoreKey::ViewedPosts { user_id } => write!(f, "user:{}:viewed_posts", user_id),
        }
    }
}

#[async_trait]
pub trait RecommendationStore: Send + Sync {
    /// Add ids to the set. Adding nothing is a no-op.
    async fn store(&self, key: &StoreKey, ids: &BTreeSet<i64>) -> Result<()>;

    async fn clear(&self, key: &StoreKey) -> Result<()>;

    async fn remove(&self, key: &StoreKey, ids: &BTreeSet<i64>) -> Result<()>;

    /// Current set; a missing key reads as empty.
    async fn get(&self, key: &StoreKey) -> Result<BTreeSet<i64>>;

    /// Clear and store as one step; readers see the old set or the new one.
    async fn replace(&self, key: &StoreKey, ids: &BTreeSet<i64>) -> Result<()>;
}

// ============================================================================
// Redis
// ============================================================================

#[derive(Clone)]
pub struct RedisRecommendationStore {
    conn: MultiplexedConnection,
}

impl RedisRecommendationStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }

    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl RecommendationStore for RedisRecommendationStore {
    async fn store(&self, key: &StoreKey, ids: &BTreeSet<i64>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let members: Vec<i64> = ids.iter().copied().collect();
        conn.sadd::<_, _, ()>(key.to_string(), members).await?;
        Ok(())
    }

    async fn clear(&self, key: &StoreKey) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key.to_string()).await?;
        Ok(())
    }

    async fn remove(&self, key: &StoreKey, ids: &BTreeSet<i64>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let members: Vec<i64> = ids.iter().copied().collect();
        conn.srem::<_, _, ()>(key.to_string(), members).await?;
        Ok(())
    }

    async fn get(&self, key: &StoreKey) -> Result<BTreeSet<i64>> {
        let mut conn = self.conn.clone();
        let members: Vec<i64> = conn.smembers(key.to_string()).await?;
        Ok(members.into_iter().collect())
    }

    #[instrument(skip(self, ids), fields(key = %key, size = ids.len()))]
    async fn replace(&self, key: &StoreKey, ids: &BTreeSet<i64>) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        let mut pipe = redis::pipe();
        pipe.atomic().del(&key).ignore();
        if !ids.is_empty() {
            let members: Vec<i64> = ids.iter().copied().collect();
            pipe.sadd(&key, members).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        debug!("Replaced recommendation set");
        Ok(())
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Process-local store for tests and single-node runs.
#[derive(Default)]
pub struct MemoryRecommendationStore {
    sets: RwLock<HashMap<StoreKey, BTreeSet<i64>>>,
}

impl MemoryRecommendationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecommendationStore for MemoryRecommendationStore {
    async fn store(&self, key: &StoreKey, ids: &BTreeSet<i64>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.sets
            .write()
            .await
            .entry(*key)
            .or_default()
            .extend(ids.iter().copied());
        Ok(())
    }

    async fn clear(&self, key: &StoreKey) -> Result<()> {
        self.sets.write().await.remove(key);
        Ok(())
    }

    async fn remove(&self, key: &StoreKey, ids: &BTreeSet<i64>) -> Result<()> {
        let mut sets = self.sets.write().await;
        if let Some(set) = sets.get_mut(key) {
            set.retain(|id| !ids.contains(id));
            if set.is_empty() {
                sets.remove(key);
            }
        }
        Ok(())
    }

    async fn get(&self, key: &StoreKey) -> Result<BTreeSet<i64>> {
        Ok(self.sets.read().await.get(key).cloned().unwrap_or_default())
    }

    async fn replace(&self, key: &StoreKey, ids: &BTreeSet<i64>) -> Result<()> {
        let mut sets = self.sets.write().await;
        if ids.is_empty() {
            sets.remove(key);
        } else {
            sets.insert(*key, ids.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_format() {
        assert_eq!(StoreKey::follows(7).to_string(), "user:7:follows:recommendations");
        assert_eq!(StoreKey::posts(7).to_string(), "user:7:posts:recommendations");
        assert_eq!(StoreKey::viewed_posts(7).to_string(), "user:7:viewed_posts");
    }

    #[tokio::test]
    async fn test_memory_store_set_semantics() {
        let store = MemoryRecommendationStore::new();
        let key = StoreKey::follows(1);

        store.store(&key, &BTreeSet::from([1, 2])).await.unwrap();
        store.store(&key, &BTreeSet::from([2, 3])).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), BTreeSet::from([1, 2, 3]));

        store.remove(&key, &BTreeSet::from([2, 9])).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), BTreeSet::from([1, 3]));

        store.clear(&key).await.unwrap();
        assert!(store.get(&key).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_replace_drops_old_members() {
        let store = MemoryRecommendationStore::new();
        let key = StoreKey::posts(1);

        store.store(&key, &BTreeSet::from([1, 2, 3])).await.unwrap();
        store.replace(&key, &BTreeSet::from([4])).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), BTreeSet::from([4]));

        store.replace(&key, &BTreeSet::new()).await.unwrap();
        assert!(store.get(&key).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let store = MemoryRecommendationStore::new();
        store.store(&StoreKey::follows(1), &BTreeSet::from([5])).await.unwrap();
        assert!(store.get(&StoreKey::follows(2)).await.unwrap().is_empty());
        assert!(store.get(&StoreKey::posts(1)).await.unwrap().is_empty());
    }
}
