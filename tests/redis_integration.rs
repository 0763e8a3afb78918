use std::collections::BTreeSet;
use std::time::Duration;

use copygram::recommendation::lock::{BatchLock, RedisBatchLock};
use copygram::recommendation::store::{RedisRecommendationStore, StoreKey};
use copygram::RecommendationStore;

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

#[tokio::test]
#[ignore]
async fn redis_store_replace_and_lock() {
    // Run with `cargo test -- --ignored` against a local Redis.
    let store = RedisRecommendationStore::connect(&redis_url()).await.unwrap();
    store.health_check().await.unwrap();

    let key = StoreKey::follows(900_001);
    store.store(&key, &BTreeSet::from([1, 2, 3])).await.unwrap();
    store.replace(&key, &BTreeSet::from([3, 4])).await.unwrap();
    assert_eq!(store.get(&key).await.unwrap(), BTreeSet::from([3, 4]));

    store.remove(&key, &BTreeSet::from([3])).await.unwrap();
    assert_eq!(store.get(&key).await.unwrap(), BTreeSet::from([4]));

    store.replace(&key, &BTreeSet::new()).await.unwrap();
    assert!(store.get(&key).await.unwrap().is_empty());

    let lock = RedisBatchLock::connect(&redis_url(), "test:copygram:lock", Duration::from_secs(5))
        .await
        .unwrap();
    let token = lock.try_acquire().await.unwrap().expect("lock should be free");
    assert!(lock.try_acquire().await.unwrap().is_none());
    lock.release(token).await.unwrap();
    assert!(lock.try_acquire().await.unwrap().is_some());
}
