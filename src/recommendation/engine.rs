//! Recommendation Engine
//!
//! Orchestrates the four behavioral signals for one user: loads the
//! datasets, unions per-signal candidates, filters and backfills, then
//! replaces the stored recommendation sets.
//!
//! ## Pipeline
//!
//! 1. **Follows** is loaded over the user's ego network. Its top-k peers plus
//!    the user form the cohort for the other signals.
//! 2. **Likes / Comments / Saved** are loaded for that cohort only.
//! 3. Candidates from every loaded signal are unioned per purpose.
//! 4. Follow candidates drop the user and existing followees, then get
//!    backfilled with random users up to the target size.
//! 5. Post candidates are computed only when the signals produced any follow
//!    candidate at all. They drop the user's own posts and near-duplicates
//!    of posts the user marked uninteresting, then get backfilled with
//!    random posts that near-duplicate neither viewed nor uninteresting ones.
//! 6. Both sets are replaced in the store after everything is computed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use super::dedup::{ContentDescriptor, DedupFilter};
use super::matrix::{rank_peers, InteractionMatrix};
use super::metrics::{self, PerformanceTimer};
use super::signals::{generate_candidates, Purpose, SignalDatasets, SignalKind};
use super::source::BehaviorSource;
use super::store::{RecommendationKind, RecommendationStore, StoreKey};
use crate::config::RecommendationConfig;
use crate::error::{Error, Result};

/// What one run stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecommendationRun {
    pub user_id: i64,
    pub follows: BTreeSet<i64>,
    /// `None` when post computation was skipped for lack of signal
    pub posts: Option<BTreeSet<i64>>,
}

/// Main recommendation engine
#[derive(Clone)]
pub struct Recommender {
    source: Arc<dyn BehaviorSource>,
    store: Arc<dyn RecommendationStore>,
    dedup: Arc<dyn DedupFilter>,
    settings: RecommendationConfig,
}

impl Recommender {
    pub fn new(
        source: Arc<dyn BehaviorSource>,
        store: Arc<dyn RecommendationStore>,
        dedup: Arc<dyn DedupFilter>,
        settings: RecommendationConfig,
    ) -> Self {
        Self {
            source,
            store,
            dedup,
            settings,
        }
    }

    pub fn source(&self) -> &Arc<dyn BehaviorSource> {
        &self.source
    }

    /// Load every signal dataset for `user_id`.
    #[instrument(skip(self))]
    pub async fn load_datasets(&self, user_id: i64) -> Result<SignalDatasets> {
        let mut datasets = SignalDatasets::default();

        let following = self.source.following_ids(user_id).await?;
        let follows = SignalKind::Follows
            .load(self.source.as_ref(), user_id, &following)
            .await?;

        if let Some(rows) = &follows {
            let matrix = InteractionMatrix::pivot(rows);
            match rank_peers(&matrix, user_id, self.settings.top_k) {
                Ok(ranking) => {
                    datasets.similar_users = ranking.peer_ids().collect();
                    datasets.similar_users.insert(user_id);
                }
                Err(Error::NotFound { .. }) => {
                    debug!("User has no follows row, content signals get no cohort");
                }
                Err(e) => return Err(e),
            }
        }
        datasets.follows = follows;

        for kind in SignalKind::CONTENT {
            let rows = kind
                .load(self.source.as_ref(), user_id, &datasets.similar_users)
                .await?;
            if rows.is_none() {
                debug!(signal = %kind, "No data for signal");
            }
            datasets.set(kind, rows);
        }

        Ok(datasets)
    }

    /// Recompute and replace both recommendation sets for `user_id`.
    #[instrument(skip(self))]
    pub async fn generate_recommendations(&self, user_id: i64) -> Result<RecommendationRun> {
        let timer = PerformanceTimer::new("generate_recommendations");

        let datasets = self.load_datasets(user_id).await?;
        let top_k = self.settings.top_k;

        // Pivots and rankings are CPU-bound; keep them off the runtime threads
        let (raw_follows, raw_posts) = tokio::task::spawn_blocking(move || {
            (
                union_candidates(&datasets, user_id, top_k, Purpose::Peers),
                union_candidates(&datasets, user_id, top_k, Purpose::Content),
            )
        })
        .await?;

        let following = self.source.following_ids(user_id).await?;

        let mut follows: BTreeSet<i64> = raw_follows
            .iter()
            .copied()
            .filter(|id| *id != user_id && !following.contains(id))
            .collect();
        let added = self.backfill_follows(user_id, &mut follows, &following).await?;
        metrics::record_backfill(RecommendationKind::Follows, added);

        let posts = if raw_follows.is_empty() {
            debug!("No signal-derived follow candidates, skipping posts");
            None
        } else {
            Some(self.post_recommendations(user_id, raw_posts, &following).await?)
        };

        self.store.replace(&StoreKey::follows(user_id), &follows).await?;
        self.store
            .replace(&StoreKey::posts(user_id), posts.as_ref().unwrap_or(&BTreeSet::new()))
            .await?;

        metrics::record_generated(RecommendationKind::Follows, follows.len());
        if let Some(posts) = &posts {
            metrics::record_generated(RecommendationKind::Posts, posts.len());
        }

        info!(
            "✅ Recommendations for user {}: {} follows, {} posts in {}ms",
            user_id,
            follows.len(),
            posts.as_ref().map_or(0, BTreeSet::len),
            timer.elapsed_ms()
        );
        timer.log_if_slow(5_000);

        Ok(RecommendationRun {
            user_id,
            follows,
            posts,
        })
    }

    async fn post_recommendations(
        &self,
        user_id: i64,
        raw_posts: BTreeSet<i64>,
        following: &BTreeSet<i64>,
    ) -> Result<BTreeSet<i64>> {
        let own_posts = self.source.own_post_ids(user_id).await?;
        let mut posts: BTreeSet<i64> = raw_posts.difference(&own_posts).copied().collect();

        let uninteresting_ids = self.source.uninteresting_post_ids(user_id).await?;
        posts.retain(|id| !uninteresting_ids.contains(id));
        let uninteresting = self.source.describe_posts(&uninteresting_ids).await?;
        let mut dropped = uninteresting_ids;

        if !uninteresting.is_empty() && !posts.is_empty() {
            let candidates = self.source.describe_posts(&posts).await?;
            let duplicates = self.dedup.score_similarity(&uninteresting, &candidates).await?;
            if !duplicates.is_empty() {
                debug!(
                    "Dropping {} posts similar to uninteresting ones",
                    duplicates.len()
                );
                posts.retain(|id| !duplicates.contains(id));
                dropped.extend(duplicates);
            }
        }

        let added = self
            .backfill_posts(user_id, &mut posts, following, &uninteresting, &dropped)
            .await?;
        metrics::record_backfill(RecommendationKind::Posts, added);
        Ok(posts)
    }

    /// Top up with random users; returns how many were added.
    async fn backfill_follows(
        &self,
        user_id: i64,
        current: &mut BTreeSet<i64>,
        following: &BTreeSet<i64>,
    ) -> Result<usize> {
        let missing = self.settings.target_size.saturating_sub(current.len());
        if missing == 0 {
            return Ok(0);
        }

        let mut exclude: BTreeSet<i64> = current.union(following).copied().collect();
        exclude.insert(user_id);

        let before = current.len();
        current.extend(
            self.source
                .random_users(&exclude, missing)
                .await?
                .into_iter()
                .filter(|id| !exclude.contains(id))
                .take(missing),
        );
        Ok(current.len() - before)
    }

    /// Top up with random posts, skipping anything that near-duplicates a
    /// recently viewed or uninteresting post.
    async fn backfill_posts(
        &self,
        user_id: i64,
        current: &mut BTreeSet<i64>,
        following: &BTreeSet<i64>,
        uninteresting: &[ContentDescriptor],
        dropped: &BTreeSet<i64>,
    ) -> Result<usize> {
        let missing = self.settings.target_size.saturating_sub(current.len());
        if missing == 0 {
            return Ok(0);
        }

        let mut exclude_owners = following.clone();
        exclude_owners.insert(user_id);

        let viewed = self.store.get(&StoreKey::viewed_posts(user_id)).await?;
        let exclude_posts: BTreeSet<i64> = current
            .iter()
            .chain(&viewed)
            .chain(dropped)
            .copied()
            .collect();

        let oversample = missing.saturating_mul(self.settings.backfill_oversample.max(1));
        let mut pool = self
            .source
            .random_posts(&exclude_owners, &exclude_posts, oversample)
            .await?;
        pool.retain(|post| !exclude_posts.contains(&post.id));

        let mut reference = self.source.describe_posts(&viewed).await?;
        reference.extend_from_slice(uninteresting);
        if !reference.is_empty() && !pool.is_empty() {
            let duplicates = self.dedup.score_similarity(&reference, &pool).await?;
            pool.retain(|post| !duplicates.contains(&post.id));
        }

        let before = current.len();
        current.extend(pool.into_iter().map(|post| post.id).take(missing));
        Ok(current.len() - before)
    }

    /// Remove stored post recommendations that near-duplicate `post_id`,
    /// which the user just marked uninteresting. Returns the removed ids.
    #[instrument(skip(self))]
    pub async fn prune_similar(&self, user_id: i64, post_id: i64) -> Result<BTreeSet<i64>> {
        let key = StoreKey::posts(user_id);
        let stored = self.store.get(&key).await?;
        if stored.is_empty() {
            return Ok(BTreeSet::new());
        }

        let marked = self
            .source
            .describe_posts(&BTreeSet::from([post_id]))
            .await?;
        if marked.is_empty() {
            debug!("Marked post no longer exists");
            return Ok(BTreeSet::new());
        }

        let candidates = self.source.describe_posts(&stored).await?;
        let mut duplicates = self.dedup.score_similarity(&marked, &candidates).await?;
        if stored.contains(&post_id) {
            duplicates.insert(post_id);
        }

        self.store.remove(&key, &duplicates).await?;
        debug!("Pruned {} similar posts", duplicates.len());
        Ok(duplicates)
    }

    /// Drop a deleted post from every audience member's post recommendations.
    #[instrument(skip(self, audience), fields(audience = audience.len()))]
    pub async fn forget_post(&self, post_id: i64, audience: &BTreeSet<i64>) -> Result<()> {
        let ids = BTreeSet::from([post_id]);
        for user_id in audience {
            self.store.remove(&StoreKey::posts(*user_id), &ids).await?;
        }
        Ok(())
    }

    /// Append to the user's view log.
    pub async fn record_view(&self, user_id: i64, post_id: i64) -> Result<()> {
        self.store
            .store(&StoreKey::viewed_posts(user_id), &BTreeSet::from([post_id]))
            .await
    }

    /// Current follow recommendations, without recomputing.
    pub async fn get_follow_recommendation_ids(&self, user_id: i64) -> Result<BTreeSet<i64>> {
        self.store.get(&StoreKey::follows(user_id)).await
    }

    /// Current post recommendations, without recomputing.
    pub async fn get_post_recommendation_ids(&self, user_id: i64) -> Result<BTreeSet<i64>> {
        self.store.get(&StoreKey::posts(user_id)).await
    }
}

/// Union of one purpose's candidates over every loaded signal.
/// A signal without a row for the target contributes nothing.
pub fn union_candidates(
    datasets: &SignalDatasets,
    target_id: i64,
    top_k: usize,
    purpose: Purpose,
) -> BTreeSet<i64> {
    let mut union = BTreeSet::new();
    for kind in SignalKind::ALL {
        let Some(rows) = datasets.get(kind) else {
            continue;
        };
        match generate_candidates(kind, rows, purpose, target_id, top_k) {
            Ok(out) => union.extend(out.candidates),
            Err(e) => {
                debug!(signal = %kind, error_code = e.error_code(), "Signal skipped: {}", e);
                metrics::record_signal_skipped(kind);
            }
        }
    }
    union
}
