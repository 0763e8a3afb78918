#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;

use copygram::config::RecommendationConfig;
use copygram::error::Result;
use copygram::recommendation::dedup::{ImageSimilarityTable, LocalDedupFilter};
use copygram::recommendation::store::MemoryRecommendationStore;
use copygram::{BehaviorSource, ContentDescriptor, InteractionRow, Recommender, SignalKind};

pub struct Post {
    pub id: i64,
    pub owner_id: i64,
    pub image: Option<&'static str>,
    pub description: Option<&'static str>,
}

/// Social graph held in memory. "Random" pools come back in id order.
#[derive(Default)]
pub struct FixtureSource {
    pub users: Vec<i64>,
    pub follows: Vec<(i64, i64)>,
    pub posts: Vec<Post>,
    pub likes: Vec<(i64, i64)>,
    pub comments: Vec<(i64, i64)>,
    pub saved: Vec<(i64, i64)>,
    pub uninteresting: Vec<(i64, i64)>,
}

impl FixtureSource {
    fn follows(&self, from: i64, to: i64) -> bool {
        self.follows.contains(&(from, to))
    }

    fn latest_post(&self, owner_id: i64) -> Option<i64> {
        self.posts
            .iter()
            .filter(|p| p.owner_id == owner_id)
            .map(|p| p.id)
            .max()
    }

    fn post(&self, id: i64) -> Option<&Post> {
        self.posts.iter().find(|p| p.id == id)
    }

    fn describe(post: &Post) -> ContentDescriptor {
        let mut descriptor = ContentDescriptor::new(post.id);
        if let Some(image) = post.image {
            descriptor = descriptor.with_image(image);
        }
        if let Some(description) = post.description {
            descriptor = descriptor.with_description(description);
        }
        descriptor
    }

    fn relation(&self, kind: SignalKind) -> &[(i64, i64)] {
        match kind {
            SignalKind::Likes => &self.likes,
            SignalKind::Comments => &self.comments,
            SignalKind::Saved => &self.saved,
            SignalKind::Follows => &[],
        }
    }
}

#[async_trait]
impl BehaviorSource for FixtureSource {
    async fn interaction_rows(
        &self,
        kind: SignalKind,
        target_id: i64,
        cohort: &BTreeSet<i64>,
    ) -> Result<Vec<InteractionRow>> {
        if kind == SignalKind::Follows {
            let mut ego: BTreeSet<i64> = cohort.clone();
            ego.insert(target_id);
            ego.extend(
                self.follows
                    .iter()
                    .filter(|(_, to)| cohort.contains(to))
                    .map(|(from, _)| *from),
            );
            let followed: BTreeSet<i64> = self
                .follows
                .iter()
                .filter(|(from, to)| ego.contains(from) && *to != target_id)
                .map(|(_, to)| *to)
                .collect();

            let mut rows = Vec::new();
            for &actor in &ego {
                for &subject in &followed {
                    let mut row = InteractionRow::new(actor, subject, self.follows(actor, subject));
                    if let Some(post) = self.latest_post(subject) {
                        row = row.with_link(post);
                    }
                    rows.push(row);
                }
            }
            return Ok(rows);
        }

        let pairs = self.relation(kind);
        let touched: BTreeSet<i64> = pairs
            .iter()
            .filter(|(actor, _)| cohort.contains(actor))
            .map(|(_, post)| *post)
            .collect();

        let mut rows = Vec::new();
        for &actor in cohort {
            for &post_id in &touched {
                let Some(post) = self.post(post_id) else {
                    continue;
                };
                rows.push(
                    InteractionRow::new(actor, post_id, pairs.contains(&(actor, post_id)))
                        .with_link(post.owner_id),
                );
            }
        }
        Ok(rows)
    }

    async fn following_ids(&self, user_id: i64) -> Result<BTreeSet<i64>> {
        Ok(self
            .follows
            .iter()
            .filter(|(from, _)| *from == user_id)
            .map(|(_, to)| *to)
            .collect())
    }

    async fn follower_ids(&self, user_id: i64) -> Result<BTreeSet<i64>> {
        Ok(self
            .follows
            .iter()
            .filter(|(_, to)| *to == user_id)
            .map(|(from, _)| *from)
            .collect())
    }

    async fn two_hop_audience(&self, owner_id: i64) -> Result<BTreeSet<i64>> {
        let followers = self.follower_ids(owner_id).await?;
        Ok(self
            .follows
            .iter()
            .filter(|(from, to)| followers.contains(to) && *from != owner_id)
            .map(|(from, _)| *from)
            .collect())
    }

    async fn own_post_ids(&self, user_id: i64) -> Result<BTreeSet<i64>> {
        Ok(self
            .posts
            .iter()
            .filter(|p| p.owner_id == user_id)
            .map(|p| p.id)
            .collect())
    }

    async fn uninteresting_post_ids(&self, user_id: i64) -> Result<BTreeSet<i64>> {
        Ok(self
            .uninteresting
            .iter()
            .filter(|(user, _)| *user == user_id)
            .map(|(_, post)| *post)
            .collect())
    }

    async fn random_users(&self, exclude: &BTreeSet<i64>, limit: usize) -> Result<Vec<i64>> {
        Ok(self
            .users
            .iter()
            .copied()
            .filter(|id| !exclude.contains(id))
            .take(limit)
            .collect())
    }

    async fn random_posts(
        &self,
        exclude_owners: &BTreeSet<i64>,
        exclude_posts: &BTreeSet<i64>,
        limit: usize,
    ) -> Result<Vec<ContentDescriptor>> {
        Ok(self
            .posts
            .iter()
            .filter(|p| !exclude_owners.contains(&p.owner_id) && !exclude_posts.contains(&p.id))
            .take(limit)
            .map(Self::describe)
            .collect())
    }

    async fn describe_posts(&self, post_ids: &BTreeSet<i64>) -> Result<Vec<ContentDescriptor>> {
        Ok(self
            .posts
            .iter()
            .filter(|p| post_ids.contains(&p.id))
            .map(Self::describe)
            .collect())
    }
}

/// Six users, nine posts.
///
/// User 1 follows 2. User 3 follows 2 and 4, user 2 follows 4, so 3 is
/// user 1's closest peer. Peer 3 liked post 10 (owned by 5), which user 1
/// has not. Posts are sorted by id, so backfill order is predictable.
pub fn fixture() -> FixtureSource {
    FixtureSource {
        users: (1..=6).collect(),
        follows: vec![(1, 2), (3, 2), (3, 4), (2, 4), (6, 1)],
        posts: vec![
            post(10, 5, Some("media/sunset_copy.jpg"), Some("golden hour at the pier")),
            post(11, 4, Some("media/cat.jpg"), Some("my cat again")),
            post(12, 1, Some("media/selfie.jpg"), None),
            post(13, 6, Some("media/mountain.jpg"), Some("alpine lake hike")),
            post(14, 2, None, Some("coffee")),
            post(15, 6, Some("media/sunset.jpg"), Some("beach evening")),
            post(16, 3, Some("media/bridge.png"), Some("city bridge")),
            post(17, 5, None, Some("new shoes")),
            post(18, 6, Some("media/sunset_again.jpg"), None),
        ],
        likes: vec![(3, 10), (1, 11), (3, 11)],
        comments: vec![(3, 16), (1, 16)],
        saved: vec![],
        uninteresting: vec![],
    }
}

pub fn post(
    id: i64,
    owner_id: i64,
    image: Option<&'static str>,
    description: Option<&'static str>,
) -> Post {
    Post {
        id,
        owner_id,
        image,
        description,
    }
}

pub fn images() -> ImageSimilarityTable {
    let mut table = ImageSimilarityTable::default();
    table.insert("sunset", "sunset_copy", 0.8);
    table.insert("sunset", "sunset_again", 0.9);
    table.insert("sunset", "mountain", 0.3);
    table
}

pub fn settings(target_size: usize) -> RecommendationConfig {
    RecommendationConfig {
        top_k: 3,
        target_size,
        backfill_oversample: 3,
    }
}

pub fn recommender(
    source: FixtureSource,
    target_size: usize,
) -> (Recommender, Arc<MemoryRecommendationStore>) {
    let store = Arc::new(MemoryRecommendationStore::new());
    let recommender = Recommender::new(
        Arc::new(source),
        store.clone(),
        Arc::new(LocalDedupFilter::new(images(), 0.75)),
        settings(target_size),
    );
    (recommender, store)
}
