//! Recommendation Module
//!
//! Collaborative-filtering recommendations for Copygram users: accounts to
//! follow and posts to show.
//!
//! ## Architecture
//!
//! 1. **Matrix** - Pivot interaction rows and rank similar users by cosine similarity
//! 2. **Signals** - Follows, likes, comments and saves as candidate generators
//! 3. **Source** - Read-only behavioral queries against Postgres
//! 4. **Dedup** - Near-duplicate scoring oracle (image + description similarity)
//! 5. **Engine** - Union, filter and backfill the candidates, then store them
//! 6. **Store** - Per-user recommendation sets in Redis
//! 7. **Updater** - Job queue and workers behind the batch lock
//!
//! ## Algorithm Overview
//!
//! The follows graph of the user's ego network is pivoted first. Its top-k
//! peers (k=3 by default) become the cohort for the likes, comments and
//! saves matrices, so those stay small. Every signal recommends what its
//! top-k peers did and the user did not. Shortfalls are topped up with
//! random users and posts up to the target size.

pub mod dedup;
pub mod engine;
pub mod lock;
pub mod matrix;
pub mod metrics;
pub mod signals;
pub mod source;
pub mod store;
pub mod updater;

pub use dedup::{ContentDescriptor, DedupFilter};
pub use engine::{RecommendationRun, Recommender};
pub use lock::BatchLock;
pub use matrix::{InteractionMatrix, InteractionRow, SimilarityRanking};
pub use signals::{generate_candidates, Purpose, SignalDatasets, SignalKind};
pub use source::{BehaviorSource, PgBehaviorSource};
pub use store::{RecommendationKind, RecommendationStore, StoreKey};
pub use updater::{Job, JobQueue};
