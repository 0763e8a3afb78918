//! Copygram recommendation engine library crate
//!
//! Re-exports core modules for the service binary and integration tests.

pub mod config;
pub mod database;
pub mod error;
pub mod event_processor;
pub mod events;
pub mod recommendation;

// Re-export commonly used types
pub use config::Config;
pub use database::Database;
pub use error::{Error, Result};
pub use recommendation::{
    BehaviorSource, ContentDescriptor, DedupFilter, InteractionRow, Job, JobQueue,
    PgBehaviorSource, RecommendationKind, RecommendationRun, RecommendationStore, Recommender,
    SignalKind, StoreKey,
};
