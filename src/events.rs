//! Domain events
//!
//! Events published by the social backend on the `user.actions` topic, and
//! the recommendation job each one triggers.
//!
//! Payloads are JSON objects tagged by `event_type`:
//!
//! ```json
//! {"event_type": "post_liked", "user_id": 7, "post_id": 42, "timestamp": "2024-05-01T12:00:00Z"}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::recommendation::updater::Job;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum DomainEvent {
    // Social graph
    UserFollowed { from_user_id: i64, to_user_id: i64 },
    UserUnfollowed { from_user_id: i64, to_user_id: i64 },

    // Engagement
    PostLiked { user_id: i64, post_id: i64 },
    PostUnliked { user_id: i64, post_id: i64 },
    PostCommented { user_id: i64, post_id: i64 },
    PostSaved { user_id: i64, post_id: i64 },
    PostUnsaved { user_id: i64, post_id: i64 },

    // Feedback
    PostMarkedUninteresting { user_id: i64, post_id: i64 },
    PostUninterestingRemoved { user_id: i64, post_id: i64 },

    // Content lifecycle
    PostCreated { owner_id: i64, post_id: i64 },
    PostDeleted { owner_id: i64, post_id: i64 },
    PostViewed { user_id: i64, post_id: i64 },
}

/// Every `event_type` this service understands
pub const EVENT_TYPES: [&str; 12] = [
    "user_followed",
    "user_unfollowed",
    "post_liked",
    "post_unliked",
    "post_commented",
    "post_saved",
    "post_unsaved",
    "post_marked_uninteresting",
    "post_uninteresting_removed",
    "post_created",
    "post_deleted",
    "post_viewed",
];

/// A decoded message: the event plus the producer's timestamp, if sent.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EventEnvelope {
    #[serde(flatten)]
    pub event: DomainEvent,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl DomainEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::UserFollowed { .. } => "user_followed",
            DomainEvent::UserUnfollowed { .. } => "user_unfollowed",
            DomainEvent::PostLiked { .. } => "post_liked",
            DomainEvent::PostUnliked { .. } => "post_unliked",
            DomainEvent::PostCommented { .. } => "post_commented",
            DomainEvent::PostSaved { .. } => "post_saved",
            DomainEvent::PostUnsaved { .. } => "post_unsaved",
            DomainEvent::PostMarkedUninteresting { .. } => "post_marked_uninteresting",
            DomainEvent::PostUninterestingRemoved { .. } => "post_uninteresting_removed",
            DomainEvent::PostCreated { .. } => "post_created",
            DomainEvent::PostDeleted { .. } => "post_deleted",
            DomainEvent::PostViewed { .. } => "post_viewed",
        }
    }

    /// The recommendation job this event triggers.
    pub fn to_job(&self) -> Job {
        match *self {
            DomainEvent::UserFollowed { from_user_id, .. }
            | DomainEvent::UserUnfollowed { from_user_id, .. } => Job::RecomputeNetwork {
                user_id: from_user_id,
            },

            DomainEvent::PostLiked { user_id, .. }
            | DomainEvent::PostUnliked { user_id, .. }
            | DomainEvent::PostCommented { user_id, .. }
            | DomainEvent::PostSaved { user_id, .. }
            | DomainEvent::PostUnsaved { user_id, .. }
            | DomainEvent::PostUninterestingRemoved { user_id, .. } => {
                Job::RecomputeNetwork { user_id }
            }

            DomainEvent::PostMarkedUninteresting { user_id, post_id } => {
                Job::PruneSimilar { user_id, post_id }
            }

            DomainEvent::PostCreated { owner_id, .. } => Job::RecomputeAudience { owner_id },
            DomainEvent::PostDeleted { owner_id, post_id } => Job::ForgetPost { owner_id, post_id },
            DomainEvent::PostViewed { user_id, post_id } => Job::RecordView { user_id, post_id },
        }
    }
}

impl std::fmt::Display for DomainEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.event_type())
    }
}

/// Decode a message payload.
///
/// `Ok(None)` for well-formed messages of an event type this service
/// doesn't handle; an error for anything malformed.
pub fn parse_event(payload: &[u8]) -> Result<Option<EventEnvelope>> {
    let value: serde_json::Value = serde_json::from_slice(payload)?;

    let event_type = value
        .get("event_type")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| Error::InvalidFormat {
            message: "missing event_type".into(),
        })?;

    if !EVENT_TYPES.contains(&event_type) {
        return Ok(None);
    }

    Ok(Some(serde_json::from_value(value)?))
}
