//! Behavioral signals
//!
//! The four collaborative-filtering inputs as one tagged enum. Each kind
//! carries its relation and axis mapping as data; candidate generation is a
//! single function switching on the tag.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use super::matrix::{find_unrated_columns, rank_peers, InteractionMatrix, InteractionRow, SimilarityRanking};
use super::source::BehaviorSource;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// from_user × to_user → is_following
    Follows,
    /// user × post → is_liked
    Likes,
    /// user × post → is_commented
    Comments,
    /// user × post → is_saved
    Saved,
}

/// Table and actor column a content signal reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relation {
    pub table: &'static str,
    pub actor_column: &'static str,
}

/// What a candidate column is turned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    /// User ids to follow
    Peers,
    /// Post ids to show
    Content,
}

impl SignalKind {
    pub const ALL: [SignalKind; 4] = [
        SignalKind::Follows,
        SignalKind::Likes,
        SignalKind::Comments,
        SignalKind::Saved,
    ];

    /// The kinds loaded against the peer cohort derived from follows.
    pub const CONTENT: [SignalKind; 3] = [SignalKind::Likes, SignalKind::Comments, SignalKind::Saved];

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Follows => "follows",
            SignalKind::Likes => "likes",
            SignalKind::Comments => "comments",
            SignalKind::Saved => "saved",
        }
    }

    /// Relation for content signals; follows reads the social graph instead.
    pub fn relation(&self) -> Option<Relation> {
        match self {
            SignalKind::Follows => None,
            SignalKind::Likes => Some(Relation {
                table: "blogs_post_likes",
                actor_column: "user_id",
            }),
            SignalKind::Comments => Some(Relation {
                table: "blogs_comment",
                actor_column: "owner_id",
            }),
            SignalKind::Saved => Some(Relation {
                table: "blogs_post_saved",
                actor_column: "user_id",
            }),
        }
    }

    /// Map a candidate column to the id recommended for `purpose`.
    ///
    /// Follows columns are users: their latest post serves as content.
    /// Content columns are posts: their owner serves as a peer.
    fn map_column(&self, matrix: &InteractionMatrix, column: i64, purpose: Purpose) -> Option<i64> {
        match (self, purpose) {
            (SignalKind::Follows, Purpose::Peers) => Some(column),
            (SignalKind::Follows, Purpose::Content) => matrix.link(column),
            (_, Purpose::Content) => Some(column),
            (_, Purpose::Peers) => matrix.link(column),
        }
    }

    /// Load this signal's rows for `cohort`.
    ///
    /// `None` when the cohort is empty or the query yields nothing, so the
    /// caller skips the signal instead of pivoting an empty matrix.
    pub async fn load(
        self,
        source: &dyn BehaviorSource,
        target_id: i64,
        cohort: &BTreeSet<i64>,
    ) -> Result<Option<Vec<InteractionRow>>> {
        if cohort.is_empty() {
            return Ok(None);
        }
        let rows = source.interaction_rows(self, target_id, cohort).await?;
        Ok(if rows.is_empty() { None } else { Some(rows) })
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of running one signal for one target.
#[derive(Debug, Clone, Default)]
pub struct SignalCandidates {
    pub ranking: SimilarityRanking,
    pub candidates: BTreeSet<i64>,
}

/// Recommend the unrated columns any top-k peer has a positive value in.
///
/// Fails with `NotFound` when the target has no row in `rows`.
pub fn generate_candidates(
    kind: SignalKind,
    rows: &[InteractionRow],
    purpose: Purpose,
    target_id: i64,
    top_k: usize,
) -> Result<SignalCandidates> {
    let matrix = InteractionMatrix::pivot(rows);
    let ranking = rank_peers(&matrix, target_id, top_k)?;
    let unrated = find_unrated_columns(&matrix, target_id)?;

    let candidates = unrated
        .into_iter()
        .filter(|&column| ranking.peer_ids().any(|peer| matrix.value(peer, column)))
        .filter_map(|column| kind.map_column(&matrix, column, purpose))
        .collect();

    Ok(SignalCandidates { ranking, candidates })
}

/// All signal data for one recommendation run, built once and then read.
#[derive(Debug, Clone, Default)]
pub struct SignalDatasets {
    pub follows: Option<Vec<InteractionRow>>,
    pub likes: Option<Vec<InteractionRow>>,
    pub comments: Option<Vec<InteractionRow>>,
    pub saved: Option<Vec<InteractionRow>>,
    /// Follows peers plus the target; the cohort of the content signals
    pub similar_users: BTreeSet<i64>,
}

impl SignalDatasets {
    pub fn get(&self, kind: SignalKind) -> Option<&[InteractionRow]> {
        match kind {
            SignalKind::Follows => self.follows.as_deref(),
            SignalKind::Likes => self.likes.as_deref(),
            SignalKind::Comments => self.comments.as_deref(),
            SignalKind::Saved => self.saved.as_deref(),
        }
    }

    pub fn set(&mut self, kind: SignalKind, rows: Option<Vec<InteractionRow>>) {
        match kind {
            SignalKind::Follows => self.follows = rows,
            SignalKind::Likes => self.likes = rows,
            SignalKind::Comments => self.comments = rows,
            SignalKind::Saved => self.saved = rows,
        }
    }
}
