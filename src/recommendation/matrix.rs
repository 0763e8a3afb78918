//! Similarity Matrix
//!
//! Pivots flat interaction rows into a dense actor × subject table and
//! ranks the actors most similar to a target by cosine similarity.
//!
//! Absent (actor, subject) pairs pivot to `false`: "no interaction", never
//! "negative interaction".

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::error::{Error, Result};

/// One behavioral row for a single signal kind.
///
/// `link_id` carries the id the subject maps to for the other purpose:
/// the post owner for content signals, the subject user's latest post for
/// the follows signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionRow {
    pub actor_id: i64,
    pub subject_id: i64,
    pub flag: bool,
    pub link_id: Option<i64>,
}

impl InteractionRow {
    pub fn new(actor_id: i64, subject_id: i64, flag: bool) -> Self {
        Self {
            actor_id,
            subject_id,
            flag,
            link_id: None,
        }
    }

    pub fn with_link(mut self, link_id: i64) -> Self {
        self.link_id = Some(link_id);
        self
    }
}

/// Dense boolean pivot of interaction rows.
#[derive(Debug, Clone)]
pub struct InteractionMatrix {
    actors: Vec<i64>,
    subjects: Vec<i64>,
    actor_index: HashMap<i64, usize>,
    /// Row-major, `actors.len() * subjects.len()`
    values: Vec<bool>,
    links: HashMap<i64, i64>,
}

impl InteractionMatrix {
    /// Pivot rows into a matrix. Actors and subjects are ordered by id.
    /// Duplicate (actor, subject) rows collapse to one cell, true if any
    /// duplicate is true.
    pub fn pivot(rows: &[InteractionRow]) -> Self {
        let actors: Vec<i64> = rows
            .iter()
            .map(|r| r.actor_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let subjects: Vec<i64> = rows
            .iter()
            .map(|r| r.subject_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let actor_index: HashMap<i64, usize> =
            actors.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        let subject_index: HashMap<i64, usize> =
            subjects.iter().enumerate().map(|(i, id)| (*id, i)).collect();

        let width = subjects.len();
        let mut values = vec![false; actors.len() * width];
        let mut links = HashMap::new();

        for row in rows {
            let (Some(&a), Some(&s)) = (
                actor_index.get(&row.actor_id),
                subject_index.get(&row.subject_id),
            ) else {
                continue;
            };
            if row.flag {
                values[a * width + s] = true;
            }
            if let Some(link) = row.link_id {
                links.entry(row.subject_id).or_insert(link);
            }
        }

        Self {
            actors,
            subjects,
            actor_index,
            values,
            links,
        }
    }

    /// The actor's interaction vector over the shared subject columns.
    pub fn row(&self, actor_id: i64) -> Option<&[bool]> {
        let width = self.subjects.len();
        self.actor_index
            .get(&actor_id)
            .map(|&i| &self.values[i * width..(i + 1) * width])
    }

    /// Cell lookup; unknown actors or subjects read as `false`.
    pub fn value(&self, actor_id: i64, subject_id: i64) -> bool {
        let Some(row) = self.row(actor_id) else {
            return false;
        };
        self.subjects
            .binary_search(&subject_id)
            .map(|col| row[col])
            .unwrap_or(false)
    }

    /// Id the subject column maps to for the other purpose, if known.
    pub fn link(&self, subject_id: i64) -> Option<i64> {
        self.links.get(&subject_id).copied()
    }
}

/// A peer and its similarity to the target.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeerScore {
    pub peer_id: i64,
    pub score: f64,
}

/// Peers ordered by descending score, ties by ascending peer id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimilarityRanking {
    pub peers: Vec<PeerScore>,
}

impl SimilarityRanking {
    pub fn peer_ids(&self) -> impl Iterator<Item = i64> + '_ {
        self.peers.iter().map(|p| p.peer_id)
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }
}

/// Cosine similarity of two 0/1 vectors. A zero-norm vector scores 0.0.
pub fn cosine_similarity(a: &[bool], b: &[bool]) -> f64 {
    let (mut dot, mut norm_a, mut norm_b) = (0u64, 0u64, 0u64);
    for (&x, &y) in a.iter().zip(b) {
        norm_a += x as u64;
        norm_b += y as u64;
        dot += (x && y) as u64;
    }

    if norm_a == 0 || norm_b == 0 {
        return 0.0;
    }
    // One sqrt of the product keeps identical rows at exactly 1.0
    dot as f64 / ((norm_a * norm_b) as f64).sqrt()
}

/// Rank the `top_k` actors most similar to `target_id`.
///
/// Fails with `NotFound` when the target has no row; a matrix holding only
/// the target yields an empty ranking.
pub fn rank_peers(
    matrix: &InteractionMatrix,
    target_id: i64,
    top_k: usize,
) -> Result<SimilarityRanking> {
    let target_row = matrix
        .row(target_id)
        .ok_or_else(|| Error::not_found("matrix row", target_id.to_string()))?;

    let width = matrix.subjects.len();
    let mut peers: Vec<PeerScore> = matrix
        .actors
        .par_iter()
        .enumerate()
        .filter(|(_, &id)| id != target_id)
        .map(|(i, &id)| PeerScore {
            peer_id: id,
            score: cosine_similarity(target_row, &matrix.values[i * width..(i + 1) * width]),
        })
        .collect();

    peers.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.peer_id.cmp(&b.peer_id))
    });
    peers.truncate(top_k);

    Ok(SimilarityRanking { peers })
}

/// Columns where the target's value is false: what the target has not done yet.
pub fn find_unrated_columns(matrix: &InteractionMatrix, target_id: i64) -> Result<BTreeSet<i64>> {
    let row = matrix
        .row(target_id)
        .ok_or_else(|| Error::not_found("matrix row", target_id.to_string()))?;

    Ok(matrix
        .subjects
        .iter()
        .zip(row)
        .filter(|(_, &done)| !done)
        .map(|(&id, _)| id)
        .collect())
}
