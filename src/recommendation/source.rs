//! Behavioral data source
//!
//! Read-only queries over the social store: the four signal datasets, the
//! follow graph, and the random pools used for backfill.

use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::BTreeSet;
use tracing::{debug, instrument};

use super::dedup::ContentDescriptor;
use super::matrix::InteractionRow;
use super::signals::SignalKind;
use crate::error::Result;

#[async_trait]
pub trait BehaviorSource: Send + Sync {
    /// Rows for one signal.
    ///
    /// For `Follows`, `cohort` is the target's followees and the rows cover
    /// the target's ego network. For content signals, `cohort` is the exact
    /// set of actors to pivot.
    async fn interaction_rows(
        &self,
        kind: SignalKind,
        target_id: i64,
        cohort: &BTreeSet<i64>,
    ) -> Result<Vec<InteractionRow>>;

    /// Accounts `user_id` follows
    async fn following_ids(&self, user_id: i64) -> Result<BTreeSet<i64>>;

    /// Accounts following `user_id`
    async fn follower_ids(&self, user_id: i64) -> Result<BTreeSet<i64>>;

    /// Users following one of `owner_id`'s followers, the owner excluded
    async fn two_hop_audience(&self, owner_id: i64) -> Result<BTreeSet<i64>>;

    async fn own_post_ids(&self, user_id: i64) -> Result<BTreeSet<i64>>;

    async fn uninteresting_post_ids(&self, user_id: i64) -> Result<BTreeSet<i64>>;

    /// Up to `limit` random active users outside `exclude`
    async fn random_users(&self, exclude: &BTreeSet<i64>, limit: usize) -> Result<Vec<i64>>;

    /// Up to `limit` random visible posts, skipping the given owners and ids
    async fn random_posts(
        &self,
        exclude_owners: &BTreeSet<i64>,
        exclude_posts: &BTreeSet<i64>,
        limit: usize,
    ) -> Result<Vec<ContentDescriptor>>;

    /// Descriptors for the given posts; unknown ids are skipped
    async fn describe_posts(&self, post_ids: &BTreeSet<i64>) -> Result<Vec<ContentDescriptor>>;
}

fn to_vec(ids: &BTreeSet<i64>) -> Vec<i64> {
    ids.iter().copied().collect()
}

#[derive(Debug, sqlx::FromRow)]
struct RowRecord {
    actor_id: i64,
    subject_id: i64,
    flag: bool,
    link_id: Option<i64>,
}

impl From<RowRecord> for InteractionRow {
    fn from(r: RowRecord) -> Self {
        InteractionRow {
            actor_id: r.actor_id,
            subject_id: r.subject_id,
            flag: r.flag,
            link_id: r.link_id,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PostRecord {
    id: i64,
    file: Option<String>,
    description: Option<String>,
}

impl From<PostRecord> for ContentDescriptor {
    fn from(r: PostRecord) -> Self {
        ContentDescriptor {
            id: r.id,
            image_ref: r.file.filter(|f| !f.is_empty()),
            description: r.description.filter(|d| !d.trim().is_empty()),
        }
    }
}

/// Every pair in the target's ego network: the target, its followees, and
/// their other followers, against everyone those users follow.
const FOLLOWS_QUERY: &str = r#"
WITH ego AS (
    SELECT $1::bigint AS id
    UNION
    SELECT unnest($2::bigint[])
    UNION
    SELECT f.from_user_id::bigint FROM users_follower f WHERE f.to_user_id = ANY($2)
),
followed AS (
    SELECT DISTINCT f.to_user_id::bigint AS id
    FROM users_follower f
    JOIN ego ON ego.id = f.from_user_id
    WHERE f.to_user_id <> $1
)
SELECT
    e.id AS actor_id,
    c.id AS subject_id,
    EXISTS (
        SELECT 1 FROM users_follower f
        WHERE f.from_user_id = e.id AND f.to_user_id = c.id
    ) AS flag,
    (
        SELECT p.id::bigint FROM blogs_post p
        WHERE p.owner_id = c.id AND NOT p.archived
        ORDER BY p.created_at DESC
        LIMIT 1
    ) AS link_id
FROM ego e
CROSS JOIN followed c
"#;

/// Cohort × posts any cohort member touched, for one content relation.
fn content_query(table: &str, actor_column: &str) -> String {
    format!(
        r#"
WITH cohort AS (
    SELECT unnest($1::bigint[]) AS id
),
touched AS (
    SELECT DISTINCT r.post_id
    FROM {table} r
    JOIN cohort ON cohort.id = r.{actor}
)
SELECT
    c.id AS actor_id,
    p.id::bigint AS subject_id,
    EXISTS (
        SELECT 1 FROM {table} r
        WHERE r.{actor} = c.id AND r.post_id = p.id
    ) AS flag,
    p.owner_id::bigint AS link_id
FROM cohort c
CROSS JOIN touched t
JOIN blogs_post p ON p.id = t.post_id AND NOT p.archived
"#,
        table = table,
        actor = actor_column,
    )
}

const POST_DESCRIPTOR_COLUMNS: &str = r#"
    p.id::bigint AS id,
    (SELECT m.file FROM blogs_postmedia m WHERE m.post_id = p.id ORDER BY m.id LIMIT 1) AS file,
    p.description
"#;

/// Postgres implementation over the social schema
#[derive(Clone)]
pub struct PgBehaviorSource {
    pool: PgPool,
}

impl PgBehaviorSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn ids(&self, sql: &str, user_id: i64) -> Result<BTreeSet<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar(sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().collect())
    }
}

#[async_trait]
impl BehaviorSource for PgBehaviorSource {
    #[instrument(skip(self, cohort), fields(kind = %kind, cohort = cohort.len()))]
    async fn interaction_rows(
        &self,
        kind: SignalKind,
        target_id: i64,
        cohort: &BTreeSet<i64>,
    ) -> Result<Vec<InteractionRow>> {
        let records: Vec<RowRecord> = match kind.relation() {
            None => {
                sqlx::query_as(FOLLOWS_QUERY)
                    .bind(target_id)
                    .bind(to_vec(cohort))
                    .fetch_all(&self.pool)
                    .await?
            }
            Some(relation) => {
                let sql = content_query(relation.table, relation.actor_column);
                sqlx::query_as(&sql)
                    .bind(to_vec(cohort))
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        debug!("Loaded {} {} rows", records.len(), kind);
        Ok(records.into_iter().map(Into::into).collect())
    }

    async fn following_ids(&self, user_id: i64) -> Result<BTreeSet<i64>> {
        self.ids(
            "SELECT to_user_id::bigint FROM users_follower WHERE from_user_id = $1",
            user_id,
        )
        .await
    }

    async fn follower_ids(&self, user_id: i64) -> Result<BTreeSet<i64>> {
        self.ids(
            "SELECT from_user_id::bigint FROM users_follower WHERE to_user_id = $1",
            user_id,
        )
        .await
    }

    async fn two_hop_audience(&self, owner_id: i64) -> Result<BTreeSet<i64>> {
        self.ids(
            r#"
            SELECT DISTINCT f2.from_user_id::bigint
            FROM users_follower f1
            JOIN users_follower f2 ON f2.to_user_id = f1.from_user_id
            WHERE f1.to_user_id = $1 AND f2.from_user_id <> $1
            "#,
            owner_id,
        )
        .await
    }

    async fn own_post_ids(&self, user_id: i64) -> Result<BTreeSet<i64>> {
        self.ids(
            "SELECT id::bigint FROM blogs_post WHERE owner_id = $1",
            user_id,
        )
        .await
    }

    async fn uninteresting_post_ids(&self, user_id: i64) -> Result<BTreeSet<i64>> {
        self.ids(
            "SELECT post_id::bigint FROM blogs_uninterestingpost WHERE user_id = $1",
            user_id,
        )
        .await
    }

    async fn random_users(&self, exclude: &BTreeSet<i64>, limit: usize) -> Result<Vec<i64>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT id::bigint FROM users_user
            WHERE is_active AND NOT (id = ANY($1))
            ORDER BY random()
            LIMIT $2
            "#,
        )
        .bind(to_vec(exclude))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn random_posts(
        &self,
        exclude_owners: &BTreeSet<i64>,
        exclude_posts: &BTreeSet<i64>,
        limit: usize,
    ) -> Result<Vec<ContentDescriptor>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let sql = format!(
            r#"
            SELECT {columns}
            FROM blogs_post p
            WHERE NOT p.archived
              AND NOT (p.owner_id = ANY($1))
              AND NOT (p.id = ANY($2))
            ORDER BY random()
            LIMIT $3
            "#,
            columns = POST_DESCRIPTOR_COLUMNS,
        );
        let records: Vec<PostRecord> = sqlx::query_as(&sql)
            .bind(to_vec(exclude_owners))
            .bind(to_vec(exclude_posts))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(records.into_iter().map(Into::into).collect())
    }

    async fn describe_posts(&self, post_ids: &BTreeSet<i64>) -> Result<Vec<ContentDescriptor>> {
        if post_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {columns} FROM blogs_post p WHERE p.id = ANY($1) ORDER BY p.id",
            columns = POST_DESCRIPTOR_COLUMNS,
        );
        let records: Vec<PostRecord> = sqlx::query_as(&sql)
            .bind(to_vec(post_ids))
            .fetch_all(&self.pool)
            .await?;
        Ok(records.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_query_uses_relation_columns() {
        let relation = SignalKind::Comments.relation().unwrap();
        let sql = content_query(relation.table, relation.actor_column);
        assert!(sql.contains("FROM blogs_comment r"));
        assert!(sql.contains("r.owner_id = c.id"));
        assert!(!sql.contains("{table}"));
    }

    #[test]
    fn test_post_record_drops_blank_fields() {
        let d: ContentDescriptor = PostRecord {
            id: 1,
            file: Some(String::new()),
            description: Some("   ".to_string()),
        }
        .into();
        assert_eq!(d, ContentDescriptor::new(1));
    }
}
