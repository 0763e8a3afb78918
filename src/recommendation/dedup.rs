//! Near-duplicate content filter
//!
//! An opaque scoring oracle: given a reference batch and a candidate batch
//! of posts, return the candidate ids too similar to anything in the
//! reference batch. A pair is a duplicate when its image score or its text
//! score exceeds the threshold.
//!
//! Three implementations:
//! - [`LocalDedupFilter`]: a precomputed image-similarity table plus
//!   lexical overlap of descriptions, scored in-process on rayon
//! - [`HttpDedupFilter`]: delegates to a remote scoring service
//! - [`GuardedDedupFilter`]: wraps either with a timeout and a failure policy

use async_trait::async_trait;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::metrics;
use crate::config::{DedupConfig, DedupMode, FailurePolicy};
use crate::error::{Error, Result};

/// The oracle's view of a post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentDescriptor {
    pub id: i64,
    /// Media file path of the post's first image
    pub image_ref: Option<String>,
    pub description: Option<String>,
}

impl ContentDescriptor {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            image_ref: None,
            description: None,
        }
    }

    pub fn with_image(mut self, image_ref: impl Into<String>) -> Self {
        self.image_ref = Some(image_ref.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// File name without directories or extension; the image table key.
    pub fn image_key(&self) -> Option<&str> {
        let image = self.image_ref.as_deref()?;
        Path::new(image).file_stem().and_then(|s| s.to_str())
    }
}

#[async_trait]
pub trait DedupFilter: Send + Sync {
    /// Ids from `candidates` that near-duplicate something in `reference`.
    async fn score_similarity(
        &self,
        reference: &[ContentDescriptor],
        candidates: &[ContentDescriptor],
    ) -> Result<BTreeSet<i64>>;
}

/// Build the oracle selected by configuration, guarded by its timeout and policy.
pub fn from_config(config: &DedupConfig) -> Result<Arc<dyn DedupFilter>> {
    let inner: Arc<dyn DedupFilter> = match config.mode {
        DedupMode::Local => match &config.image_table_path {
            Some(path) => Arc::new(LocalDedupFilter::from_path(path, config.threshold)?),
            None => Arc::new(LocalDedupFilter::new(ImageSimilarityTable::default(), config.threshold)),
        },
        DedupMode::Remote => {
            let endpoint = config
                .endpoint
                .clone()
                .ok_or_else(|| Error::config("remote dedup mode requires DEDUP_ENDPOINT"))?;
            Arc::new(HttpDedupFilter::new(endpoint, config.threshold, config.timeout)?)
        }
    };

    Ok(Arc::new(GuardedDedupFilter::new(
        inner,
        config.timeout,
        config.failure_policy,
    )))
}

// ============================================================================
// Local oracle
// ============================================================================

/// Pairwise image similarity keyed by file stem, as produced offline by the
/// image embedding job: `{"a": {"a": 1.0, "b": 0.8}, "b": {...}}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageSimilarityTable(HashMap<String, HashMap<String, f32>>);

impl ImageSimilarityTable {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn insert(&mut self, a: &str, b: &str, score: f32) {
        self.0
            .entry(a.to_string())
            .or_default()
            .insert(b.to_string(), score);
        self.0
            .entry(b.to_string())
            .or_default()
            .insert(a.to_string(), score);
    }

    pub fn score(&self, a: &str, b: &str) -> Option<f32> {
        self.0.get(a).and_then(|row| row.get(b)).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Binary bag-of-words cosine similarity of two descriptions.
pub fn description_similarity(a: &str, b: &str) -> f32 {
    let words = |text: &str| -> HashSet<String> {
        text.split_whitespace().map(|w| w.to_lowercase()).collect()
    };
    let (a, b) = (words(a), words(b));
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let shared = a.intersection(&b).count() as f32;
    shared / ((a.len() * b.len()) as f32).sqrt()
}

pub struct LocalDedupFilter {
    images: Arc<ImageSimilarityTable>,
    threshold: f32,
}

impl LocalDedupFilter {
    pub fn new(images: ImageSimilarityTable, threshold: f32) -> Self {
        Self {
            images: Arc::new(images),
            threshold,
        }
    }

    pub fn from_path(path: impl AsRef<Path>, threshold: f32) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| Error::Config {
            message: format!("cannot read image table {}", path.display()).into(),
            source: Some(Box::new(e)),
        })?;
        let images = ImageSimilarityTable::from_json(&json)?;
        debug!("Loaded image similarity table with {} entries", images.len());
        Ok(Self::new(images, threshold))
    }

    fn is_duplicate(
        images: &ImageSimilarityTable,
        threshold: f32,
        a: &ContentDescriptor,
        b: &ContentDescriptor,
    ) -> bool {
        let image = match (a.image_key(), b.image_key()) {
            (Some(x), Some(y)) if x == y => 1.0,
            (Some(x), Some(y)) => images.score(x, y).unwrap_or(0.0),
            _ => 0.0,
        };
        if image > threshold {
            return true;
        }

        let text = match (&a.description, &b.description) {
            (Some(x), Some(y)) => description_similarity(x, y),
            _ => 0.0,
        };
        text > threshold
    }
}

#[async_trait]
impl DedupFilter for LocalDedupFilter {
    #[instrument(skip_all, fields(reference = reference.len(), candidates = candidates.len()))]
    async fn score_similarity(
        &self,
        reference: &[ContentDescriptor],
        candidates: &[ContentDescriptor],
    ) -> Result<BTreeSet<i64>> {
        let images = self.images.clone();
        let threshold = self.threshold;
        let reference = reference.to_vec();
        let candidates = candidates.to_vec();

        let duplicates = tokio::task::spawn_blocking(move || {
            candidates
                .par_iter()
                .filter(|c| {
                    reference
                        .iter()
                        .any(|r| Self::is_duplicate(&images, threshold, r, c))
                })
                .map(|c| c.id)
                .collect::<BTreeSet<i64>>()
        })
        .await?;

        Ok(duplicates)
    }
}

// ============================================================================
// Remote oracle
// ============================================================================

#[derive(Debug, Serialize)]
struct SimilarityRequest<'a> {
    reference: &'a [ContentDescriptor],
    candidates: &'a [ContentDescriptor],
    threshold: f32,
}

#[derive(Debug, Deserialize)]
struct SimilarityResponse {
    duplicates: Vec<i64>,
}

/// Scores batches through `POST {endpoint}/v1/similarity`.
pub struct HttpDedupFilter {
    client: reqwest::Client,
    endpoint: String,
    threshold: f32,
}

impl HttpDedupFilter {
    pub fn new(endpoint: impl Into<String>, threshold: f32, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(oracle_error)?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            threshold,
        })
    }
}

fn oracle_error(err: reqwest::Error) -> Error {
    Error::ScoringOracle {
        message: err.to_string().into(),
        source: Some(Box::new(err)),
    }
}

#[async_trait]
impl DedupFilter for HttpDedupFilter {
    #[instrument(skip_all, fields(reference = reference.len(), candidates = candidates.len()))]
    async fn score_similarity(
        &self,
        reference: &[ContentDescriptor],
        candidates: &[ContentDescriptor],
    ) -> Result<BTreeSet<i64>> {
        let url = format!("{}/v1/similarity", self.endpoint);
        let response = self
            .client
            .post(&url)
            .json(&SimilarityRequest {
                reference,
                candidates,
                threshold: self.threshold,
            })
            .send()
            .await
            .map_err(oracle_error)?
            .error_for_status()
            .map_err(oracle_error)?;

        let body: SimilarityResponse = response.json().await.map_err(oracle_error)?;

        // Only ids that were actually offered as candidates count.
        let offered: HashSet<i64> = candidates.iter().map(|c| c.id).collect();
        Ok(body
            .duplicates
            .into_iter()
            .filter(|id| offered.contains(id))
            .collect())
    }
}

// ============================================================================
// Timeout and failure policy
// ============================================================================

pub struct GuardedDedupFilter {
    inner: Arc<dyn DedupFilter>,
    timeout: Duration,
    policy: FailurePolicy,
}

impl GuardedDedupFilter {
    pub fn new(inner: Arc<dyn DedupFilter>, timeout: Duration, policy: FailurePolicy) -> Self {
        Self {
            inner,
            timeout,
            policy,
        }
    }

    fn fallback(&self, err: Error) -> Result<BTreeSet<i64>> {
        match self.policy {
            FailurePolicy::Open => {
                warn!(
                    error_code = err.error_code(),
                    "Scoring oracle failed, treating as no duplicates: {}", err
                );
                metrics::record_dedup_fallback(self.policy);
                Ok(BTreeSet::new())
            }
            FailurePolicy::Closed => Err(err),
        }
    }
}

#[async_trait]
impl DedupFilter for GuardedDedupFilter {
    async fn score_similarity(
        &self,
        reference: &[ContentDescriptor],
        candidates: &[ContentDescriptor],
    ) -> Result<BTreeSet<i64>> {
        if reference.is_empty() || candidates.is_empty() {
            return Ok(BTreeSet::new());
        }

        match tokio::time::timeout(self.timeout, self.inner.score_similarity(reference, candidates))
            .await
        {
            Ok(Ok(duplicates)) => Ok(duplicates),
            Ok(Err(err)) => self.fallback(err),
            Err(_) => self.fallback(Error::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn post(id: i64, image: &str, description: &str) -> ContentDescriptor {
        ContentDescriptor::new(id)
            .with_image(format!("posts/2024/05/01/{}.jpg", image))
            .with_description(description)
    }

    struct FailingFilter(AtomicUsize);

    #[async_trait]
    impl DedupFilter for FailingFilter {
        async fn score_similarity(
            &self,
            _: &[ContentDescriptor],
            _: &[ContentDescriptor],
        ) -> Result<BTreeSet<i64>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(Error::oracle("model not loaded"))
        }
    }

    struct SlowFilter;

    #[async_trait]
    impl DedupFilter for SlowFilter {
        async fn score_similarity(
            &self,
            _: &[ContentDescriptor],
            candidates: &[ContentDescriptor],
        ) -> Result<BTreeSet<i64>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(candidates.iter().map(|c| c.id).collect())
        }
    }

    #[test]
    fn test_description_similarity() {
        assert_eq!(description_similarity("Sunset at the beach", "sunset AT the BEACH"), 1.0);
        assert_eq!(description_similarity("cats", "dogs"), 0.0);
        assert_eq!(description_similarity("", "dogs"), 0.0);
        let partial = description_similarity("red car", "red bike");
        assert!((partial - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_image_key_strips_directories_and_extension() {
        let d = post(1, "abc123", "");
        assert_eq!(d.image_key(), Some("abc123"));
        assert_eq!(ContentDescriptor::new(2).image_key(), None);
    }

    #[tokio::test]
    async fn test_local_image_channel() {
        let mut images = ImageSimilarityTable::default();
        images.insert("mountain", "mountain_copy", 0.8);
        images.insert("mountain", "ocean", 0.2);
        let filter = LocalDedupFilter::new(images, 0.75);

        let reference = vec![post(1, "mountain", "hiking trip")];
        let candidates = vec![post(2, "mountain_copy", "lunch"), post(3, "ocean", "swim")];

        let dupes = filter.score_similarity(&reference, &candidates).await.unwrap();
        assert_eq!(dupes, BTreeSet::from([2]));
    }

    #[tokio::test]
    async fn test_local_text_channel() {
        let filter = LocalDedupFilter::new(ImageSimilarityTable::default(), 0.75);
        let reference = vec![post(1, "a", "my new puppy playing in the park")];
        let candidates = vec![
            post(2, "b", "My new puppy playing in the park"),
            post(3, "c", "quarterly earnings report"),
        ];

        let dupes = filter.score_similarity(&reference, &candidates).await.unwrap();
        assert_eq!(dupes, BTreeSet::from([2]));
    }

    #[tokio::test]
    async fn test_local_same_image_is_duplicate_without_table_entry() {
        let filter = LocalDedupFilter::new(ImageSimilarityTable::default(), 0.75);
        let marked = ContentDescriptor::new(1).with_image("posts/a/sunset.jpg");
        let candidates = vec![
            ContentDescriptor::new(1).with_image("posts/a/sunset.jpg"),
            ContentDescriptor::new(2).with_image("posts/b/sunset.png"),
            ContentDescriptor::new(3).with_image("posts/b/beach.jpg"),
        ];

        let dupes = filter.score_similarity(&[marked], &candidates).await.unwrap();
        assert_eq!(dupes, BTreeSet::from([1, 2]));
    }

    #[tokio::test]
    async fn test_local_threshold_is_strict() {
        let mut images = ImageSimilarityTable::default();
        images.insert("x", "y", 0.75);
        let filter = LocalDedupFilter::new(images, 0.75);
        let dupes = filter
            .score_similarity(&[post(1, "x", "")], &[post(2, "y", "")])
            .await
            .unwrap();
        assert!(dupes.is_empty());
    }

    #[tokio::test]
    async fn test_local_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"a": {{"b": 0.9}}, "b": {{"a": 0.9}}}}"#).unwrap();

        let filter = LocalDedupFilter::from_path(file.path(), 0.75).unwrap();
        let dupes = filter
            .score_similarity(&[post(1, "a", "")], &[post(2, "b", "")])
            .await
            .unwrap();
        assert_eq!(dupes, BTreeSet::from([2]));
    }

    #[tokio::test]
    async fn test_http_filter() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/similarity"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "duplicates": [2, 99] })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let filter = HttpDedupFilter::new(server.uri(), 0.75, Duration::from_secs(2)).unwrap();
        let dupes = filter
            .score_similarity(&[post(1, "a", "x")], &[post(2, "b", "y"), post(3, "c", "z")])
            .await
            .unwrap();

        // 99 was never offered
        assert_eq!(dupes, BTreeSet::from([2]));
    }

    #[tokio::test]
    async fn test_http_filter_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/similarity"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let filter = HttpDedupFilter::new(server.uri(), 0.75, Duration::from_secs(2)).unwrap();
        let err = filter
            .score_similarity(&[post(1, "a", "x")], &[post(2, "b", "y")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ScoringOracle { .. }));
    }

    #[tokio::test]
    async fn test_guard_fail_open() {
        let inner = Arc::new(FailingFilter(AtomicUsize::new(0)));
        let guard = GuardedDedupFilter::new(inner.clone(), Duration::from_secs(1), FailurePolicy::Open);

        let dupes = guard
            .score_similarity(&[post(1, "a", "")], &[post(2, "b", "")])
            .await
            .unwrap();
        assert!(dupes.is_empty());
        assert_eq!(inner.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_guard_fail_closed() {
        let inner = Arc::new(FailingFilter(AtomicUsize::new(0)));
        let guard = GuardedDedupFilter::new(inner, Duration::from_secs(1), FailurePolicy::Closed);

        let err = guard
            .score_similarity(&[post(1, "a", "")], &[post(2, "b", "")])
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "SCORING_ORACLE_FAILURE");
    }

    #[tokio::test]
    async fn test_guard_timeout() {
        let guard = GuardedDedupFilter::new(
            Arc::new(SlowFilter),
            Duration::from_millis(20),
            FailurePolicy::Open,
        );
        let dupes = guard
            .score_similarity(&[post(1, "a", "")], &[post(2, "b", "")])
            .await
            .unwrap();
        assert!(dupes.is_empty());
    }

    #[tokio::test]
    async fn test_guard_timeout_fail_closed() {
        let guard = GuardedDedupFilter::new(
            Arc::new(SlowFilter),
            Duration::from_millis(20),
            FailurePolicy::Closed,
        );
        let err = guard
            .score_similarity(&[post(1, "a", "")], &[post(2, "b", "")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { timeout_ms: 20 }));
        assert_eq!(err.error_code(), "TIMEOUT");
    }

    #[tokio::test]
    async fn test_guard_skips_empty_batches() {
        let inner = Arc::new(FailingFilter(AtomicUsize::new(0)));
        let guard = GuardedDedupFilter::new(inner.clone(), Duration::from_secs(1), FailurePolicy::Closed);

        assert!(guard.score_similarity(&[], &[post(2, "b", "")]).await.unwrap().is_empty());
        assert!(guard.score_similarity(&[post(1, "a", "")], &[]).await.unwrap().is_empty());
        assert_eq!(inner.0.load(Ordering::SeqCst), 0);
    }
}
