//! Recommendation metrics and timing
//!
//! Counter names are stable; dashboards key on them.

use std::time::Instant;

use super::signals::SignalKind;
use super::store::RecommendationKind;
use crate::config::FailurePolicy;

pub const RECOMMENDATIONS_GENERATED: &str = "recommendations_generated_total";
pub const SIGNAL_SKIPPED: &str = "recommendation_signal_skipped_total";
pub const BACKFILL: &str = "recommendation_backfill_total";
pub const DEDUP_FALLBACK: &str = "dedup_fallback_total";
pub const JOBS: &str = "recommendation_jobs_total";
pub const DURATION_MS: &str = "recommendation_duration_ms";

/// Final outcome of a queued job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed,
    Retried,
    Abandoned,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Completed => "completed",
            JobOutcome::Failed => "failed",
            JobOutcome::Retried => "retried",
            JobOutcome::Abandoned => "abandoned",
        }
    }
}

pub fn record_generated(kind: RecommendationKind, count: usize) {
    ::metrics::counter!(RECOMMENDATIONS_GENERATED, "kind" => kind.as_str()).increment(count as u64);
}

pub fn record_signal_skipped(signal: SignalKind) {
    ::metrics::counter!(SIGNAL_SKIPPED, "signal" => signal.as_str()).increment(1);
}

pub fn record_backfill(kind: RecommendationKind, count: usize) {
    ::metrics::counter!(BACKFILL, "kind" => kind.as_str()).increment(count as u64);
}

pub fn record_dedup_fallback(policy: FailurePolicy) {
    ::metrics::counter!(DEDUP_FALLBACK, "policy" => policy.as_str()).increment(1);
}

pub fn record_job(outcome: JobOutcome) {
    ::metrics::counter!(JOBS, "outcome" => outcome.as_str()).increment(1);
}

/// Performance timer for tracking operation duration
pub struct PerformanceTimer {
    start: Instant,
    label: &'static str,
}

impl PerformanceTimer {
    pub fn new(label: &'static str) -> Self {
        Self {
            start: Instant::now(),
            label,
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn log_if_slow(&self, threshold_ms: u64) {
        let elapsed = self.elapsed_ms();
        if elapsed > threshold_ms {
            tracing::warn!(
                "⚠️ Slow operation: {} took {}ms (threshold: {}ms)",
                self.label,
                elapsed,
                threshold_ms
            );
        }
    }
}

impl Drop for PerformanceTimer {
    fn drop(&mut self) {
        let elapsed = self.elapsed_ms();
        ::metrics::histogram!(DURATION_MS, "operation" => self.label).record(elapsed as f64);
        tracing::debug!("⏱️ {} completed in {}ms", self.label, elapsed);
    }
}
