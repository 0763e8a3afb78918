//! Recommendation job queue
//!
//! Domain events become jobs on a bounded in-process queue. A worker pool
//! runs them with explicit concurrency control. Batch recomputations take
//! the global batch lock first; a job that finds the lock held is requeued
//! after a fixed delay and abandoned once its retries run out.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::engine::Recommender;
use super::lock::BatchLock;
use super::metrics::{self, JobOutcome};
use crate::config::WorkerConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum Job {
    /// Recompute exactly these users, as one batch
    Recompute { user_ids: Vec<i64> },
    /// Recompute the user and everyone following them
    RecomputeNetwork { user_id: i64 },
    /// Recompute the two-hop audience of a post owner
    RecomputeAudience { owner_id: i64 },
    /// Prune near-duplicates of a post the user marked uninteresting, then recompute the user
    PruneSimilar { user_id: i64, post_id: i64 },
    /// Remove a deleted post from its two-hop audience's recommendations
    ForgetPost { owner_id: i64, post_id: i64 },
    /// Append to the user's view log
    RecordView { user_id: i64, post_id: i64 },
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Job::Recompute { .. } => "recompute",
            Job::RecomputeNetwork { .. } => "recompute_network",
            Job::RecomputeAudience { .. } => "recompute_audience",
            Job::PruneSimilar { .. } => "prune_similar",
            Job::ForgetPost { .. } => "forget_post",
            Job::RecordView { .. } => "record_view",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedJob {
    pub id: Uuid,
    pub job: Job,
    /// Lock retries already spent
    pub attempt: u32,
}

impl QueuedJob {
    pub fn new(job: Job) -> Self {
        Self {
            id: Uuid::new_v4(),
            job,
            attempt: 0,
        }
    }

    fn retry(&self, job: Job) -> Self {
        Self {
            id: self.id,
            job,
            attempt: self.attempt + 1,
        }
    }
}

/// Submission handle; cheap to clone.
#[derive(Clone)]
pub struct JobQueue {
    sender: mpsc::Sender<QueuedJob>,
}

impl JobQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<QueuedJob>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Enqueue without waiting for the job to run.
    pub async fn submit(&self, job: Job) -> Result<Uuid> {
        self.enqueue(QueuedJob::new(job)).await
    }

    /// Inbound trigger: recompute a batch of users.
    pub async fn recompute(&self, user_ids: Vec<i64>) -> Result<Uuid> {
        self.submit(Job::Recompute { user_ids }).await
    }

    async fn enqueue(&self, queued: QueuedJob) -> Result<Uuid> {
        let id = queued.id;
        self.sender
            .send(queued)
            .await
            .map_err(|_| Error::internal(QueueClosed))?;
        Ok(id)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("job queue is closed")]
struct QueueClosed;

/// Runs single jobs; shared by every worker task.
#[derive(Clone)]
pub struct Worker {
    recommender: Recommender,
    lock: Arc<dyn BatchLock>,
    queue: JobQueue,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        recommender: Recommender,
        lock: Arc<dyn BatchLock>,
        queue: JobQueue,
        config: WorkerConfig,
    ) -> Self {
        Self {
            recommender,
            lock,
            queue,
            config,
        }
    }

    /// Run one job to its outcome for this attempt.
    #[instrument(skip(self, queued), fields(job_id = %queued.id, job = queued.job.name(), attempt = queued.attempt))]
    pub async fn process(&self, queued: QueuedJob) -> JobOutcome {
        let outcome = match self.run(&queued).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if e.is_error_level() {
                    error!(error_code = e.error_code(), "Job failed: {}", e);
                } else {
                    warn!(error_code = e.error_code(), "Job failed: {}", e);
                }
                JobOutcome::Failed
            }
        };
        metrics::record_job(outcome);
        outcome
    }

    async fn run(&self, queued: &QueuedJob) -> Result<JobOutcome> {
        let source = self.recommender.source();

        let batch: BTreeSet<i64> = match &queued.job {
            Job::Recompute { user_ids } => user_ids.iter().copied().collect(),
            Job::RecomputeNetwork { user_id } => {
                let mut users = source.follower_ids(*user_id).await?;
                users.insert(*user_id);
                users
            }
            Job::RecomputeAudience { owner_id } => source.two_hop_audience(*owner_id).await?,
            Job::PruneSimilar { user_id, post_id } => {
                self.recommender.prune_similar(*user_id, *post_id).await?;
                BTreeSet::from([*user_id])
            }
            Job::ForgetPost { owner_id, post_id } => {
                let audience = source.two_hop_audience(*owner_id).await?;
                self.recommender.forget_post(*post_id, &audience).await?;
                return Ok(JobOutcome::Completed);
            }
            Job::RecordView { user_id, post_id } => {
                self.recommender.record_view(*user_id, *post_id).await?;
                return Ok(JobOutcome::Completed);
            }
        };

        if batch.is_empty() {
            debug!("Nobody to recompute");
            return Ok(JobOutcome::Completed);
        }

        self.recompute_locked(queued, batch).await
    }

    async fn recompute_locked(&self, queued: &QueuedJob, batch: BTreeSet<i64>) -> Result<JobOutcome> {
        let Some(token) = self.lock.try_acquire().await? else {
            let contention = Error::LockContention {
                key: self.config.lock_key.clone(),
            };
            // Retries carry the resolved batch so earlier steps don't rerun
            let retry = queued.retry(Job::Recompute {
                user_ids: batch.into_iter().collect(),
            });
            return Ok(self.requeue(retry, contention));
        };

        let mut failures = 0usize;
        for user_id in &batch {
            if let Err(e) = self.recommender.generate_recommendations(*user_id).await {
                failures += 1;
                error!(
                    user_id,
                    error_code = e.error_code(),
                    "Recomputation failed: {}",
                    e
                );
            }
        }

        if let Err(e) = self.lock.release(token).await {
            warn!("Failed to release batch lock: {}", e);
        }

        if failures > 0 {
            warn!("{}/{} users failed in batch", failures, batch.len());
            Ok(JobOutcome::Failed)
        } else {
            Ok(JobOutcome::Completed)
        }
    }

    /// Schedule a retry after the fixed delay, or give up.
    fn requeue(&self, retry: QueuedJob, contention: Error) -> JobOutcome {
        if retry.attempt > self.config.max_retries {
            error!(
                error_code = contention.error_code(),
                "Abandoning job after {} retries: {}",
                self.config.max_retries,
                contention
            );
            return JobOutcome::Abandoned;
        }

        warn!(
            "{}, retrying in {:?} ({}/{})",
            contention, self.config.retry_delay, retry.attempt, self.config.max_retries
        );
        let queue = self.queue.clone();
        let delay = self.config.retry_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = queue.enqueue(retry).await {
                warn!("Dropping retry: {}", e);
            }
        });
        JobOutcome::Retried
    }
}

/// Spawn the worker pool. Returns the submission handle and the pool task,
/// which ends after `shutdown` fires and in-flight jobs finish.
pub fn spawn_workers(
    recommender: Recommender,
    lock: Arc<dyn BatchLock>,
    config: WorkerConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> (JobQueue, tokio::task::JoinHandle<Result<()>>) {
    let (queue, mut receiver) = JobQueue::new(config.queue_capacity);
    let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
    let worker = Worker::new(recommender, lock, queue.clone(), config);

    let handle = tokio::spawn(async move {
        info!("🧵 Recommendation workers started");
        let mut set = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Workers received shutdown signal");
                    break;
                }
                Some(res) = set.join_next(), if !set.is_empty() => {
                    if let Err(e) = res {
                        error!("Worker task join error: {}", e);
                    }
                }
                // A free slot first, then a job; shutdown stays visible while all slots are busy
                permit = semaphore.clone().acquire_owned() => {
                    let permit = permit.map_err(Error::internal)?;
                    tokio::select! {
                        _ = shutdown.recv() => {
                            info!("Workers received shutdown signal");
                            break;
                        }
                        maybe = receiver.recv() => {
                            let Some(queued) = maybe else { break };
                            let worker = worker.clone();
                            set.spawn(async move {
                                let _permit = permit;
                                worker.process(queued).await
                            });
                        }
                    }
                }
            }
        }

        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                error!("Worker task join error: {}", e);
            }
        }
        info!("Recommendation workers stopped");
        Ok(())
    });

    (queue, handle)
}
