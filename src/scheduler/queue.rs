//! SQLite-backed job queue.
//!
//! [`JobQueue`] is the operator-facing facade over the durable store. It
//! owns no state of its own: every call reads or writes the database file, so
//! any number of processes can hold a `JobQueue` on the same path.
//!
//! # Lifecycle
//!
//! ```text
//! enqueue ──▶ pending ──claim──▶ processing ──▶ completed
//!               ▲                    │
//!               └──── retry ◀────────┤
//!                                    └──▶ dead ──replay──▶ pending
//! ```

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use super::executor::ExecutionOutcome;
use super::job::{DeadLetterRecord, Job, JobDescriptor, JobState, WorkerRecord};
use super::retry::{RetryPolicy, Transition};
use crate::config::ConfigStore;
use crate::error::{ConfigError, ValidationError};
use crate::storage::{Database, DatabaseError, JobFilter};

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The descriptor was rejected before touching the store.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A job with this id already exists.
    #[error("Job '{0}' already exists")]
    DuplicateJob(String),

    /// No dead letter record exists for this id.
    #[error("No dead letter job with id '{0}'")]
    NotFound(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(DatabaseError),
}

impl From<DatabaseError> for QueueError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::DuplicateJob(id) => QueueError::DuplicateJob(id),
            other => QueueError::Database(other),
        }
    }
}

/// Snapshot of queue health for `status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub dead: u64,
    pub dead_letters: u64,
    pub workers: Vec<WorkerRecord>,
}

impl StatusReport {
    pub fn total_jobs(&self) -> u64 {
        self.pending + self.processing + self.completed + self.dead
    }

    pub fn count(&self, state: JobState) -> u64 {
        match state {
            JobState::Pending => self.pending,
            JobState::Processing => self.processing,
            JobState::Completed => self.completed,
            JobState::Dead => self.dead,
        }
    }
}

/// Durable job queue shared by producers, workers and operators.
#[derive(Debug, Clone)]
pub struct JobQueue {
    db: Database,
    config: ConfigStore,
}

impl JobQueue {
    pub fn new(db: Database) -> Self {
        let config = ConfigStore::new(db.clone());
        Self { db, config }
    }

    /// Creates the database file if needed, applies the schema and seeds
    /// default config values. Safe to run on an existing store.
    pub async fn initialize(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let db = Database::create(path).await?;
        let queue = Self::new(db);
        queue.config.seed_defaults().await?;
        tracing::info!(path = %queue.db.path().display(), "Queue initialized");
        Ok(queue)
    }

    /// Opens an existing, initialized store.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let db = Database::open(path).await?;
        Ok(Self::new(db))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    /// Validates a descriptor and inserts it as a pending job.
    ///
    /// A missing `max_retries` takes the current configured default.
    pub async fn enqueue(&self, descriptor: JobDescriptor) -> Result<Job, QueueError> {
        let default_max_retries = self.config.max_retries().await?;
        let job = Job::from_descriptor(descriptor, default_max_retries)?;
        self.db.insert_job(&job).await?;

        tracing::info!(
            job_id = %job.id,
            max_retries = job.max_retries,
            next_run_at = %job.next_run_at,
            "Job enqueued"
        );
        Ok(job)
    }

    /// Claims the oldest due pending job for `worker_id`.
    pub async fn claim(&self, worker_id: &str) -> Result<Option<Job>, QueueError> {
        Ok(self.db.claim_next(worker_id, Utc::now()).await?)
    }

    /// Applies the retry policy to an execution outcome and persists the
    /// resulting transition. The backoff base is read fresh from config.
    pub async fn record_outcome(
        &self,
        job: &Job,
        worker_id: &str,
        outcome: &ExecutionOutcome,
    ) -> Result<Transition, QueueError> {
        let policy = RetryPolicy::new(self.config.backoff_base().await?);
        let now = Utc::now();
        let transition = policy.decide(job, outcome, now);
        self.apply(job, worker_id, &transition, now).await?;
        Ok(transition)
    }

    /// Returns a claimed job to pending without touching config and without
    /// counting an attempt. Used when an outcome could not be persisted.
    pub async fn release(&self, job: &Job, worker_id: &str, error: &str) -> Result<(), QueueError> {
        let now = Utc::now();
        self.db
            .reschedule(
                &job.id,
                worker_id,
                job.attempts,
                job.next_run_at.max(now),
                error,
                now,
            )
            .await?;
        Ok(())
    }

    async fn apply(
        &self,
        job: &Job,
        worker_id: &str,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        match transition {
            Transition::Complete => {
                self.db.mark_completed(&job.id, worker_id, now).await?;
            }
            Transition::Retry {
                attempts,
                next_run_at,
                error,
            } => {
                self.db
                    .reschedule(&job.id, worker_id, *attempts, *next_run_at, error, now)
                    .await?;
            }
            Transition::Bury { attempts, error } => {
                self.db
                    .bury(&job.id, worker_id, *attempts, error, now)
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Job>, QueueError> {
        Ok(self.db.get_job(id).await?)
    }

    pub async fn list(&self, state: Option<JobState>) -> Result<Vec<Job>, QueueError> {
        let filter = JobFilter { state };
        Ok(self.db.list_jobs(&filter).await?)
    }

    pub async fn status(&self) -> Result<StatusReport, QueueError> {
        let counts = self.db.count_jobs_by_state().await?;
        let count = |state: JobState| counts.get(&state).copied().unwrap_or(0);

        Ok(StatusReport {
            pending: count(JobState::Pending),
            processing: count(JobState::Processing),
            completed: count(JobState::Completed),
            dead: count(JobState::Dead),
            dead_letters: self.db.count_dead_letters().await?,
            workers: self.db.list_workers().await?,
        })
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetterRecord>, QueueError> {
        Ok(self.db.list_dead_letters().await?)
    }

    /// Moves a dead-lettered job back to pending with a fresh attempt budget.
    pub async fn replay(&self, id: &str) -> Result<Job, QueueError> {
        match self.db.replay_dead_letter(id, Utc::now()).await {
            Ok(job) => {
                tracing::info!(job_id = %job.id, "Dead letter job replayed");
                Ok(job)
            }
            Err(DatabaseError::NotFound(_)) => Err(QueueError::NotFound(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Asks every running worker to stop after its current iteration.
    pub async fn stop_workers(&self) -> Result<u64, QueueError> {
        let signaled = self.db.request_stop_all().await?;
        tracing::info!(workers = signaled, "Stop requested");
        Ok(signaled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigKey;

    async fn temp_queue() -> (tempfile::TempDir, JobQueue) {
        let dir = tempfile::tempdir().unwrap();
        let queue = JobQueue::initialize(dir.path().join("queue.db")).await.unwrap();
        (dir, queue)
    }

    fn descriptor(json: &str) -> JobDescriptor {
        JobDescriptor::parse(json).unwrap()
    }

    #[tokio::test]
    async fn test_initialize_twice_keeps_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");

        let queue = JobQueue::initialize(&path).await.unwrap();
        queue.config().set(ConfigKey::MaxRetries, "7").await.unwrap();

        let queue = JobQueue::initialize(&path).await.unwrap();
        assert_eq!(queue.config().max_retries().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_open_uninitialized_store_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = JobQueue::open(dir.path().join("nope.db")).await.unwrap_err();
        assert!(matches!(
            err,
            QueueError::Database(DatabaseError::ConnectionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_enqueue_uses_configured_default() {
        let (_dir, queue) = temp_queue().await;
        queue.config().set(ConfigKey::MaxRetries, "5").await.unwrap();

        let job = queue
            .enqueue(descriptor(r#"{"id":"j1","command":"true"}"#))
            .await
            .unwrap();
        assert_eq!(job.max_retries, 5);
    }

    #[tokio::test]
    async fn test_enqueue_duplicate_is_reported() {
        let (_dir, queue) = temp_queue().await;
        queue
            .enqueue(descriptor(r#"{"id":"j1","command":"true"}"#))
            .await
            .unwrap();

        let err = queue
            .enqueue(descriptor(r#"{"id":"j1","command":"false"}"#))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::DuplicateJob(ref id) if id == "j1"));
        assert_eq!(queue.list(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_descriptor_writes_nothing() {
        let (_dir, queue) = temp_queue().await;
        let err = queue
            .enqueue(descriptor(r#"{"id":"j1"}"#))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
        assert!(queue.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_record_outcome_retries_then_buries() {
        let (_dir, queue) = temp_queue().await;
        queue
            .enqueue(descriptor(r#"{"id":"j1","command":"false","max_retries":2}"#))
            .await
            .unwrap();
        let failure = ExecutionOutcome::Failure {
            error: "Exit code 1".to_string(),
        };

        let job = queue.claim("w-1").await.unwrap().unwrap();
        let transition = queue.record_outcome(&job, "w-1", &failure).await.unwrap();
        assert!(matches!(transition, Transition::Retry { attempts: 1, .. }));

        // Not due yet because of the backoff.
        assert!(queue.claim("w-1").await.unwrap().is_none());

        // Force it due and fail it again.
        let mut job = queue.get("j1").await.unwrap().unwrap();
        job.state = JobState::Processing;
        job.worker_id = Some("w-1".to_string());
        sqlx::query("UPDATE jobs SET state = 'processing', worker_id = 'w-1' WHERE id = 'j1'")
            .execute(queue.database().pool())
            .await
            .unwrap();

        let transition = queue.record_outcome(&job, "w-1", &failure).await.unwrap();
        assert!(matches!(transition, Transition::Bury { attempts: 2, .. }));

        let status = queue.status().await.unwrap();
        assert_eq!(status.dead, 1);
        assert_eq!(status.dead_letters, 1);
        assert_eq!(status.total_jobs(), 1);
    }

    #[tokio::test]
    async fn test_replay_unknown_id() {
        let (_dir, queue) = temp_queue().await;
        let err = queue.replay("ghost").await.unwrap_err();
        assert!(matches!(err, QueueError::NotFound(ref id) if id == "ghost"));
    }

    #[tokio::test]
    async fn test_status_lists_workers() {
        let (_dir, queue) = temp_queue().await;
        queue
            .database()
            .register_worker(&WorkerRecord::new("w-1"))
            .await
            .unwrap();

        let status = queue.status().await.unwrap();
        assert_eq!(status.workers.len(), 1);
        assert_eq!(status.count(JobState::Pending), 0);
        assert_eq!(queue.stop_workers().await.unwrap(), 1);
    }
}
