//! Worker loop that drains the queue.
//!
//! A worker is a small state machine:
//!
//! ```text
//! Starting ──▶ Running ──▶ Stopping ──▶ Terminated
//!                 │ ▲
//!                 └─┘ claim, execute, suspend
//! ```
//!
//! [`WorkerLoop::step`] advances it by one transition and reports how long
//! the caller should suspend before the next one, so the loop can be driven
//! by tests without real delays. [`WorkerLoop::run`] drives it for real and
//! honours the shutdown channel during the suspension.
//!
//! Stop requests arrive through the worker registry (`desired_state`) and
//! are only observed between iterations; a job that is executing is never
//! interrupted by them.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::executor::{CommandExecutor, ExecutionOutcome, ShellExecutor};
use super::job::{DesiredState, Job, WorkerRecord};
use super::queue::{JobQueue, QueueError};
use super::retry::Transition;
use crate::error::ConfigError;
use crate::storage::DatabaseError;

/// Suspension used when the poll interval itself cannot be read.
const FALLBACK_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Tries made to record a job's outcome before releasing it.
const PERSIST_ATTEMPTS: u32 = 3;
const PERSIST_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Errors that can occur in a worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// A worker task panicked or was cancelled.
    #[error("Worker task failed: {0}")]
    Task(String),
}

/// Phase of a worker's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Starting,
    Running,
    Stopping,
    Terminated,
}

/// Result of one [`WorkerLoop::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    /// Phase after the step.
    pub phase: WorkerPhase,
    /// How long to wait before the next step, if at all.
    pub suspend: Option<Duration>,
}

/// Counters for the jobs one worker has processed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub completed: u64,
    pub retried: u64,
    pub dead: u64,
}

impl WorkerStats {
    pub fn total_processed(&self) -> u64 {
        self.completed + self.retried + self.dead
    }

    fn record(&mut self, transition: &Transition) {
        match transition {
            Transition::Complete => self.completed += 1,
            Transition::Retry { .. } => self.retried += 1,
            Transition::Bury { .. } => self.dead += 1,
        }
    }
}

/// Generates a process-scoped worker id such as `w-1a2b3c4d`.
pub fn generate_worker_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("w-{}", &uuid[..8])
}

/// One worker polling the shared queue.
pub struct WorkerLoop {
    id: String,
    queue: JobQueue,
    executor: Arc<dyn CommandExecutor>,
    phase: WorkerPhase,
    stats: WorkerStats,
}

impl WorkerLoop {
    /// Creates a worker that runs commands through the platform shell.
    pub fn new(queue: JobQueue) -> Self {
        Self::with_executor(queue, Arc::new(ShellExecutor::new()))
    }

    pub fn with_executor(queue: JobQueue, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            id: generate_worker_id(),
            queue,
            executor,
            phase: WorkerPhase::Starting,
            stats: WorkerStats::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn phase(&self) -> WorkerPhase {
        self.phase
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    /// Advances the state machine by one transition.
    ///
    /// Only a failure to register in `Starting` is returned as an error;
    /// store errors while running are logged and retried after the poll
    /// interval.
    pub async fn step(&mut self) -> Result<Step, WorkerError> {
        let step = match self.phase {
            WorkerPhase::Starting => {
                let record = WorkerRecord::new(self.id.clone());
                self.queue
                    .database()
                    .register_worker(&record)
                    .await
                    .map_err(QueueError::from)?;
                info!(worker_id = %self.id, pid = record.pid, "Worker started");
                Step {
                    phase: WorkerPhase::Running,
                    suspend: None,
                }
            }
            WorkerPhase::Running => self.run_iteration().await,
            WorkerPhase::Stopping => {
                self.deregister().await;
                info!(
                    worker_id = %self.id,
                    processed = self.stats.total_processed(),
                    "Worker stopped gracefully"
                );
                Step {
                    phase: WorkerPhase::Terminated,
                    suspend: None,
                }
            }
            WorkerPhase::Terminated => Step {
                phase: WorkerPhase::Terminated,
                suspend: None,
            },
        };

        self.phase = step.phase;
        Ok(step)
    }

    async fn run_iteration(&mut self) -> Step {
        let db = self.queue.database().clone();

        match db.worker_desired_state(&self.id).await {
            Ok(Some(DesiredState::Running)) => {}
            Ok(Some(DesiredState::Stopping)) | Ok(None) => {
                info!(worker_id = %self.id, "Stop requested, worker stopping");
                return Step {
                    phase: WorkerPhase::Stopping,
                    suspend: None,
                };
            }
            Err(e) => {
                warn!(worker_id = %self.id, error = %e, "Failed to read desired state");
                return self.suspend().await;
            }
        }

        if let Err(e) = db.heartbeat(&self.id, chrono::Utc::now()).await {
            warn!(worker_id = %self.id, error = %e, "Failed to record heartbeat");
        }

        if let Err(e) = self.process_next().await {
            error!(worker_id = %self.id, error = %e, "Worker iteration failed");
        }

        self.suspend().await
    }

    async fn suspend(&self) -> Step {
        let interval = match self.queue.config().poll_interval().await {
            Ok(interval) => interval,
            Err(e) => {
                warn!(worker_id = %self.id, error = %e, "Failed to read poll interval");
                FALLBACK_POLL_INTERVAL
            }
        };
        Step {
            phase: WorkerPhase::Running,
            suspend: Some(interval),
        }
    }

    /// Claims and executes at most one job.
    ///
    /// Returns the transition that was persisted, or `None` if nothing was due.
    pub async fn process_next(&mut self) -> Result<Option<Transition>, WorkerError> {
        // Read before claiming so nothing fallible sits between claim and execute.
        let timeout = self.queue.config().execution_timeout().await?;

        let Some(job) = self.queue.claim(&self.id).await? else {
            debug!(worker_id = %self.id, "No jobs available");
            return Ok(None);
        };

        info!(
            worker_id = %self.id,
            job_id = %job.id,
            command = %job.command,
            attempt = job.attempts + 1,
            "Processing job"
        );

        let outcome = self.executor.execute(&job.command, timeout).await;
        debug!(
            worker_id = %self.id,
            job_id = %job.id,
            success = outcome.is_success(),
            "Command finished"
        );

        let Some(transition) = self.persist_outcome(&job, &outcome).await? else {
            return Ok(None);
        };

        match (&transition, &outcome) {
            (Transition::Complete, ExecutionOutcome::Success { output }) => {
                info!(worker_id = %self.id, job_id = %job.id, output = %output, "Job completed successfully");
            }
            (Transition::Retry { next_run_at, error, .. }, _) => {
                warn!(
                    worker_id = %self.id,
                    job_id = %job.id,
                    error = %error,
                    next_run_at = %next_run_at,
                    remaining_attempts = job.remaining_attempts().saturating_sub(1),
                    "Job failed, retry scheduled"
                );
            }
            (Transition::Bury { attempts, error }, _) => {
                error!(
                    worker_id = %self.id,
                    job_id = %job.id,
                    attempts = attempts,
                    error = %error,
                    "Job moved to dead letter queue"
                );
            }
            (Transition::Complete, _) => {}
        }

        self.stats.record(&transition);
        Ok(Some(transition))
    }

    /// Records the outcome of a claimed job, retrying transient store errors.
    ///
    /// If the outcome still cannot be recorded the job is released back to
    /// pending so it is not stranded in `processing`, and the original error
    /// is returned. `Ok(None)` means another party owns the job now.
    async fn persist_outcome(
        &self,
        job: &Job,
        outcome: &ExecutionOutcome,
    ) -> Result<Option<Transition>, WorkerError> {
        let mut attempt = 1;
        let err = loop {
            match self.queue.record_outcome(job, &self.id, outcome).await {
                Ok(transition) => return Ok(Some(transition)),
                Err(QueueError::Database(DatabaseError::LostClaim { .. })) => {
                    warn!(
                        worker_id = %self.id,
                        job_id = %job.id,
                        "Job is no longer owned by this worker, outcome discarded"
                    );
                    return Ok(None);
                }
                Err(e) if attempt < PERSIST_ATTEMPTS => {
                    warn!(
                        worker_id = %self.id,
                        job_id = %job.id,
                        attempt = attempt,
                        error = %e,
                        "Failed to record job outcome, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(PERSIST_RETRY_DELAY).await;
                }
                Err(e) => break e,
            }
        };

        let reason = format!("Outcome could not be recorded: {}", err);
        match self.queue.release(job, &self.id, &reason).await {
            Ok(()) => warn!(
                worker_id = %self.id,
                job_id = %job.id,
                error = %err,
                "Job released back to pending"
            ),
            Err(release_err) => error!(
                worker_id = %self.id,
                job_id = %job.id,
                error = %release_err,
                "Failed to release job, it remains in processing"
            ),
        }
        Err(err.into())
    }

    async fn deregister(&self) {
        if let Err(e) = self.queue.database().deregister_worker(&self.id).await {
            error!(worker_id = %self.id, error = %e, "Failed to remove worker registration");
        }
    }

    /// Cleans up after an external interruption and terminates.
    pub async fn interrupt(&mut self) {
        self.deregister().await;
        self.phase = WorkerPhase::Terminated;
        info!(worker_id = %self.id, "Worker interrupted");
    }

    /// Drives the loop until it terminates or a shutdown signal arrives.
    pub async fn run(
        mut self,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<WorkerStats, WorkerError> {
        loop {
            match shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    self.interrupt().await;
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            let step = self.step().await?;
            if step.phase == WorkerPhase::Terminated {
                break;
            }

            if let Some(delay) = step.suspend {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.recv() => {
                        self.interrupt().await;
                        break;
                    }
                }
            }
        }

        Ok(self.stats)
    }
}

/// Runs `count` worker loops in the current process until they all stop.
///
/// Ctrl-C is forwarded to every loop as an interruption.
pub async fn run_workers(queue: JobQueue, count: usize) -> Result<Vec<WorkerStats>, WorkerError> {
    let (shutdown_tx, _) = broadcast::channel(1);

    let signal_tx = shutdown_tx.clone();
    let signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down workers");
            let _ = signal_tx.send(());
        }
    });

    let handles: Vec<_> = (0..count)
        .map(|_| {
            let worker = WorkerLoop::new(queue.clone());
            tokio::spawn(worker.run(shutdown_tx.subscribe()))
        })
        .collect();

    let results = futures::future::join_all(handles).await;
    signal_task.abort();

    let mut stats = Vec::with_capacity(count);
    for result in results {
        match result {
            Ok(outcome) => stats.push(outcome?),
            Err(e) => return Err(WorkerError::Task(e.to_string())),
        }
    }
    Ok(stats)
}
