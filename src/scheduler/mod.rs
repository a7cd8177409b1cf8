//! Job lifecycle, claim protocol and worker processes.
//!
//! This module provides everything that moves a job through its states:
//!
//! - **JobQueue**: SQLite-backed queue facade shared by producers, workers and operators
//! - **WorkerLoop**: Steppable polling loop that claims and executes one job per iteration
//! - **RetryPolicy**: Exponential backoff and dead-letter decision
//! - **CommandExecutor**: Runs a job's shell command with a timeout
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │   Operator   │
//!                      │    (CLI)     │
//!                      └──────┬───────┘
//!                             │
//!                      ┌──────▼───────┐
//!                      │    SQLite    │
//!                      │   queue.db   │
//!                      └──────┬───────┘
//!                             │
//!         ┌───────────────────┼───────────────────┐
//!         │                   │                   │
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └─────────┘         └─────────┘         └─────────┘
//! ```
//!
//! Workers may live in separate OS processes. The only coordination between
//! them is the atomic claim in [`crate::storage::Database::claim_next`].
//!
//! # Example
//!
//! ```rust,ignore
//! use queuectl::scheduler::{JobDescriptor, JobQueue, WorkerLoop};
//! use tokio::sync::broadcast;
//!
//! let queue = JobQueue::initialize("queue.db").await?;
//! queue.enqueue(JobDescriptor::parse(r#"{"id":"job1","command":"echo hi"}"#)?).await?;
//!
//! let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
//! let stats = WorkerLoop::new(queue.clone()).run(shutdown_rx).await?;
//! ```
//!
//! # Reliability Features
//!
//! - **Atomic claim**: A single conditional UPDATE hands each job to exactly one worker
//! - **Owned updates**: Post-claim writes only apply while the worker still owns the job
//! - **Dead letter queue**: Jobs that exhaust `max_retries` are kept for inspection and replay
//! - **Graceful stop**: Workers observe stop requests between jobs, never mid-execution

pub mod executor;
pub mod job;
pub mod queue;
pub mod retry;
pub mod worker;

// Re-export main types for convenience
pub use executor::{CommandExecutor, ExecutionError, ExecutionOutcome, ShellExecutor};
pub use job::{DeadLetterRecord, DesiredState, Job, JobDescriptor, JobState, WorkerRecord};
pub use queue::{JobQueue, QueueError, StatusReport};
pub use retry::{RetryPolicy, Transition};
pub use worker::{
    generate_worker_id, run_workers, Step, WorkerError, WorkerLoop, WorkerPhase, WorkerStats,
};
