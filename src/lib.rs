//! queuectl: persistent multi-process shell-command job queue.
//!
//! Jobs live in a single SQLite file shared by any number of worker
//! processes. Failed jobs are retried with exponential backoff and moved to a
//! dead letter queue once their retry budget is spent.

pub mod cli;
pub mod config;
pub mod error;
pub mod scheduler;
pub mod storage;

// Re-export commonly used types
pub use config::{ConfigKey, ConfigStore};
pub use error::{ConfigError, ValidationError};
pub use scheduler::{Job, JobQueue, JobState, QueueError, WorkerLoop};
pub use storage::{Database, DatabaseError};
