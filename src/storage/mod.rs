//! SQLite persistent storage system.
//!
//! This module provides the durable store shared by every queuectl process.
//!
//! # Overview
//!
//! The storage system consists of:
//! - **Database**: SQLite client for jobs, dead letters, config and the worker registry
//! - **Migrations**: Schema management and versioning
//!
//! # Usage
//!
//! ```rust,ignore
//! use queuectl::storage::{Database, JobFilter};
//! use queuectl::scheduler::{Job, JobState};
//!
//! // Create (or open) the database file and apply the schema
//! let db = Database::create("queue.db").await?;
//!
//! // Insert a job
//! db.insert_job(&Job::new("job1", "echo hello", 3)).await?;
//!
//! // Query jobs
//! let filter = JobFilter::new().with_state(JobState::Pending);
//! let pending = db.list_jobs(&filter).await?;
//! ```

pub mod database;
pub mod migrations;
pub mod schema;

// Re-export main types for convenience
pub use database::{Database, DatabaseError, JobFilter};
pub use migrations::{MigrationError, MigrationRunner};
