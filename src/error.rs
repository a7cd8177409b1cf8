//! Error types for queuectl operations.
//!
//! Defines the operator-facing error types that are not tied to a single
//! storage call:
//! - Job descriptor validation (rejected before any store write)
//! - Configuration keys and values (rejected before any store write)
//!
//! Store failures live in [`crate::storage::DatabaseError`]; worker loop
//! failures live in [`crate::scheduler::WorkerError`].

use thiserror::Error;

/// Errors raised while validating a job descriptor before it is enqueued.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Job must include '{0}'")]
    MissingField(&'static str),

    #[error("Field '{0}' must not be empty")]
    EmptyField(&'static str),

    #[error("max_retries must be a positive integer, got {0}")]
    InvalidMaxRetries(i64),

    #[error("Invalid job descriptor: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Failed to read job descriptor file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by the configuration store.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unknown config key '{0}' (expected one of: max-retries, backoff-base, poll-interval-sec, timeout-seconds)")]
    UnknownKey(String),

    #[error("Invalid value '{value}' for '{key}': {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Database error: {0}")]
    Database(#[from] crate::storage::DatabaseError),
}
