//! Job definitions for the scheduler.
//!
//! This module defines the core records of the queue:
//!
//! - `Job`: A unit of work stored in the job table
//! - `JobState`: Lifecycle state of a job
//! - `JobDescriptor`: The submission payload accepted by `enqueue`
//! - `DeadLetterRecord`: A job that exhausted its retries
//! - `WorkerRecord`: Liveness and desired state of a worker process

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Lifecycle state of a job.
///
/// Transitions are exactly `pending -> processing -> {completed | pending | dead}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting for `next_run_at` and a worker to claim it.
    Pending,
    /// Claimed by exactly one worker.
    Processing,
    /// The command exited successfully.
    Completed,
    /// Retries exhausted; a dead letter record exists for it.
    Dead,
}

impl JobState {
    /// All states, in display order.
    pub const ALL: [JobState; 4] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Dead => "dead",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "dead" => Ok(JobState::Dead),
            other => Err(format!("unknown job state '{}'", other)),
        }
    }
}

/// A job representing a unit of work to be executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier supplied by the submitter.
    pub id: String,
    /// Opaque command string, run through the platform shell.
    pub command: String,
    /// Current lifecycle state.
    pub state: JobState,
    /// Number of execution attempts that failed so far.
    pub attempts: u32,
    /// Ceiling on failed attempts before the job is dead-lettered.
    pub max_retries: u32,
    /// When this job was created (or last replayed).
    pub created_at: DateTime<Utc>,
    /// When this job was last mutated.
    pub updated_at: DateTime<Utc>,
    /// Earliest time the job may be claimed.
    pub next_run_at: DateTime<Utc>,
    /// Diagnostic text from the last failed attempt.
    pub last_error: Option<String>,
    /// Current or last claimant.
    pub worker_id: Option<String>,
}

impl Job {
    /// Creates a new pending job that is due immediately.
    pub fn new(id: impl Into<String>, command: impl Into<String>, max_retries: u32) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            command: command.into(),
            state: JobState::Pending,
            attempts: 0,
            max_retries,
            created_at: now,
            updated_at: now,
            next_run_at: now,
            last_error: None,
            worker_id: None,
        }
    }

    /// Sets the earliest time the job may be claimed.
    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.next_run_at = run_at;
        self
    }

    /// Builds a pending job from a validated descriptor.
    ///
    /// `default_max_retries` comes from the config store and is used when the
    /// descriptor does not carry its own ceiling.
    pub fn from_descriptor(
        descriptor: JobDescriptor,
        default_max_retries: u32,
    ) -> Result<Self, ValidationError> {
        let (id, command, max_retries, run_at) = descriptor.validate(default_max_retries)?;
        let job = Job::new(id, command, max_retries);
        Ok(match run_at {
            Some(run_at) => job.with_run_at(run_at),
            None => job,
        })
    }

    /// Returns the number of failed attempts left before dead-lettering.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_retries.saturating_sub(self.attempts)
    }
}

/// Submission payload for `enqueue`.
///
/// Every field is optional at the serde level so that a missing `id` or
/// `command` surfaces as a [`ValidationError`] instead of a parse error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobDescriptor {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub max_retries: Option<i64>,
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
}

impl JobDescriptor {
    /// Parses a descriptor from inline JSON or from `@path/to/file.json`.
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let json = match input.strip_prefix('@') {
            Some(path) => std::fs::read_to_string(path).map_err(|source| ValidationError::Io {
                path: path.to_string(),
                source,
            })?,
            None => input.to_string(),
        };
        Ok(serde_json::from_str(&json)?)
    }

    fn validate(
        self,
        default_max_retries: u32,
    ) -> Result<(String, String, u32, Option<DateTime<Utc>>), ValidationError> {
        let id = self.id.ok_or(ValidationError::MissingField("id"))?;
        let command = self.command.ok_or(ValidationError::MissingField("command"))?;
        if id.trim().is_empty() {
            return Err(ValidationError::EmptyField("id"));
        }
        if command.trim().is_empty() {
            return Err(ValidationError::EmptyField("command"));
        }

        let max_retries = match self.max_retries {
            Some(n) if n >= 1 && n <= u32::MAX as i64 => n as u32,
            Some(n) => return Err(ValidationError::InvalidMaxRetries(n)),
            None => default_max_retries,
        };

        Ok((id, command, max_retries, self.run_at))
    }
}

/// A job that exhausted its retry budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: String,
    pub command: String,
    pub attempts: u32,
    pub max_retries: u32,
    pub failed_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Intent an operator can set on a running worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    Running,
    Stopping,
}

impl DesiredState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DesiredState::Running => "running",
            DesiredState::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for DesiredState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DesiredState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(DesiredState::Running),
            "stopping" => Ok(DesiredState::Stopping),
            other => Err(format!("unknown desired state '{}'", other)),
        }
    }
}

/// Registry entry of a worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub desired_state: DesiredState,
}

impl WorkerRecord {
    /// Creates a registry entry for the current process.
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            pid: std::process::id(),
            started_at: now,
            last_heartbeat: now,
            desired_state: DesiredState::Running,
        }
    }
}
