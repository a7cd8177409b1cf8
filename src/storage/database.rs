//! SQLite database client for the durable queue state.
//!
//! One database file holds the four record kinds (jobs, dead letters, config,
//! worker registry). Every worker process opens its own pool on the same file;
//! all cross-process coordination goes through SQLite's write lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use thiserror::Error;

use crate::scheduler::job::{DeadLetterRecord, DesiredState, Job, JobState, WorkerRecord};

use super::migrations::MigrationRunner;

/// How long a connection waits on another process's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const JOB_COLUMNS: &str = "id, command, state, attempts, max_retries, created_at, updated_at, \
                           next_run_at, last_error, worker_id";

/// Errors that can occur during database operations.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// The database file could not be opened.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// Record not found.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// A job with the same id already exists.
    #[error("Job '{0}' already exists")]
    DuplicateJob(String),

    /// The worker no longer owns the processing row it tried to update.
    #[error("Worker '{worker_id}' no longer owns job '{job_id}'")]
    LostClaim { job_id: String, worker_id: String },

    /// A stored row could not be decoded.
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] super::migrations::MigrationError),
}

/// Filter options for listing jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub state: Option<JobState>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }
}

/// SQLite database client.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    path: PathBuf,
}

impl Database {
    /// Opens an existing database file.
    ///
    /// Fails with `ConnectionFailed` if the file does not exist, so that
    /// workers never silently run against an uninitialized store.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        Self::connect(path.as_ref(), false).await
    }

    /// Opens the database file, creating it if missing, and runs migrations.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let db = Self::connect(path.as_ref(), true).await?;
        db.run_migrations().await?;
        Ok(db)
    }

    async fn connect(path: &Path, create_if_missing: bool) -> Result<Self, DatabaseError> {
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(create_if_missing)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await
            .map_err(|e| {
                DatabaseError::ConnectionFailed(format!("{}: {}", path.display(), e))
            })?;

        tracing::debug!(path = %path.display(), "Database opened");
        Ok(Self {
            pool,
            path: path.to_path_buf(),
        })
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Returns the database file path this client was opened with.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs database migrations.
    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let runner = MigrationRunner::new(self.pool.clone());
        runner.run_migrations().await?;
        Ok(())
    }

    // =========================================================================
    // Job Operations
    // =========================================================================

    /// Inserts a new job.
    ///
    /// Fails with `DuplicateJob` if the id exists; the existing row is left
    /// untouched.
    pub async fn insert_job(&self, job: &Job) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (
                id, command, state, attempts, max_retries,
                created_at, updated_at, next_run_at, last_error, worker_id
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&job.id)
        .bind(&job.command)
        .bind(job.state.as_str())
        .bind(job.attempts as i64)
        .bind(job.max_retries as i64)
        .bind(dt_to_ms(job.created_at))
        .bind(dt_to_ms(job.updated_at))
        .bind(dt_to_ms(job.next_run_at))
        .bind(&job.last_error)
        .bind(&job.worker_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::DuplicateJob(job.id.clone()));
        }
        Ok(())
    }

    /// Retrieves a job by its ID.
    ///
    /// Returns `None` if the job doesn't exist.
    pub async fn get_job(&self, id: &str) -> Result<Option<Job>, DatabaseError> {
        let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| job_from_row(&r)).transpose()
    }

    /// Lists jobs oldest first, optionally restricted to one state.
    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, DatabaseError> {
        let mut sql = format!("SELECT {} FROM jobs", JOB_COLUMNS);
        if filter.state.is_some() {
            sql.push_str(" WHERE state = ?1");
        }
        sql.push_str(" ORDER BY created_at ASC, id ASC");

        let mut query = sqlx::query(&sql);
        if let Some(state) = filter.state {
            query = query.bind(state.as_str());
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(job_from_row).collect()
    }

    /// Counts jobs per state. States with no jobs are reported as zero.
    pub async fn count_jobs_by_state(&self) -> Result<HashMap<JobState, u64>, DatabaseError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS count FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await?;

        let mut counts: HashMap<JobState, u64> =
            JobState::ALL.iter().map(|state| (*state, 0)).collect();
        for row in rows {
            let state: String = row.try_get("state")?;
            let state = state.parse::<JobState>().map_err(DatabaseError::InvalidRecord)?;
            let count: i64 = row.try_get("count")?;
            counts.insert(state, count as u64);
        }

        Ok(counts)
    }

    /// Atomically claims the oldest due pending job for `worker_id`.
    ///
    /// Selection and transition happen in one conditional UPDATE, so among
    /// any number of concurrent callers at most one receives a given job.
    pub async fn claim_next(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, DatabaseError> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET state = 'processing', worker_id = ?1, updated_at = ?2
            WHERE id = (
                SELECT id FROM jobs
                WHERE state = 'pending' AND next_run_at <= ?2
                ORDER BY created_at ASC, id ASC
                LIMIT 1
            )
            AND state = 'pending'
            RETURNING {}
            "#,
            JOB_COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(worker_id)
            .bind(dt_to_ms(now))
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| job_from_row(&r)).transpose()
    }

    /// Marks a claimed job as completed and clears its last error.
    pub async fn mark_completed(
        &self,
        job_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'completed', last_error = NULL, updated_at = ?3
            WHERE id = ?1 AND state = 'processing' AND worker_id = ?2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(dt_to_ms(now))
        .execute(&self.pool)
        .await?;

        ensure_owned(result.rows_affected(), job_id, worker_id)
    }

    /// Returns a claimed job to pending with a later `next_run_at`.
    pub async fn reschedule(
        &self,
        job_id: &str,
        worker_id: &str,
        attempts: u32,
        next_run_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'pending', attempts = ?3, next_run_at = ?4, last_error = ?5, updated_at = ?6
            WHERE id = ?1 AND state = 'processing' AND worker_id = ?2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(attempts as i64)
        .bind(dt_to_ms(next_run_at))
        .bind(error)
        .bind(dt_to_ms(now))
        .execute(&self.pool)
        .await?;

        ensure_owned(result.rows_affected(), job_id, worker_id)
    }

    /// Moves a claimed job to `dead` and records it in the dead letter table.
    ///
    /// Both writes happen in one transaction: either the job is dead and has
    /// a dead letter record, or nothing changed.
    pub async fn bury(
        &self,
        job_id: &str,
        worker_id: &str,
        attempts: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<DeadLetterRecord, DatabaseError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'dead', attempts = ?3, last_error = ?4, updated_at = ?5
            WHERE id = ?1 AND state = 'processing' AND worker_id = ?2
            RETURNING command, max_retries
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(attempts as i64)
        .bind(error)
        .bind(dt_to_ms(now))
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Err(DatabaseError::LostClaim {
                job_id: job_id.to_string(),
                worker_id: worker_id.to_string(),
            });
        };

        let record = DeadLetterRecord {
            id: job_id.to_string(),
            command: row.try_get("command")?,
            attempts,
            max_retries: row.try_get::<i64, _>("max_retries")? as u32,
            failed_at: now,
            last_error: Some(error.to_string()),
        };

        sqlx::query(
            r#"
            INSERT INTO dead_letters (id, command, attempts, max_retries, failed_at, last_error)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO UPDATE SET
                command = excluded.command,
                attempts = excluded.attempts,
                max_retries = excluded.max_retries,
                failed_at = excluded.failed_at,
                last_error = excluded.last_error
            "#,
        )
        .bind(&record.id)
        .bind(&record.command)
        .bind(record.attempts as i64)
        .bind(record.max_retries as i64)
        .bind(dt_to_ms(record.failed_at))
        .bind(&record.last_error)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(record)
    }

    // =========================================================================
    // Dead Letter Operations
    // =========================================================================

    /// Lists dead letter records, most recent failure first.
    pub async fn list_dead_letters(&self) -> Result<Vec<DeadLetterRecord>, DatabaseError> {
        let rows = sqlx::query(
            r#"
            SELECT id, command, attempts, max_retries, failed_at, last_error
            FROM dead_letters
            ORDER BY failed_at DESC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(dead_letter_from_row).collect()
    }

    /// Retrieves a dead letter record by job id.
    pub async fn get_dead_letter(&self, id: &str) -> Result<Option<DeadLetterRecord>, DatabaseError> {
        let row = sqlx::query(
            r#"
            SELECT id, command, attempts, max_retries, failed_at, last_error
            FROM dead_letters
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| dead_letter_from_row(&r)).transpose()
    }

    /// Returns the number of dead letter records.
    pub async fn count_dead_letters(&self) -> Result<u64, DatabaseError> {
        let count: i64 = sqlx::query("SELECT COUNT(*) AS count FROM dead_letters")
            .fetch_one(&self.pool)
            .await?
            .try_get("count")?;
        Ok(count as u64)
    }

    /// Removes a dead letter record and re-enqueues its job with a fresh budget.
    ///
    /// The job row keeps its id, command and `max_retries`; attempts, worker
    /// and last error are reset and it becomes due at `now`. Fails with
    /// `NotFound` (and changes nothing) if no record exists.
    pub async fn replay_dead_letter(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Job, DatabaseError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("DELETE FROM dead_letters WHERE id = ?1 RETURNING command, max_retries")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            return Err(DatabaseError::NotFound(format!("dead letter job '{}'", id)));
        };
        let command: String = row.try_get("command")?;
        let max_retries: i64 = row.try_get("max_retries")?;

        let sql = format!(
            r#"
            INSERT INTO jobs (
                id, command, state, attempts, max_retries,
                created_at, updated_at, next_run_at, last_error, worker_id
            ) VALUES (?1, ?2, 'pending', 0, ?3, ?4, ?4, ?4, NULL, NULL)
            ON CONFLICT(id) DO UPDATE SET
                command = excluded.command,
                state = 'pending',
                attempts = 0,
                max_retries = excluded.max_retries,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                next_run_at = excluded.next_run_at,
                last_error = NULL,
                worker_id = NULL
            RETURNING {}
            "#,
            JOB_COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(id)
            .bind(&command)
            .bind(max_retries)
            .bind(dt_to_ms(now))
            .fetch_one(&mut *tx)
            .await?;
        let job = job_from_row(&row)?;

        tx.commit().await?;
        Ok(job)
    }

    // =========================================================================
    // Worker Registry Operations
    // =========================================================================

    /// Registers (or re-registers) a worker.
    pub async fn register_worker(&self, worker: &WorkerRecord) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO workers (id, pid, started_at, last_heartbeat, desired_state)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&worker.id)
        .bind(worker.pid as i64)
        .bind(dt_to_ms(worker.started_at))
        .bind(dt_to_ms(worker.last_heartbeat))
        .bind(worker.desired_state.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Reads a worker's desired state; `None` if the registry entry is gone.
    pub async fn worker_desired_state(
        &self,
        worker_id: &str,
    ) -> Result<Option<DesiredState>, DatabaseError> {
        let row = sqlx::query("SELECT desired_state FROM workers WHERE id = ?1")
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let state: String = row.try_get("desired_state")?;
                state
                    .parse::<DesiredState>()
                    .map(Some)
                    .map_err(DatabaseError::InvalidRecord)
            }
            None => Ok(None),
        }
    }

    /// Refreshes a worker's heartbeat. Returns false if the entry is gone.
    pub async fn heartbeat(&self, worker_id: &str, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let result = sqlx::query("UPDATE workers SET last_heartbeat = ?2 WHERE id = ?1")
            .bind(worker_id)
            .bind(dt_to_ms(now))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Flips every running worker to `stopping`. Returns how many were signaled.
    pub async fn request_stop_all(&self) -> Result<u64, DatabaseError> {
        let result = sqlx::query(
            "UPDATE workers SET desired_state = 'stopping' WHERE desired_state = 'running'",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Removes a worker's registry entry.
    pub async fn deregister_worker(&self, worker_id: &str) -> Result<(), DatabaseError> {
        sqlx::query("DELETE FROM workers WHERE id = ?1")
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Lists registered workers, oldest first.
    pub async fn list_workers(&self) -> Result<Vec<WorkerRecord>, DatabaseError> {
        let rows = sqlx::query(
            r#"
            SELECT id, pid, started_at, last_heartbeat, desired_state
            FROM workers
            ORDER BY started_at ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<WorkerRecord, DatabaseError> {
                let desired: String = row.try_get("desired_state")?;
                Ok(WorkerRecord {
                    id: row.try_get("id")?,
                    pid: row.try_get::<i64, _>("pid")? as u32,
                    started_at: ms_to_dt(row.try_get("started_at")?)?,
                    last_heartbeat: ms_to_dt(row.try_get("last_heartbeat")?)?,
                    desired_state: desired
                        .parse::<DesiredState>()
                        .map_err(DatabaseError::InvalidRecord)?,
                })
            })
            .collect()
    }

    // =========================================================================
    // Config Operations
    // =========================================================================

    /// Reads a raw config value.
    pub async fn config_value(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let row = sqlx::query("SELECT value FROM config WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get("value")).transpose()?)
    }

    /// Writes a raw config value, overwriting any previous one.
    pub async fn set_config_value(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO config (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Writes a config value only if the key has no value yet.
    pub async fn seed_config_value(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        sqlx::query("INSERT OR IGNORE INTO config (key, value) VALUES (?1, ?2)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Returns every stored config pair ordered by key.
    pub async fn config_values(&self) -> Result<Vec<(String, String)>, DatabaseError> {
        let rows = sqlx::query("SELECT key, value FROM config ORDER BY key")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<(String, String), DatabaseError> {
                Ok((row.try_get("key")?, row.try_get("value")?))
            })
            .collect()
    }
}

fn ensure_owned(rows_affected: u64, job_id: &str, worker_id: &str) -> Result<(), DatabaseError> {
    if rows_affected == 0 {
        return Err(DatabaseError::LostClaim {
            job_id: job_id.to_string(),
            worker_id: worker_id.to_string(),
        });
    }
    Ok(())
}

fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn ms_to_dt(ms: i64) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| DatabaseError::InvalidRecord(format!("timestamp out of range: {}", ms)))
}

fn job_from_row(row: &SqliteRow) -> Result<Job, DatabaseError> {
    let state: String = row.try_get("state")?;

    Ok(Job {
        id: row.try_get("id")?,
        command: row.try_get("command")?,
        state: state.parse::<JobState>().map_err(DatabaseError::InvalidRecord)?,
        attempts: row.try_get::<i64, _>("attempts")? as u32,
        max_retries: row.try_get::<i64, _>("max_retries")? as u32,
        created_at: ms_to_dt(row.try_get("created_at")?)?,
        updated_at: ms_to_dt(row.try_get("updated_at")?)?,
        next_run_at: ms_to_dt(row.try_get("next_run_at")?)?,
        last_error: row.try_get("last_error")?,
        worker_id: row.try_get("worker_id")?,
    })
}

fn dead_letter_from_row(row: &SqliteRow) -> Result<DeadLetterRecord, DatabaseError> {
    Ok(DeadLetterRecord {
        id: row.try_get("id")?,
        command: row.try_get("command")?,
        attempts: row.try_get::<i64, _>("attempts")? as u32,
        max_retries: row.try_get::<i64, _>("max_retries")? as u32,
        failed_at: ms_to_dt(row.try_get("failed_at")?)?,
        last_error: row.try_get("last_error")?,
    })
}
