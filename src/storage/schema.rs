//! Database schema constants.
//!
//! All SQL schema definitions for the SQLite storage backend. Timestamps are
//! INTEGER milliseconds since the Unix epoch so that `<=` and `ORDER BY`
//! compare exactly.

/// SQL schema for creating the jobs table.
pub const CREATE_JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id          TEXT    PRIMARY KEY,
    command     TEXT    NOT NULL,
    state       TEXT    NOT NULL CHECK (state IN ('pending', 'processing', 'completed', 'dead')),
    attempts    INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3,
    created_at  INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL,
    next_run_at INTEGER NOT NULL,
    last_error  TEXT,
    worker_id   TEXT,
    CHECK (state <> 'processing' OR worker_id IS NOT NULL)
)
"#;

/// SQL schema for creating the dead letter table.
pub const CREATE_DEAD_LETTERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS dead_letters (
    id          TEXT    PRIMARY KEY,
    command     TEXT    NOT NULL,
    attempts    INTEGER NOT NULL,
    max_retries INTEGER NOT NULL,
    failed_at   INTEGER NOT NULL,
    last_error  TEXT
)
"#;

/// SQL schema for creating the config table.
pub const CREATE_CONFIG_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS config (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

/// SQL schema for creating the worker registry table.
pub const CREATE_WORKERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS workers (
    id             TEXT    PRIMARY KEY,
    pid            INTEGER NOT NULL,
    started_at     INTEGER NOT NULL,
    last_heartbeat INTEGER NOT NULL,
    desired_state  TEXT    NOT NULL CHECK (desired_state IN ('running', 'stopping'))
)
"#;

/// Index backing the claim query (due pending jobs, oldest first).
pub const CREATE_JOBS_CLAIM_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(state, next_run_at, created_at, id)
"#;

/// Index for listing dead letters newest first.
pub const CREATE_DEAD_LETTERS_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_dead_letters_failed_at ON dead_letters(failed_at)
"#;

/// Returns all schema statements in the order they must be executed.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_JOBS_TABLE,
        CREATE_DEAD_LETTERS_TABLE,
        CREATE_CONFIG_TABLE,
        CREATE_WORKERS_TABLE,
        CREATE_JOBS_CLAIM_INDEX,
        CREATE_DEAD_LETTERS_INDEX,
    ]
}
