//! Command execution for claimed jobs.
//!
//! A job's command is an opaque string handed to the platform shell. The
//! executor never fails as such: spawn faults, non-zero exits and timeouts
//! are all reported as an [`ExecutionOutcome`] for the retry policy to judge.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors raised while driving the child process.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Failed to spawn command: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Failed to collect command output: {0}")]
    Wait(#[source] std::io::Error),
}

/// Result of running one job's command once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Exit status zero. `output` is trimmed stdout, or "OK" when empty.
    Success { output: String },
    /// Non-zero exit or a fault before the command could finish.
    Failure { error: String },
    /// The command was still running when the timeout elapsed and was killed.
    Timeout { after: Duration },
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success { .. })
    }

    /// Text recorded as the job's `last_error`, if the attempt failed.
    pub fn error_message(&self) -> Option<String> {
        match self {
            ExecutionOutcome::Success { .. } => None,
            ExecutionOutcome::Failure { error } => Some(error.clone()),
            ExecutionOutcome::Timeout { after } => {
                Some(format!("Job exceeded {}s timeout", after.as_secs()))
            }
        }
    }
}

/// Runs job commands.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: &str, timeout: Duration) -> ExecutionOutcome;
}

/// Runs commands through `sh -c` (or `cmd /C` on Windows).
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor;

impl ShellExecutor {
    pub fn new() -> Self {
        Self
    }

    fn shell_command(command: &str) -> tokio::process::Command {
        #[cfg(windows)]
        let mut cmd = {
            let mut cmd = tokio::process::Command::new("cmd");
            cmd.arg("/C").arg(command);
            cmd
        };
        #[cfg(not(windows))]
        let mut cmd = {
            let mut cmd = tokio::process::Command::new("sh");
            cmd.arg("-c").arg(command);
            cmd
        };

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<Option<std::process::Output>, ExecutionError> {
        let child = Self::shell_command(command)
            .spawn()
            .map_err(ExecutionError::Spawn)?;

        // Dropping the wait future on timeout drops the child, which kills it.
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output.map(Some).map_err(ExecutionError::Wait),
            Err(_) => Ok(None),
        }
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn execute(&self, command: &str, timeout: Duration) -> ExecutionOutcome {
        match self.run(command, timeout).await {
            Ok(Some(output)) if output.status.success() => {
                let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
                let output = if stdout.is_empty() {
                    "OK".to_string()
                } else {
                    stdout
                };
                ExecutionOutcome::Success { output }
            }
            Ok(Some(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                let error = if !stderr.is_empty() {
                    stderr
                } else {
                    match output.status.code() {
                        Some(code) => format!("Exit code {}", code),
                        None => "Process terminated by signal".to_string(),
                    }
                };
                ExecutionOutcome::Failure { error }
            }
            Ok(None) => ExecutionOutcome::Timeout { after: timeout },
            Err(e) => ExecutionOutcome::Failure {
                error: e.to_string(),
            },
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_success_captures_stdout() {
        let outcome = ShellExecutor::new().execute("echo hello", TIMEOUT).await;
        assert_eq!(
            outcome,
            ExecutionOutcome::Success {
                output: "hello".to_string()
            }
        );
        assert!(outcome.error_message().is_none());
    }

    #[tokio::test]
    async fn test_silent_success_reports_ok() {
        let outcome = ShellExecutor::new().execute("true", TIMEOUT).await;
        assert_eq!(
            outcome,
            ExecutionOutcome::Success {
                output: "OK".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_non_zero_exit_without_stderr() {
        let outcome = ShellExecutor::new().execute("exit 3", TIMEOUT).await;
        assert_eq!(outcome.error_message().as_deref(), Some("Exit code 3"));
    }

    #[tokio::test]
    async fn test_non_zero_exit_prefers_stderr() {
        let outcome = ShellExecutor::new()
            .execute("echo broken >&2; exit 1", TIMEOUT)
            .await;
        assert_eq!(
            outcome,
            ExecutionOutcome::Failure {
                error: "broken".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let started = std::time::Instant::now();
        let outcome = ShellExecutor::new()
            .execute("sleep 5", Duration::from_millis(200))
            .await;

        assert!(matches!(outcome, ExecutionOutcome::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_timeout_message() {
        let outcome = ExecutionOutcome::Timeout {
            after: Duration::from_secs(10),
        };
        assert_eq!(
            outcome.error_message().as_deref(),
            Some("Job exceeded 10s timeout")
        );
    }
}
