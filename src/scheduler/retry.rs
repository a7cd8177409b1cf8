//! Retry and backoff policy.
//!
//! Pure decision logic: given a claimed job and the outcome of running it,
//! produce the transition the worker must persist.

use chrono::{DateTime, Utc};

use super::executor::ExecutionOutcome;
use super::job::Job;

/// Next state for a claimed job after one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Job finished successfully.
    Complete,
    /// Job failed but has budget left; return it to pending.
    Retry {
        attempts: u32,
        next_run_at: DateTime<Utc>,
        error: String,
    },
    /// Job failed and exhausted its budget; move it to the dead letter store.
    Bury { attempts: u32, error: String },
}

/// Exponential backoff with delay `base^attempts` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff_base: u32,
}

impl RetryPolicy {
    pub fn new(backoff_base: u32) -> Self {
        Self { backoff_base }
    }

    /// Delay before the next attempt, or `None` if it does not fit a
    /// `chrono::Duration`.
    pub fn backoff_delay(&self, attempts: u32) -> Option<chrono::Duration> {
        let secs = (self.backoff_base as u64).checked_pow(attempts)?;
        chrono::Duration::try_seconds(i64::try_from(secs).ok()?)
    }

    /// Earliest time the job may run again.
    ///
    /// Never earlier than `previous`, and saturates at the latest
    /// representable instant on overflow.
    pub fn next_run_at(
        &self,
        attempts: u32,
        previous: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let candidate = self
            .backoff_delay(attempts)
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        candidate.max(previous)
    }

    pub fn decide(&self, job: &Job, outcome: &ExecutionOutcome, now: DateTime<Utc>) -> Transition {
        let Some(error) = outcome.error_message() else {
            return Transition::Complete;
        };

        let attempts = job.attempts.saturating_add(1);
        if attempts < job.max_retries {
            Transition::Retry {
                attempts,
                next_run_at: self.next_run_at(attempts, job.next_run_at, now),
                error,
            }
        } else {
            Transition::Bury { attempts, error }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn failure() -> ExecutionOutcome {
        ExecutionOutcome::Failure {
            error: "Exit code 1".to_string(),
        }
    }

    #[test]
    fn test_success_completes() {
        let policy = RetryPolicy::new(2);
        let job = Job::new("j1", "true", 3);
        let outcome = ExecutionOutcome::Success {
            output: String::new(),
        };
        assert_eq!(policy.decide(&job, &outcome, Utc::now()), Transition::Complete);
    }

    #[test]
    fn test_backoff_grows_exponentially() {
        let policy = RetryPolicy::new(2);
        assert_eq!(policy.backoff_delay(0), Some(Duration::seconds(1)));
        assert_eq!(policy.backoff_delay(1), Some(Duration::seconds(2)));
        assert_eq!(policy.backoff_delay(3), Some(Duration::seconds(8)));
    }

    #[test]
    fn test_failure_with_budget_left_retries() {
        let policy = RetryPolicy::new(3);
        let now = Utc::now();
        let mut job = Job::new("j1", "false", 3);
        job.attempts = 1;

        match policy.decide(&job, &failure(), now) {
            Transition::Retry {
                attempts,
                next_run_at,
                error,
            } => {
                assert_eq!(attempts, 2);
                assert_eq!(next_run_at, now + Duration::seconds(9));
                assert_eq!(error, "Exit code 1");
            }
            other => panic!("expected retry, got {:?}", other),
        }
    }

    #[test]
    fn test_last_failure_buries() {
        let policy = RetryPolicy::new(2);
        let mut job = Job::new("j1", "false", 3);
        job.attempts = 2;

        assert_eq!(
            policy.decide(&job, &failure(), Utc::now()),
            Transition::Bury {
                attempts: 3,
                error: "Exit code 1".to_string()
            }
        );
    }

    #[test]
    fn test_single_retry_budget_buries_on_first_failure() {
        let policy = RetryPolicy::new(2);
        let job = Job::new("j1", "false", 1);
        let outcome = ExecutionOutcome::Timeout {
            after: std::time::Duration::from_secs(10),
        };

        assert_eq!(
            policy.decide(&job, &outcome, Utc::now()),
            Transition::Bury {
                attempts: 1,
                error: "Job exceeded 10s timeout".to_string()
            }
        );
    }

    #[test]
    fn test_next_run_at_never_moves_backwards() {
        let policy = RetryPolicy::new(1);
        let now = Utc::now();
        let previous = now + Duration::hours(1);
        assert_eq!(policy.next_run_at(1, previous, now), previous);
    }

    #[test]
    fn test_backoff_overflow_saturates() {
        let policy = RetryPolicy::new(u32::MAX);
        let now = Utc::now();
        assert!(policy.backoff_delay(10).is_none());
        assert_eq!(policy.next_run_at(10, now, now), DateTime::<Utc>::MAX_UTC);
    }
}
