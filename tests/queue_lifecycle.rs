//! End-to-end tests for the job lifecycle against a real database file.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::broadcast;

use queuectl::config::ConfigKey;
use queuectl::scheduler::{
    CommandExecutor, ExecutionOutcome, JobDescriptor, JobQueue, JobState, QueueError, Transition,
    WorkerLoop,
};
use queuectl::storage::Database;

struct AlwaysFails;

#[async_trait]
impl CommandExecutor for AlwaysFails {
    async fn execute(&self, _command: &str, _timeout: Duration) -> ExecutionOutcome {
        ExecutionOutcome::Failure {
            error: "Exit code 1".to_string(),
        }
    }
}

async fn setup() -> (tempfile::TempDir, JobQueue) {
    let dir = tempfile::tempdir().unwrap();
    let queue = JobQueue::initialize(dir.path().join("queue.db")).await.unwrap();
    queue
        .config()
        .set(ConfigKey::PollIntervalSec, "0.05")
        .await
        .unwrap();
    (dir, queue)
}

async fn enqueue(queue: &JobQueue, json: &str) {
    queue.enqueue(JobDescriptor::parse(json).unwrap()).await.unwrap();
}

/// Claims `id` regardless of its backoff by pretending the clock is far ahead.
async fn claim_ignoring_backoff(queue: &JobQueue, worker_id: &str) -> Option<queuectl::Job> {
    let far_future = Utc::now() + ChronoDuration::days(365 * 100);
    queue
        .database()
        .claim_next(worker_id, far_future)
        .await
        .unwrap()
}

#[tokio::test]
async fn concurrent_processes_never_claim_the_same_job() {
    let (dir, queue) = setup().await;
    for i in 0..40 {
        enqueue(&queue, &format!(r#"{{"id":"job-{:02}","command":"true"}}"#, i)).await;
    }

    // Each claimer opens its own pool, like a separate worker process would.
    let path = dir.path().join("queue.db");
    let mut handles = Vec::new();
    for w in 0..8 {
        let path = path.clone();
        handles.push(tokio::spawn(async move {
            let db = Database::open(&path).await.unwrap();
            let worker_id = format!("w-{}", w);
            let mut claimed = Vec::new();
            while let Some(job) = db.claim_next(&worker_id, Utc::now()).await.unwrap() {
                assert_eq!(job.worker_id.as_deref(), Some(worker_id.as_str()));
                claimed.push(job.id);
            }
            claimed
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id.clone()), "job {} claimed twice", id);
        }
    }
    assert_eq!(seen.len(), 40);

    let status = queue.status().await.unwrap();
    assert_eq!(status.processing, 40);
    assert_eq!(status.pending, 0);
}

#[tokio::test]
async fn failing_job_is_dead_lettered_exactly_once() {
    let (_dir, queue) = setup().await;
    enqueue(&queue, r#"{"id":"flaky","command":"false","max_retries":3}"#).await;
    let failure = ExecutionOutcome::Failure {
        error: "Exit code 1".to_string(),
    };

    let mut transitions = Vec::new();
    while let Some(job) = claim_ignoring_backoff(&queue, "w-1").await {
        transitions.push(queue.record_outcome(&job, "w-1", &failure).await.unwrap());
    }

    assert_eq!(transitions.len(), 3);
    assert!(matches!(transitions[0], Transition::Retry { attempts: 1, .. }));
    assert!(matches!(transitions[1], Transition::Retry { attempts: 2, .. }));
    assert!(matches!(transitions[2], Transition::Bury { attempts: 3, .. }));

    let job = queue.get("flaky").await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Dead);
    assert_eq!(job.attempts, 3);

    let dead = queue.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, "flaky");
    assert_eq!(dead[0].attempts, 3);
    assert_eq!(dead[0].max_retries, 3);
    assert_eq!(dead[0].last_error.as_deref(), Some("Exit code 1"));
}

#[tokio::test]
async fn retry_delay_follows_backoff_base() {
    let (_dir, queue) = setup().await;
    queue.config().set(ConfigKey::BackoffBase, "3").await.unwrap();
    enqueue(&queue, r#"{"id":"slow","command":"false","max_retries":5}"#).await;
    let failure = ExecutionOutcome::Failure {
        error: "Exit code 1".to_string(),
    };

    let mut previous = queue.get("slow").await.unwrap().unwrap().next_run_at;
    for k in 1..=3u32 {
        let job = claim_ignoring_backoff(&queue, "w-1").await.unwrap();
        let before = Utc::now();
        queue.record_outcome(&job, "w-1", &failure).await.unwrap();

        let job = queue.get("slow").await.unwrap().unwrap();
        let expected = ChronoDuration::seconds(3i64.pow(k));
        assert_eq!(job.attempts, k);
        assert!(job.next_run_at >= before + expected - ChronoDuration::milliseconds(1));
        assert!(job.next_run_at >= previous);
        previous = job.next_run_at;

        // Not claimable before the delay has elapsed.
        assert!(queue.claim("w-1").await.unwrap().is_none());
    }
}

#[tokio::test]
async fn replay_restores_a_fresh_budget() {
    let (_dir, queue) = setup().await;
    enqueue(&queue, r#"{"id":"again","command":"false","max_retries":1}"#).await;

    let job = queue.claim("w-1").await.unwrap().unwrap();
    let failure = ExecutionOutcome::Timeout {
        after: Duration::from_secs(10),
    };
    queue.record_outcome(&job, "w-1", &failure).await.unwrap();
    assert_eq!(queue.status().await.unwrap().dead_letters, 1);

    let replayed = queue.replay("again").await.unwrap();
    assert_eq!(replayed.state, JobState::Pending);
    assert_eq!(replayed.attempts, 0);
    assert_eq!(replayed.max_retries, 1);
    assert!(queue.dead_letters().await.unwrap().is_empty());

    let job = queue.claim("w-2").await.unwrap().unwrap();
    assert_eq!(job.id, "again");
    assert_eq!(job.worker_id.as_deref(), Some("w-2"));

    assert!(matches!(
        queue.replay("again").await,
        Err(QueueError::NotFound(_))
    ));
}

#[tokio::test]
async fn scheduled_job_waits_for_run_at() {
    let (_dir, queue) = setup().await;
    let run_at = Utc::now() + ChronoDuration::milliseconds(400);
    enqueue(
        &queue,
        &format!(
            r#"{{"id":"later","command":"true","run_at":"{}"}}"#,
            run_at.to_rfc3339()
        ),
    )
    .await;

    assert!(queue.claim("w-1").await.unwrap().is_none());
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(queue.claim("w-1").await.unwrap().unwrap().id, "later");
}

#[tokio::test]
async fn duplicate_enqueue_keeps_original() {
    let (_dir, queue) = setup().await;
    enqueue(&queue, r#"{"id":"dup","command":"echo one"}"#).await;

    let result = queue
        .enqueue(JobDescriptor::parse(r#"{"id":"dup","command":"echo two"}"#).unwrap())
        .await;
    assert!(matches!(result, Err(QueueError::DuplicateJob(_))));
    assert_eq!(queue.get("dup").await.unwrap().unwrap().command, "echo one");
}

#[cfg(unix)]
#[tokio::test]
async fn failing_command_retries_once_then_dies() {
    let (_dir, queue) = setup().await;
    queue.config().set(ConfigKey::BackoffBase, "1").await.unwrap();
    enqueue(&queue, r#"{"id":"job1","command":"exit 1","max_retries":2}"#).await;

    let mut worker = WorkerLoop::new(queue.clone());

    let first = worker.process_next().await.unwrap().unwrap();
    match first {
        Transition::Retry { attempts, error, .. } => {
            assert_eq!(attempts, 1);
            assert_eq!(error, "Exit code 1");
        }
        other => panic!("expected retry, got {:?}", other),
    }

    // Delay is 1^1 = 1 second.
    assert!(worker.process_next().await.unwrap().is_none());
    tokio::time::sleep(Duration::from_millis(1100)).await;

    let second = worker.process_next().await.unwrap().unwrap();
    assert!(matches!(second, Transition::Bury { attempts: 2, .. }));

    let dead = queue.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 2);
}

#[tokio::test]
async fn running_workers_drain_queue_and_stop_on_request() {
    let (_dir, queue) = setup().await;
    for i in 0..6 {
        enqueue(
            &queue,
            &format!(r#"{{"id":"bad-{}","command":"false","max_retries":1}}"#, i),
        )
        .await;
    }

    let (shutdown_tx, _) = broadcast::channel(1);
    let mut handles = Vec::new();
    for _ in 0..3 {
        let worker = WorkerLoop::with_executor(queue.clone(), Arc::new(AlwaysFails));
        handles.push(tokio::spawn(worker.run(shutdown_tx.subscribe())));
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while queue.status().await.unwrap().dead < 6 {
        assert!(tokio::time::Instant::now() < deadline, "workers did not drain the queue");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(queue.stop_workers().await.unwrap(), 3);

    let mut processed = 0;
    for handle in handles {
        let stats = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        processed += stats.dead;
    }

    assert_eq!(processed, 6);
    assert_eq!(queue.dead_letters().await.unwrap().len(), 6);
    assert!(queue.status().await.unwrap().workers.is_empty());
}
