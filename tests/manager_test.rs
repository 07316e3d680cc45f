//! Integration tests for per-message jobs and semaphore-scoped execution.

use async_trait::async_trait;
use leasehold::progress::{ProgressCallback, ProgressListener};
use leasehold::queue::{MemoryQueue, Message, MessageQueue};
use leasehold::semaphore::{CountingLockStore, MemoryLockStore};
use leasehold::worker::{
    ConcurrentManager, MessageDrivenRunner, RETRY_VISIBILITY_TIMEOUT_SEC, StaticStackStatus,
};
use leasehold::{Error, Result};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
enum QueueCall {
    Delete(String),
    ChangeVisibility(String, u64),
}

/// Wraps a [`MemoryQueue`] and records delete / visibility calls.
#[derive(Default)]
struct RecordingQueue {
    inner: MemoryQueue,
    calls: Mutex<Vec<QueueCall>>,
    fail_deletes: Mutex<bool>,
}

impl RecordingQueue {
    fn calls(&self) -> Vec<QueueCall> {
        self.calls.lock().unwrap().clone()
    }

    fn deletes(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, QueueCall::Delete(_)))
            .count()
    }

    fn visibility_changes(&self) -> Vec<u64> {
        self.calls()
            .iter()
            .filter_map(|c| match c {
                QueueCall::ChangeVisibility(_, t) => Some(*t),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl MessageQueue for RecordingQueue {
    async fn queue_url(&self, queue_name: &str) -> Result<String> {
        self.inner.queue_url(queue_name).await
    }

    async fn receive(
        &self,
        queue_url: &str,
        max_messages: usize,
        visibility_timeout_sec: u64,
    ) -> Result<Vec<Message>> {
        self.inner
            .receive(queue_url, max_messages, visibility_timeout_sec)
            .await
    }

    async fn delete(&self, queue_url: &str, message: &Message) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(QueueCall::Delete(message.message_id.clone()));
        if *self.fail_deletes.lock().unwrap() {
            return Err(Error::Other("delete rejected".into()));
        }
        self.inner.delete(queue_url, message).await
    }

    async fn change_visibility(
        &self,
        queue_url: &str,
        message: &Message,
        timeout_sec: u64,
    ) -> Result<()> {
        self.calls.lock().unwrap().push(QueueCall::ChangeVisibility(
            message.message_id.clone(),
            timeout_sec,
        ));
        self.inner
            .change_visibility(queue_url, message, timeout_sec)
            .await
    }
}

enum Outcome {
    Succeed,
    Retry,
    Fail,
}

/// Reports progress `progress_calls` times, then finishes with `outcome`.
struct ScriptedRunner {
    outcome: Outcome,
    progress_calls: usize,
    runs: AtomicUsize,
}

impl ScriptedRunner {
    fn new(outcome: Outcome) -> Self {
        Self {
            outcome,
            progress_calls: 0,
            runs: AtomicUsize::new(0),
        }
    }

    fn with_progress(mut self, calls: usize) -> Self {
        self.progress_calls = calls;
        self
    }
}

#[async_trait]
impl MessageDrivenRunner for ScriptedRunner {
    async fn run(&self, callback: Arc<ProgressCallback>, _message: &Message) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        for _ in 0..self.progress_calls {
            callback.progress_made().await;
        }
        match self.outcome {
            Outcome::Succeed => Ok(()),
            Outcome::Retry => Err(Error::Recoverable("try again".into())),
            Outcome::Fail => Err(Error::Other("poison".into())),
        }
    }
}

struct Fixture {
    queue: Arc<RecordingQueue>,
    locks: Arc<MemoryLockStore>,
    manager: ConcurrentManager,
    url: String,
}

async fn fixture() -> Fixture {
    let queue = Arc::new(RecordingQueue::default());
    queue.inner.create_queue("jobs");
    let locks = Arc::new(MemoryLockStore::new());
    let manager = ConcurrentManager::new(
        locks.clone(),
        queue.clone(),
        Arc::new(StaticStackStatus::default()),
    );
    let url = manager.queue_url("jobs").await.unwrap();
    Fixture {
        queue,
        locks,
        manager,
        url,
    }
}

async fn run_one(fx: &Fixture, runner: ScriptedRunner) -> Result<()> {
    fx.queue.inner.send("jobs", json!({ "table": "t1" })).unwrap();
    let runner: Arc<dyn MessageDrivenRunner> = Arc::new(runner);
    let mut jobs = fx
        .manager
        .poll_for_messages_and_start_jobs(&fx.url, 1, 30, &runner)
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
    jobs.remove(0).join().await.unwrap()
}

// ---------------------------------------------------------------------------
// Message reconciliation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn success_deletes_the_message_once() {
    let fx = fixture().await;

    run_one(&fx, ScriptedRunner::new(Outcome::Succeed)).await.unwrap();

    assert_eq!(fx.queue.deletes(), 1);
    assert!(fx.queue.visibility_changes().is_empty());
    assert!(fx.queue.inner.is_empty("jobs"));
}

#[tokio::test]
async fn progress_extends_visibility_by_the_lease() {
    let fx = fixture().await;

    run_one(&fx, ScriptedRunner::new(Outcome::Succeed).with_progress(2))
        .await
        .unwrap();

    assert_eq!(fx.queue.visibility_changes(), vec![30, 30]);
    assert_eq!(fx.queue.deletes(), 1);
}

#[tokio::test]
async fn recoverable_failure_retries_soon_without_delete() {
    let fx = fixture().await;

    run_one(&fx, ScriptedRunner::new(Outcome::Retry).with_progress(1))
        .await
        .unwrap();

    assert_eq!(fx.queue.deletes(), 0);
    assert_eq!(
        fx.queue.visibility_changes(),
        vec![30, RETRY_VISIBILITY_TIMEOUT_SEC]
    );
    assert_eq!(fx.queue.inner.len("jobs"), 1);
}

#[tokio::test(start_paused = true)]
async fn retried_message_is_redelivered_after_the_delay() {
    let fx = fixture().await;
    run_one(&fx, ScriptedRunner::new(Outcome::Retry)).await.unwrap();
    assert_eq!(fx.queue.inner.visible_len("jobs"), 0);

    tokio::time::advance(Duration::from_secs(RETRY_VISIBILITY_TIMEOUT_SEC)).await;

    assert_eq!(fx.queue.inner.visible_len("jobs"), 1);
}

#[tokio::test]
async fn other_failure_deletes_and_propagates() {
    let fx = fixture().await;

    let err = run_one(&fx, ScriptedRunner::new(Outcome::Fail))
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "poison");
    assert_eq!(fx.queue.deletes(), 1);
    assert!(fx.queue.inner.is_empty("jobs"));
}

#[tokio::test]
async fn failed_delete_does_not_mask_job_failure() {
    let fx = fixture().await;
    *fx.queue.fail_deletes.lock().unwrap() = true;

    let err = run_one(&fx, ScriptedRunner::new(Outcome::Fail))
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "poison");
}

#[tokio::test]
async fn vanished_message_is_tolerated_on_success() {
    let fx = fixture().await;
    fx.queue.inner.send("jobs", json!({})).unwrap();
    let messages = fx.queue.inner.receive(&fx.url, 1, 30).await.unwrap();
    let message = messages.into_iter().next().unwrap();
    // Another consumer deleted it first.
    fx.queue.inner.delete(&fx.url, &message).await.unwrap();

    let job = fx.manager.start_worker_job(
        &fx.url,
        30,
        Arc::new(ScriptedRunner::new(Outcome::Succeed)),
        message,
    );

    job.join().await.unwrap().unwrap();
}

#[tokio::test]
async fn forced_shutdown_leaves_the_message_alone() {
    let fx = fixture().await;
    fx.manager.force_shutdown();
    assert!(fx.manager.is_shut_down());

    run_one(&fx, ScriptedRunner::new(Outcome::Succeed)).await.unwrap();
    run_one(&fx, ScriptedRunner::new(Outcome::Retry)).await.unwrap();

    assert!(fx.queue.calls().is_empty());
    assert_eq!(fx.queue.inner.len("jobs"), 2);
}

#[tokio::test]
async fn finished_job_no_longer_refreshes_visibility() {
    let fx = fixture().await;
    fx.queue.inner.send("jobs", json!({})).unwrap();
    let runner: Arc<dyn MessageDrivenRunner> = Arc::new(ScriptedRunner::new(Outcome::Retry));
    let mut jobs = fx
        .manager
        .poll_for_messages_and_start_jobs(&fx.url, 1, 30, &runner)
        .await
        .unwrap();
    let job = jobs.remove(0);
    let listener = job.listener().clone();
    job.join().await.unwrap().unwrap();
    let before = fx.queue.calls().len();

    listener.progress_made().await.unwrap();

    assert_eq!(fx.queue.calls().len(), before);
}

/// Never finishes on its own.
struct StuckRunner;

#[async_trait]
impl MessageDrivenRunner for StuckRunner {
    async fn run(&self, _callback: Arc<ProgressCallback>, _message: &Message) -> Result<()> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn aborted_job_leaves_the_message_for_redelivery() {
    let fx = fixture().await;
    fx.queue.inner.send("jobs", json!({})).unwrap();
    let runner: Arc<dyn MessageDrivenRunner> = Arc::new(StuckRunner);
    let mut jobs = fx
        .manager
        .poll_for_messages_and_start_jobs(&fx.url, 1, 30, &runner)
        .await
        .unwrap();
    let job = jobs.remove(0);

    job.abort();
    let err = job.join().await.unwrap_err();

    assert!(err.is_cancelled());
    assert!(fx.queue.calls().is_empty());
    assert_eq!(fx.queue.inner.len("jobs"), 1);
}

// ---------------------------------------------------------------------------
// Polling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn poll_starts_one_job_per_message() {
    let fx = fixture().await;
    for i in 0..3 {
        fx.queue.inner.send("jobs", json!({ "n": i })).unwrap();
    }
    let runner = Arc::new(ScriptedRunner::new(Outcome::Succeed));
    let dyn_runner: Arc<dyn MessageDrivenRunner> = runner.clone();

    let jobs = fx
        .manager
        .poll_for_messages_and_start_jobs(&fx.url, 10, 30, &dyn_runner)
        .await
        .unwrap();
    assert_eq!(jobs.len(), 3);
    for job in jobs {
        job.join().await.unwrap().unwrap();
    }

    assert_eq!(runner.runs.load(Ordering::SeqCst), 3);
    assert!(fx.queue.inner.is_empty("jobs"));
}

#[tokio::test]
async fn poll_validates_arguments() {
    let fx = fixture().await;
    let runner: Arc<dyn MessageDrivenRunner> = Arc::new(ScriptedRunner::new(Outcome::Succeed));

    let cases = [
        ("", 1, 30, "queue_url is required."),
        ("memory://jobs", 0, 30, "max_messages must be greater than or equal to 1."),
        ("memory://jobs", 11, 30, "max_messages must be less than or equal to 10."),
        (
            "memory://jobs",
            1,
            9,
            "visibility_timeout_sec must be greater than or equal to 10.",
        ),
        (
            "memory://jobs",
            1,
            43_201,
            "visibility_timeout_sec must be less than or equal to 43200.",
        ),
    ];
    for (url, max, vt, message) in cases {
        let err = fx
            .manager
            .poll_for_messages_and_start_jobs(url, max, vt, &runner)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), message);
    }
}

#[tokio::test]
async fn queue_url_requires_a_name() {
    let fx = fixture().await;

    let err = fx.manager.queue_url("").await.unwrap_err();
    assert_eq!(err.to_string(), "queue_name is required.");
    assert!(matches!(
        fx.manager.queue_url("missing").await,
        Err(Error::NotFound(_))
    ));
}

// ---------------------------------------------------------------------------
// Semaphore-scoped execution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn semaphore_work_runs_while_holding_a_slot() {
    let fx = fixture().await;
    let callback = ProgressCallback::shared();
    let locks = fx.locks.clone();

    let held_during = fx
        .manager
        .run_with_semaphore_lock("stack", 30, 2, &callback, async move {
            Ok(locks.holder_count("stack"))
        })
        .await
        .unwrap();

    assert_eq!(held_during, Some(1));
    assert_eq!(fx.locks.holder_count("stack"), 0);
    assert_eq!(callback.listener_count(), 0);
}

#[tokio::test]
async fn full_semaphore_skips_the_work() {
    let fx = fixture().await;
    fx.locks
        .attempt_to_acquire_lock("stack", 30, 1, "another process")
        .await
        .unwrap()
        .unwrap();
    let ran = Arc::new(AtomicUsize::new(0));
    let counter = ran.clone();

    let result = fx
        .manager
        .run_with_semaphore_lock("stack", 30, 1, &ProgressCallback::shared(), async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(result, None);
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn semaphore_is_released_when_work_fails() {
    let fx = fixture().await;

    let err = fx
        .manager
        .run_with_semaphore_lock("stack", 30, 1, &ProgressCallback::shared(), async {
            Err::<(), _>(Error::Other("work failed".into()))
        })
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "work failed");
    assert_eq!(fx.locks.holder_count("stack"), 0);
}

#[tokio::test(start_paused = true)]
async fn progress_keeps_the_semaphore_alive() {
    let fx = fixture().await;
    let callback = ProgressCallback::shared();
    let cb = callback.clone();
    let locks = fx.locks.clone();

    let held_after = fx
        .manager
        .run_with_semaphore_lock("stack", 10, 1, &callback, async move {
            for _ in 0..3 {
                tokio::time::sleep(Duration::from_secs(6)).await;
                cb.progress_made().await;
            }
            Ok(locks.holder_count("stack"))
        })
        .await
        .unwrap();

    assert_eq!(held_after, Some(1));
}

#[tokio::test]
async fn semaphore_key_is_required() {
    let fx = fixture().await;

    let err = fx
        .manager
        .run_with_semaphore_lock("", 30, 1, &ProgressCallback::shared(), async { Ok(()) })
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "lock_key is required.");
}

#[tokio::test(start_paused = true)]
async fn sleep_is_interrupted_by_cancellation() {
    let fx = fixture().await;
    let token = fx.manager.shutdown_token().child_token();

    fx.manager.sleep(Duration::from_secs(1), &token).await.unwrap();

    fx.manager.force_shutdown();
    assert!(matches!(
        fx.manager.sleep(Duration::from_secs(60), &token).await,
        Err(Error::Interrupted)
    ));
}
