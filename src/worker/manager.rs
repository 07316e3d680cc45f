//! Infrastructure calls made on behalf of worker stacks.

use super::job::WorkerJob;
use super::runner::MessageDrivenRunner;
use super::status::StackStatus;
use crate::cleanup::FirstError;
use crate::error::{Error, Result};
use crate::lock::{HeldLock, finish_scoped};
use crate::lock::acquired::LeaseRefresher;
use crate::progress::{ProgressCallback, ProgressListener};
use crate::queue::{MAX_MESSAGES_PER_REQUEST, MAX_VISIBILITY_TIMEOUT_SEC, Message, MessageQueue};
use crate::semaphore::CountingLockStore;
use crate::telemetry::spans::{record_job_outcome, start_job_span};
use crate::telemetry::metrics;
use async_trait::async_trait;
use opentelemetry::KeyValue;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;

/// Visibility timeout applied to a message whose job asked for a retry.
pub const RETRY_VISIBILITY_TIMEOUT_SEC: u64 = 2;
/// Shortest visibility timeout accepted when polling.
pub const MIN_VISIBILITY_TIMEOUT_SEC: u64 = 10;

/// Extends a message's visibility timeout each time progress is made.
struct VisibilityRefresher {
    queue: Arc<dyn MessageQueue>,
    queue_url: String,
    message: Message,
    visibility_timeout_sec: u64,
}

#[async_trait]
impl ProgressListener for VisibilityRefresher {
    async fn progress_made(&self) -> Result<()> {
        self.queue
            .change_visibility(&self.queue_url, &self.message, self.visibility_timeout_sec)
            .await
    }
}

/// Shared by every worker stack in a process.
pub struct ConcurrentManager {
    lock_store: Arc<dyn CountingLockStore>,
    queue: Arc<dyn MessageQueue>,
    status: Arc<dyn StackStatus>,
    shutdown: CancellationToken,
    instance_id: String,
}

impl ConcurrentManager {
    pub fn new(
        lock_store: Arc<dyn CountingLockStore>,
        queue: Arc<dyn MessageQueue>,
        status: Arc<dyn StackStatus>,
    ) -> Self {
        Self {
            lock_store,
            queue,
            status,
            shutdown: CancellationToken::new(),
            instance_id: Uuid::new_v4().to_string(),
        }
    }

    /// Identifies this process in semaphore lock contexts.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Stop every stack created from this manager. Jobs that finish after
    /// this leave their messages in the queue for redelivery.
    pub fn force_shutdown(&self) {
        info!(instance_id = %self.instance_id, "forced shutdown");
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Token cancelled by [`ConcurrentManager::force_shutdown`].
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// `false` while the system is in read-only mode. Errors count as read-only.
    pub async fn is_stack_available_for_write(&self) -> bool {
        match self.status.is_read_write().await {
            Ok(read_write) => read_write,
            Err(e) => {
                warn!(error = %e, "failed to read stack status, assuming read-only");
                false
            }
        }
    }

    pub fn current_time(&self) -> Instant {
        Instant::now()
    }

    /// Sleep for `duration`, returning [`Error::Interrupted`] early if
    /// `interrupt` is cancelled.
    pub async fn sleep(&self, duration: Duration, interrupt: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = interrupt.cancelled() => Err(Error::Interrupted),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    pub async fn queue_url(&self, queue_name: &str) -> Result<String> {
        if queue_name.is_empty() {
            return Err(Error::required("queue_name"));
        }
        self.queue.queue_url(queue_name).await
    }

    /// Run `work` while holding one slot of the counting lock `lock_key`.
    ///
    /// Returns `Ok(None)` without running `work` when every slot is taken.
    /// While held, each `callback` notification refreshes the lease. The
    /// listener is removed and the slot released however `work` ends.
    pub async fn run_with_semaphore_lock<F, R>(
        &self,
        lock_key: &str,
        lease_seconds: u64,
        max_lock_count: u32,
        callback: &Arc<ProgressCallback>,
        work: F,
    ) -> Result<Option<R>>
    where
        F: Future<Output = Result<R>>,
    {
        if lock_key.is_empty() {
            return Err(Error::required("lock_key"));
        }
        let context = format!("worker stack semaphore held by {}", self.instance_id);
        let Some(token) = self
            .lock_store
            .attempt_to_acquire_lock(lock_key, lease_seconds, max_lock_count, &context)
            .await?
        else {
            debug!(lock_key, "semaphore lock unavailable");
            return Ok(None);
        };

        let held: Arc<[HeldLock]> = vec![HeldLock {
            key: lock_key.to_string(),
            token: token.clone(),
        }]
        .into();
        let refresher = LeaseRefresher::new(Arc::clone(&self.lock_store), held, lease_seconds);
        let listener = callback.add_listener(Arc::new(refresher));

        let result = work.await;

        let mut errors = FirstError::new();
        errors.record(callback.remove_listener(listener));
        errors.record(self.lock_store.release_lock(lock_key, &token).await);
        let closed = errors.finish_with(|e| Error::LockClose(Box::new(e)));
        if let Err(ref e) = closed {
            warn!(lock_key, token = %token, error = %e, "failed to release semaphore lock");
        }

        finish_scoped(result, closed).map(Some)
    }

    /// Receive up to `max_messages` messages and start one job per message.
    pub async fn poll_for_messages_and_start_jobs(
        &self,
        queue_url: &str,
        max_messages: usize,
        visibility_timeout_sec: u64,
        runner: &Arc<dyn MessageDrivenRunner>,
    ) -> Result<Vec<WorkerJob>> {
        if queue_url.is_empty() {
            return Err(Error::required("queue_url"));
        }
        if max_messages < 1 {
            return Err(Error::InvalidArgument(
                "max_messages must be greater than or equal to 1.".into(),
            ));
        }
        if max_messages > MAX_MESSAGES_PER_REQUEST {
            return Err(Error::InvalidArgument(format!(
                "max_messages must be less than or equal to {MAX_MESSAGES_PER_REQUEST}."
            )));
        }
        if visibility_timeout_sec < MIN_VISIBILITY_TIMEOUT_SEC {
            return Err(Error::InvalidArgument(format!(
                "visibility_timeout_sec must be greater than or equal to {MIN_VISIBILITY_TIMEOUT_SEC}."
            )));
        }
        if visibility_timeout_sec > MAX_VISIBILITY_TIMEOUT_SEC {
            return Err(Error::InvalidArgument(format!(
                "visibility_timeout_sec must be less than or equal to {MAX_VISIBILITY_TIMEOUT_SEC}."
            )));
        }

        let messages = self
            .queue
            .receive(queue_url, max_messages, visibility_timeout_sec)
            .await?;
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", queue_url.to_string()),
                KeyValue::new(
                    "operation",
                    if messages.is_empty() { "receive_empty" } else { "receive" },
                ),
            ],
        );

        Ok(messages
            .into_iter()
            .map(|message| {
                self.start_worker_job(queue_url, visibility_timeout_sec, Arc::clone(runner), message)
            })
            .collect())
    }

    /// Spawn `runner` for `message`.
    ///
    /// The returned job's listener extends the message's visibility by
    /// `visibility_timeout_sec` until the job finishes.
    pub fn start_worker_job(
        &self,
        queue_url: &str,
        visibility_timeout_sec: u64,
        runner: Arc<dyn MessageDrivenRunner>,
        message: Message,
    ) -> WorkerJob {
        let callback = ProgressCallback::shared();
        let listener_id = callback.add_listener(Arc::new(VisibilityRefresher {
            queue: Arc::clone(&self.queue),
            queue_url: queue_url.to_string(),
            message: message.clone(),
            visibility_timeout_sec,
        }));

        let span = start_job_span(queue_url, &message.message_id);
        let message_id = message.message_id.clone();
        let job_callback = Arc::clone(&callback);
        let queue = Arc::clone(&self.queue);
        let queue_url = queue_url.to_string();
        let shutdown = self.shutdown.clone();

        let handle = tokio::spawn(
            async move {
                let start = Instant::now();
                let result = runner.run(Arc::clone(&job_callback), &message).await;
                if let Err(e) = job_callback.remove_listener(listener_id) {
                    debug!(error = %e, "visibility listener already removed");
                }
                let outcome =
                    reconcile_message(&*queue, &queue_url, &message, result, &shutdown).await;
                metrics::job_duration_ms().record(
                    start.elapsed().as_millis() as f64,
                    &[KeyValue::new("queue", queue_url.clone())],
                );
                outcome
            }
            .instrument(span),
        );

        WorkerJob::new(message_id, handle, callback)
    }
}

/// Delete, retry, or abandon a message according to its job's result.
async fn reconcile_message(
    queue: &dyn MessageQueue,
    queue_url: &str,
    message: &Message,
    result: Result<()>,
    shutdown: &CancellationToken,
) -> Result<()> {
    let span = tracing::Span::current();

    if shutdown.is_cancelled() {
        info!(message_id = %message.message_id, "shutting down, leaving message for redelivery");
        record_job_outcome(&span, "abandoned");
        return match result {
            Err(e) if !e.is_recoverable() => Err(e),
            _ => Ok(()),
        };
    }

    match result {
        Ok(()) => {
            record_job_outcome(&span, "deleted");
            match queue.delete(queue_url, message).await {
                Ok(()) => Ok(()),
                // Already gone (e.g. redelivered and handled elsewhere).
                Err(Error::NotFound(what)) => {
                    debug!(message_id = %message.message_id, what, "message already removed");
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
        Err(e) if e.is_recoverable() => {
            info!(message_id = %message.message_id, reason = %e, "job will be retried");
            record_job_outcome(&span, "retry");
            queue
                .change_visibility(queue_url, message, RETRY_VISIBILITY_TIMEOUT_SEC)
                .await
        }
        Err(e) => {
            error!(message_id = %message.message_id, error = %e, "job failed, deleting message");
            record_job_outcome(&span, "failed");
            if let Err(delete_error) = queue.delete(queue_url, message).await {
                warn!(
                    message_id = %message.message_id,
                    error = %delete_error,
                    "failed to delete message of failed job"
                );
            }
            Err(e)
        }
    }
}
