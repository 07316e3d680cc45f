//! The worker stack control loop.

use super::job::WorkerJob;
use super::manager::ConcurrentManager;
use super::runner::MessageDrivenRunner;
use crate::error::{Error, Result};
use crate::lock::DEFAULT_LEASE_SECONDS;
use crate::progress::ProgressCallback;
use crate::queue::{MAX_MESSAGES_PER_REQUEST, MAX_VISIBILITY_TIMEOUT_SEC};
use crate::telemetry::spans::start_stack_span;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

/// Pause after a cycle that started new jobs.
pub const MIN_WAIT: Duration = Duration::from_millis(100);
/// Pause after an idle cycle.
pub const MAX_WAIT: Duration = Duration::from_secs(1);
/// Shortest lease a stack accepts for its semaphore and its messages.
pub const MIN_STACK_LEASE_SECONDS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackState {
    Continue,
    /// Terminal. Running jobs are drained, no new ones start.
    ShutDown,
}

/// Keeps up to `max_threads_per_machine` jobs running, fed from one queue
/// and gated by a fleet-wide semaphore lock.
pub struct ConcurrentWorkerStack {
    name: String,
    manager: Arc<ConcurrentManager>,
    runner: Arc<dyn MessageDrivenRunner>,
    queue_name: String,
    semaphore_lock_key: String,
    semaphore_max_lock_count: u32,
    lease_seconds: u64,
    max_threads_per_machine: usize,
    can_run_in_read_only: bool,
    shutdown: CancellationToken,
    state: StackState,
    running_jobs: Vec<WorkerJob>,
    lock_callback: Arc<ProgressCallback>,
    next_refresh_time: Instant,
}

impl ConcurrentWorkerStack {
    pub fn builder() -> ConcurrentWorkerStackBuilder {
        ConcurrentWorkerStackBuilder::default()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn state(&self) -> StackState {
        self.state
    }

    pub fn running_job_count(&self) -> usize {
        self.running_jobs.len()
    }

    /// Cancelling this token shuts the stack down. It is also cancelled by
    /// [`ConcurrentManager::force_shutdown`].
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run one cycle: take a semaphore slot and process messages until shut
    /// down, then drain running jobs.
    ///
    /// Does nothing if the stack is shut down, the system is read-only (and
    /// the stack may not run then), or every semaphore slot is taken.
    pub async fn run(&mut self) -> Result<()> {
        if !self.can_process_more_messages().await {
            debug!(stack = %self.name, "not processing messages this cycle");
            return Ok(());
        }
        let queue_url = self.manager.queue_url(&self.queue_name).await?;
        // The semaphore's lease refresher subscribes to this callback.
        self.lock_callback = ProgressCallback::shared();

        let manager = Arc::clone(&self.manager);
        let callback = Arc::clone(&self.lock_callback);
        let lock_key = self.semaphore_lock_key.clone();
        let lease_seconds = self.lease_seconds;
        let max_lock_count = self.semaphore_max_lock_count;
        let span = start_stack_span(&self.name);

        let held = manager
            .run_with_semaphore_lock(
                &lock_key,
                lease_seconds,
                max_lock_count,
                &callback,
                self.run_while_holding_lock(&queue_url),
            )
            .instrument(span)
            .await?;
        if held.is_none() {
            debug!(stack = %self.name, lock_key, "semaphore full, skipping cycle");
        }
        Ok(())
    }

    /// Call [`ConcurrentWorkerStack::run`] every `retry_interval` until the
    /// stack shuts down. Cycle errors are logged and retried.
    pub async fn run_until_shutdown(&mut self, retry_interval: Duration) {
        loop {
            if let Err(e) = self.run().await {
                error!(stack = %self.name, error = %e, "worker stack cycle failed");
            }
            if self.shutdown.is_cancelled() {
                self.start_shutdown();
            }
            if self.state == StackState::ShutDown {
                break;
            }
            if self.manager.sleep(retry_interval, &self.shutdown).await.is_err() {
                self.start_shutdown();
                break;
            }
        }
        info!(stack = %self.name, "worker stack stopped");
    }

    async fn run_while_holding_lock(&mut self, queue_url: &str) -> Result<()> {
        info!(stack = %self.name, queue_url, "worker stack holding semaphore");
        self.reset_all_state();
        loop {
            self.refresh_locks_if_needed().await;
            self.check_running_jobs().await;
            let added = self.attempt_to_add_more_workers(queue_url).await;
            self.pause(if added { MIN_WAIT } else { MAX_WAIT }).await;
            if !self.should_continue_running() {
                break;
            }
        }
        Ok(())
    }

    fn should_continue_running(&self) -> bool {
        self.state == StackState::Continue || !self.running_jobs.is_empty()
    }

    async fn can_process_more_messages(&mut self) -> bool {
        if self.shutdown.is_cancelled() {
            self.start_shutdown();
        }
        if self.state != StackState::Continue {
            return false;
        }
        self.can_run_in_read_only || self.manager.is_stack_available_for_write().await
    }

    fn start_shutdown(&mut self) {
        if self.state == StackState::ShutDown {
            return;
        }
        info!(
            stack = %self.name,
            running = self.running_jobs.len(),
            "worker stack shutting down"
        );
        self.state = StackState::ShutDown;
        self.shutdown.cancel();
    }

    fn reset_all_state(&mut self) {
        self.running_jobs = Vec::new();
        self.reset_next_refresh_time();
    }

    fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.lease_seconds * 1000 / 3)
    }

    fn reset_next_refresh_time(&mut self) {
        self.next_refresh_time = self.manager.current_time() + self.refresh_interval();
    }

    async fn refresh_locks_if_needed(&mut self) {
        if self.manager.current_time() < self.next_refresh_time {
            return;
        }
        debug!(
            stack = %self.name,
            jobs = self.running_jobs.len(),
            "refreshing message and semaphore leases"
        );
        for job in &self.running_jobs {
            if let Err(e) = job.listener().progress_made().await {
                warn!(message_id = job.message_id(), error = %e, "failed to refresh job lease");
            }
        }
        self.lock_callback.progress_made().await;
        self.reset_next_refresh_time();
    }

    /// Reap finished jobs. Their messages were already reconciled by the
    /// job itself, so only cancellation changes the stack's state.
    /// Cancellation comes from [`WorkerJob::abort`] or a runtime shutdown.
    async fn check_running_jobs(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.running_jobs)
            .into_iter()
            .partition(WorkerJob::is_finished);
        self.running_jobs = running;

        for job in finished {
            let message_id = job.message_id().to_string();
            match job.join().await {
                Ok(Ok(())) => debug!(message_id, "job finished"),
                Ok(Err(e)) => debug!(message_id, error = %e, "job finished with error"),
                Err(e) if e.is_cancelled() => {
                    warn!(message_id, "job was cancelled");
                    self.start_shutdown();
                }
                Err(e) => error!(message_id, error = %e, "job panicked"),
            }
        }
    }

    /// Start jobs for free slots. Returns whether any job was started.
    async fn attempt_to_add_more_workers(&mut self, queue_url: &str) -> bool {
        let open_slots = self
            .max_threads_per_machine
            .saturating_sub(self.running_jobs.len());
        if open_slots == 0 || !self.can_process_more_messages().await {
            return false;
        }

        let max_messages = open_slots.min(MAX_MESSAGES_PER_REQUEST);
        match self
            .manager
            .poll_for_messages_and_start_jobs(
                queue_url,
                max_messages,
                self.lease_seconds,
                &self.runner,
            )
            .await
        {
            Ok(jobs) => {
                let added = !jobs.is_empty();
                if added {
                    debug!(stack = %self.name, started = jobs.len(), "started jobs");
                }
                self.running_jobs.extend(jobs);
                added
            }
            Err(e) => {
                warn!(stack = %self.name, queue_url, error = %e, "failed to poll for messages");
                false
            }
        }
    }

    async fn pause(&mut self, wait: Duration) {
        if self.state == StackState::ShutDown {
            // Draining: the shutdown token is already cancelled.
            tokio::time::sleep(wait).await;
            return;
        }
        if let Err(Error::Interrupted) = self.manager.sleep(wait, &self.shutdown).await {
            self.start_shutdown();
        }
    }
}

impl std::fmt::Debug for ConcurrentWorkerStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentWorkerStack")
            .field("name", &self.name)
            .field("queue_name", &self.queue_name)
            .field("semaphore_lock_key", &self.semaphore_lock_key)
            .field("state", &self.state)
            .field("running_jobs", &self.running_jobs.len())
            .finish()
    }
}

/// Builder for [`ConcurrentWorkerStack`].
pub struct ConcurrentWorkerStackBuilder {
    name: Option<String>,
    manager: Option<Arc<ConcurrentManager>>,
    runner: Option<Arc<dyn MessageDrivenRunner>>,
    queue_name: Option<String>,
    semaphore_lock_key: Option<String>,
    semaphore_max_lock_count: u32,
    lease_seconds: u64,
    max_threads_per_machine: usize,
    can_run_in_read_only: bool,
}

impl Default for ConcurrentWorkerStackBuilder {
    fn default() -> Self {
        Self {
            name: None,
            manager: None,
            runner: None,
            queue_name: None,
            semaphore_lock_key: None,
            semaphore_max_lock_count: 1,
            lease_seconds: DEFAULT_LEASE_SECONDS,
            max_threads_per_machine: 1,
            can_run_in_read_only: false,
        }
    }
}

impl ConcurrentWorkerStackBuilder {
    /// Used in logs. Defaults to the queue name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_manager(mut self, manager: Arc<ConcurrentManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    pub fn with_runner(mut self, runner: Arc<dyn MessageDrivenRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn with_queue_name(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }

    pub fn with_semaphore_lock_key(mut self, key: impl Into<String>) -> Self {
        self.semaphore_lock_key = Some(key.into());
        self
    }

    /// Stack instances allowed to run at once across the fleet.
    pub fn with_semaphore_max_lock_count(mut self, count: u32) -> Self {
        self.semaphore_max_lock_count = count;
        self
    }

    /// Lease of the semaphore lock and visibility timeout of received messages.
    pub fn with_lease_seconds(mut self, seconds: u64) -> Self {
        self.lease_seconds = seconds;
        self
    }

    pub fn with_max_threads_per_machine(mut self, threads: usize) -> Self {
        self.max_threads_per_machine = threads;
        self
    }

    pub fn with_can_run_in_read_only(mut self, allowed: bool) -> Self {
        self.can_run_in_read_only = allowed;
        self
    }

    pub fn build(self) -> Result<ConcurrentWorkerStack> {
        let manager = self.manager.ok_or_else(|| Error::required("manager"))?;
        let runner = self.runner.ok_or_else(|| Error::required("runner"))?;
        let queue_name = self
            .queue_name
            .filter(|q| !q.is_empty())
            .ok_or_else(|| Error::required("queue_name"))?;
        let semaphore_lock_key = self
            .semaphore_lock_key
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::required("semaphore_lock_key"))?;
        if self.lease_seconds < MIN_STACK_LEASE_SECONDS {
            return Err(Error::InvalidArgument(format!(
                "lease_seconds must be greater than or equal to {MIN_STACK_LEASE_SECONDS}."
            )));
        }
        // Also the visibility timeout of received messages.
        if self.lease_seconds > MAX_VISIBILITY_TIMEOUT_SEC {
            return Err(Error::InvalidArgument(format!(
                "lease_seconds must be less than or equal to {MAX_VISIBILITY_TIMEOUT_SEC}."
            )));
        }
        if self.semaphore_max_lock_count < 1 {
            return Err(Error::InvalidArgument(
                "semaphore_max_lock_count must be greater than or equal to 1.".into(),
            ));
        }
        if self.max_threads_per_machine < 1 {
            return Err(Error::InvalidArgument(
                "max_threads_per_machine must be greater than or equal to 1.".into(),
            ));
        }

        let shutdown = manager.shutdown_token().child_token();
        let next_refresh_time = manager.current_time();
        Ok(ConcurrentWorkerStack {
            name: self.name.unwrap_or_else(|| queue_name.clone()),
            manager,
            runner,
            queue_name,
            semaphore_lock_key,
            semaphore_max_lock_count: self.semaphore_max_lock_count,
            lease_seconds: self.lease_seconds,
            max_threads_per_machine: self.max_threads_per_machine,
            can_run_in_read_only: self.can_run_in_read_only,
            shutdown,
            state: StackState::Continue,
            running_jobs: Vec::new(),
            lock_callback: ProgressCallback::shared(),
            next_refresh_time,
        })
    }
}

#[cfg(test)]
#[path = "stack_tests.rs"]
mod tests;
