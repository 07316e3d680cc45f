//! Queue-driven worker stack.
//!
//! A [`ConcurrentWorkerStack`] keeps up to `max_threads_per_machine` jobs
//! running on this process, fed from a shared queue and gated by a
//! fleet-wide semaphore lock. The [`ConcurrentManager`] owns the
//! infrastructure calls: semaphore locking, queue polling, and per-message
//! job execution with delete / retry reconciliation.

pub mod job;
pub mod manager;
pub mod runner;
pub mod stack;
pub mod status;

pub use job::WorkerJob;
pub use manager::{ConcurrentManager, RETRY_VISIBILITY_TIMEOUT_SEC};
pub use runner::{CommandRunner, MessageDrivenRunner};
pub use stack::{ConcurrentWorkerStack, ConcurrentWorkerStackBuilder, StackState};
pub use status::{StackStatus, StaticStackStatus};
