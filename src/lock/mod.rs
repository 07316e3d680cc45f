//! Distributed multi-reader / single-writer lock.
//!
//! Built from two counting-lock families per resource key:
//! `"{key}_WRITER_LOCK"` with capacity 1 and `"{key}_READER_LOCK"` with
//! capacity `max_readers`. There is no shared memory between processes;
//! all exclusion comes from the lease store.
//!
//! Keys are locked strictly in the order the caller supplies them. Callers
//! that lock several keys must agree on a global order to avoid deadlock.
//! Writers are not prioritized: a writer that finds active readers polls
//! [`WriteLock::existing_read_lock_context`] until they drain.

pub mod acquired;
pub mod request;

pub use acquired::{HeldLock, ReadLock, WriteLock};
pub use request::{DEFAULT_LEASE_SECONDS, LockRequest, MIN_LEASE_SECONDS};

use crate::error::{Error, Result};
use crate::semaphore::CountingLockStore;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Which side of the reader / writer exclusion a lock is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockType {
    Read,
    Write,
}

impl std::fmt::Display for LockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockType::Read => write!(f, "Read"),
            LockType::Write => write!(f, "Write"),
        }
    }
}

/// Store key of the writer family for `resource_key`.
pub fn writer_key(resource_key: &str) -> String {
    format!("{resource_key}_WRITER_LOCK")
}

/// Store key of the reader family for `resource_key`.
pub fn reader_key(resource_key: &str) -> String {
    format!("{resource_key}_READER_LOCK")
}

/// Reader / writer lock over a shared [`CountingLockStore`].
#[derive(Clone)]
pub struct ReadWriteLock {
    store: Arc<dyn CountingLockStore>,
    max_readers: u32,
}

impl ReadWriteLock {
    pub fn new(store: Arc<dyn CountingLockStore>, max_readers: u32) -> Result<Self> {
        if max_readers < 1 {
            return Err(Error::InvalidArgument(
                "max_readers must be greater than or equal to 1.".into(),
            ));
        }
        Ok(Self { store, max_readers })
    }

    pub fn max_readers(&self) -> u32 {
        self.max_readers
    }

    /// Acquire a reader slot on every key of a read request.
    ///
    /// Fails with [`Error::LockUnavailable`] if any key has an unexpired
    /// writer or no free reader slot. Sub-locks taken before the failing key
    /// are released first.
    pub async fn read_lock(&self, request: &LockRequest) -> Result<ReadLock> {
        if request.lock_type() != LockType::Read {
            return Err(Error::InvalidArgument("expected a read lock request.".into()));
        }
        let held = self.acquire(request).await?;
        Ok(ReadLock::new(
            Arc::clone(&self.store),
            held,
            Arc::clone(request.callback()),
            request.lease_seconds(),
        ))
    }

    /// Acquire the single writer slot for a write request's key.
    ///
    /// Readers that already hold the key are not waited for; see
    /// [`WriteLock::existing_read_lock_context`].
    pub async fn write_lock(&self, request: &LockRequest) -> Result<WriteLock> {
        if request.lock_type() != LockType::Write {
            return Err(Error::InvalidArgument("expected a write lock request.".into()));
        }
        let held = self.acquire(request).await?;
        Ok(WriteLock::new(
            Arc::clone(&self.store),
            request.keys()[0].clone(),
            held,
            Arc::clone(request.callback()),
            request.lease_seconds(),
        ))
    }

    /// Run `work` while holding a read lock, releasing it afterwards.
    ///
    /// A failure from `work` takes precedence over a release failure.
    pub async fn with_read_lock<F, Fut, R>(&self, request: &LockRequest, work: F) -> Result<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let lock = self.read_lock(request).await?;
        let result = work().await;
        finish_scoped(result, lock.release().await)
    }

    /// Run `work` while holding a write lock, once every existing reader
    /// has drained.
    ///
    /// While readers remain, progress is reported on the request's callback
    /// (keeping the writer lease alive) and the readers are polled every
    /// `poll_interval`.
    pub async fn with_write_lock<F, Fut, R>(
        &self,
        request: &LockRequest,
        poll_interval: Duration,
        work: F,
    ) -> Result<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let lock = self.write_lock(request).await?;
        loop {
            match lock.existing_read_lock_context().await {
                Ok(None) => break,
                Ok(Some(reader)) => {
                    debug!(key = %request.keys()[0], reader, "waiting for readers to release");
                    request.callback().progress_made().await;
                    tokio::time::sleep(poll_interval).await;
                }
                Err(e) => return finish_scoped(Err(e), lock.release().await),
            }
        }
        let result = work().await;
        finish_scoped(result, lock.release().await)
    }

    async fn acquire(&self, request: &LockRequest) -> Result<Vec<HeldLock>> {
        let mut held = Vec::with_capacity(request.keys().len());
        let outcome = self.acquire_each(request, &mut held).await;

        let result = match &outcome {
            Ok(()) => "ok",
            Err(e) if e.is_lock_unavailable() => "unavailable",
            Err(_) => "error",
        };
        metrics::lock_acquisitions().add(
            1,
            &[
                KeyValue::new("lock_type", request.lock_type().to_string()),
                KeyValue::new("result", result),
            ],
        );

        match outcome {
            Ok(()) => Ok(held),
            Err(e) => {
                // Rollback errors never mask the acquisition failure.
                acquired::release_all(&*self.store, &held)
                    .await
                    .swallow("lock acquisition rollback");
                if e.is_lock_unavailable() {
                    debug!(error = %e, "lock unavailable");
                    Err(e)
                } else {
                    warn!(error = %e, "lock acquisition fault");
                    Err(Error::LockAcquisition(Box::new(e)))
                }
            }
        }
    }

    async fn acquire_each(&self, request: &LockRequest, held: &mut Vec<HeldLock>) -> Result<()> {
        for key in request.keys() {
            let lock = match request.lock_type() {
                LockType::Read => self.acquire_reader_slot(key, request).await?,
                LockType::Write => self.acquire_writer_slot(key, request).await?,
            };
            held.push(lock);
        }
        Ok(())
    }

    async fn acquire_reader_slot(&self, key: &str, request: &LockRequest) -> Result<HeldLock> {
        if let Some(writer) = self.store.first_unexpired_lock_context(&writer_key(key)).await? {
            return Err(Error::LockUnavailable {
                lock_type: LockType::Write,
                key: key.to_string(),
                holder_context: Some(writer),
            });
        }
        self.acquire_slot(LockType::Read, key, reader_key(key), self.max_readers, request)
            .await
    }

    async fn acquire_writer_slot(&self, key: &str, request: &LockRequest) -> Result<HeldLock> {
        self.acquire_slot(LockType::Write, key, writer_key(key), 1, request)
            .await
    }

    async fn acquire_slot(
        &self,
        lock_type: LockType,
        key: &str,
        store_key: String,
        capacity: u32,
        request: &LockRequest,
    ) -> Result<HeldLock> {
        let token = self
            .store
            .attempt_to_acquire_lock(
                &store_key,
                request.lease_seconds(),
                capacity,
                request.context(),
            )
            .await?;
        match token {
            Some(token) => Ok(HeldLock {
                key: store_key,
                token,
            }),
            None => {
                let holder_context = self.store.first_unexpired_lock_context(&store_key).await?;
                Err(Error::LockUnavailable {
                    lock_type,
                    key: key.to_string(),
                    holder_context,
                })
            }
        }
    }
}

pub(crate) fn finish_scoped<R>(result: Result<R>, closed: Result<()>) -> Result<R> {
    match (result, closed) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(close)) => Err(close),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(close)) => {
            warn!(error = %close, "lock release failed after work failure");
            Err(e)
        }
    }
}
