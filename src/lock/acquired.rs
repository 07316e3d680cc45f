//! Acquired read and write locks.

use super::{LockType, reader_key};
use crate::cleanup::FirstError;
use crate::error::{Error, Result};
use crate::progress::{ListenerId, ProgressCallback, ProgressListener};
use crate::semaphore::{CountingLockStore, LockToken};
use crate::telemetry::metrics;
use async_trait::async_trait;
use opentelemetry::KeyValue;
use std::sync::Arc;
use tracing::{debug, warn};

/// One sub-lock held in the counting lock store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldLock {
    /// Store key, including the reader / writer family suffix.
    pub key: String,
    pub token: LockToken,
}

/// Refreshes the lease of every held sub-lock each time progress is made.
pub(crate) struct LeaseRefresher {
    store: Arc<dyn CountingLockStore>,
    held: Arc<[HeldLock]>,
    lease_seconds: u64,
}

impl LeaseRefresher {
    pub(crate) fn new(
        store: Arc<dyn CountingLockStore>,
        held: Arc<[HeldLock]>,
        lease_seconds: u64,
    ) -> Self {
        Self {
            store,
            held,
            lease_seconds,
        }
    }
}

#[async_trait]
impl ProgressListener for LeaseRefresher {
    async fn progress_made(&self) -> Result<()> {
        let mut errors = FirstError::new();
        for lock in self.held.iter() {
            errors.record(
                self.store
                    .refresh_lock_timeout(&lock.key, &lock.token, self.lease_seconds)
                    .await,
            );
        }
        errors.finish()
    }
}

/// Release every sub-lock in order, attempting all of them.
pub(crate) async fn release_all(store: &dyn CountingLockStore, held: &[HeldLock]) -> FirstError {
    let mut errors = FirstError::new();
    for lock in held {
        let result = store.release_lock(&lock.key, &lock.token).await;
        if let Err(ref e) = result {
            warn!(key = %lock.key, token = %lock.token, error = %e, "failed to release lock");
        }
        errors.record(result);
    }
    errors
}

/// State shared by read and write locks: the held sub-locks and the
/// listener keeping them alive.
struct AcquiredLock {
    lock_type: LockType,
    store: Arc<dyn CountingLockStore>,
    held: Arc<[HeldLock]>,
    callback: Arc<ProgressCallback>,
    listener: Option<ListenerId>,
    released: bool,
}

impl AcquiredLock {
    fn new(
        lock_type: LockType,
        store: Arc<dyn CountingLockStore>,
        held: Vec<HeldLock>,
        callback: Arc<ProgressCallback>,
        lease_seconds: u64,
    ) -> Self {
        let held: Arc<[HeldLock]> = held.into();
        let refresher = LeaseRefresher::new(Arc::clone(&store), Arc::clone(&held), lease_seconds);
        let listener = callback.add_listener(Arc::new(refresher));
        Self {
            lock_type,
            store,
            held,
            callback,
            listener: Some(listener),
            released: false,
        }
    }

    async fn release(&mut self) -> Result<()> {
        self.released = true;
        let mut errors = FirstError::new();
        match self.listener.take() {
            Some(id) => errors.record(self.callback.remove_listener(id)),
            None => errors.record(Err(Error::NotFound("lease refresh listener".into()))),
        }
        let releases = release_all(&*self.store, &self.held).await;
        errors.record(releases.finish());

        let result = if errors.has_error() { "error" } else { "ok" };
        metrics::lock_releases().add(
            1,
            &[
                KeyValue::new("lock_type", self.lock_type.to_string()),
                KeyValue::new("result", result),
            ],
        );
        debug!(lock_type = %self.lock_type, locks = self.held.len(), result, "lock released");
        errors.finish_with(|e| Error::LockClose(Box::new(e)))
    }
}

impl Drop for AcquiredLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Some(id) = self.listener.take() {
            let _ = self.callback.remove_listener(id);
        }
        let keys: Vec<&str> = self.held.iter().map(|l| l.key.as_str()).collect();
        warn!(
            lock_type = %self.lock_type,
            ?keys,
            "lock dropped without release, holding until lease expires"
        );
    }
}

/// Shared access to one or more keys.
pub struct ReadLock {
    inner: AcquiredLock,
}

impl ReadLock {
    pub(crate) fn new(
        store: Arc<dyn CountingLockStore>,
        held: Vec<HeldLock>,
        callback: Arc<ProgressCallback>,
        lease_seconds: u64,
    ) -> Self {
        Self {
            inner: AcquiredLock::new(LockType::Read, store, held, callback, lease_seconds),
        }
    }

    /// Sub-locks held, in acquisition order.
    pub fn held(&self) -> &[HeldLock] {
        &self.inner.held
    }

    /// Unsubscribe the lease refresher and release every sub-lock.
    ///
    /// Every step is attempted; the first failure is returned wrapped in
    /// [`Error::LockClose`].
    pub async fn release(mut self) -> Result<()> {
        self.inner.release().await
    }
}

/// Exclusive access to a single key.
pub struct WriteLock {
    inner: AcquiredLock,
    resource_key: String,
}

impl WriteLock {
    pub(crate) fn new(
        store: Arc<dyn CountingLockStore>,
        resource_key: String,
        held: Vec<HeldLock>,
        callback: Arc<ProgressCallback>,
        lease_seconds: u64,
    ) -> Self {
        Self {
            inner: AcquiredLock::new(LockType::Write, store, held, callback, lease_seconds),
            resource_key,
        }
    }

    pub fn held(&self) -> &[HeldLock] {
        &self.inner.held
    }

    /// Context of any reader still holding the key, without blocking.
    ///
    /// Holding the write lock stops new readers; callers poll this until it
    /// returns `None` before doing exclusive work.
    pub async fn existing_read_lock_context(&self) -> Result<Option<String>> {
        self.inner
            .store
            .first_unexpired_lock_context(&reader_key(&self.resource_key))
            .await
    }

    /// Unsubscribe the lease refresher and release the writer slot.
    pub async fn release(mut self) -> Result<()> {
        self.inner.release().await
    }
}

impl std::fmt::Debug for AcquiredLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquiredLock")
            .field("lock_type", &self.lock_type)
            .field("held", &self.held)
            .field("listener", &self.listener)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for ReadLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadLock").field("inner", &self.inner).finish()
    }
}

impl std::fmt::Debug for WriteLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteLock")
            .field("inner", &self.inner)
            .field("resource_key", &self.resource_key)
            .finish()
    }
}
