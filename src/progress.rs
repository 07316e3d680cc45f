//! Progress notification fan-out.
//!
//! Long-running work calls [`ProgressCallback::progress_made`] periodically.
//! Each call is forwarded to every subscribed [`ProgressListener`] (lock
//! lease refreshers, message visibility refreshers). A listener that fails
//! once is disabled for the rest of the callback's life; the others keep
//! receiving notifications.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::warn;

/// Receives progress notifications.
#[async_trait]
pub trait ProgressListener: Send + Sync {
    async fn progress_made(&self) -> Result<()>;
}

/// Handle returned by [`ProgressCallback::add_listener`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Subscription {
    id: ListenerId,
    listener: Arc<dyn ProgressListener>,
    disabled: bool,
}

/// Fan-out point shared by a unit of work and everything keeping its leases alive.
#[derive(Default)]
pub struct ProgressCallback {
    subscriptions: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for ProgressCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressCallback")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl ProgressCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn subscriptions(&self) -> MutexGuard<'_, Vec<Subscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_listener(&self, listener: Arc<dyn ProgressListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions().push(Subscription {
            id,
            listener,
            disabled: false,
        });
        id
    }

    /// Unsubscribe a listener. Fails if the id is not (or no longer) subscribed.
    pub fn remove_listener(&self, id: ListenerId) -> Result<()> {
        let mut subscriptions = self.subscriptions();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        if subscriptions.len() == before {
            return Err(Error::NotFound(format!("progress listener {}", id.0)));
        }
        Ok(())
    }

    /// Number of subscribed listeners, including disabled ones.
    pub fn listener_count(&self) -> usize {
        self.subscriptions().len()
    }

    /// Notify every enabled listener once.
    ///
    /// The subscription list is snapshotted first so listeners may add or
    /// remove subscriptions while being notified.
    pub async fn progress_made(&self) {
        let active: Vec<(ListenerId, Arc<dyn ProgressListener>)> = self
            .subscriptions()
            .iter()
            .filter(|s| !s.disabled)
            .map(|s| (s.id, Arc::clone(&s.listener)))
            .collect();

        for (id, listener) in active {
            if let Err(e) = listener.progress_made().await {
                warn!(listener = id.0, error = %e, "progress listener failed, disabling it");
                if let Some(s) = self.subscriptions().iter_mut().find(|s| s.id == id) {
                    s.disabled = true;
                }
            }
        }
    }
}

#[async_trait]
impl ProgressListener for ProgressCallback {
    async fn progress_made(&self) -> Result<()> {
        ProgressCallback::progress_made(self).await;
        Ok(())
    }
}
