//! In-process counting lock store.
//!
//! Same lease semantics as the Postgres store, but confined to one process.
//! Expiry is measured with `tokio::time::Instant`, so tests can pause and
//! advance time.

use super::{CountingLockStore, LockToken, validate_acquire, validate_lease};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Holder {
    token: LockToken,
    context: String,
    expires_at: Instant,
}

/// Counting lock store held in memory.
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    locks: Mutex<HashMap<String, Vec<Holder>>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn locks(&self) -> MutexGuard<'_, HashMap<String, Vec<Holder>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of unexpired holders of `key`.
    pub fn holder_count(&self, key: &str) -> usize {
        let now = Instant::now();
        self.locks()
            .get(key)
            .map(|holders| holders.iter().filter(|h| h.expires_at > now).count())
            .unwrap_or(0)
    }
}

fn purge_expired(holders: &mut Vec<Holder>, now: Instant) {
    holders.retain(|h| h.expires_at > now);
}

#[async_trait]
impl CountingLockStore for MemoryLockStore {
    async fn attempt_to_acquire_lock(
        &self,
        key: &str,
        lease_seconds: u64,
        max_holders: u32,
        context: &str,
    ) -> Result<Option<LockToken>> {
        validate_acquire(key, lease_seconds, max_holders, context)?;
        let now = Instant::now();
        let mut locks = self.locks();
        let holders = locks.entry(key.to_string()).or_default();
        purge_expired(holders, now);
        if holders.len() >= max_holders as usize {
            return Ok(None);
        }
        let token = LockToken::generate();
        holders.push(Holder {
            token: token.clone(),
            context: context.to_string(),
            expires_at: now + Duration::from_secs(lease_seconds),
        });
        Ok(Some(token))
    }

    async fn release_lock(&self, key: &str, token: &LockToken) -> Result<()> {
        let now = Instant::now();
        let mut locks = self.locks();
        let released = locks.get_mut(key).is_some_and(|holders| {
            purge_expired(holders, now);
            let before = holders.len();
            holders.retain(|h| &h.token != token);
            holders.len() < before
        });
        if !released {
            return Err(Error::LockReleaseFailed {
                key: key.to_string(),
                token: token.to_string(),
            });
        }
        Ok(())
    }

    async fn refresh_lock_timeout(
        &self,
        key: &str,
        token: &LockToken,
        lease_seconds: u64,
    ) -> Result<()> {
        validate_lease(lease_seconds)?;
        let now = Instant::now();
        let mut locks = self.locks();
        let holder = locks
            .get_mut(key)
            .and_then(|holders| {
                purge_expired(holders, now);
                holders.iter_mut().find(|h| &h.token == token)
            })
            .ok_or_else(|| Error::LockReleaseFailed {
                key: key.to_string(),
                token: token.to_string(),
            })?;
        holder.expires_at = now + Duration::from_secs(lease_seconds);
        Ok(())
    }

    async fn first_unexpired_lock_context(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        Ok(self.locks().get(key).and_then(|holders| {
            holders
                .iter()
                .find(|h| h.expires_at > now)
                .map(|h| h.context.clone())
        }))
    }

    async fn release_all_locks(&self) -> Result<()> {
        self.locks().clear();
        Ok(())
    }
}
