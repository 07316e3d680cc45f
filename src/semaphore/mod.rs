//! Counting lock store: the lease primitive everything else is built on.
//!
//! A counting lock grants up to `max_holders` concurrent holders of a named
//! key, each for a bounded lease. Holders are identified by an opaque
//! [`LockToken`] that must be presented to release or refresh the lease.

pub mod memory;

pub use memory::MemoryLockStore;

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Maximum length of the context string registered with a lock holder.
pub const MAX_CONTEXT_CHARS: usize = 256;

/// Longest lease a store grants or extends (12 hours).
pub const MAX_LEASE_SECONDS: u64 = 43_200;

/// Opaque credential proving ownership of one lease.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockToken(String);

impl LockToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Generate a fresh random token.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Storage-backed lease primitive shared by every process in the fleet.
#[async_trait]
pub trait CountingLockStore: Send + Sync {
    /// Grant a slot if fewer than `max_holders` unexpired holders exist for `key`.
    async fn attempt_to_acquire_lock(
        &self,
        key: &str,
        lease_seconds: u64,
        max_holders: u32,
        context: &str,
    ) -> Result<Option<LockToken>>;

    /// Release a held slot. Fails with [`Error::LockReleaseFailed`] when the
    /// token is not a current holder.
    async fn release_lock(&self, key: &str, token: &LockToken) -> Result<()>;

    /// Extend a held lease. Fails with [`Error::LockReleaseFailed`] when the
    /// token is not a current holder.
    async fn refresh_lock_timeout(
        &self,
        key: &str,
        token: &LockToken,
        lease_seconds: u64,
    ) -> Result<()>;

    /// Context string of any unexpired holder of `key`.
    async fn first_unexpired_lock_context(&self, key: &str) -> Result<Option<String>>;

    /// Drop every lock. Administrative use only.
    async fn release_all_locks(&self) -> Result<()>;
}

/// Argument checks shared by every store implementation.
pub(crate) fn validate_acquire(
    key: &str,
    lease_seconds: u64,
    max_holders: u32,
    context: &str,
) -> Result<()> {
    validate_lease(lease_seconds)?;
    if key.is_empty() {
        return Err(Error::InvalidArgument("key cannot be empty".into()));
    }
    if max_holders < 1 {
        return Err(Error::InvalidArgument(
            "max_holders must be greater than or equal to 1".into(),
        ));
    }
    if context.trim().is_empty() {
        return Err(Error::InvalidArgument("context cannot be blank".into()));
    }
    if context.chars().count() > MAX_CONTEXT_CHARS {
        return Err(Error::InvalidArgument(format!(
            "context length cannot be more than {MAX_CONTEXT_CHARS} characters"
        )));
    }
    Ok(())
}

pub(crate) fn validate_lease(lease_seconds: u64) -> Result<()> {
    if lease_seconds > MAX_LEASE_SECONDS {
        return Err(Error::InvalidArgument(format!(
            "lease cannot be more than {MAX_LEASE_SECONDS} seconds"
        )));
    }
    Ok(())
}
