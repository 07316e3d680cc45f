//! Lock requests: what to lock, for how long, and on whose behalf.

use super::LockType;
use crate::error::{Error, Result};
use crate::progress::ProgressCallback;
use crate::semaphore::MAX_LEASE_SECONDS;
use std::sync::Arc;

/// Lease length used when the caller does not pick one.
pub const DEFAULT_LEASE_SECONDS: u64 = 60;
/// Shortest lease a request may ask for.
pub const MIN_LEASE_SECONDS: u64 = 2;

/// An immutable request for a read or write lock.
///
/// Read requests may name several keys, locked atomically in the order
/// given. Write requests name exactly one key. The `context` string is
/// registered with every sub-lock and reported to contending callers.
#[derive(Debug, Clone)]
pub struct LockRequest {
    lock_type: LockType,
    keys: Vec<String>,
    lease_seconds: u64,
    context: String,
    callback: Arc<ProgressCallback>,
}

impl LockRequest {
    /// Request shared access to every key in `keys`.
    pub fn read<I, K>(
        callback: Arc<ProgressCallback>,
        context: impl Into<String>,
        keys: I,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        Self::build(
            LockType::Read,
            callback,
            context.into(),
            keys.into_iter().map(Into::into).collect(),
        )
    }

    /// Request exclusive access to `key`.
    pub fn write(
        callback: Arc<ProgressCallback>,
        context: impl Into<String>,
        key: impl Into<String>,
    ) -> Result<Self> {
        Self::build(LockType::Write, callback, context.into(), vec![key.into()])
    }

    fn build(
        lock_type: LockType,
        callback: Arc<ProgressCallback>,
        context: String,
        keys: Vec<String>,
    ) -> Result<Self> {
        validate(&keys, DEFAULT_LEASE_SECONDS, &context)?;
        Ok(Self {
            lock_type,
            keys,
            lease_seconds: DEFAULT_LEASE_SECONDS,
            context,
            callback,
        })
    }

    pub fn with_lease_seconds(mut self, lease_seconds: u64) -> Result<Self> {
        validate(&self.keys, lease_seconds, &self.context)?;
        self.lease_seconds = lease_seconds;
        Ok(self)
    }

    pub fn lock_type(&self) -> LockType {
        self.lock_type
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn lease_seconds(&self) -> u64 {
        self.lease_seconds
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn callback(&self) -> &Arc<ProgressCallback> {
        &self.callback
    }
}

fn validate(keys: &[String], lease_seconds: u64, context: &str) -> Result<()> {
    if keys.is_empty() {
        return Err(Error::InvalidArgument(
            "lock keys must include at least one key.".into(),
        ));
    }
    if keys.iter().any(|k| k.is_empty()) {
        return Err(Error::InvalidArgument("lock keys cannot contain an empty key.".into()));
    }
    if lease_seconds < MIN_LEASE_SECONDS {
        return Err(Error::InvalidArgument(format!(
            "lease_seconds must be greater than or equal to {MIN_LEASE_SECONDS}."
        )));
    }
    if lease_seconds > MAX_LEASE_SECONDS {
        return Err(Error::InvalidArgument(format!(
            "lease_seconds must be less than or equal to {MAX_LEASE_SECONDS}."
        )));
    }
    if context.trim().is_empty() {
        return Err(Error::required("context"));
    }
    Ok(())
}
