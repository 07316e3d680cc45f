//! Error types for leasehold.

use crate::lock::LockType;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Another holder owns the lock. Routine contention, retry later.
    #[error("{lock_type} lock unavailable for key '{key}'{}", holder_suffix(.holder_context))]
    LockUnavailable {
        lock_type: LockType,
        key: String,
        holder_context: Option<String>,
    },

    /// The lock store no longer recognizes the token (lease expired or reassigned).
    #[error("failed to release or refresh lock '{key}' with token '{token}'")]
    LockReleaseFailed { key: String, token: String },

    /// Infrastructure fault raised while acquiring a lock.
    #[error("lock acquisition failed: {0}")]
    LockAcquisition(#[source] Box<Error>),

    /// One or more steps of releasing an acquired lock failed; carries the first.
    #[error("failed to close lock: {0}")]
    LockClose(#[source] Box<Error>),

    /// Raised by job logic to request redelivery of its message later.
    #[error("recoverable failure: {0}")]
    Recoverable(String),

    #[error("interrupted")]
    Interrupted,

    #[error("{0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

fn holder_suffix(context: &Option<String>) -> String {
    match context {
        Some(context) => format!(" (held by: {context})"),
        None => String::new(),
    }
}

impl Error {
    pub fn is_lock_unavailable(&self) -> bool {
        matches!(self, Error::LockUnavailable { .. })
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Recoverable(_))
    }

    /// Shorthand for `InvalidArgument(format!("{name} is required."))`.
    pub(crate) fn required(name: &str) -> Self {
        Error::InvalidArgument(format!("{name} is required."))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
