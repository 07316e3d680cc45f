//! Durable message queue interface.
//!
//! A received message stays hidden from other consumers for its visibility
//! timeout. It is gone once deleted; otherwise it becomes visible again when
//! the timeout lapses and is redelivered.

pub mod memory;

pub use memory::MemoryQueue;

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Upper bound on messages returned by a single receive call.
pub const MAX_MESSAGES_PER_REQUEST: usize = 10;

/// Longest visibility timeout a queue accepts (12 hours).
pub const MAX_VISIBILITY_TIMEOUT_SEC: u64 = 43_200;

pub(crate) fn validate_visibility_timeout(timeout_sec: u64) -> Result<()> {
    if timeout_sec > MAX_VISIBILITY_TIMEOUT_SEC {
        return Err(Error::InvalidArgument(format!(
            "visibility timeout cannot be more than {MAX_VISIBILITY_TIMEOUT_SEC} seconds"
        )));
    }
    Ok(())
}

/// A message received from a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Stable identifier of the message.
    pub message_id: String,
    /// Identifies this particular delivery; used to delete or re-time it.
    pub receipt_handle: String,
    pub body: serde_json::Value,
    /// How many times the message has been received, this delivery included.
    pub receive_count: u32,
}

/// Queue transport consumed by the worker stack.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Resolve a queue name to the address used by the other calls.
    async fn queue_url(&self, queue_name: &str) -> Result<String>;

    /// Receive up to `max_messages` visible messages without waiting,
    /// hiding each for `visibility_timeout_sec`.
    async fn receive(
        &self,
        queue_url: &str,
        max_messages: usize,
        visibility_timeout_sec: u64,
    ) -> Result<Vec<Message>>;

    /// Remove the message. Fails with [`Error::NotFound`] when the receipt
    /// handle belongs to an earlier delivery.
    async fn delete(&self, queue_url: &str, message: &Message) -> Result<()>;

    /// Reset the message's visibility timeout to `timeout_sec` from now.
    /// Stale receipt handles are rejected like in [`MessageQueue::delete`].
    async fn change_visibility(
        &self,
        queue_url: &str,
        message: &Message,
        timeout_sec: u64,
    ) -> Result<()>;
}
