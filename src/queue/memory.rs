//! In-process queue with visibility-timeout semantics.
//!
//! Useful for local runs and tests. Time comes from `tokio::time::Instant`.

use super::{Message, MessageQueue, validate_visibility_timeout};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

const URL_SCHEME: &str = "memory://";

#[derive(Debug)]
struct Stored {
    message_id: String,
    body: serde_json::Value,
    visible_at: Instant,
    receive_count: u32,
    receipt_handle: Option<String>,
}

/// Named FIFO queues kept in memory.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    queues: Mutex<HashMap<String, Vec<Stored>>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<String, Vec<Stored>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a queue (idempotent).
    pub fn create_queue(&self, queue_name: &str) {
        self.queues().entry(queue_name.to_string()).or_default();
    }

    /// Enqueue a message, visible immediately. Returns its id.
    pub fn send(&self, queue_name: &str, body: serde_json::Value) -> Result<String> {
        let mut queues = self.queues();
        let queue = queues
            .get_mut(queue_name)
            .ok_or_else(|| Error::NotFound(format!("queue {queue_name}")))?;
        let message_id = Uuid::new_v4().to_string();
        queue.push(Stored {
            message_id: message_id.clone(),
            body,
            visible_at: Instant::now(),
            receive_count: 0,
            receipt_handle: None,
        });
        Ok(message_id)
    }

    /// Messages not yet deleted, visible or not.
    pub fn len(&self, queue_name: &str) -> usize {
        self.queues().get(queue_name).map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self, queue_name: &str) -> bool {
        self.len(queue_name) == 0
    }

    /// Messages a receive call would return right now.
    pub fn visible_len(&self, queue_name: &str) -> usize {
        let now = Instant::now();
        self.queues()
            .get(queue_name)
            .map(|q| q.iter().filter(|m| m.visible_at <= now).count())
            .unwrap_or(0)
    }
}

fn queue_name(queue_url: &str) -> Result<&str> {
    queue_url
        .strip_prefix(URL_SCHEME)
        .ok_or_else(|| Error::InvalidArgument(format!("not a memory queue url: {queue_url}")))
}

/// Locate the current delivery of `message`. A stale receipt handle (the
/// message was redelivered since) does not match.
fn find_delivery<'a>(
    queues: &'a mut HashMap<String, Vec<Stored>>,
    queue_url: &str,
    message: &Message,
) -> Result<(&'a mut Vec<Stored>, usize)> {
    let name = queue_name(queue_url)?;
    let queue = queues
        .get_mut(name)
        .ok_or_else(|| Error::NotFound(format!("queue {name}")))?;
    let index = queue
        .iter()
        .position(|m| m.receipt_handle.as_deref() == Some(message.receipt_handle.as_str()))
        .ok_or_else(|| Error::NotFound(format!("message {}", message.message_id)))?;
    Ok((queue, index))
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn queue_url(&self, queue_name: &str) -> Result<String> {
        if queue_name.is_empty() {
            return Err(Error::required("queue_name"));
        }
        if !self.queues().contains_key(queue_name) {
            return Err(Error::NotFound(format!("queue {queue_name}")));
        }
        Ok(format!("{URL_SCHEME}{queue_name}"))
    }

    async fn receive(
        &self,
        queue_url: &str,
        max_messages: usize,
        visibility_timeout_sec: u64,
    ) -> Result<Vec<Message>> {
        let name = queue_name(queue_url)?;
        validate_visibility_timeout(visibility_timeout_sec)?;
        let now = Instant::now();
        let mut queues = self.queues();
        let queue = queues
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("queue {name}")))?;

        let mut received = Vec::new();
        for stored in queue.iter_mut().filter(|m| m.visible_at <= now) {
            if received.len() >= max_messages {
                break;
            }
            let receipt_handle = Uuid::new_v4().to_string();
            stored.visible_at = now + Duration::from_secs(visibility_timeout_sec);
            stored.receive_count += 1;
            stored.receipt_handle = Some(receipt_handle.clone());
            received.push(Message {
                message_id: stored.message_id.clone(),
                receipt_handle,
                body: stored.body.clone(),
                receive_count: stored.receive_count,
            });
        }
        Ok(received)
    }

    async fn delete(&self, queue_url: &str, message: &Message) -> Result<()> {
        let mut queues = self.queues();
        let (queue, index) = find_delivery(&mut queues, queue_url, message)?;
        queue.remove(index);
        Ok(())
    }

    async fn change_visibility(
        &self,
        queue_url: &str,
        message: &Message,
        timeout_sec: u64,
    ) -> Result<()> {
        validate_visibility_timeout(timeout_sec)?;
        let mut queues = self.queues();
        let (queue, index) = find_delivery(&mut queues, queue_url, message)?;
        queue[index].visible_at = Instant::now() + Duration::from_secs(timeout_sec);
        Ok(())
    }
}
