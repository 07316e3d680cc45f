//! Message queue over pgmq.
//!
//! Calls pgmq's SQL functions (`pgmq.create`, `pgmq.send`, `pgmq.read`)
//! and writes its queue tables directly to settle a delivery. A queue URL is
//! `pgmq://{queue_name}`. pgmq has no receipt handles, so the handle is
//! `{msg_id}:{read_ct}`; deleting or re-timing a message only matches the row
//! while its read count is unchanged, so a stale delivery cannot touch a
//! newer one.

use super::Db;
use crate::error::{Error, Result};
use crate::queue::{Message, MessageQueue, validate_visibility_timeout};
use crate::telemetry::metrics;
use async_trait::async_trait;
use opentelemetry::KeyValue;

const URL_SCHEME: &str = "pgmq://";

fn queue_name(queue_url: &str) -> Result<&str> {
    queue_url
        .strip_prefix(URL_SCHEME)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| Error::InvalidArgument(format!("not a pgmq queue url: {queue_url}")))
}

/// pgmq's table for a queue. Names are restricted to what `pgmq.create` accepts.
fn queue_table(name: &str) -> Result<String> {
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(Error::InvalidArgument(format!("not a pgmq queue name: {name}")));
    }
    Ok(format!("pgmq.q_{name}"))
}

/// `(msg_id, read_ct)` of the delivery named by the receipt handle.
fn delivery(message: &Message) -> Result<(i64, i32)> {
    let invalid =
        || Error::InvalidArgument(format!("not a pgmq receipt handle: {}", message.receipt_handle));
    let (msg_id, read_ct) = message.receipt_handle.split_once(':').ok_or_else(invalid)?;
    Ok((
        msg_id.parse().map_err(|_| invalid())?,
        read_ct.parse().map_err(|_| invalid())?,
    ))
}

fn count(queue: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

fn timeout_secs(timeout_sec: u64) -> Result<i32> {
    validate_visibility_timeout(timeout_sec)?;
    i32::try_from(timeout_sec)
        .map_err(|_| Error::InvalidArgument(format!("visibility timeout too large: {timeout_sec}")))
}

impl Db {
    /// Create a pgmq queue (idempotent).
    pub async fn create_queue(&self, queue_name: &str) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue_name)
            .execute(&self.pool)
            .await?;
        count(queue_name, "create");
        Ok(())
    }

    /// Enqueue a message, delivered after `delay_seconds`. Returns its id.
    pub async fn send_to_queue(
        &self,
        queue_name: &str,
        payload: &serde_json::Value,
        delay_seconds: i32,
    ) -> Result<i64> {
        let (msg_id,): (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, $3)")
            .bind(queue_name)
            .bind(payload)
            .bind(delay_seconds)
            .fetch_one(&self.pool)
            .await?;
        count(queue_name, "send");
        Ok(msg_id)
    }

    /// Names of every pgmq queue.
    pub async fn list_queues(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT queue_name FROM pgmq.list_queues() ORDER BY queue_name")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }
}

#[async_trait]
impl MessageQueue for Db {
    async fn queue_url(&self, queue_name: &str) -> Result<String> {
        if queue_name.is_empty() {
            return Err(Error::required("queue_name"));
        }
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM pgmq.list_queues() WHERE queue_name = $1)",
        )
        .bind(queue_name)
        .fetch_one(&self.pool)
        .await?;
        if !exists {
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
        let qty = i32::try_from(max_messages)
            .map_err(|_| Error::InvalidArgument(format!("too many messages: {max_messages}")))?;
        let rows: Vec<(i64, i32, serde_json::Value)> =
            sqlx::query_as("SELECT msg_id, read_ct, message FROM pgmq.read($1, $2, $3)")
                .bind(name)
                .bind(timeout_secs(visibility_timeout_sec)?)
                .bind(qty)
                .fetch_all(&self.pool)
                .await?;
        count(name, if rows.is_empty() { "read_empty" } else { "read" });

        Ok(rows
            .into_iter()
            .map(|(msg_id, read_ct, body)| Message {
                message_id: msg_id.to_string(),
                receipt_handle: format!("{msg_id}:{read_ct}"),
                body,
                receive_count: u32::try_from(read_ct).unwrap_or(0),
            })
            .collect())
    }

    async fn delete(&self, queue_url: &str, message: &Message) -> Result<()> {
        let name = queue_name(queue_url)?;
        let (msg_id, read_ct) = delivery(message)?;
        let sql = format!(
            "DELETE FROM {} WHERE msg_id = $1 AND read_ct = $2",
            queue_table(name)?
        );
        let result = sqlx::query(&sql)
            .bind(msg_id)
            .bind(read_ct)
            .execute(&self.pool)
            .await?;
        count(name, "delete");
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("message {}", message.message_id)));
        }
        Ok(())
    }

    async fn change_visibility(
        &self,
        queue_url: &str,
        message: &Message,
        timeout_sec: u64,
    ) -> Result<()> {
        let name = queue_name(queue_url)?;
        let (msg_id, read_ct) = delivery(message)?;
        let sql = format!(
            "UPDATE {} SET vt = clock_timestamp() + make_interval(secs => $3) \
             WHERE msg_id = $1 AND read_ct = $2",
            queue_table(name)?
        );
        let result = sqlx::query(&sql)
            .bind(msg_id)
            .bind(read_ct)
            .bind(f64::from(timeout_secs(timeout_sec)?))
            .execute(&self.pool)
            .await?;
        count(name, "set_vt");
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("message {}", message.message_id)));
        }
        Ok(())
    }
}
