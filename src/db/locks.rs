//! Counting locks in the `semaphore_locks` table.
//!
//! Each holder is one row. Acquisition serializes per key with a
//! transaction-scoped advisory lock, purges expired rows, and inserts a new
//! row only while fewer than `max_holders` remain. Expiry is judged by the
//! database clock.

use super::Db;
use crate::error::{Error, Result};
use crate::semaphore::{CountingLockStore, LockToken, validate_acquire, validate_lease};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

/// A row of the lock table, for diagnostics.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LockHolder {
    pub lock_key: String,
    pub token: String,
    pub context: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

fn lease_secs(lease_seconds: u64) -> f64 {
    lease_seconds as f64
}

impl Db {
    /// Unexpired holders, optionally only those whose key starts with `prefix`.
    pub async fn list_locks(&self, prefix: Option<&str>) -> Result<Vec<LockHolder>> {
        let pattern = format!("{}%", prefix.unwrap_or_default());
        let holders = sqlx::query_as::<_, LockHolder>(
            "SELECT lock_key, token, context, acquired_at, expires_at \
             FROM semaphore_locks \
             WHERE expires_at > now() AND lock_key LIKE $1 \
             ORDER BY lock_key, acquired_at",
        )
        .bind(pattern)
        .fetch_all(&self.pool)
        .await?;
        Ok(holders)
    }

    /// Drop every holder of one key. Returns how many rows were removed.
    pub async fn clear_lock(&self, key: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM semaphore_locks WHERE lock_key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl CountingLockStore for Db {
    async fn attempt_to_acquire_lock(
        &self,
        key: &str,
        lease_seconds: u64,
        max_holders: u32,
        context: &str,
    ) -> Result<Option<LockToken>> {
        validate_acquire(key, lease_seconds, max_holders, context)?;
        let lease = lease_secs(lease_seconds);

        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(key)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM semaphore_locks WHERE lock_key = $1 AND expires_at <= now()")
            .bind(key)
            .execute(&mut *tx)
            .await?;
        let (holders,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM semaphore_locks WHERE lock_key = $1")
                .bind(key)
                .fetch_one(&mut *tx)
                .await?;
        if holders >= i64::from(max_holders) {
            tx.commit().await?;
            debug!(key, holders, max_holders, "no free lock slot");
            return Ok(None);
        }

        let token = LockToken::generate();
        sqlx::query(
            "INSERT INTO semaphore_locks (lock_key, token, context, acquired_at, expires_at) \
             VALUES ($1, $2, $3, now(), now() + $4::float8 * interval '1 second')",
        )
        .bind(key)
        .bind(token.as_str())
        .bind(context)
        .bind(lease)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(Some(token))
    }

    async fn release_lock(&self, key: &str, token: &LockToken) -> Result<()> {
        let result = sqlx::query(
            "DELETE FROM semaphore_locks \
             WHERE lock_key = $1 AND token = $2 AND expires_at > now()",
        )
        .bind(key)
        .bind(token.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
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
        let result = sqlx::query(
            "UPDATE semaphore_locks SET expires_at = now() + $3::float8 * interval '1 second' \
             WHERE lock_key = $1 AND token = $2 AND expires_at > now()",
        )
        .bind(key)
        .bind(token.as_str())
        .bind(lease_secs(lease_seconds))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::LockReleaseFailed {
                key: key.to_string(),
                token: token.to_string(),
            });
        }
        Ok(())
    }

    async fn first_unexpired_lock_context(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT context FROM semaphore_locks \
             WHERE lock_key = $1 AND expires_at > now() \
             ORDER BY acquired_at LIMIT 1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(context,)| context))
    }

    async fn release_all_locks(&self) -> Result<()> {
        sqlx::query("DELETE FROM semaphore_locks")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
