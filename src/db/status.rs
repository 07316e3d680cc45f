//! Read-only switch in the single-row `stack_status` table.

use super::Db;
use crate::error::Result;
use crate::worker::StackStatus;
use async_trait::async_trait;
use tracing::info;

impl Db {
    /// Turn read-only mode off (`true`) or on (`false`) for the whole fleet.
    pub async fn set_read_write(&self, read_write: bool) -> Result<()> {
        sqlx::query(
            "INSERT INTO stack_status (id, read_write, updated_at) VALUES (1, $1, now()) \
             ON CONFLICT (id) DO UPDATE SET read_write = EXCLUDED.read_write, updated_at = now()",
        )
        .bind(read_write)
        .execute(&self.pool)
        .await?;
        info!(read_write, "stack status updated");
        Ok(())
    }
}

#[async_trait]
impl StackStatus for Db {
    /// A missing row means read-write.
    async fn is_read_write(&self) -> Result<bool> {
        let row: Option<(bool,)> =
            sqlx::query_as("SELECT read_write FROM stack_status WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_none_or(|(read_write,)| read_write))
    }
}
