//! Postgres backends: connection pool, migrations, and health check.
//!
//! One [`Db`] handle implements all three stores the worker stack needs:
//! [`CountingLockStore`](crate::semaphore::CountingLockStore) over the
//! `semaphore_locks` table, [`MessageQueue`](crate::queue::MessageQueue)
//! over pgmq, and [`StackStatus`](crate::worker::StackStatus) over the
//! `stack_status` table.

pub mod locks;
pub mod pgmq;
pub mod status;

pub use locks::LockHolder;

use crate::error::{Error, Result};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Database handle. Cheap to clone; clones share the pool.
#[derive(Debug, Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
