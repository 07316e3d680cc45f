//! Fleet-wide read-only (maintenance) mode.

use crate::error::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};

/// Reports whether the system currently accepts writes.
#[async_trait]
pub trait StackStatus: Send + Sync {
    async fn is_read_write(&self) -> Result<bool>;
}

/// Status held in process, toggled by the embedding application.
#[derive(Debug)]
pub struct StaticStackStatus {
    read_write: AtomicBool,
}

impl StaticStackStatus {
    pub fn read_write() -> Self {
        Self {
            read_write: AtomicBool::new(true),
        }
    }

    pub fn read_only() -> Self {
        Self {
            read_write: AtomicBool::new(false),
        }
    }

    pub fn set_read_write(&self, read_write: bool) {
        self.read_write.store(read_write, Ordering::SeqCst);
    }
}

impl Default for StaticStackStatus {
    fn default() -> Self {
        Self::read_write()
    }
}

#[async_trait]
impl StackStatus for StaticStackStatus {
    async fn is_read_write(&self) -> Result<bool> {
        Ok(self.read_write.load(Ordering::SeqCst))
    }
}
