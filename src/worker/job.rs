//! A running job and the listener keeping its message leased.

use crate::error::Result;
use crate::progress::ProgressListener;
use std::sync::Arc;
use tokio::task::{JoinError, JoinHandle};

/// A spawned job paired with the listener that extends its message's
/// visibility timeout.
pub struct WorkerJob {
    message_id: String,
    handle: JoinHandle<Result<()>>,
    listener: Arc<dyn ProgressListener>,
}

impl WorkerJob {
    pub fn new(
        message_id: impl Into<String>,
        handle: JoinHandle<Result<()>>,
        listener: Arc<dyn ProgressListener>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            handle,
            listener,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn listener(&self) -> &Arc<dyn ProgressListener> {
        &self.listener
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel the job's task. Its message is left for redelivery.
    ///
    /// The stack never aborts its own jobs; this is for embedders that must
    /// stop one early. A stack that reaps a cancelled job shuts down, as it
    /// does when the runtime cancels job tasks on its way down.
    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Wait for the job and take its outcome.
    pub async fn join(self) -> std::result::Result<Result<()>, JoinError> {
        self.handle.await
    }
}

impl std::fmt::Debug for WorkerJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerJob")
            .field("message_id", &self.message_id)
            .field("finished", &self.is_finished())
            .finish()
    }
}
