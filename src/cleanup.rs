//! Best-effort multi-step cleanup.
//!
//! Every step runs regardless of earlier failures. Only the first error is
//! kept; later ones are logged and dropped.

use crate::error::{Error, Result};
use tracing::warn;

/// Collects the outcome of independent cleanup steps.
#[derive(Debug, Default)]
pub struct FirstError {
    first: Option<Error>,
    suppressed: usize,
}

impl FirstError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of one step.
    pub fn record(&mut self, result: Result<()>) {
        if let Err(e) = result {
            if self.first.is_none() {
                self.first = Some(e);
            } else {
                warn!(error = %e, "suppressed cleanup error");
                self.suppressed += 1;
            }
        }
    }

    pub fn has_error(&self) -> bool {
        self.first.is_some()
    }

    /// Number of errors recorded after the first one.
    pub fn suppressed(&self) -> usize {
        self.suppressed
    }

    /// `Ok(())` when every step succeeded, otherwise the first error.
    pub fn finish(self) -> Result<()> {
        match self.first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Like [`FirstError::finish`], mapping the first error through `wrap`.
    pub fn finish_with(self, wrap: impl FnOnce(Error) -> Error) -> Result<()> {
        self.finish().map_err(wrap)
    }

    /// Drop every recorded error after logging it. Used on rollback paths
    /// where the original failure must be the one the caller sees.
    pub fn swallow(self, context: &str) {
        if let Some(e) = self.first {
            warn!(error = %e, suppressed = self.suppressed, context, "cleanup failed");
        }
    }
}
