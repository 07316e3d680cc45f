//! Worker stack definitions loaded from TOML.
//!
//! ```toml
//! [[stack]]
//! name = "table-update"
//! queue_name = "table-update"
//! semaphore_lock_key = "table-update-worker"
//! semaphore_max_lock_count = 10
//! lease_seconds = 60
//! max_threads_per_machine = 4
//! can_run_in_read_only = false
//! command = "bin/process-table-update"
//! ```

use crate::error::{Error, Result};
use crate::lock::DEFAULT_LEASE_SECONDS;
use crate::worker::{CommandRunner, ConcurrentManager, ConcurrentWorkerStack};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct StacksFile {
    #[serde(default)]
    stack: Vec<StackDefinition>,
}

/// One worker type: where its messages come from, how many may run, and
/// the executable that processes each message.
#[derive(Debug, Clone, Deserialize)]
pub struct StackDefinition {
    pub name: String,
    pub queue_name: String,
    pub semaphore_lock_key: String,
    #[serde(default = "default_max_lock_count")]
    pub semaphore_max_lock_count: u32,
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,
    #[serde(default = "default_max_threads")]
    pub max_threads_per_machine: usize,
    #[serde(default)]
    pub can_run_in_read_only: bool,
    pub command: PathBuf,
    /// Seconds between progress reports while the command runs.
    #[serde(default)]
    pub progress_interval_seconds: Option<u64>,
}

fn default_max_lock_count() -> u32 {
    1
}

fn default_lease_seconds() -> u64 {
    DEFAULT_LEASE_SECONDS
}

fn default_max_threads() -> usize {
    1
}

impl StackDefinition {
    /// Build a stack running `command` for each message.
    pub fn build_stack(&self, manager: Arc<ConcurrentManager>) -> Result<ConcurrentWorkerStack> {
        let mut runner = CommandRunner::new(&self.command);
        if let Some(secs) = self.progress_interval_seconds {
            runner = runner.with_progress_interval(Duration::from_secs(secs));
        }
        ConcurrentWorkerStack::builder()
            .with_name(&self.name)
            .with_manager(manager)
            .with_runner(Arc::new(runner))
            .with_queue_name(&self.queue_name)
            .with_semaphore_lock_key(&self.semaphore_lock_key)
            .with_semaphore_max_lock_count(self.semaphore_max_lock_count)
            .with_lease_seconds(self.lease_seconds)
            .with_max_threads_per_machine(self.max_threads_per_machine)
            .with_can_run_in_read_only(self.can_run_in_read_only)
            .build()
    }
}

/// Stack definitions in file order, with unique names.
#[derive(Debug, Default)]
pub struct StackRegistry {
    stacks: Vec<StackDefinition>,
}

impl StackRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read stack config {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("bad stack config {}: {e}", path.display())))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let file: StacksFile =
            toml::from_str(content).map_err(|e| Error::Config(e.message().to_string()))?;

        let mut seen = HashSet::new();
        for stack in &file.stack {
            if !seen.insert(stack.name.as_str()) {
                return Err(Error::Config(format!("duplicate stack name {:?}", stack.name)));
            }
        }
        Ok(Self { stacks: file.stack })
    }

    pub fn get(&self, name: &str) -> Option<&StackDefinition> {
        self.stacks.iter().find(|s| s.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StackDefinition> {
        self.stacks.iter()
    }

    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }
}
