//! Job logic invoked once per received message.

use crate::error::{Error, Result};
use crate::progress::ProgressCallback;
use crate::queue::Message;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Processes one message.
///
/// Long-running implementations must call `callback.progress_made()`
/// periodically to keep the message hidden from other consumers. Returning
/// [`Error::Recoverable`] asks for redelivery shortly; any other error marks
/// the message as poison and it is deleted.
#[async_trait]
pub trait MessageDrivenRunner: Send + Sync {
    async fn run(&self, callback: Arc<ProgressCallback>, message: &Message) -> Result<()>;
}

/// Exit status a command uses to ask for a retry (`EX_TEMPFAIL`).
pub const EXIT_TEMPFAIL: i32 = 75;

/// Runs an executable per message.
///
/// The message body is written to the child's stdin as JSON. Progress is
/// reported every `progress_interval` while the child runs.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    command: PathBuf,
    progress_interval: Duration,
}

impl CommandRunner {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            progress_interval: Duration::from_secs(10),
        }
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }
}

#[async_trait]
impl MessageDrivenRunner for CommandRunner {
    async fn run(&self, callback: Arc<ProgressCallback>, message: &Message) -> Result<()> {
        // Relative paths resolve against the process CWD.
        let command = if self.command.is_relative() {
            std::env::current_dir()?.join(&self.command)
        } else {
            self.command.clone()
        };

        debug!(
            command = %command.display(),
            message_id = %message.message_id,
            "running command"
        );

        let mut child = Command::new(&command)
            .env("LEASEHOLD_MESSAGE_ID", &message.message_id)
            .env("LEASEHOLD_RECEIVE_COUNT", message.receive_count.to_string())
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Fed alongside the wait: a child may exit without reading its input.
        let body = serde_json::to_vec(&message.body)?;
        let stdin = child.stdin.take();
        let mut feed = tokio::spawn(async move {
            match stdin {
                Some(mut stdin) => stdin.write_all(&body).await,
                None => Ok(()),
            }
        });

        let wait = child.wait();
        tokio::pin!(wait);
        let status = loop {
            tokio::select! {
                status = &mut wait => break status?,
                _ = tokio::time::sleep(self.progress_interval) => {
                    callback.progress_made().await;
                }
            }
        };

        // A descendant may still hold the pipe open.
        if !feed.is_finished() {
            feed.abort();
        }
        match (&mut feed).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.kind() == ErrorKind::BrokenPipe => {
                debug!(message_id = %message.message_id, "command did not read its input");
            }
            Ok(Err(e)) => {
                warn!(message_id = %message.message_id, error = %e, "failed to write command input");
            }
            Err(_) => {}
        }

        match status.code() {
            Some(0) => Ok(()),
            Some(EXIT_TEMPFAIL) => Err(Error::Recoverable(format!(
                "{} asked for a retry",
                command.display()
            ))),
            code => Err(Error::Other(format!(
                "{} exited with status {}",
                command.display(),
                code.unwrap_or(-1)
            ))),
        }
    }
}
