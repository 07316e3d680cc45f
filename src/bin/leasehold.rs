//! leasehold CLI: run worker stacks and inspect queues and locks.

use clap::{Parser, Subcommand};
use leasehold::config::{Config, StackRegistry};
use leasehold::db::Db;
use leasehold::lock::{DEFAULT_LEASE_SECONDS, LockRequest, ReadWriteLock};
use leasehold::progress::ProgressCallback;
use leasehold::semaphore::CountingLockStore;
use leasehold::telemetry::{TelemetryConfig, init_telemetry};
use leasehold::worker::{ConcurrentManager, StackStatus};
use secrecy::ExposeSecret;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command as ChildCommand;

#[derive(Parser)]
#[command(name = "leasehold", about = "Fleet-wide leases and queue-driven workers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every worker stack defined in a TOML file until Ctrl-C
    Serve {
        /// Stack definitions
        #[arg(long, default_value = "stacks.toml")]
        stacks: PathBuf,
        /// Seconds to wait before retrying a stack whose semaphore is full
        #[arg(long, default_value_t = 5)]
        retry_interval: u64,
    },
    /// Queue operations
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Lock operations
    Lock {
        #[command(subcommand)]
        action: LockAction,
    },
    /// Fleet-wide read-only mode
    Status {
        #[command(subcommand)]
        action: StatusAction,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// Create a queue (idempotent)
    Create { name: String },
    /// Send a JSON message
    Send {
        name: String,
        /// Message body
        body: String,
        /// Delivery delay in seconds
        #[arg(long, default_value_t = 0)]
        delay: i32,
    },
    /// List queues
    List,
}

#[derive(Subcommand)]
enum LockAction {
    /// Show unexpired lock holders
    Status {
        /// Only keys starting with this prefix
        #[arg(long)]
        prefix: Option<String>,
    },
    /// Remove every holder of a store key
    Clear { key: String },
    /// Remove every lock
    ClearAll,
    /// Run a command while holding a read (default) or write lock
    Exec {
        /// Resource keys, locked in the order given
        #[arg(long = "key", required = true)]
        keys: Vec<String>,
        /// Take the write lock (exactly one key)
        #[arg(long)]
        write: bool,
        #[arg(long, default_value_t = DEFAULT_LEASE_SECONDS)]
        lease: u64,
        /// Command and arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

#[derive(Subcommand)]
enum StatusAction {
    /// Print the current mode
    Show,
    /// Stop stacks that may not run read-only
    ReadOnly,
    /// Resume normal operation
    ReadWrite,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Serve {
            stacks,
            retry_interval,
        } => cmd_serve(config, stacks, Duration::from_secs(retry_interval)).await,
        Command::Queue { action } => {
            let db = connect(&config).await?;
            match action {
                QueueAction::Create { name } => {
                    db.create_queue(&name).await?;
                    println!("Created queue {name}");
                }
                QueueAction::Send { name, body, delay } => {
                    let body: serde_json::Value = serde_json::from_str(&body)?;
                    let id = db.send_to_queue(&name, &body, delay).await?;
                    println!("Sent message {id} to {name}");
                }
                QueueAction::List => {
                    for name in db.list_queues().await? {
                        println!("{name}");
                    }
                }
            }
            Ok(())
        }
        Command::Lock { action } => {
            let db = connect(&config).await?;
            match action {
                LockAction::Status { prefix } => cmd_lock_status(&db, prefix.as_deref()).await,
                LockAction::Clear { key } => {
                    let removed = db.clear_lock(&key).await?;
                    println!("Removed {removed} holder(s) of {key}");
                    Ok(())
                }
                LockAction::ClearAll => {
                    db.release_all_locks().await?;
                    println!("Removed all locks");
                    Ok(())
                }
                LockAction::Exec {
                    keys,
                    write,
                    lease,
                    command,
                } => cmd_lock_exec(db, config.max_readers, keys, write, lease, command).await,
            }
        }
        Command::Status { action } => {
            let db = connect(&config).await?;
            match action {
                StatusAction::Show => {
                    let mode = if db.is_read_write().await? {
                        "read-write"
                    } else {
                        "read-only"
                    };
                    println!("{mode}");
                }
                StatusAction::ReadOnly => db.set_read_write(false).await?,
                StatusAction::ReadWrite => db.set_read_write(true).await?,
            }
            Ok(())
        }
    }
}

async fn connect(config: &Config) -> anyhow::Result<Db> {
    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;
    Ok(db)
}

async fn cmd_serve(config: Config, stacks: PathBuf, retry_interval: Duration) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "leasehold".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let db = Arc::new(connect(&config).await?);
    let registry = StackRegistry::load_from_file(&stacks)?;
    if registry.is_empty() {
        anyhow::bail!("no stacks defined in {}", stacks.display());
    }

    let manager = Arc::new(ConcurrentManager::new(db.clone(), db.clone(), db.clone()));

    let mut handles = Vec::with_capacity(registry.len());
    for definition in registry.iter() {
        db.create_queue(&definition.queue_name).await?;
        let mut stack = definition.build_stack(manager.clone())?;
        tracing::info!(stack = %definition.name, queue = %definition.queue_name, "starting stack");
        handles.push(tokio::spawn(async move {
            stack.run_until_shutdown(retry_interval).await;
        }));
    }

    let mgr = manager.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        mgr.force_shutdown();
    });

    for handle in handles {
        handle.await?;
    }
    Ok(())
}

async fn cmd_lock_status(db: &Db, prefix: Option<&str>) -> anyhow::Result<()> {
    let holders = db.list_locks(prefix).await?;
    if holders.is_empty() {
        println!("No locks held.");
        return Ok(());
    }

    println!("{:<40}  {:<20}  {:<36}  CONTEXT", "KEY", "EXPIRES", "TOKEN");
    println!("{}", "-".repeat(120));
    for holder in &holders {
        println!(
            "{:<40}  {:<20}  {:<36}  {}",
            holder.lock_key,
            holder.expires_at.format("%Y-%m-%d %H:%M:%S"),
            holder.token,
            holder.context
        );
    }
    println!("\n{} holder(s)", holders.len());
    Ok(())
}

async fn cmd_lock_exec(
    db: Db,
    max_readers: u32,
    keys: Vec<String>,
    write: bool,
    lease: u64,
    command: Vec<String>,
) -> anyhow::Result<()> {
    let store: Arc<dyn CountingLockStore> = Arc::new(db);
    let lock = ReadWriteLock::new(store, max_readers)?;
    let callback = ProgressCallback::shared();
    let context = format!("leasehold lock exec (pid {})", std::process::id());

    let request = if write {
        let [key] = <[String; 1]>::try_from(keys)
            .map_err(|_| anyhow::anyhow!("--write takes exactly one --key"))?;
        LockRequest::write(callback.clone(), context, key)?
    } else {
        LockRequest::read(callback.clone(), context, keys)?
    };
    let request = request.with_lease_seconds(lease)?;

    // Report progress at a third of the lease so it never lapses.
    let interval = Duration::from_secs(lease) / 3;
    let run = || run_child(&command, &callback, interval);
    let code = if write {
        lock.with_write_lock(&request, interval, run).await?
    } else {
        lock.with_read_lock(&request, run).await?
    };
    std::process::exit(code);
}

async fn run_child(
    command: &[String],
    callback: &ProgressCallback,
    interval: Duration,
) -> leasehold::Result<i32> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| leasehold::Error::InvalidArgument("command is required.".into()))?;
    let mut child = ChildCommand::new(program)
        .args(args)
        .kill_on_drop(true)
        .spawn()?;

    let wait = child.wait();
    tokio::pin!(wait);
    let status = loop {
        tokio::select! {
            status = &mut wait => break status?,
            _ = tokio::time::sleep(interval) => callback.progress_made().await,
        }
    };
    Ok(status.code().unwrap_or(1))
}
