//! # leasehold
//!
//! Lease-based coordination for a fleet of processes that share nothing
//! but a database.
//!
//! Provides a distributed multi-reader / single-writer lock built on
//! counting leases ([`lock`], [`semaphore`]), and a queue-driven worker
//! stack that runs jobs concurrently under a fleet-wide semaphore
//! ([`worker`]). Postgres (with pgmq) backs both in production ([`db`]);
//! in-memory stores are provided for local runs and tests.

pub mod cleanup;
pub mod config;
pub mod db;
pub mod error;
pub mod lock;
pub mod progress;
pub mod queue;
pub mod semaphore;
pub mod telemetry;
pub mod worker;

pub use error::{Error, Result};
