//! predio - Property scrape orchestration core
//!
//! Decides which scrape task runs next, under what concurrency cap, within
//! what host resource budget, and how to resume correctly after an
//! interruption. The actual page extraction is an external, opaque
//! capability consumed through the [`executor`] contract.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration management and settings
//! - [`models`] - Core task records and the status state machine
//! - [`registry`] - Durable task catalog (SQLite) and site catalog import
//! - [`monitor`] - Host CPU/memory admission gate
//! - [`dispatcher`] - The scheduler loop, site lanes and dependency resolution
//! - [`worker`] - Worker pool reporting outcomes over a channel
//! - [`checkpoint`] - Versioned in-flight snapshots for crash detection
//! - [`recovery`] - Startup reconciliation after unclean shutdowns
//! - [`executor`] - External scrape executor contract
//! - [`backup`] - Fire-and-forget backup notification
//! - [`metrics`] - Prometheus metrics
//!
//! # Example
//!
//! ```no_run
//! use predio::config::Config;
//! use predio::registry::TaskRegistry;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let registry = TaskRegistry::open(&config.storage.registry_path)?;
//!     println!("{}", registry.counts()?);
//!     Ok(())
//! }
//! ```

pub mod backup;
pub mod checkpoint;
pub mod commands;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod models;
pub mod monitor;
pub mod recovery;
pub mod registry;
pub mod worker;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::dispatcher::Dispatcher;
    pub use crate::error::{Error, ErrorCategory, RegistryError, Result};
    pub use crate::executor::{ExecutionReport, ExecutionRequest, ScrapeExecutor};
    pub use crate::models::{ErrorKind, Run, Task, TaskCounts, TaskSpec, TaskStatus};
    pub use crate::registry::TaskRegistry;
}

// Direct re-exports for convenience
pub use models::{ErrorKind, Run, Task, TaskCounts, TaskSpec, TaskStatus};
