//! Configuration management for the predio orchestrator
//!
//! This module handles loading and validating configuration from environment
//! variables, files, and command-line arguments.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Scheduler loop configuration
    pub orchestrator: OrchestratorConfig,

    /// Host resource admission thresholds
    pub resources: ResourceConfig,

    /// Registry, checkpoint and output locations
    pub storage: StorageConfig,

    /// External executor and backup commands
    pub executor: ExecutorConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Scheduler loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Maximum number of sites scraped concurrently (lane count)
    pub max_concurrent_sites: usize,

    /// Dispatcher cycle cadence in seconds
    pub cycle_interval_secs: u64,

    /// Failed attempts allowed before a task is marked failed
    pub max_retries: u32,

    /// Grace period for active workers on shutdown, in seconds
    pub shutdown_grace_secs: u64,
}

/// Host resource admission thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// CPU usage ceiling, percent
    pub max_cpu_percent: f32,

    /// Memory usage ceiling, percent
    pub max_memory_percent: f32,

    /// Seconds a denied admission stays denied before re-sampling
    pub admission_cooldown_secs: u64,
}

/// Registry, checkpoint and output locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite registry path
    pub registry_path: PathBuf,

    /// Directory for checkpoint documents
    pub checkpoint_dir: PathBuf,

    /// Directory for recovery reports
    pub recovery_dir: PathBuf,

    /// Directory handed to the executor for scrape output
    pub output_dir: PathBuf,

    /// Days to keep timestamped checkpoint history
    pub checkpoint_retention_days: u32,
}

/// External executor and backup commands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Scraper command; receives site, url and output path as arguments.
    /// When unset, `run` refuses to start (there is nothing to execute).
    pub scraper_command: Option<String>,

    /// Backup command invoked fire-and-forget after a completed task
    pub backup_command: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let max_concurrent_sites = std::env::var("PREDIO_MAX_CONCURRENT_SITES")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(4);

        let cycle_interval_secs = std::env::var("PREDIO_CYCLE_INTERVAL")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(30);

        let max_retries = std::env::var("PREDIO_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(5);

        let shutdown_grace_secs = std::env::var("PREDIO_SHUTDOWN_GRACE")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(30);

        let max_cpu_percent = std::env::var("PREDIO_MAX_CPU_PERCENT")
            .ok()
            .and_then(|v| v.parse::<f32>().ok())
            .unwrap_or(80.0);

        let max_memory_percent = std::env::var("PREDIO_MAX_MEMORY_PERCENT")
            .ok()
            .and_then(|v| v.parse::<f32>().ok())
            .unwrap_or(80.0);

        let admission_cooldown_secs = std::env::var("PREDIO_ADMISSION_COOLDOWN")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(60);

        let registry_path = std::env::var("PREDIO_REGISTRY_PATH")
            .unwrap_or_else(|_| String::from("data/registry.db"))
            .into();

        let checkpoint_dir = std::env::var("PREDIO_CHECKPOINT_DIR")
            .unwrap_or_else(|_| String::from("data/checkpoints"))
            .into();

        let recovery_dir = std::env::var("PREDIO_RECOVERY_DIR")
            .unwrap_or_else(|_| String::from("data/recovery"))
            .into();

        let output_dir = std::env::var("PREDIO_OUTPUT_DIR")
            .unwrap_or_else(|_| String::from("data/output"))
            .into();

        let checkpoint_retention_days = std::env::var("PREDIO_CHECKPOINT_RETENTION_DAYS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(7);

        let scraper_command = std::env::var("PREDIO_SCRAPER_COMMAND").ok();
        let backup_command = std::env::var("PREDIO_BACKUP_COMMAND").ok();

        let level = std::env::var("PREDIO_LOG_LEVEL").unwrap_or_else(|_| String::from("info"));
        let format = std::env::var("PREDIO_LOG_FORMAT").unwrap_or_else(|_| String::from("text"));

        Ok(Self {
            orchestrator: OrchestratorConfig {
                max_concurrent_sites,
                cycle_interval_secs,
                max_retries,
                shutdown_grace_secs,
            },
            resources: ResourceConfig {
                max_cpu_percent,
                max_memory_percent,
                admission_cooldown_secs,
            },
            storage: StorageConfig {
                registry_path,
                checkpoint_dir,
                recovery_dir,
                output_dir,
                checkpoint_retention_days,
            },
            executor: ExecutorConfig {
                scraper_command,
                backup_command,
            },
            logging: LoggingConfig { level, format },
        })
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.orchestrator.max_concurrent_sites == 0 {
            anyhow::bail!("max_concurrent_sites must be greater than 0");
        }

        if self.orchestrator.cycle_interval_secs == 0 {
            anyhow::bail!("cycle_interval_secs must be greater than 0");
        }

        if !(0.0..=100.0).contains(&self.resources.max_cpu_percent) {
            anyhow::bail!("max_cpu_percent must be within 0-100");
        }

        if !(0.0..=100.0).contains(&self.resources.max_memory_percent) {
            anyhow::bail!("max_memory_percent must be within 0-100");
        }

        Ok(())
    }

    /// Dispatcher cadence as Duration
    #[must_use]
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.orchestrator.cycle_interval_secs)
    }

    /// Shutdown grace period as Duration
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.orchestrator.shutdown_grace_secs)
    }

    /// Admission cool-down as Duration
    #[must_use]
    pub fn admission_cooldown(&self) -> Duration {
        Duration::from_secs(self.resources.admission_cooldown_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            orchestrator: OrchestratorConfig {
                max_concurrent_sites: 4,
                cycle_interval_secs: 30,
                max_retries: 5,
                shutdown_grace_secs: 30,
            },
            resources: ResourceConfig {
                max_cpu_percent: 80.0,
                max_memory_percent: 80.0,
                admission_cooldown_secs: 60,
            },
            storage: StorageConfig {
                registry_path: PathBuf::from("data/registry.db"),
                checkpoint_dir: PathBuf::from("data/checkpoints"),
                recovery_dir: PathBuf::from("data/recovery"),
                output_dir: PathBuf::from("data/output"),
                checkpoint_retention_days: 7,
            },
            executor: ExecutorConfig {
                scraper_command: None,
                backup_command: None,
            },
            logging: LoggingConfig {
                level: String::from("info"),
                format: String::from("text"),
            },
        }
    }
}
