//! Scrape executor contract: the opaque, long-running external call
//!
//! The orchestration core never fetches or parses a page itself. It hands a
//! task to a [`ScrapeExecutor`] and receives an [`ExecutionReport`] back,
//! however long that takes. Anti-bot handling, pagination and network retries
//! all live behind this boundary.
//!
//! A failed scrape is *data*, not an `Err`: the report carries an
//! [`ErrorKind`] and feeds the dispatcher's retry ladder. Infrastructure
//! faults (the command cannot even be spawned) are folded into a failed
//! report as well, so the worker pool has exactly one shape to forward.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio::process::Command;

use crate::models::{ErrorKind, Task};

/// Everything the executor needs to run one task
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub task_id: String,
    pub site: String,
    pub city: String,
    pub operation: String,
    pub product: String,
    pub url: String,

    /// File the scraper should write its extraction into
    pub output_path: PathBuf,
}

impl ExecutionRequest {
    /// Build a request for `task`, laying the output file out as
    /// `<output_dir>/<site>/<city>/<operation>/<product>_<timestamp>.csv`
    pub fn for_task(task: &Task, output_dir: &Path) -> Self {
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let output_path = output_dir
            .join(&task.site)
            .join(&task.city)
            .join(&task.operation)
            .join(format!("{}_{timestamp}.csv", task.product));

        Self {
            task_id: task.id.clone(),
            site: task.site.clone(),
            city: task.city.clone(),
            operation: task.operation.clone(),
            product: task.product.clone(),
            url: task.url.clone(),
            output_path,
        }
    }
}

/// Outcome of one execution attempt
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub success: bool,
    pub properties_extracted: u64,
    pub duration: Duration,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,

    /// Artifact produced by the run (e.g. a collected URL list) that may
    /// seed a dependent detail scrape
    pub output_ref: Option<String>,
}

impl ExecutionReport {
    /// A failed report with no extraction
    pub fn failure(kind: ErrorKind, error: impl Into<String>, duration: Duration) -> Self {
        Self {
            success: false,
            properties_extracted: 0,
            duration,
            error_kind: Some(kind),
            error: Some(error.into()),
            output_ref: None,
        }
    }
}

/// External scrape capability
#[async_trait]
pub trait ScrapeExecutor: Send + Sync {
    /// Execute one task. May block for minutes to hours.
    async fn execute(&self, request: ExecutionRequest) -> ExecutionReport;
}

/// Result line printed by the scraper command on its last stdout line
#[derive(Debug, Deserialize)]
struct RawReport {
    success: bool,
    #[serde(default)]
    properties_found: u64,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_kind: Option<String>,
    #[serde(default)]
    output_ref: Option<String>,
}

/// Executor that shells out to a configured scraper command.
///
/// The command is invoked as
/// `<command> --site <site> --city <city> --operation <op> --product <prod>
///  --url <url> --output <path>` and is expected to print a JSON report as
/// its final stdout line. A non-zero exit without a parseable report is a
/// failed attempt of kind `other`.
pub struct CommandExecutor {
    command: String,
}

impl CommandExecutor {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl ScrapeExecutor for CommandExecutor {
    async fn execute(&self, request: ExecutionRequest) -> ExecutionReport {
        let started = Instant::now();

        if let Some(parent) = request.output_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ExecutionReport::failure(
                    ErrorKind::Other,
                    format!("cannot create output directory: {e}"),
                    started.elapsed(),
                );
            }
        }

        tracing::info!(
            task_id = %request.task_id,
            site = %request.site,
            url = %request.url,
            output = %request.output_path.display(),
            "launching scraper"
        );

        let output = Command::new(&self.command)
            .arg("--site")
            .arg(&request.site)
            .arg("--city")
            .arg(&request.city)
            .arg("--operation")
            .arg(&request.operation)
            .arg("--product")
            .arg(&request.product)
            .arg("--url")
            .arg(&request.url)
            .arg("--output")
            .arg(&request.output_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        let duration = started.elapsed();
        let output = match output {
            Ok(out) => out,
            Err(e) => {
                tracing::error!(task_id = %request.task_id, error = %e, "scraper spawn failed");
                return ExecutionReport::failure(
                    ErrorKind::Other,
                    format!("spawn failed: {e}"),
                    duration,
                );
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let report_line = stdout.lines().rev().find(|l| !l.trim().is_empty());

        match report_line.and_then(|line| serde_json::from_str::<RawReport>(line.trim()).ok()) {
            Some(raw) => {
                let error_kind = if raw.success {
                    None
                } else {
                    Some(
                        raw.error_kind
                            .as_deref()
                            .and_then(|k| k.parse().ok())
                            .unwrap_or(ErrorKind::Other),
                    )
                };
                ExecutionReport {
                    success: raw.success,
                    properties_extracted: raw.properties_found,
                    duration,
                    error_kind,
                    error: raw.error,
                    output_ref: raw.output_ref,
                }
            }
            None if output.status.success() => {
                // scraper finished cleanly but reported nothing usable
                ExecutionReport::failure(
                    ErrorKind::Parsing,
                    "scraper produced no result report",
                    duration,
                )
            }
            None => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                ExecutionReport::failure(
                    ErrorKind::Other,
                    format!(
                        "scraper exited with {}: {}",
                        output.status,
                        stderr.trim().chars().take(200).collect::<String>()
                    ),
                    duration,
                )
            }
        }
    }
}
