//! Fire-and-forget backup hand-off after a completed task
//!
//! Once a task reaches `completed`, the dispatcher notifies the backup
//! mechanism with `(site, operation, output_ref)` and moves on. The
//! notification runs on its own tokio task; a failed backup is logged and
//! never blocks or fails scheduling.

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;

use crate::config::ExecutorConfig;

/// External backup capability
#[async_trait]
pub trait BackupNotifier: Send + Sync {
    /// Notify the backup mechanism that `output_ref` for (site, operation)
    /// is ready for upload. Must not panic; failures are the implementation's
    /// to log.
    async fn notify(&self, site: &str, operation: &str, output_ref: &str);
}

/// Notifier that shells out to a configured backup command as
/// `<command> --site <site> --operation <op> --path <output_ref>`
pub struct CommandNotifier {
    command: String,
}

impl CommandNotifier {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl BackupNotifier for CommandNotifier {
    async fn notify(&self, site: &str, operation: &str, output_ref: &str) {
        tracing::info!(site, operation, output_ref, "backup notification");

        let result = Command::new(&self.command)
            .arg("--site")
            .arg(site)
            .arg("--operation")
            .arg(operation)
            .arg("--path")
            .arg(output_ref)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await;

        match result {
            Ok(output) if output.status.success() => {
                tracing::info!(site, operation, "backup finished");
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                tracing::warn!(
                    site,
                    operation,
                    status = %output.status,
                    error = %stderr.trim(),
                    "backup command failed"
                );
            }
            Err(e) => {
                tracing::warn!(site, operation, error = %e, "backup command could not run");
            }
        }
    }
}

/// Notifier used when no backup command is configured
pub struct NoopNotifier;

#[async_trait]
impl BackupNotifier for NoopNotifier {
    async fn notify(&self, site: &str, operation: &str, _output_ref: &str) {
        tracing::debug!(site, operation, "no backup command configured, skipping");
    }
}

/// Build the notifier matching the executor configuration
pub fn from_config(config: &ExecutorConfig) -> Arc<dyn BackupNotifier> {
    match &config.backup_command {
        Some(command) => Arc::new(CommandNotifier::new(command)),
        None => Arc::new(NoopNotifier),
    }
}
