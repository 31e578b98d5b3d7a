//! Startup reconciliation after an unclean shutdown
//!
//! Runs once at process start, before the dispatcher's first cycle. The last
//! checkpoint's `running` set is compared against the execution handles that
//! are actually alive; any `running` task whose handle is gone was cut off
//! mid-flight. Those tasks go back to `pending` with their retry count
//! bumped, or to `failed` with reason `exhausted_retries` once the budget is
//! spent. Tasks left `paused` by a graceful shutdown are resumed to
//! `pending`.
//!
//! Every pass writes a timestamped recovery report so an operator can see
//! what was detected and what was done about it.

use std::collections::HashSet;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::checkpoint::{CheckpointStore, RunningEntry};
use crate::error::Result;
use crate::models::{ErrorKind, TaskStatus};
use crate::registry::{TaskRegistry, TransitionFields};

/// Checkpoint older than this is itself evidence of an interruption
const STALE_CHECKPOINT_SECS: i64 = 30 * 60;

/// What `detect_interruption` found
#[derive(Debug, Default, Serialize)]
pub struct InterruptionReport {
    pub interrupted: bool,
    pub reasons: Vec<String>,

    /// Checkpointed running entries whose handles are no longer alive
    pub stale_running: Vec<RunningEntry>,

    /// Registry rows in `running` with no live handle (crash without a
    /// matching checkpoint entry)
    pub orphaned_running: Vec<String>,

    /// Tasks left `paused` by a graceful shutdown
    pub paused: Vec<String>,

    /// Seconds since the last checkpoint, when one exists
    pub checkpoint_age_secs: Option<i64>,
}

/// What `reconcile` did
#[derive(Debug, Default, Serialize)]
pub struct RecoveryOutcome {
    pub reset_to_pending: Vec<String>,
    pub failed_exhausted: Vec<String>,
    pub resumed_paused: Vec<String>,
}

impl RecoveryOutcome {
    pub fn total_recovered(&self) -> usize {
        self.reset_to_pending.len() + self.failed_exhausted.len() + self.resumed_paused.len()
    }
}

/// Startup reconciliation of registry state against the last checkpoint
pub struct RecoveryManager {
    registry: Arc<TaskRegistry>,
    checkpoints: Arc<CheckpointStore>,
    report_dir: PathBuf,
    max_retries: u32,
}

impl RecoveryManager {
    pub fn new(
        registry: Arc<TaskRegistry>,
        checkpoints: Arc<CheckpointStore>,
        report_dir: &Path,
        max_retries: u32,
    ) -> Self {
        Self {
            registry,
            checkpoints,
            report_dir: report_dir.to_path_buf(),
            max_retries,
        }
    }

    /// Compare the last checkpoint's running set against `live_handles`.
    /// At process start the live set is empty by construction: handles are
    /// uuids scoped to a single process run.
    pub fn detect_interruption(
        &self,
        live_handles: &HashSet<String>,
    ) -> Result<InterruptionReport> {
        let mut report = InterruptionReport::default();

        let checkpoint = match self.checkpoints.load_current() {
            Ok(cp) => cp,
            Err(e) => {
                // an unreadable checkpoint cannot prove a clean shutdown
                tracing::warn!(error = %e, "checkpoint unreadable, treating as interruption evidence");
                report.reasons.push(format!("checkpoint unreadable: {e}"));
                None
            }
        };

        if let Some(cp) = &checkpoint {
            report.checkpoint_age_secs = Some((Utc::now() - cp.timestamp).num_seconds());

            for entry in &cp.running {
                if !live_handles.contains(&entry.handle_id) {
                    report.stale_running.push(entry.clone());
                }
            }
            if !report.stale_running.is_empty() {
                report.reasons.push(format!(
                    "{} checkpointed running task(s) with dead handles",
                    report.stale_running.len()
                ));
            }

            if report.checkpoint_age_secs.unwrap_or(0) > STALE_CHECKPOINT_SECS {
                report.reasons.push(format!(
                    "last checkpoint is {}s old",
                    report.checkpoint_age_secs.unwrap_or(0)
                ));
            }
        }

        // registry rows stuck in running that the checkpoint does not cover
        let checkpointed: HashSet<&str> = report
            .stale_running
            .iter()
            .map(|e| e.task_id.as_str())
            .collect();
        for task in self
            .registry
            .list_by_status(TaskStatus::Running)
            ?
        {
            let has_live_handle = checkpoint
                .as_ref()
                .map(|cp| {
                    cp.running
                        .iter()
                        .any(|e| e.task_id == task.id && live_handles.contains(&e.handle_id))
                })
                .unwrap_or(false);
            if !has_live_handle && !checkpointed.contains(task.id.as_str()) {
                report.orphaned_running.push(task.id);
            }
        }
        if !report.orphaned_running.is_empty() {
            report.reasons.push(format!(
                "{} registry task(s) stuck in running",
                report.orphaned_running.len()
            ));
        }

        for task in self
            .registry
            .list_by_status(TaskStatus::Paused)
            ?
        {
            report.paused.push(task.id);
        }
        if !report.paused.is_empty() {
            report
                .reasons
                .push(format!("{} paused task(s) awaiting resume", report.paused.len()));
        }

        report.interrupted = !report.stale_running.is_empty()
            || !report.orphaned_running.is_empty()
            || !report.paused.is_empty();

        Ok(report)
    }

    /// Repair everything the interruption report flagged. Stale running
    /// tasks return to `pending` with their retry count bumped; tasks past
    /// the retry budget become `failed` with reason `exhausted_retries`;
    /// paused tasks resume to `pending`.
    pub fn reconcile(&self, report: &InterruptionReport) -> Result<RecoveryOutcome> {
        let mut outcome = RecoveryOutcome::default();

        let stale_ids = report
            .stale_running
            .iter()
            .map(|e| e.task_id.clone())
            .chain(report.orphaned_running.iter().cloned());

        for task_id in stale_ids {
            let task = self.registry.get(&task_id)?;
            let retries = task.retry_count + 1;

            if retries >= self.max_retries {
                self.registry
                    .transition(
                        &task_id,
                        TaskStatus::Failed,
                        TransitionFields {
                            retry_count: Some(retries),
                            last_error_kind: Some(ErrorKind::ExhaustedRetries),
                            ..Default::default()
                        },
                    )?;
                tracing::warn!(task_id = %task_id, retries, "retries exhausted during recovery");
                outcome.failed_exhausted.push(task_id);
            } else {
                self.registry
                    .transition(
                        &task_id,
                        TaskStatus::Pending,
                        TransitionFields {
                            retry_count: Some(retries),
                            ..Default::default()
                        },
                    )?;
                tracing::info!(task_id = %task_id, retries, "stale running task reset to pending");
                outcome.reset_to_pending.push(task_id);
            }
        }

        for task_id in &report.paused {
            self.registry
                .transition(task_id, TaskStatus::Pending, TransitionFields::none())?;
            tracing::info!(task_id = %task_id, "paused task resumed");
            outcome.resumed_paused.push(task_id.clone());
        }

        Ok(outcome)
    }

    /// Full startup pass: detect, reconcile, report. Returns the outcome so
    /// the caller can log totals.
    pub fn run(&self) -> Result<(InterruptionReport, RecoveryOutcome)> {
        let report = self.detect_interruption(&HashSet::new())?;

        if !report.interrupted {
            tracing::info!("no interruption detected");
            let outcome = RecoveryOutcome::default();
            return Ok((report, outcome));
        }

        tracing::warn!(reasons = ?report.reasons, "interruption detected, reconciling");
        let outcome = self.reconcile(&report)?;
        self.write_report(&report, &outcome)?;

        tracing::info!(
            reset = outcome.reset_to_pending.len(),
            failed = outcome.failed_exhausted.len(),
            resumed = outcome.resumed_paused.len(),
            "recovery finished"
        );
        Ok((report, outcome))
    }

    fn write_report(
        &self,
        report: &InterruptionReport,
        outcome: &RecoveryOutcome,
    ) -> Result<()> {
        std::fs::create_dir_all(&self.report_dir)?;
        let path = self.report_dir.join(format!(
            "recovery_report_{}.json",
            Utc::now().format("%Y%m%d_%H%M%S")
        ));

        #[derive(Serialize)]
        struct FullReport<'a> {
            generated_at: String,
            interruption: &'a InterruptionReport,
            actions: &'a RecoveryOutcome,
        }

        let file = File::create(&path)?;
        serde_json::to_writer_pretty(
            BufWriter::new(file),
            &FullReport {
                generated_at: Utc::now().to_rfc3339(),
                interruption: report,
                actions: outcome,
            },
        )?;

        tracing::info!(path = %path.display(), "recovery report written");
        Ok(())
    }
}
