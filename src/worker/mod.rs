//! Worker pool: one tokio task per in-flight scrape
//!
//! Each admitted task runs on its own tokio task so lanes proceed in
//! parallel; the worker blocks only inside the opaque [`ScrapeExecutor`]
//! call. When the call returns, the worker reports a [`WorkerOutcome`]
//! through an mpsc channel for the dispatcher to reap; workers never touch
//! task status themselves, and no shared flag is involved.
//!
//! Every worker carries a fresh handle id (uuid) which the dispatcher records
//! in checkpoints; after a crash none of the checkpointed handles can be
//! alive in the new process, which is exactly what recovery looks for.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::executor::{ExecutionReport, ExecutionRequest, ScrapeExecutor};
use crate::models::Task;

/// Identifier of one in-flight execution handle
pub type HandleId = String;

/// Message a worker sends when its executor call returns
#[derive(Debug)]
pub struct WorkerOutcome {
    pub task_id: String,
    pub handle_id: HandleId,
    pub site: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,

    /// Where the executor was told to write; backup falls back to this when
    /// the report names no artifact
    pub output_path: PathBuf,

    pub report: ExecutionReport,
}

/// Bookkeeping for one in-flight worker
#[derive(Debug)]
pub struct ActiveWorker {
    pub handle_id: HandleId,
    pub task_id: String,
    pub site: String,
    pub started_at: DateTime<Utc>,
    join: JoinHandle<()>,
}

impl ActiveWorker {
    /// True once the worker's tokio task has returned
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Abort the worker task. Used only after the shutdown grace period;
    /// the executor subprocess may keep running, which is why the task is
    /// marked `paused` rather than failed.
    pub fn abort(&self) {
        self.join.abort();
    }
}

/// Spawns workers and wires their outcomes into one channel
pub struct WorkerPool {
    executor: Arc<dyn ScrapeExecutor>,
    outcome_tx: mpsc::Sender<WorkerOutcome>,
}

impl WorkerPool {
    pub fn new(executor: Arc<dyn ScrapeExecutor>, outcome_tx: mpsc::Sender<WorkerOutcome>) -> Self {
        Self {
            executor,
            outcome_tx,
        }
    }

    /// Launch one worker for `task`. The returned record is the dispatcher's
    /// only view of the in-flight execution.
    pub fn spawn(&self, task: &Task, request: ExecutionRequest) -> ActiveWorker {
        let handle_id = Uuid::new_v4().to_string();
        let task_id = task.id.clone();
        let site = task.site.clone();
        let started_at = Utc::now();

        let executor = Arc::clone(&self.executor);
        let outcome_tx = self.outcome_tx.clone();
        let worker_handle = handle_id.clone();
        let worker_task = task_id.clone();
        let worker_site = site.clone();

        let join = tokio::spawn(async move {
            tracing::debug!(task_id = %worker_task, handle = %worker_handle, "worker started");
            let output_path = request.output_path.clone();
            let report: ExecutionReport = executor.execute(request).await;
            let ended_at = Utc::now();

            let outcome = WorkerOutcome {
                task_id: worker_task.clone(),
                handle_id: worker_handle,
                site: worker_site,
                started_at,
                ended_at,
                output_path,
                report,
            };

            if outcome_tx.send(outcome).await.is_err() {
                // dispatcher already gone (shutdown); nothing to report to
                tracing::warn!(task_id = %worker_task, "outcome channel closed, result dropped");
            }
        });

        ActiveWorker {
            handle_id,
            task_id,
            site,
            started_at,
            join,
        }
    }
}
