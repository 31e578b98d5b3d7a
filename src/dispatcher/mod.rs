//! The core scheduler loop
//!
//! Event-driven control loop combining the registry, the resource monitor
//! and the dependency resolver to admit and track tasks via the worker pool.
//! Each cycle:
//!
//! 1. Reap finished workers; transition their tasks through the registry;
//!    enqueue dependent detail scrapes; notify backup for completed tasks.
//! 2. Promote completed tasks whose re-scrape time elapsed back to pending.
//! 3. Admit ready tasks into free lanes, gated by the resource monitor;
//!    lane assignment and the `running` transition happen together, before
//!    the worker spawns, so a task can never be admitted twice.
//! 4. Persist a checkpoint (running set + lane occupancy + registry digest).
//! 5. Block on a worker-completion signal, the cycle timer, or shutdown.
//!
//! Invariants upheld here: at most one running task per site, global
//! concurrency bounded by the lane budget, a site's tasks drain in registry
//! order while it holds its lane, and all status decisions happen in the
//! reap step; workers only report.

pub mod lanes;
pub mod resolver;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::backup::BackupNotifier;
use crate::checkpoint::{Checkpoint, CheckpointStore, RunningEntry};
use crate::config::Config;
use crate::error::{DispatchError, Result};
use crate::executor::{ExecutionRequest, ScrapeExecutor};
use crate::metrics;
use crate::models::{ErrorKind, Run, TaskStatus};
use crate::monitor::ResourceMonitor;
use crate::registry::{TaskRegistry, TransitionFields};
use crate::worker::{ActiveWorker, WorkerOutcome, WorkerPool};

use lanes::LaneMap;
use resolver::DependencyResolver;

const OUTCOME_CHANNEL_CAPACITY: usize = 64;

/// What a finished dispatcher run looked like
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchSummary {
    pub cycles: u64,
    /// Tasks that could not be paused on shutdown; non-zero means a dirty exit
    pub non_resumable: usize,
}

/// The core scheduler loop
pub struct Dispatcher {
    registry: Arc<TaskRegistry>,
    monitor: Arc<ResourceMonitor>,
    checkpoints: Arc<CheckpointStore>,
    resolver: DependencyResolver,
    backup: Arc<dyn BackupNotifier>,
    pool: WorkerPool,
    outcome_rx: mpsc::Receiver<WorkerOutcome>,
    shutdown_rx: watch::Receiver<bool>,

    lanes: LaneMap,
    active: HashMap<String, ActiveWorker>,

    cycle_interval: Duration,
    shutdown_grace: Duration,
    max_retries: u32,
    output_dir: PathBuf,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &Config,
        registry: Arc<TaskRegistry>,
        monitor: Arc<ResourceMonitor>,
        checkpoints: Arc<CheckpointStore>,
        resolver: DependencyResolver,
        backup: Arc<dyn BackupNotifier>,
        executor: Arc<dyn ScrapeExecutor>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let (outcome_tx, outcome_rx) = mpsc::channel(OUTCOME_CHANNEL_CAPACITY);
        Self {
            registry,
            monitor,
            checkpoints,
            resolver,
            backup,
            pool: WorkerPool::new(executor, outcome_tx),
            outcome_rx,
            shutdown_rx,
            lanes: LaneMap::new(config.orchestrator.max_concurrent_sites),
            active: HashMap::new(),
            cycle_interval: config.cycle_interval(),
            shutdown_grace: config.shutdown_grace(),
            max_retries: config.orchestrator.max_retries,
            output_dir: config.storage.output_dir.clone(),
        }
    }

    /// Run the loop until no work remains (or forever under `watch`).
    /// Returns once everything drained or shutdown was requested.
    pub async fn run(&mut self, watch_mode: bool) -> Result<DispatchSummary> {
        let mut summary = DispatchSummary::default();
        let mut ticker = tokio::time::interval(self.cycle_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // first tick fires immediately; consume it

        tracing::info!(
            max_lanes = self.lanes.free_lanes(),
            cycle_secs = self.cycle_interval.as_secs(),
            watch = watch_mode,
            "dispatcher started"
        );

        enum Wake {
            Outcome(Option<WorkerOutcome>),
            Tick,
            Shutdown,
        }

        loop {
            summary.cycles += 1;

            // drain everything workers delivered since the last cycle
            while let Ok(outcome) = self.outcome_rx.try_recv() {
                self.handle_outcome(outcome)?;
            }

            self.registry.promote_due(Utc::now())?;
            self.admit_ready()?;
            self.persist_checkpoint()?;
            self.report_status();

            let ready = self.registry.list_ready(Utc::now())?;
            if self.lanes.occupied() == 0 && ready.is_empty() && !watch_mode {
                tracing::info!("no lanes occupied and nothing ready, dispatcher finished");
                break;
            }

            let wake = tokio::select! {
                maybe = self.outcome_rx.recv() => Wake::Outcome(maybe),
                _ = ticker.tick() => Wake::Tick,
                _ = self.shutdown_rx.changed() => Wake::Shutdown,
            };

            match wake {
                Wake::Outcome(Some(outcome)) => self.handle_outcome(outcome)?,
                Wake::Outcome(None) => return Err(DispatchError::ChannelClosed.into()),
                Wake::Tick => {}
                Wake::Shutdown => {
                    if *self.shutdown_rx.borrow() {
                        summary.non_resumable = self.graceful_shutdown().await?;
                        return Ok(summary);
                    }
                }
            }
        }

        // clean finish: record an empty in-flight snapshot
        self.persist_checkpoint()?;
        Ok(summary)
    }

    /// React to one worker completion. The only place task status is decided.
    fn handle_outcome(&mut self, outcome: WorkerOutcome) -> Result<()> {
        self.active.remove(&outcome.task_id);
        // lane stays reserved for the site; admission decides whether the
        // site continues or the lane is released
        self.lanes.clear_task(&outcome.site);

        let run = Run {
            id: Uuid::new_v4().to_string(),
            task_id: outcome.task_id.clone(),
            started_at: outcome.started_at,
            ended_at: outcome.ended_at,
            success: outcome.report.success,
            properties_extracted: outcome.report.properties_extracted,
            error_kind: outcome.report.error_kind,
            output_ref: outcome.report.output_ref.clone(),
        };
        self.registry.record_run(&run)?;
        metrics::record_run(
            &outcome.site,
            outcome.report.success,
            run.duration_secs() as f64,
        );

        if outcome.report.success {
            self.complete_task(&outcome)?;
        } else {
            self.fail_attempt(&outcome)?;
        }
        Ok(())
    }

    fn complete_task(&mut self, outcome: &WorkerOutcome) -> Result<()> {
        let task = self.registry.get(&outcome.task_id)?;
        let next_run = outcome.ended_at + chrono::Duration::days(i64::from(task.interval_days));

        let task = self
            .registry
            .transition(
                &outcome.task_id,
                TaskStatus::Completed,
                TransitionFields {
                    last_run_at: Some(outcome.ended_at),
                    next_run_at: Some(next_run),
                    retry_count: Some(0),
                    records_extracted: Some(outcome.report.properties_extracted),
                    output_ref: outcome.report.output_ref.clone(),
                    ..Default::default()
                },
            )?;

        tracing::info!(
            task_id = %task.id,
            site = %task.site,
            properties = outcome.report.properties_extracted,
            duration_secs = outcome.report.duration.as_secs(),
            "task completed"
        );

        // dependent detail scrape, when the run produced a usable artifact
        if let Some(output_ref) = &outcome.report.output_ref {
            if let Some(spec) = self.resolver.child_spec(&task, output_ref) {
                match self.registry.record_dependency(&task.id, &spec) {
                    Ok(child) => {
                        tracing::info!(child = %child.id, parent = %task.id, "dependent scrape enqueued");
                    }
                    Err(e) => {
                        // logged, never fails the parent
                        let err = DispatchError::Dependency {
                            parent_id: task.id.clone(),
                            reason: e.to_string(),
                        };
                        tracing::warn!(error = %err, "dependency enqueue failed");
                    }
                }
            }
        }

        // backup hand-off, fire-and-forget
        let backup = Arc::clone(&self.backup);
        let site = task.site.clone();
        let operation = task.operation.clone();
        let output_ref = outcome
            .report
            .output_ref
            .clone()
            .unwrap_or_else(|| outcome.output_path.display().to_string());
        tokio::spawn(async move {
            backup.notify(&site, &operation, &output_ref).await;
        });

        Ok(())
    }

    fn fail_attempt(&mut self, outcome: &WorkerOutcome) -> Result<()> {
        let task = self.registry.get(&outcome.task_id)?;
        let retries = task.retry_count + 1;
        let kind = outcome.report.error_kind.unwrap_or(ErrorKind::Other);

        if retries >= self.max_retries {
            self.registry
                .transition(
                    &outcome.task_id,
                    TaskStatus::Failed,
                    TransitionFields {
                        last_run_at: Some(outcome.ended_at),
                        retry_count: Some(retries),
                        last_error_kind: Some(ErrorKind::ExhaustedRetries),
                        ..Default::default()
                    },
                )?;
            tracing::error!(
                task_id = %outcome.task_id,
                retries,
                last_error = %kind,
                "retries exhausted, task failed"
            );
        } else {
            self.registry
                .transition(
                    &outcome.task_id,
                    TaskStatus::Pending,
                    TransitionFields {
                        last_run_at: Some(outcome.ended_at),
                        retry_count: Some(retries),
                        last_error_kind: Some(kind),
                        ..Default::default()
                    },
                )?;
            tracing::warn!(
                task_id = %outcome.task_id,
                retries,
                error_kind = %kind,
                error = outcome.report.error.as_deref().unwrap_or(""),
                "attempt failed, task returned to pending"
            );
        }
        Ok(())
    }

    /// Fill lanes with ready work. Sites holding a reserved lane continue
    /// draining their own queue first; remaining budget goes to the
    /// highest-priority ready task of an unoccupied site. Every start is
    /// individually gated by the resource monitor.
    fn admit_ready(&mut self) -> Result<()> {
        let now = Utc::now();

        // reserved lanes: continue the site or let the lane go
        for site in self.lanes.idle_sites() {
            let ready = self.registry.list_ready(now)?;
            match ready.into_iter().find(|t| t.site == site) {
                Some(task) => {
                    if !self.try_admit_gate() {
                        // site keeps its lane; retried after the cool-down
                        continue;
                    }
                    self.start_in_lane(&task.id, &site, false)?;
                }
                None => {
                    tracing::debug!(site = %site, "site drained, lane released");
                    self.lanes.release(&site);
                }
            }
        }

        // free budget: new sites, highest priority first
        while self.lanes.free_lanes() > 0 {
            let ready = self.registry.list_ready(now)?;
            let Some(task) = ready.into_iter().find(|t| !self.lanes.has_lane(&t.site)) else {
                break;
            };
            if !self.try_admit_gate() {
                break;
            }
            self.start_in_lane(&task.id, &task.site, true)?;
        }

        Ok(())
    }

    fn try_admit_gate(&self) -> bool {
        let admitted = self.monitor.can_admit();
        if !admitted {
            metrics::record_admission_denied();
        }
        admitted
    }

    /// Assign the lane and flip the task to `running` in one step, then hand
    /// it to the worker pool.
    fn start_in_lane(&mut self, task_id: &str, site: &str, new_lane: bool) -> Result<()> {
        let claimed = if new_lane {
            self.lanes.assign(site, task_id)
        } else {
            self.lanes.set_task(site, task_id)
        };
        if !claimed {
            // lane raced away within the cycle; skip, next cycle retries
            tracing::debug!(task_id, site, "lane no longer available");
            return Ok(());
        }

        let task = match self.registry.transition(
            task_id,
            TaskStatus::Running,
            TransitionFields {
                last_run_at: Some(Utc::now()),
                ..Default::default()
            },
        ) {
            Ok(task) => task,
            Err(e) => {
                self.lanes.clear_task(site);
                if new_lane {
                    self.lanes.release(site);
                }
                return Err(e.into());
            }
        };

        let request = ExecutionRequest::for_task(&task, &self.output_dir);
        let worker = self.pool.spawn(&task, request);
        tracing::info!(
            task_id = %task.id,
            site = %task.site,
            handle = %worker.handle_id,
            "task admitted"
        );
        self.active.insert(task.id.clone(), worker);
        Ok(())
    }

    fn persist_checkpoint(&self) -> Result<()> {
        let running = self
            .active
            .values()
            .map(|w| RunningEntry {
                task_id: w.task_id.clone(),
                handle_id: w.handle_id.clone(),
                site: w.site.clone(),
                started_at: w.started_at,
            })
            .collect();

        let counts = self.registry.counts()?;
        let checkpoint = Checkpoint::new(running, self.lanes.snapshot(), counts);

        if let Err(e) = self.checkpoints.save(&checkpoint) {
            // a missed snapshot only widens the recovery window
            tracing::warn!(error = %e, "checkpoint save failed");
        }
        let _ = self.checkpoints.prune_history();
        Ok(())
    }

    fn report_status(&self) {
        let counts = match self.registry.counts() {
            Ok(counts) => counts,
            Err(e) => {
                tracing::warn!(error = %e, "status counts unavailable");
                return;
            }
        };
        let usage = self.monitor.snapshot();

        metrics::set_task_counts(&counts);
        metrics::set_lane_occupancy(self.lanes.running());

        tracing::info!(
            pending = counts.pending,
            running = counts.running,
            paused = counts.paused,
            completed = counts.completed,
            failed = counts.failed,
            lanes = self.lanes.running(),
            cpu = usage.cpu_percent,
            memory = usage.memory_percent,
            "orchestrator status"
        );
    }

    /// Stop admissions, give active workers a bounded grace period, then
    /// force-mark stragglers `paused` and write a final checkpoint. Returns
    /// how many tasks could not be made resumable.
    async fn graceful_shutdown(&mut self) -> Result<usize> {
        tracing::info!(
            active = self.active.len(),
            grace_secs = self.shutdown_grace.as_secs(),
            "shutdown requested, draining workers"
        );

        let deadline = tokio::time::Instant::now() + self.shutdown_grace;
        while !self.active.is_empty() {
            match tokio::time::timeout_at(deadline, self.outcome_rx.recv()).await {
                Ok(Some(outcome)) => self.handle_outcome(outcome)?,
                Ok(None) => break,
                Err(_) => break, // grace expired
            }
        }

        let mut non_resumable = 0;
        for (task_id, worker) in self.active.drain() {
            worker.abort();
            match self.registry.transition(
                &task_id,
                TaskStatus::Paused,
                TransitionFields::none(),
            ) {
                Ok(_) => {
                    tracing::info!(task_id = %task_id, "task paused for resume");
                }
                Err(e) => {
                    tracing::error!(task_id = %task_id, error = %e, "task could not be paused");
                    non_resumable += 1;
                }
            }
        }
        self.lanes.clear();

        self.persist_checkpoint()?;
        tracing::info!(non_resumable, "shutdown complete");
        Ok(non_resumable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::executor::ExecutionReport;
    use crate::models::TaskSpec;
    use crate::registry::catalog::Catalog;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Executor that tracks concurrent sites and can be scripted to fail
    struct FakeExecutor {
        state: Mutex<FakeState>,
        delay_ms: u64,
        fail_sites: HashSet<String>,
        output_ref_sites: HashSet<String>,
    }

    #[derive(Default)]
    struct FakeState {
        active_sites: HashSet<String>,
        max_concurrent: usize,
        same_site_overlap: bool,
        executions: usize,
    }

    impl FakeExecutor {
        fn new(delay_ms: u64) -> Self {
            Self {
                state: Mutex::new(FakeState::default()),
                delay_ms,
                fail_sites: HashSet::new(),
                output_ref_sites: HashSet::new(),
            }
        }

        fn failing_for(mut self, site: &str) -> Self {
            self.fail_sites.insert(site.to_string());
            self
        }

        fn with_output_ref_for(mut self, site: &str) -> Self {
            self.output_ref_sites.insert(site.to_string());
            self
        }
    }

    #[async_trait]
    impl ScrapeExecutor for FakeExecutor {
        async fn execute(&self, request: ExecutionRequest) -> ExecutionReport {
            {
                let mut state = self.state.lock().unwrap();
                if !state.active_sites.insert(request.site.clone()) {
                    state.same_site_overlap = true;
                }
                state.max_concurrent = state.max_concurrent.max(state.active_sites.len());
                state.executions += 1;
            }

            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;

            {
                let mut state = self.state.lock().unwrap();
                state.active_sites.remove(&request.site);
            }

            if self.fail_sites.contains(&request.site) {
                ExecutionReport::failure(
                    ErrorKind::Network,
                    "connection reset",
                    Duration::from_millis(self.delay_ms),
                )
            } else {
                ExecutionReport {
                    success: true,
                    properties_extracted: 25,
                    duration: Duration::from_millis(self.delay_ms),
                    error_kind: None,
                    error: None,
                    output_ref: self
                        .output_ref_sites
                        .contains(&request.site)
                        .then(|| format!("{}/urls.csv", request.site)),
                }
            }
        }
    }

    struct Harness {
        registry: Arc<TaskRegistry>,
        dispatcher: Dispatcher,
        shutdown_tx: watch::Sender<bool>,
        _dir: TempDir,
    }

    fn harness(executor: Arc<dyn ScrapeExecutor>, max_lanes: usize, max_retries: u32) -> Harness {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.orchestrator.max_concurrent_sites = max_lanes;
        config.orchestrator.max_retries = max_retries;
        config.orchestrator.cycle_interval_secs = 1;
        config.orchestrator.shutdown_grace_secs = 1;
        config.storage.output_dir = dir.path().join("output");

        let registry = Arc::new(TaskRegistry::in_memory().unwrap());
        let monitor = Arc::new(ResourceMonitor::new(&crate::config::ResourceConfig {
            max_cpu_percent: 100.0,
            max_memory_percent: 100.0,
            admission_cooldown_secs: 0,
        }));
        let checkpoints =
            Arc::new(CheckpointStore::new(&dir.path().join("checkpoints"), 7).unwrap());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let dispatcher = Dispatcher::new(
            &config,
            Arc::clone(&registry),
            monitor,
            checkpoints,
            DependencyResolver::new(Catalog::builtin()),
            Arc::new(crate::backup::NoopNotifier),
            executor,
            shutdown_rx,
        );

        Harness {
            registry,
            dispatcher,
            shutdown_tx,
            _dir: dir,
        }
    }

    fn seed(registry: &TaskRegistry, site: &str, operation: &str) -> String {
        let spec = TaskSpec {
            site: site.into(),
            city: "guadalajara".into(),
            operation: operation.into(),
            product: "casa".into(),
            url: format!("https://{site}.example.com/{operation}"),
            priority: 5,
            interval_days: 15,
        };
        registry.add_task(&spec).unwrap().id
    }

    #[tokio::test]
    async fn test_drains_all_tasks_within_lane_budget() {
        let executor = Arc::new(FakeExecutor::new(20));
        let mut h = harness(executor.clone(), 2, 3);

        for site in ["inmuebles24", "lamudi", "mitula"] {
            seed(&h.registry, site, "venta");
            seed(&h.registry, site, "renta");
        }

        let summary = h.dispatcher.run(false).await.unwrap();
        assert!(summary.cycles >= 1);

        let counts = h.registry.counts().unwrap();
        assert_eq!(counts.completed, 6);
        assert_eq!(counts.pending, 0);
        assert_eq!(counts.running, 0);

        let state = executor.state.lock().unwrap();
        assert_eq!(state.executions, 6);
        assert!(
            state.max_concurrent <= 2,
            "lane budget exceeded: {}",
            state.max_concurrent
        );
        assert!(!state.same_site_overlap, "two tasks of one site overlapped");
    }

    #[tokio::test]
    async fn test_exhausted_retries_mark_failed() {
        let executor = Arc::new(FakeExecutor::new(5).failing_for("trovit"));
        let mut h = harness(executor, 2, 5);
        let id = seed(&h.registry, "trovit", "venta");

        h.dispatcher.run(false).await.unwrap();

        let task = h.registry.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 5);
        assert_eq!(task.last_error_kind, Some(ErrorKind::ExhaustedRetries));
        assert_eq!(h.registry.runs_for(&id).unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_parent_output_enqueues_one_child() {
        let executor = Arc::new(FakeExecutor::new(5).with_output_ref_for("inmuebles24"));
        let mut h = harness(executor, 2, 3);
        let parent_id = seed(&h.registry, "inmuebles24", "venta");

        h.dispatcher.run(false).await.unwrap();

        let children: Vec<_> = h
            .registry
            .load()
            .unwrap()
            .into_iter()
            .filter(|t| t.dependency_of.as_deref() == Some(parent_id.as_str()))
            .collect();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].site, "inmuebles24_det");
        // the child itself also ran to completion
        assert_eq!(children[0].status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_shutdown_pauses_active_tasks() {
        let executor = Arc::new(FakeExecutor::new(30_000));
        let mut h = harness(executor, 2, 3);
        let id = seed(&h.registry, "lamudi", "venta");

        let shutdown_tx = h.shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let _ = shutdown_tx.send(true);
        });

        let summary = h.dispatcher.run(false).await.unwrap();
        assert_eq!(summary.non_resumable, 0);
        assert_eq!(h.registry.get(&id).unwrap().status, TaskStatus::Paused);
    }

    #[tokio::test]
    async fn test_checkpoint_reflects_running_tasks() {
        let executor = Arc::new(FakeExecutor::new(30_000));
        let mut h = harness(executor, 2, 3);
        seed(&h.registry, "mitula", "venta");

        let shutdown_tx = h.shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let _ = shutdown_tx.send(true);
        });
        h.dispatcher.run(false).await.unwrap();

        // final checkpoint after pause: nothing in flight
        let checkpoint = h
            .dispatcher
            .checkpoints
            .load_current()
            .unwrap()
            .expect("checkpoint written");
        assert!(checkpoint.running.is_empty());
        assert!(checkpoint.lanes.is_empty());
        assert_eq!(checkpoint.counts.paused, 1);
    }
}
