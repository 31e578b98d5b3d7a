//! Integration tests for the orchestration core
//!
//! These tests drive the full dispatcher against a scripted executor and
//! verify the scheduling guarantees end-to-end:
//! - lane exclusivity and the global concurrency cap
//! - retry exhaustion
//! - crash recovery across a simulated restart (on-disk registry + checkpoint)
//! - dependent detail-scrape enqueueing
//! - admission denial holding lane occupancy at zero

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;
use tokio::sync::watch;

use predio::backup::NoopNotifier;
use predio::checkpoint::{Checkpoint, CheckpointStore, RunningEntry};
use predio::config::{Config, ResourceConfig};
use predio::dispatcher::resolver::DependencyResolver;
use predio::dispatcher::Dispatcher;
use predio::executor::{ExecutionReport, ExecutionRequest, ScrapeExecutor};
use predio::models::{ErrorKind, TaskCounts, TaskSpec, TaskStatus};
use predio::monitor::ResourceMonitor;
use predio::recovery::RecoveryManager;
use predio::registry::catalog::Catalog;
use predio::registry::{TaskRegistry, TransitionFields};

// ============================================================================
// Fixtures
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
enum Event {
    Start(String),
    End(String),
}

/// Executor that records start/end events per site and can be scripted to
/// fail or to produce an output artifact for specific sites.
struct TrackingExecutor {
    events: Mutex<Vec<Event>>,
    active_sites: Mutex<HashSet<String>>,
    max_concurrent: AtomicUsize,
    overlaps: AtomicUsize,
    delay: Duration,
    fail_sites: HashSet<String>,
    output_sites: HashSet<String>,
}

impl TrackingExecutor {
    fn new(delay_ms: u64) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            active_sites: Mutex::new(HashSet::new()),
            max_concurrent: AtomicUsize::new(0),
            overlaps: AtomicUsize::new(0),
            delay: Duration::from_millis(delay_ms),
            fail_sites: HashSet::new(),
            output_sites: HashSet::new(),
        }
    }

    fn failing_for(mut self, site: &str) -> Self {
        self.fail_sites.insert(site.to_string());
        self
    }

    fn with_output_for(mut self, site: &str) -> Self {
        self.output_sites.insert(site.to_string());
        self
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl ScrapeExecutor for TrackingExecutor {
    async fn execute(&self, request: ExecutionRequest) -> ExecutionReport {
        {
            let mut active = self.active_sites.lock().unwrap();
            if !active.insert(request.site.clone()) {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            self.max_concurrent
                .fetch_max(active.len(), Ordering::SeqCst);
            self.events
                .lock()
                .unwrap()
                .push(Event::Start(request.site.clone()));
        }

        tokio::time::sleep(self.delay).await;

        {
            let mut active = self.active_sites.lock().unwrap();
            active.remove(&request.site);
            self.events
                .lock()
                .unwrap()
                .push(Event::End(request.site.clone()));
        }

        if self.fail_sites.contains(&request.site) {
            ExecutionReport::failure(ErrorKind::Blocked, "bot wall", self.delay)
        } else {
            ExecutionReport {
                success: true,
                properties_extracted: 40,
                duration: self.delay,
                error_kind: None,
                error: None,
                output_ref: self
                    .output_sites
                    .contains(&request.site)
                    .then(|| format!("{}/listado_urls.csv", request.site)),
            }
        }
    }
}

struct Env {
    _dir: TempDir,
    config: Config,
}

impl Env {
    fn new(max_lanes: usize, max_retries: u32) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.orchestrator.max_concurrent_sites = max_lanes;
        config.orchestrator.max_retries = max_retries;
        config.orchestrator.cycle_interval_secs = 1;
        config.orchestrator.shutdown_grace_secs = 1;
        config.resources = ResourceConfig {
            max_cpu_percent: 100.0,
            max_memory_percent: 100.0,
            admission_cooldown_secs: 0,
        };
        config.storage.registry_path = dir.path().join("registry.db");
        config.storage.checkpoint_dir = dir.path().join("checkpoints");
        config.storage.recovery_dir = dir.path().join("recovery");
        config.storage.output_dir = dir.path().join("output");
        Env { _dir: dir, config }
    }

    fn registry(&self) -> Arc<TaskRegistry> {
        Arc::new(TaskRegistry::open(&self.config.storage.registry_path).unwrap())
    }

    fn checkpoints(&self) -> Arc<CheckpointStore> {
        Arc::new(
            CheckpointStore::new(
                &self.config.storage.checkpoint_dir,
                self.config.storage.checkpoint_retention_days,
            )
            .unwrap(),
        )
    }

    fn dispatcher(
        &self,
        registry: Arc<TaskRegistry>,
        executor: Arc<dyn ScrapeExecutor>,
        resources: Option<ResourceConfig>,
    ) -> (Dispatcher, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let monitor = Arc::new(ResourceMonitor::new(
            &resources.unwrap_or_else(|| self.config.resources.clone()),
        ));
        let dispatcher = Dispatcher::new(
            &self.config,
            registry,
            monitor,
            self.checkpoints(),
            DependencyResolver::new(Catalog::builtin()),
            Arc::new(NoopNotifier),
            executor,
            shutdown_rx,
        );
        (dispatcher, shutdown_tx)
    }
}

fn spec(site: &str, operation: &str, priority: u32) -> TaskSpec {
    TaskSpec {
        site: site.into(),
        city: "guadalajara".into(),
        operation: operation.into(),
        product: "casa".into(),
        url: format!("https://{site}.example.com/{operation}"),
        priority,
        interval_days: 15,
    }
}

// ============================================================================
// Concurrency & Lane Tests
// ============================================================================

#[tokio::test]
async fn three_sites_two_lanes_third_waits() {
    let env = Env::new(2, 3);
    let registry = env.registry();

    // insertion order fixes which two sites grab lanes first
    for site in ["inmuebles24", "lamudi", "mitula"] {
        registry.add_task(&spec(site, "venta", 5)).unwrap();
        registry.add_task(&spec(site, "renta", 5)).unwrap();
    }

    let executor = Arc::new(TrackingExecutor::new(30));
    let (mut dispatcher, _shutdown) = env.dispatcher(registry.clone(), executor.clone(), None);
    dispatcher.run(false).await.unwrap();

    // all six tasks done, never more than two sites at once, never the same
    // site twice in parallel
    let counts = registry.counts().unwrap();
    assert_eq!(counts.completed, 6);
    assert_eq!(executor.max_concurrent.load(Ordering::SeqCst), 2);
    assert_eq!(executor.overlaps.load(Ordering::SeqCst), 0);

    // the third site only starts after another site fully drained its two
    // tasks and released the lane
    let events = executor.events();
    let third_site_start = events
        .iter()
        .position(|e| matches!(e, Event::Start(site) if site == "mitula"))
        .expect("mitula ran");
    let drained_before = ["inmuebles24", "lamudi"].iter().any(|site| {
        events[..third_site_start]
            .iter()
            .filter(|e| matches!(e, Event::End(s) if s == site))
            .count()
            >= 2
    });
    assert!(
        drained_before,
        "mitula started before any lane was drained: {events:?}"
    );
}

#[tokio::test]
async fn site_tasks_drain_in_registry_order() {
    let env = Env::new(1, 3);
    let registry = env.registry();
    registry.add_task(&spec("lamudi", "venta", 5)).unwrap();
    registry.add_task(&spec("lamudi", "renta", 5)).unwrap();

    let executor = Arc::new(TrackingExecutor::new(10));
    let (mut dispatcher, _shutdown) = env.dispatcher(registry.clone(), executor.clone(), None);
    dispatcher.run(false).await.unwrap();

    let runs_first = registry
        .runs_for("lamudi_guadalajara_venta_casa")
        .unwrap();
    let runs_second = registry
        .runs_for("lamudi_guadalajara_renta_casa")
        .unwrap();
    assert_eq!(runs_first.len(), 1);
    assert_eq!(runs_second.len(), 1);
    assert!(
        runs_first[0].ended_at <= runs_second[0].started_at,
        "second task started before the first finished"
    );
}

#[tokio::test]
async fn running_task_occupies_exactly_one_lane() {
    let env = Env::new(2, 3);
    let registry = env.registry();
    registry.add_task(&spec("inmuebles24", "venta", 1)).unwrap();
    registry.add_task(&spec("trovit", "venta", 2)).unwrap();

    let executor = Arc::new(TrackingExecutor::new(30_000));
    let (mut dispatcher, shutdown) = env.dispatcher(registry.clone(), executor, None);

    let checkpoints = env.checkpoints();
    let handle = tokio::spawn(async move { dispatcher.run(false).await });

    tokio::time::sleep(Duration::from_millis(300)).await;

    // while both workers are in flight, the checkpoint pairs every running
    // task with exactly one occupied lane
    let checkpoint = checkpoints.load_current().unwrap().expect("checkpoint written");
    assert_eq!(checkpoint.running.len(), 2);
    assert_eq!(checkpoint.lanes.len(), 2);
    for entry in &checkpoint.running {
        assert_eq!(
            checkpoint.lanes.get(&entry.site).unwrap(),
            &entry.task_id,
            "running task without matching lane"
        );
    }

    shutdown.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

// ============================================================================
// Retry & Failure Tests
// ============================================================================

#[tokio::test]
async fn five_failures_exhaust_retries() {
    let env = Env::new(2, 5);
    let registry = env.registry();
    let id = registry
        .add_task(&spec("propiedades", "venta", 5))
        .unwrap()
        .id;

    let executor = Arc::new(TrackingExecutor::new(5).failing_for("propiedades"));
    let (mut dispatcher, _shutdown) = env.dispatcher(registry.clone(), executor, None);
    dispatcher.run(false).await.unwrap();

    let task = registry.get(&id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 5);
    assert_eq!(task.last_error_kind, Some(ErrorKind::ExhaustedRetries));

    let runs = registry.runs_for(&id).unwrap();
    assert_eq!(runs.len(), 5);
    assert!(runs.iter().all(|r| !r.success));
}

// ============================================================================
// Dependency Tests
// ============================================================================

#[tokio::test]
async fn completed_parent_enqueues_one_child() {
    let env = Env::new(2, 3);
    let registry = env.registry();
    let parent_id = registry
        .add_task(&spec("inmuebles24", "venta", 1))
        .unwrap()
        .id;

    let executor = Arc::new(TrackingExecutor::new(10).with_output_for("inmuebles24"));
    let (mut dispatcher, _shutdown) = env.dispatcher(registry.clone(), executor, None);
    dispatcher.run(false).await.unwrap();

    let children: Vec<_> = registry
        .load()
        .unwrap()
        .into_iter()
        .filter(|t| t.dependency_of.as_deref() == Some(parent_id.as_str()))
        .collect();
    assert_eq!(children.len(), 1, "exactly one child per parent completion");
    assert_eq!(children[0].site, "inmuebles24_det");
    assert_eq!(children[0].url, "inmuebles24/listado_urls.csv");

    let parent = registry.get(&parent_id).unwrap();
    assert_eq!(parent.status, TaskStatus::Completed);
    assert_eq!(
        parent.output_ref.as_deref(),
        Some("inmuebles24/listado_urls.csv")
    );
}

// ============================================================================
// Admission Tests
// ============================================================================

#[tokio::test]
async fn denied_admission_holds_occupancy_at_zero() {
    let env = Env::new(2, 3);
    let registry = env.registry();
    registry.add_task(&spec("mitula", "venta", 5)).unwrap();

    // ceilings below any real usage: every admission is denied
    let denied = ResourceConfig {
        max_cpu_percent: -1.0,
        max_memory_percent: -1.0,
        admission_cooldown_secs: 3600,
    };
    let executor = Arc::new(TrackingExecutor::new(5));
    let (mut dispatcher, shutdown) =
        env.dispatcher(registry.clone(), executor.clone(), Some(denied));

    let handle = tokio::spawn(async move { dispatcher.run(false).await });
    tokio::time::sleep(Duration::from_millis(400)).await;
    shutdown.send(true).unwrap();
    let summary = handle.await.unwrap().unwrap();

    // nothing started, nothing running, and the loop idled on its timer
    // instead of spinning
    assert!(executor.events().is_empty());
    let counts = registry.counts().unwrap();
    assert_eq!(counts.running, 0);
    assert_eq!(counts.pending, 1);
    assert!(
        summary.cycles <= 5,
        "dispatcher busy-looped: {} cycles in 400ms",
        summary.cycles
    );
}

// ============================================================================
// Crash Recovery Tests
// ============================================================================

#[tokio::test]
async fn simulated_crash_restart_resets_running_task() {
    let env = Env::new(2, 5);

    let stale_id;
    {
        // first process: task admitted, then the process "dies" leaving the
        // registry row running and a checkpoint with a now-dead handle
        let registry = env.registry();
        stale_id = registry.add_task(&spec("lamudi", "venta", 3)).unwrap().id;
        registry
            .transition(&stale_id, TaskStatus::Running, TransitionFields::none())
            .unwrap();

        let mut lanes = std::collections::BTreeMap::new();
        lanes.insert("lamudi".to_string(), stale_id.clone());
        env.checkpoints()
            .save(&Checkpoint::new(
                vec![RunningEntry {
                    task_id: stale_id.clone(),
                    handle_id: "handle-from-dead-process".into(),
                    site: "lamudi".into(),
                    started_at: Utc::now(),
                }],
                lanes,
                TaskCounts::default(),
            ))
            .unwrap();
    }

    // second process: reopen everything from disk and reconcile
    let registry = env.registry();
    let recovery = RecoveryManager::new(
        Arc::clone(&registry),
        env.checkpoints(),
        &env.config.storage.recovery_dir,
        env.config.orchestrator.max_retries,
    );
    let (report, outcome) = recovery.run().unwrap();

    assert!(report.interrupted);
    assert_eq!(outcome.reset_to_pending, vec![stale_id.clone()]);

    let task = registry.get(&stale_id).unwrap();
    assert_eq!(task.status, TaskStatus::Pending, "never left stuck in running");
    assert_eq!(task.retry_count, 1);

    // and the recovered task is schedulable again
    let ready = registry.list_ready(Utc::now()).unwrap();
    assert!(ready.iter().any(|t| t.id == stale_id));
}

#[tokio::test]
async fn graceful_shutdown_then_resume_runs_task() {
    let env = Env::new(1, 3);
    let registry = env.registry();
    let id = registry.add_task(&spec("trovit", "venta", 5)).unwrap().id;

    // first run: shut down while the task is in flight
    let slow = Arc::new(TrackingExecutor::new(30_000));
    let (mut dispatcher, shutdown) = env.dispatcher(registry.clone(), slow, None);
    let handle = tokio::spawn(async move { dispatcher.run(false).await });
    tokio::time::sleep(Duration::from_millis(300)).await;
    shutdown.send(true).unwrap();
    let summary = handle.await.unwrap().unwrap();
    assert_eq!(summary.non_resumable, 0);
    assert_eq!(registry.get(&id).unwrap().status, TaskStatus::Paused);

    // restart: recovery resumes the paused task, the next run completes it
    let recovery = RecoveryManager::new(
        Arc::clone(&registry),
        env.checkpoints(),
        &env.config.storage.recovery_dir,
        env.config.orchestrator.max_retries,
    );
    recovery.run().unwrap();
    assert_eq!(registry.get(&id).unwrap().status, TaskStatus::Pending);

    let fast = Arc::new(TrackingExecutor::new(10));
    let (mut dispatcher, _shutdown) = env.dispatcher(registry.clone(), fast, None);
    dispatcher.run(false).await.unwrap();
    assert_eq!(registry.get(&id).unwrap().status, TaskStatus::Completed);
}

// ============================================================================
// Determinism Tests
// ============================================================================

#[test]
fn list_ready_is_deterministic_across_reopen() {
    let env = Env::new(2, 3);
    let now = Utc::now();

    let first_order: Vec<String> = {
        let registry = env.registry();
        registry.add_task(&spec("trovit", "venta", 6)).unwrap();
        registry.add_task(&spec("inmuebles24", "venta", 1)).unwrap();
        registry.add_task(&spec("mitula", "venta", 4)).unwrap();
        registry.add_task(&spec("mitula", "renta", 4)).unwrap();
        registry
            .list_ready(now)
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect()
    };

    // same snapshot, same now, fresh process: identical order
    let registry = env.registry();
    let second_order: Vec<String> = registry
        .list_ready(now)
        .unwrap()
        .into_iter()
        .map(|t| t.id)
        .collect();

    assert_eq!(first_order, second_order);
    assert_eq!(first_order[0], "inmuebles24_guadalajara_venta_casa");
    // equal priority resolves by insertion sequence
    assert_eq!(first_order[1], "mitula_guadalajara_venta_casa");
    assert_eq!(first_order[2], "mitula_guadalajara_renta_casa");
    assert_eq!(first_order[3], "trovit_guadalajara_venta_casa");
}
