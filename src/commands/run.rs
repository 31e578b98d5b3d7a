use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

use crate::backup;
use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::dispatcher::resolver::DependencyResolver;
use crate::dispatcher::Dispatcher;
use crate::executor::CommandExecutor;
use crate::metrics;
use crate::monitor::ResourceMonitor;
use crate::recovery::RecoveryManager;
use crate::registry::catalog::Catalog;
use crate::registry::TaskRegistry;

/// Run the orchestration loop. Returns the process exit code: zero on a
/// clean finish or clean shutdown, non-zero when a task could not be made
/// resumable.
pub async fn run(config: Config, catalog_path: Option<PathBuf>, watch_mode: bool) -> Result<i32> {
    let Some(scraper_command) = config.executor.scraper_command.clone() else {
        bail!(
            "no scraper command configured; set executor.scraper_command \
             or PREDIO_SCRAPER_COMMAND"
        );
    };

    metrics::init_metrics();

    // a corrupt registry is fatal here: scheduling must not proceed on
    // partial state
    let registry = Arc::new(
        TaskRegistry::open(&config.storage.registry_path)
            .context("task registry unusable, aborting startup")?,
    );
    let checkpoints = Arc::new(CheckpointStore::new(
        &config.storage.checkpoint_dir,
        config.storage.checkpoint_retention_days,
    )?);

    let mut catalog = Catalog::builtin();
    if let Some(path) = &catalog_path {
        let user = Catalog::from_file(path)?;
        catalog = catalog.merged_with(user);
        let inserted = registry.import_catalog(&catalog)?;
        println!("Catalog imported: {inserted} new task(s)");
    }

    // reconcile interrupted state before the first cycle
    let recovery = RecoveryManager::new(
        Arc::clone(&registry),
        Arc::clone(&checkpoints),
        &config.storage.recovery_dir,
        config.orchestrator.max_retries,
    );
    let (report, outcome) = recovery.run()?;
    if report.interrupted {
        println!(
            "Recovered from interruption: {} task(s) repaired",
            outcome.total_recovered()
        );
    }

    let monitor = Arc::new(ResourceMonitor::new(&config.resources));
    let backup = backup::from_config(&config.executor);
    let executor = Arc::new(CommandExecutor::new(scraper_command));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_listener(shutdown_tx);

    let mut dispatcher = Dispatcher::new(
        &config,
        Arc::clone(&registry),
        monitor,
        checkpoints,
        DependencyResolver::new(catalog),
        backup,
        executor,
        shutdown_rx,
    );

    let summary = dispatcher.run(watch_mode).await?;

    let counts = registry.counts()?;
    println!("Orchestration finished after {} cycle(s): {counts}", summary.cycles);

    if summary.non_resumable > 0 {
        eprintln!(
            "{} task(s) could not be paused for resume",
            summary.non_resumable
        );
        return Ok(1);
    }
    Ok(0)
}

fn spawn_signal_listener(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable, SIGINT only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
