use anyhow::Result;
use std::collections::HashSet;
use std::sync::Arc;

use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::recovery::RecoveryManager;
use crate::registry::TaskRegistry;

/// Detect (and unless `detect_only`, repair) state left by an unclean
/// shutdown. The same pass runs automatically at the start of `run`.
pub fn recover(config: &Config, detect_only: bool) -> Result<()> {
    let registry = Arc::new(TaskRegistry::open(&config.storage.registry_path)?);
    let checkpoints = Arc::new(CheckpointStore::new(
        &config.storage.checkpoint_dir,
        config.storage.checkpoint_retention_days,
    )?);
    let manager = RecoveryManager::new(
        registry,
        checkpoints,
        &config.storage.recovery_dir,
        config.orchestrator.max_retries,
    );

    if detect_only {
        let report = manager.detect_interruption(&HashSet::new())?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let (report, outcome) = manager.run()?;
    if !report.interrupted {
        println!("No interruption detected");
        return Ok(());
    }

    println!("Interruption detected:");
    for reason in &report.reasons {
        println!("  - {reason}");
    }
    println!(
        "Repaired {} task(s): {} reset to pending, {} failed (retries exhausted), {} resumed from pause",
        outcome.total_recovered(),
        outcome.reset_to_pending.len(),
        outcome.failed_exhausted.len(),
        outcome.resumed_paused.len()
    );

    Ok(())
}
