use anyhow::Result;
use chrono::Utc;

use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::models::TaskStatus;
use crate::monitor::ResourceMonitor;
use crate::registry::TaskRegistry;

/// Print registry counts, in-flight detail, checkpoint state and host usage
pub fn status(config: &Config) -> Result<()> {
    let registry = TaskRegistry::open(&config.storage.registry_path)?;
    let counts = registry.counts()?;

    println!("Registry: {}", config.storage.registry_path.display());
    println!("=========================================");
    println!("  Pending:   {:4}", counts.pending);
    println!("  Running:   {:4}", counts.running);
    println!("  Paused:    {:4}", counts.paused);
    println!("  Completed: {:4}", counts.completed);
    println!("  Failed:    {:4}", counts.failed);
    println!("  Total:     {:4}", counts.total());

    let running = registry.list_by_status(TaskStatus::Running)?;
    if !running.is_empty() {
        println!("\nIn flight:");
        for task in running {
            let since = task
                .last_run_at
                .map(|t| format!("{}s", (Utc::now() - t).num_seconds()))
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  {:<16} {:<6} {:<20} elapsed {}",
                task.site, task.operation, task.product, since
            );
        }
    }

    let failed = registry.list_by_status(TaskStatus::Failed)?;
    if !failed.is_empty() {
        println!("\nFailed:");
        for task in failed {
            println!(
                "  {:<40} retries={} reason={}",
                task.id,
                task.retry_count,
                task.last_error_kind
                    .map(|k| k.as_str())
                    .unwrap_or("unknown")
            );
        }
    }

    let store = CheckpointStore::new(
        &config.storage.checkpoint_dir,
        config.storage.checkpoint_retention_days,
    )?;
    match store.load_current() {
        Ok(Some(checkpoint)) => {
            let age = (Utc::now() - checkpoint.timestamp).num_seconds();
            println!(
                "\nCheckpoint: {}s old, {} running, {} lane(s) occupied",
                age,
                checkpoint.running.len(),
                checkpoint.lanes.len()
            );
        }
        Ok(None) => println!("\nCheckpoint: none"),
        Err(e) => println!("\nCheckpoint: unreadable ({e})"),
    }

    let usage = ResourceMonitor::new(&config.resources).snapshot();
    println!(
        "\nHost: CPU {:.1}% | Memory {:.1}% (limits {:.0}%/{:.0}%)",
        usage.cpu_percent,
        usage.memory_percent,
        config.resources.max_cpu_percent,
        config.resources.max_memory_percent
    );

    Ok(())
}
