use anyhow::Result;
use chrono::Utc;

use crate::checkpoint::CheckpointStore;
use crate::config::Config;

/// Inspect the current checkpoint document, optionally listing the
/// timestamped history
pub fn checkpoint(config: &Config, history: bool) -> Result<()> {
    let store = CheckpointStore::new(
        &config.storage.checkpoint_dir,
        config.storage.checkpoint_retention_days,
    )?;

    match store.load_current() {
        Ok(Some(cp)) => {
            println!(
                "Checkpoint v{} written {} ({}s ago)",
                cp.version,
                cp.timestamp.to_rfc3339(),
                (Utc::now() - cp.timestamp).num_seconds()
            );
            println!("Counts: {}", cp.counts);
            if cp.running.is_empty() {
                println!("Nothing in flight");
            } else {
                println!("In flight:");
                for entry in &cp.running {
                    println!(
                        "  {:<16} {:<40} handle {}",
                        entry.site, entry.task_id, entry.handle_id
                    );
                }
            }
            if !cp.lanes.is_empty() {
                println!("Lanes:");
                for (site, task_id) in &cp.lanes {
                    println!("  {site:<16} -> {task_id}");
                }
            }
        }
        Ok(None) => println!("No checkpoint found"),
        Err(e) => println!("Checkpoint unreadable: {e}"),
    }

    if history {
        let files = store.list_history()?;
        println!("\n{} history document(s):", files.len());
        for path in files {
            println!("  {}", path.display());
        }
    }

    Ok(())
}
