//! Durable snapshots of in-flight state for crash detection
//!
//! One versioned, typed document describing what was running at the end of a
//! dispatcher cycle: the `running` task ids with their execution-handle ids,
//! lane occupancy, and a digest of registry counts. The current document is
//! overwritten atomically (temp file + rename) every cycle; a timestamped
//! copy is kept alongside for audit and pruned by age.
//!
//! Checkpoints are only ever used to *detect* an unclean shutdown; they are
//! never replayed as a log. The registry stays the single source of truth.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CheckpointError;
use crate::models::TaskCounts;

/// Current checkpoint document version
pub const CHECKPOINT_VERSION: u32 = 1;

const CURRENT_FILE: &str = "current.json";

/// One running task as recorded in a checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningEntry {
    pub task_id: String,
    pub handle_id: String,
    pub site: String,
    pub started_at: DateTime<Utc>,
}

/// Point-in-time snapshot of the dispatcher's in-flight state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Document version, checked on load
    pub version: u32,

    pub timestamp: DateTime<Utc>,

    /// Tasks in `running` with their live execution handles
    pub running: Vec<RunningEntry>,

    /// Occupied lanes: site → task id
    pub lanes: BTreeMap<String, String>,

    /// Registry digest at snapshot time
    pub counts: TaskCounts,
}

impl Checkpoint {
    pub fn new(
        running: Vec<RunningEntry>,
        lanes: BTreeMap<String, String>,
        counts: TaskCounts,
    ) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            timestamp: Utc::now(),
            running,
            lanes,
            counts,
        }
    }

    /// Snapshot with nothing in flight (clean shutdown / startup)
    pub fn empty(counts: TaskCounts) -> Self {
        Self::new(Vec::new(), BTreeMap::new(), counts)
    }
}

/// Manages the current checkpoint document and its timestamped history
pub struct CheckpointStore {
    dir: PathBuf,
    retention: Duration,
}

impl CheckpointStore {
    /// Open (or create) the checkpoint directory
    pub fn new(dir: &Path, retention_days: u32) -> Result<Self, CheckpointError> {
        fs::create_dir_all(dir).map_err(|e| CheckpointError::io("create checkpoint dir", e))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            retention: Duration::from_secs(u64::from(retention_days) * 24 * 60 * 60),
        })
    }

    fn current_path(&self) -> PathBuf {
        self.dir.join(CURRENT_FILE)
    }

    /// Persist `checkpoint` as the current document plus a timestamped
    /// history copy. The current document is replaced atomically.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let temp_path = self.dir.join(format!("{CURRENT_FILE}.tmp"));

        let file =
            File::create(&temp_path).map_err(|e| CheckpointError::io("create temp file", e))?;
        serde_json::to_writer_pretty(BufWriter::new(file), checkpoint)?;

        fs::rename(&temp_path, self.current_path())
            .map_err(|e| CheckpointError::io("rename checkpoint", e))?;

        let history_name = format!(
            "checkpoint_{}.json",
            checkpoint.timestamp.format("%Y%m%d_%H%M%S%3f")
        );
        let history_file = File::create(self.dir.join(history_name))
            .map_err(|e| CheckpointError::io("create history file", e))?;
        serde_json::to_writer_pretty(BufWriter::new(history_file), checkpoint)?;

        tracing::debug!(
            running = checkpoint.running.len(),
            lanes = checkpoint.lanes.len(),
            "checkpoint saved"
        );
        Ok(())
    }

    /// Load the current checkpoint, if one exists. A document with an
    /// unknown version is reported as unreadable rather than misinterpreted.
    pub fn load_current(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = self.current_path();
        if !path.exists() {
            return Ok(None);
        }

        let file = File::open(&path).map_err(|e| CheckpointError::io("open checkpoint", e))?;
        let checkpoint: Checkpoint = serde_json::from_reader(BufReader::new(file))?;

        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(CheckpointError::Unreadable {
                reason: format!(
                    "version {} (supported: {CHECKPOINT_VERSION})",
                    checkpoint.version
                ),
            });
        }

        Ok(Some(checkpoint))
    }

    /// Timestamped history documents, oldest first
    pub fn list_history(&self) -> Result<Vec<PathBuf>, CheckpointError> {
        let mut files = Vec::new();
        let entries =
            fs::read_dir(&self.dir).map_err(|e| CheckpointError::io("read checkpoint dir", e))?;
        for entry in entries {
            let entry = entry.map_err(|e| CheckpointError::io("read dir entry", e))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("checkpoint_") && name.ends_with(".json") {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    /// Delete history documents older than the retention window. Returns how
    /// many were removed. The current document is never pruned.
    pub fn prune_history(&self) -> Result<usize, CheckpointError> {
        let cutoff = SystemTime::now() - self.retention;
        let mut removed = 0;

        for path in self.list_history()? {
            let modified = fs::metadata(&path)
                .and_then(|m| m.modified())
                .map_err(|e| CheckpointError::io("stat history file", e))?;
            if modified < cutoff {
                fs::remove_file(&path).map_err(|e| CheckpointError::io("remove history", e))?;
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!(removed, "pruned old checkpoint history");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> Checkpoint {
        let mut lanes = BTreeMap::new();
        lanes.insert("inmuebles24".to_string(), "inm24_gdl_venta_casa".to_string());
        Checkpoint::new(
            vec![RunningEntry {
                task_id: "inm24_gdl_venta_casa".into(),
                handle_id: "3f6d2e10-aaaa-bbbb-cccc-0123456789ab".into(),
                site: "inmuebles24".into(),
                started_at: Utc::now(),
            }],
            lanes,
            TaskCounts {
                pending: 5,
                running: 1,
                paused: 0,
                completed: 2,
                failed: 0,
            },
        )
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path(), 7).unwrap();

        assert!(store.load_current().unwrap().is_none());

        let checkpoint = sample();
        store.save(&checkpoint).unwrap();

        let loaded = store.load_current().unwrap().unwrap();
        assert_eq!(loaded.version, CHECKPOINT_VERSION);
        assert_eq!(loaded.running, checkpoint.running);
        assert_eq!(loaded.lanes.get("inmuebles24").unwrap(), "inm24_gdl_venta_casa");
        assert_eq!(loaded.counts.pending, 5);
    }

    #[test]
    fn test_current_overwritten_history_accumulates() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path(), 7).unwrap();

        store.save(&sample()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.save(&Checkpoint::empty(TaskCounts::default())).unwrap();

        let current = store.load_current().unwrap().unwrap();
        assert!(current.running.is_empty());
        assert_eq!(store.list_history().unwrap().len(), 2);
    }

    #[test]
    fn test_version_mismatch_is_unreadable() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path(), 7).unwrap();

        let mut checkpoint = sample();
        checkpoint.version = 99;
        store.save(&checkpoint).unwrap();

        let err = store.load_current().unwrap_err();
        assert!(matches!(err, CheckpointError::Unreadable { .. }));
    }

    #[test]
    fn test_prune_history_by_age() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path(), 0).unwrap();

        store.save(&sample()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        let removed = store.prune_history().unwrap();
        assert_eq!(removed, 1);
        assert!(store.list_history().unwrap().is_empty());
        // current document untouched
        assert!(store.load_current().unwrap().is_some());
    }
}
