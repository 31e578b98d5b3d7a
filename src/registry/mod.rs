//! Durable catalog of scrape tasks and their scheduling state
//!
//! Single source of truth for task existence and status. Backed by an
//! embedded SQLite store (WAL mode, one `Mutex`-guarded connection) so every
//! status change is an indexed row update instead of the full-file rewrite a
//! CSV registry needs. All mutation funnels through [`TaskRegistry::transition`]
//! and [`TaskRegistry::record_dependency`]; the connection mutex gives the
//! single-writer discipline the scheduler relies on.
//!
//! The status column holds the [`TaskStatus`] state machine:
//! `pending → running → {completed, failed}`, `running → paused` on shutdown,
//! `paused → pending` on resume, `completed → pending` once the re-scrape
//! interval elapses.

pub mod catalog;

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{RegistryError, RegistryResult};
use crate::models::{ErrorKind, Run, Task, TaskCounts, TaskSpec, TaskStatus};

use catalog::Catalog;

/// Fields updated together with a status transition
#[derive(Debug, Clone, Default)]
pub struct TransitionFields {
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub retry_count: Option<u32>,
    pub last_error_kind: Option<ErrorKind>,
    pub records_extracted: Option<u64>,
    pub output_ref: Option<String>,
}

impl TransitionFields {
    pub fn none() -> Self {
        Self::default()
    }
}

/// SQLite-backed task registry
pub struct TaskRegistry {
    conn: Mutex<Connection>,
}

impl TaskRegistry {
    /// Open (or create) the registry at `path`
    pub fn open(path: impl AsRef<Path>) -> RegistryResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| RegistryError::corruption(format!("cannot create {}: {e}", parent.display())))?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let registry = Self {
            conn: Mutex::new(conn),
        };
        registry.create_schema()?;
        registry.verify_store()?;

        tracing::info!(path = %path.display(), "task registry opened");
        Ok(registry)
    }

    /// Create an in-memory registry (for testing)
    pub fn in_memory() -> RegistryResult<Self> {
        let conn = Connection::open_in_memory()?;
        let registry = Self {
            conn: Mutex::new(conn),
        };
        registry.create_schema()?;
        Ok(registry)
    }

    fn create_schema(&self) -> RegistryResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
                CREATE TABLE IF NOT EXISTS tasks (
                    id TEXT PRIMARY KEY,
                    site TEXT NOT NULL,
                    city TEXT NOT NULL,
                    operation TEXT NOT NULL,
                    product TEXT NOT NULL,
                    url TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    priority INTEGER NOT NULL DEFAULT 10,
                    interval_days INTEGER NOT NULL DEFAULT 15,
                    created_at TEXT NOT NULL,
                    last_run_at TEXT,
                    next_run_at TEXT,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    last_error TEXT,
                    records_extracted INTEGER NOT NULL DEFAULT 0,
                    dependency_of TEXT,
                    output_ref TEXT,
                    seq INTEGER NOT NULL,
                    UNIQUE(site, city, operation, product)
                );
                CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
                CREATE INDEX IF NOT EXISTS idx_tasks_site ON tasks(site);

                CREATE TABLE IF NOT EXISTS runs (
                    id TEXT PRIMARY KEY,
                    task_id TEXT NOT NULL,
                    started_at TEXT NOT NULL,
                    ended_at TEXT NOT NULL,
                    success INTEGER NOT NULL,
                    properties_extracted INTEGER NOT NULL DEFAULT 0,
                    error_kind TEXT,
                    output_ref TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_runs_task ON runs(task_id);
            "#,
        )?;
        Ok(())
    }

    /// Cheap sanity pass over the persisted store. Scheduling must not start
    /// on a store we cannot fully read.
    fn verify_store(&self) -> RegistryResult<()> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id, status FROM tasks")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        for row in rows {
            let (id, status) = row?;
            status.parse::<TaskStatus>().map_err(|e| {
                RegistryError::corruption(format!("task {id} has unreadable status: {e}"))
            })?;
        }
        Ok(())
    }

    /// Load every persisted task, deduplicated by natural key.
    ///
    /// Duplicate keys cannot be created through this module (the schema is
    /// UNIQUE over the key), but stores written by older tooling may carry
    /// them; the earliest insertion wins and the rest are dropped with a
    /// warning.
    pub fn load(&self) -> RegistryResult<Vec<Task>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM tasks ORDER BY seq ASC"
        ))?;
        let rows = stmt.query_map([], row_to_task)?;

        let mut seen = HashSet::new();
        let mut tasks = Vec::new();
        for row in rows {
            let task = row??;
            if seen.insert(task.key()) {
                tasks.push(task);
            } else {
                tracing::warn!(task_id = %task.id, key = %task.key(), "dropping duplicate task record");
            }
        }
        Ok(tasks)
    }

    /// Fetch one task by id
    pub fn get(&self, task_id: &str) -> RegistryResult<Task> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM tasks WHERE id = ?1"
        ))?;
        let task = stmt
            .query_row(params![task_id], row_to_task)
            .optional()?
            .ok_or_else(|| RegistryError::NotFound {
                task_id: task_id.to_string(),
            })??;
        Ok(task)
    }

    /// Tasks eligible to run at `now`: `pending` with no next-run time or one
    /// that already elapsed. Ordered by (priority ascending, longest-waiting
    /// first), insertion sequence as the stable tie-break. Deterministic for
    /// a fixed snapshot and `now`.
    pub fn list_ready(&self, now: DateTime<Utc>) -> RegistryResult<Vec<Task>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM tasks
             WHERE status = 'pending'
               AND (next_run_at IS NULL OR next_run_at <= ?1)
             ORDER BY priority ASC, COALESCE(last_run_at, '') ASC, seq ASC"
        ))?;
        let rows = stmt.query_map(params![ts(now)], row_to_task)?;

        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row??);
        }
        Ok(tasks)
    }

    /// All tasks currently in `status`, in insertion order
    pub fn list_by_status(&self, status: TaskStatus) -> RegistryResult<Vec<Task>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM tasks WHERE status = ?1 ORDER BY seq ASC"
        ))?;
        let rows = stmt.query_map(params![status.as_str()], row_to_task)?;

        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row??);
        }
        Ok(tasks)
    }

    /// Atomic status mutation. Fails with `NotFound` for unknown ids and
    /// `InvalidTransition` when the state machine disallows the move; run
    /// summary fields are written in the same statement.
    pub fn transition(
        &self,
        task_id: &str,
        new_status: TaskStatus,
        fields: TransitionFields,
    ) -> RegistryResult<Task> {
        let conn = self.conn.lock().unwrap();

        let current: TaskStatus = conn
            .query_row(
                "SELECT status FROM tasks WHERE id = ?1",
                params![task_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .ok_or_else(|| RegistryError::NotFound {
                task_id: task_id.to_string(),
            })?
            .parse()
            .map_err(|e: String| RegistryError::corruption(e))?;

        if !current.can_transition_to(new_status) {
            return Err(RegistryError::InvalidTransition {
                task_id: task_id.to_string(),
                from: current,
                to: new_status,
            });
        }

        conn.execute(
            "UPDATE tasks SET
                 status = ?2,
                 last_run_at = COALESCE(?3, last_run_at),
                 next_run_at = COALESCE(?4, next_run_at),
                 retry_count = COALESCE(?5, retry_count),
                 last_error = COALESCE(?6, last_error),
                 records_extracted = COALESCE(?7, records_extracted),
                 output_ref = COALESCE(?8, output_ref)
             WHERE id = ?1",
            params![
                task_id,
                new_status.as_str(),
                fields.last_run_at.map(ts),
                fields.next_run_at.map(ts),
                fields.retry_count,
                fields.last_error_kind.map(|k| k.as_str()),
                fields.records_extracted.map(|v| v as i64),
                fields.output_ref,
            ],
        )?;

        tracing::debug!(task_id, from = %current, to = %new_status, "task transition");

        drop(conn);
        self.get(task_id)
    }

    /// Create a child task derived from `parent_id`'s output. Idempotent on
    /// the child's natural key: a pre-existing task is relinked to the parent
    /// and given the fresh URL instead of being duplicated.
    pub fn record_dependency(&self, parent_id: &str, spec: &TaskSpec) -> RegistryResult<Task> {
        // verify the parent exists before linking anything to it
        let _parent = self.get(parent_id)?;

        let child_id = spec.key().slug();
        let existing = {
            let conn = self.conn.lock().unwrap();
            conn.query_row(
                "SELECT id FROM tasks WHERE id = ?1",
                params![child_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?
        };

        if existing.is_some() {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE tasks SET dependency_of = ?2, url = ?3 WHERE id = ?1",
                params![child_id, parent_id, spec.url],
            )?;
            drop(conn);
            tracing::info!(child = %child_id, parent = %parent_id, "dependent task relinked");
            return self.get(&child_id);
        }

        self.insert(spec, Some(parent_id))?;
        tracing::info!(child = %child_id, parent = %parent_id, "dependent task enqueued");
        self.get(&child_id)
    }

    /// Append one execution attempt to the run history
    pub fn record_run(&self, run: &Run) -> RegistryResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO runs (id, task_id, started_at, ended_at, success,
                               properties_extracted, error_kind, output_ref)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                run.id,
                run.task_id,
                ts(run.started_at),
                ts(run.ended_at),
                run.success,
                run.properties_extracted as i64,
                run.error_kind.map(|k| k.as_str()),
                run.output_ref,
            ],
        )?;
        Ok(())
    }

    /// Run history of one task, oldest first
    pub fn runs_for(&self, task_id: &str) -> RegistryResult<Vec<Run>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, task_id, started_at, ended_at, success,
                    properties_extracted, error_kind, output_ref
             FROM runs WHERE task_id = ?1 ORDER BY started_at ASC",
        )?;
        let rows = stmt.query_map(params![task_id], row_to_run)?;

        let mut runs = Vec::new();
        for row in rows {
            runs.push(row??);
        }
        Ok(runs)
    }

    /// Per-status totals for status reporting
    pub fn counts(&self) -> RegistryResult<TaskCounts> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = TaskCounts::default();
        for row in rows {
            let (status, n) = row?;
            let n = n as usize;
            match status.parse::<TaskStatus>() {
                Ok(TaskStatus::Pending) => counts.pending = n,
                Ok(TaskStatus::Running) => counts.running = n,
                Ok(TaskStatus::Paused) => counts.paused = n,
                Ok(TaskStatus::Completed) => counts.completed = n,
                Ok(TaskStatus::Failed) => counts.failed = n,
                Err(e) => return Err(RegistryError::corruption(e)),
            }
        }
        Ok(counts)
    }

    /// Return completed tasks whose re-scrape time elapsed to `pending`.
    /// Returns how many became ready again.
    pub fn promote_due(&self, now: DateTime<Utc>) -> RegistryResult<usize> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE tasks SET status = 'pending', retry_count = 0
             WHERE status = 'completed' AND next_run_at IS NOT NULL AND next_run_at <= ?1",
            params![ts(now)],
        )?;
        if n > 0 {
            tracing::info!(count = n, "completed tasks due again, promoted to pending");
        }
        Ok(n)
    }

    /// Seed the registry from a site catalog. Existing natural keys are left
    /// untouched; returns the number of newly inserted tasks.
    pub fn import_catalog(&self, catalog: &Catalog) -> RegistryResult<usize> {
        let mut inserted = 0;
        for spec in catalog.to_specs() {
            if self.insert_if_absent(&spec)? {
                inserted += 1;
            }
        }
        tracing::info!(inserted, total = catalog.entries().len(), "catalog import finished");
        Ok(inserted)
    }

    /// Insert a task for `spec` unless its natural key already exists;
    /// returns the stored task either way.
    pub fn add_task(&self, spec: &TaskSpec) -> RegistryResult<Task> {
        self.insert_if_absent(spec)?;
        self.get(&spec.key().slug())
    }

    fn insert_if_absent(&self, spec: &TaskSpec) -> RegistryResult<bool> {
        let id = spec.key().slug();
        let exists = {
            let conn = self.conn.lock().unwrap();
            conn.query_row(
                "SELECT 1 FROM tasks WHERE id = ?1",
                params![id],
                |_| Ok(()),
            )
            .optional()?
            .is_some()
        };
        if exists {
            return Ok(false);
        }
        self.insert(spec, None)?;
        Ok(true)
    }

    fn insert(&self, spec: &TaskSpec, dependency_of: Option<&str>) -> RegistryResult<()> {
        let conn = self.conn.lock().unwrap();
        let seq: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM tasks",
            [],
            |row| row.get(0),
        )?;
        conn.execute(
            "INSERT INTO tasks (id, site, city, operation, product, url, status,
                                priority, interval_days, created_at, retry_count,
                                records_extracted, dependency_of, seq)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?8, ?9, 0, 0, ?10, ?11)",
            params![
                spec.key().slug(),
                spec.site,
                spec.city,
                spec.operation,
                spec.product,
                spec.url,
                spec.priority,
                spec.interval_days,
                ts(Utc::now()),
                dependency_of,
                seq,
            ],
        )?;
        Ok(())
    }
}

const COLUMNS: &str = "id, site, city, operation, product, url, status, priority, \
                       interval_days, created_at, last_run_at, next_run_at, retry_count, \
                       last_error, records_extracted, dependency_of, output_ref, seq";

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, RegistryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RegistryError::corruption(format!("bad timestamp '{s}': {e}")))
}

type TaskRow = Result<Task, RegistryError>;

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<TaskRow> {
    let status_raw: String = row.get(6)?;
    let created_raw: String = row.get(9)?;
    let last_raw: Option<String> = row.get(10)?;
    let next_raw: Option<String> = row.get(11)?;
    let error_raw: Option<String> = row.get(13)?;
    let build = || -> Result<Task, RegistryError> {
        Ok(Task {
            id: row.get(0)?,
            site: row.get(1)?,
            city: row.get(2)?,
            operation: row.get(3)?,
            product: row.get(4)?,
            url: row.get(5)?,
            status: status_raw
                .parse()
                .map_err(|e: String| RegistryError::corruption(e))?,
            priority: row.get(7)?,
            interval_days: row.get(8)?,
            created_at: parse_ts(&created_raw)?,
            last_run_at: last_raw.as_deref().map(parse_ts).transpose()?,
            next_run_at: next_raw.as_deref().map(parse_ts).transpose()?,
            retry_count: row.get(12)?,
            last_error_kind: error_raw
                .as_deref()
                .map(|k| k.parse().map_err(|e: String| RegistryError::corruption(e)))
                .transpose()?,
            records_extracted: row.get::<_, i64>(14)? as u64,
            dependency_of: row.get(15)?,
            output_ref: row.get(16)?,
            seq: row.get(17)?,
        })
    };
    Ok(build())
}

type RunRow = Result<Run, RegistryError>;

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<RunRow> {
    let started_raw: String = row.get(2)?;
    let ended_raw: String = row.get(3)?;
    let kind_raw: Option<String> = row.get(6)?;
    let build = || -> Result<Run, RegistryError> {
        Ok(Run {
            id: row.get(0)?,
            task_id: row.get(1)?,
            started_at: parse_ts(&started_raw)?,
            ended_at: parse_ts(&ended_raw)?,
            success: row.get(4)?,
            properties_extracted: row.get::<_, i64>(5)? as u64,
            error_kind: kind_raw
                .as_deref()
                .map(|k| k.parse().map_err(|e: String| RegistryError::corruption(e)))
                .transpose()?,
            output_ref: row.get(7)?,
        })
    };
    Ok(build())
}
