// Core data structures for the predio orchestration core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a scrape task.
///
/// Transitions: `pending → running → {completed, failed}`;
/// `running → paused` on shutdown; `running → pending` when an attempt is
/// retried or reconciled after a crash; `paused → pending` on resume;
/// `completed → pending` once `next_run_at` elapses. No transition enters
/// `completed` or `failed` without passing through `running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl TaskStatus {
    /// String representation stored in the registry
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Check whether the state machine allows moving to `next`
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (*self, next),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Paused)
                | (Running, Pending)
                | (Paused, Pending)
                | (Completed, Pending)
        )
    }

    /// True for states that hold a worker slot
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Running)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "paused" => Ok(TaskStatus::Paused),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Natural key of a task: one (site, city, operation, product) combination
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskKey {
    pub site: String,
    pub city: String,
    pub operation: String,
    pub product: String,
}

impl TaskKey {
    pub fn new(
        site: impl Into<String>,
        city: impl Into<String>,
        operation: impl Into<String>,
        product: impl Into<String>,
    ) -> Self {
        Self {
            site: site.into(),
            city: city.into(),
            operation: operation.into(),
            product: product.into(),
        }
    }

    /// Stable task id derived from the natural key.
    ///
    /// Lowercased, whitespace collapsed to `_`, accents folded so ids stay
    /// filesystem- and log-friendly regardless of catalog spelling.
    pub fn slug(&self) -> String {
        let mut id = format!(
            "{}_{}_{}_{}",
            self.site, self.city, self.operation, self.product
        )
        .to_lowercase();

        id = id
            .chars()
            .map(|c| match c {
                ' ' | '/' | '-' => '_',
                'á' => 'a',
                'é' => 'e',
                'í' => 'i',
                'ó' => 'o',
                'ú' => 'u',
                'ñ' => 'n',
                other => other,
            })
            .collect();
        id
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.site, self.city, self.operation, self.product
        )
    }
}

/// One unit of scrape work tracked by the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Stable id for the task's lifetime (natural-key slug)
    pub id: String,

    pub site: String,
    pub city: String,
    pub operation: String,
    pub product: String,

    /// Entry URL handed to the scrape executor
    pub url: String,

    pub status: TaskStatus,

    /// Lower value runs first
    pub priority: u32,

    /// Days until a completed task becomes due again
    pub interval_days: u32,

    pub created_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,

    /// Consecutive failed attempts since the last success
    pub retry_count: u32,

    /// Failure classification of the most recent failed attempt, or
    /// `exhausted_retries` once the retry budget is spent
    pub last_error_kind: Option<ErrorKind>,

    /// Records extracted by the most recent successful run
    pub records_extracted: u64,

    /// Parent task id when this task was derived from another's output
    pub dependency_of: Option<String>,

    /// Output artifact of the last successful run (e.g. a collected URL list)
    pub output_ref: Option<String>,

    /// Insertion sequence, used as the final ordering tie-break
    pub seq: i64,
}

impl Task {
    /// Natural key of this task
    pub fn key(&self) -> TaskKey {
        TaskKey::new(&self.site, &self.city, &self.operation, &self.product)
    }

    /// A pending task is due when it has never run or its re-scrape time passed
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending
            && match self.next_run_at {
                None => true,
                Some(next) => next <= now,
            }
    }
}

/// Specification for a task to be created, either from the catalog or as a
/// dependent follow-on of a completed parent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub site: String,
    pub city: String,
    pub operation: String,
    pub product: String,
    pub url: String,
    pub priority: u32,
    pub interval_days: u32,
}

impl TaskSpec {
    pub fn key(&self) -> TaskKey {
        TaskKey::new(&self.site, &self.city, &self.operation, &self.product)
    }
}

/// Failure classification for an execution attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection, DNS or transport failure inside the executor
    Network,
    /// The target site blocked or rate-limited the scraper
    Blocked,
    /// Page structure did not match the extractor
    Parsing,
    /// The executor exceeded its time budget
    Timeout,
    /// Retry budget exhausted; terminal
    ExhaustedRetries,
    /// Anything the executor could not classify
    Other,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Blocked => "blocked",
            ErrorKind::Parsing => "parsing",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ExhaustedRetries => "exhausted_retries",
            ErrorKind::Other => "other",
        }
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "network" => Ok(ErrorKind::Network),
            "blocked" => Ok(ErrorKind::Blocked),
            "parsing" => Ok(ErrorKind::Parsing),
            "timeout" => Ok(ErrorKind::Timeout),
            "exhausted_retries" => Ok(ErrorKind::ExhaustedRetries),
            "other" => Ok(ErrorKind::Other),
            other => Err(format!("unknown error kind: {other}")),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution attempt of a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Unique run id
    pub id: String,

    pub task_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub success: bool,
    pub properties_extracted: u64,
    pub error_kind: Option<ErrorKind>,
    pub output_ref: Option<String>,
}

impl Run {
    /// Wall-clock duration of the attempt in seconds
    pub fn duration_secs(&self) -> i64 {
        (self.ended_at - self.started_at).num_seconds().max(0)
    }
}

/// Registry totals per status, for status reporting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub running: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
}

impl TaskCounts {
    pub fn total(&self) -> usize {
        self.pending + self.running + self.paused + self.completed + self.failed
    }

    /// True when nothing is in flight and nothing can become ready
    pub fn idle(&self) -> bool {
        self.running == 0 && self.paused == 0
    }
}

impl fmt::Display for TaskCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pending={} running={} paused={} completed={} failed={}",
            self.pending, self.running, self.paused, self.completed, self.failed
        )
    }
}
