//! Task and Run domain types
//!
//! Tasks are the unit of work submitted by clients; a Run is one attempt
//! to execute a task, created at claim time. Both are plain data - all
//! behavior lives in the store and the queue engine built on top of it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Unique identifier for a task (client-supplied, globally unique)
pub type TaskId = Uuid;

/// Epoch zero - the `taken_until` value of a task with no active claim
pub fn epoch() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

/// Task lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Waiting to be claimed
    #[default]
    Pending,
    /// Claimed by a worker, claim valid until `taken_until`
    Running,
    /// Resolved successfully
    Completed,
    /// Resolved unsuccessfully (see `Reason`)
    Failed,
}

impl TaskState {
    /// Whether the state is terminal (only `rerun` leaves a terminal state)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown task state: {}", s)),
        }
    }
}

/// Why a task is in its current state
///
/// Terminal states always carry an explanatory reason; `claim-expired` is
/// transitional (set when an expired claim is reaped back to pending).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Reason {
    #[default]
    None,
    ClaimExpired,
    DeadlineExceeded,
    RetriesExhausted,
    RerunRequested,
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::ClaimExpired => write!(f, "claim-expired"),
            Self::DeadlineExceeded => write!(f, "deadline-exceeded"),
            Self::RetriesExhausted => write!(f, "retries-exhausted"),
            Self::RerunRequested => write!(f, "rerun-requested"),
        }
    }
}

impl std::str::FromStr for Reason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "claim-expired" => Ok(Self::ClaimExpired),
            "deadline-exceeded" => Ok(Self::DeadlineExceeded),
            "retries-exhausted" => Ok(Self::RetriesExhausted),
            "rerun-requested" => Ok(Self::RerunRequested),
            _ => Err(format!("Unknown reason: {}", s)),
        }
    }
}

/// A unit of work submitted for execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier (client-supplied)
    pub task_id: TaskId,

    /// Provisioner that owns the worker pool
    pub provisioner_id: String,

    /// Worker pool within the provisioner
    pub worker_type: String,

    /// Opaque routing key for message delivery
    #[serde(default)]
    pub routing: String,

    /// Scheduling priority (higher is more urgent)
    #[serde(default)]
    pub priority: i64,

    /// Remaining retry budget
    pub retries: u32,

    /// Seconds a claim stays valid before it can be reaped
    pub timeout_secs: u32,

    /// Opaque worker input, never interpreted by the queue
    #[serde(default)]
    pub payload: Value,

    /// Creation timestamp
    pub created: DateTime<Utc>,

    /// Absolute instant after which the task must be resolved
    pub deadline: DateTime<Utc>,

    /// Instant until which the current claim is valid
    /// (epoch zero whenever the task is not running)
    pub taken_until: DateTime<Utc>,

    /// Current lifecycle state
    pub state: TaskState,

    /// Why the task is in its current state
    pub reason: Reason,
}

impl Task {
    /// Default retry budget for new tasks
    pub const DEFAULT_RETRIES: u32 = 5;

    /// Default claim timeout for new tasks (20 minutes)
    pub const DEFAULT_TIMEOUT_SECS: u32 = 1200;

    /// Create a new pending task with default retry budget and claim timeout
    pub fn new(
        task_id: TaskId,
        provisioner_id: impl Into<String>,
        worker_type: impl Into<String>,
        deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            provisioner_id: provisioner_id.into(),
            worker_type: worker_type.into(),
            routing: String::new(),
            priority: 0,
            retries: Self::DEFAULT_RETRIES,
            timeout_secs: Self::DEFAULT_TIMEOUT_SECS,
            payload: Value::Null,
            created: Utc::now(),
            deadline,
            taken_until: epoch(),
            state: TaskState::Pending,
            reason: Reason::None,
        }
    }
}

/// One attempt to execute a task
///
/// Runs are immutable once created; the parent task's `taken_until` holds
/// the validity of the latest run's claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Parent task
    pub task_id: TaskId,

    /// 1-based, gapless, strictly increasing per task
    pub run_id: u32,

    /// Worker group of the claiming worker
    pub worker_group: String,

    /// Worker that claimed this run
    pub worker_id: String,

    /// Claim timestamp
    pub started: DateTime<Utc>,
}

/// A task snapshot together with all its runs, ordered by `run_id`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task: Task,
    pub runs: Vec<Run>,
}

impl TaskStatus {
    /// The currently active or most recently active run, if any
    pub fn latest_run(&self) -> Option<&Run> {
        self.runs.last()
    }
}

/// Equality filter for task listings
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub provisioner_id: Option<String>,
    pub worker_type: Option<String>,
    pub state: Option<TaskState>,
}

impl TaskFilter {
    pub fn by_pool(provisioner_id: impl Into<String>, worker_type: impl Into<String>) -> Self {
        Self {
            provisioner_id: Some(provisioner_id.into()),
            worker_type: Some(worker_type.into()),
            state: None,
        }
    }

    pub fn by_state(state: TaskState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }
}
