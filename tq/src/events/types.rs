//! Event types for task lifecycle transitions
//!
//! These are the messages the queue publishes after a successful state
//! transition: pending (create, requeue, rerun), running (first claim),
//! completed, and failed. Each carries the task status snapshot taken
//! after the transition committed.

use serde::{Deserialize, Serialize};
use taskstore::{TaskId, TaskState, TaskStatus};

/// Core event enum - the vocabulary of task lifecycle activity
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TaskEvent {
    /// The task is waiting to be claimed (created, requeued, or rerun)
    TaskPending { status: TaskStatus },

    /// A worker claimed the task and a new run was created
    TaskRunning {
        status: TaskStatus,
        run_id: u32,
        worker_group: String,
        worker_id: String,
    },

    /// The worker reported success
    TaskCompleted { status: TaskStatus, run_id: u32 },

    /// The task was resolved as failed; run details are present when at
    /// least one run existed at resolution time
    TaskFailed {
        status: TaskStatus,
        run_id: Option<u32>,
        worker_group: Option<String>,
        worker_id: Option<String>,
    },
}

impl TaskEvent {
    /// The wire name of this event
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TaskPending { .. } => "task-pending",
            Self::TaskRunning { .. } => "task-running",
            Self::TaskCompleted { .. } => "task-completed",
            Self::TaskFailed { .. } => "task-failed",
        }
    }

    /// The task this event is about
    pub fn task_id(&self) -> TaskId {
        self.status().task.task_id
    }

    /// The task state after the transition
    pub fn state(&self) -> TaskState {
        self.status().task.state
    }

    /// The status snapshot carried by the event
    pub fn status(&self) -> &TaskStatus {
        match self {
            Self::TaskPending { status }
            | Self::TaskRunning { status, .. }
            | Self::TaskCompleted { status, .. }
            | Self::TaskFailed { status, .. } => status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use taskstore::Task;
    use uuid::Uuid;

    fn sample_status() -> TaskStatus {
        TaskStatus {
            task: Task::new(Uuid::now_v7(), "aws", "builder", Utc::now()),
            runs: Vec::new(),
        }
    }

    #[test]
    fn test_event_type_names() {
        let status = sample_status();
        let event = TaskEvent::TaskPending {
            status: status.clone(),
        };
        assert_eq!(event.event_type(), "task-pending");
        assert_eq!(event.task_id(), status.task.task_id);
        assert_eq!(event.state(), TaskState::Pending);
    }

    #[test]
    fn test_event_serde_tagging() {
        let event = TaskEvent::TaskFailed {
            status: sample_status(),
            run_id: Some(2),
            worker_group: Some("group-a".into()),
            worker_id: Some("worker-a".into()),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"task-failed\""));

        let back: TaskEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_type(), "task-failed");
    }
}
