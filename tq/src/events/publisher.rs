//! Publisher boundary
//!
//! The queue publishes one event per committed transition; delivery is
//! at-least-once and asynchronous from the caller's perspective. A publish
//! failure never rolls back the transition that produced it - callers log
//! and move on.

use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use taskstore::{Run, TaskStatus};

use super::types::TaskEvent;

/// Failure to emit an event after a successful state transition
#[derive(Debug, Error)]
#[error("publish failed: {0}")]
pub struct PublishError(pub String);

/// Consumer of task lifecycle transitions
#[async_trait]
pub trait Publisher: Send + Sync {
    /// The task is waiting to be claimed
    async fn publish_task_pending(&self, status: &TaskStatus) -> Result<(), PublishError>;

    /// A worker claimed the task
    async fn publish_task_running(
        &self,
        status: &TaskStatus,
        run: &Run,
    ) -> Result<(), PublishError>;

    /// The worker reported success
    async fn publish_task_completed(
        &self,
        status: &TaskStatus,
        run: &Run,
    ) -> Result<(), PublishError>;

    /// The task was resolved as failed
    async fn publish_task_failed(
        &self,
        status: &TaskStatus,
        latest_run: Option<&Run>,
    ) -> Result<(), PublishError>;
}

/// Publisher that drops every event (tests and tooling)
pub struct NoopPublisher;

#[async_trait]
impl Publisher for NoopPublisher {
    async fn publish_task_pending(&self, status: &TaskStatus) -> Result<(), PublishError> {
        debug!(task_id = %status.task.task_id, "NoopPublisher: dropping task-pending");
        Ok(())
    }

    async fn publish_task_running(
        &self,
        status: &TaskStatus,
        _run: &Run,
    ) -> Result<(), PublishError> {
        debug!(task_id = %status.task.task_id, "NoopPublisher: dropping task-running");
        Ok(())
    }

    async fn publish_task_completed(
        &self,
        status: &TaskStatus,
        _run: &Run,
    ) -> Result<(), PublishError> {
        debug!(task_id = %status.task.task_id, "NoopPublisher: dropping task-completed");
        Ok(())
    }

    async fn publish_task_failed(
        &self,
        status: &TaskStatus,
        _latest_run: Option<&Run>,
    ) -> Result<(), PublishError> {
        debug!(task_id = %status.task.task_id, "NoopPublisher: dropping task-failed");
        Ok(())
    }
}

/// Publisher that records every event in memory (test assertions)
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<TaskEvent>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events recorded so far
    pub fn recorded(&self) -> Vec<TaskEvent> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }

    fn record(&self, event: TaskEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish_task_pending(&self, status: &TaskStatus) -> Result<(), PublishError> {
        self.record(TaskEvent::TaskPending {
            status: status.clone(),
        });
        Ok(())
    }

    async fn publish_task_running(
        &self,
        status: &TaskStatus,
        run: &Run,
    ) -> Result<(), PublishError> {
        self.record(TaskEvent::TaskRunning {
            status: status.clone(),
            run_id: run.run_id,
            worker_group: run.worker_group.clone(),
            worker_id: run.worker_id.clone(),
        });
        Ok(())
    }

    async fn publish_task_completed(
        &self,
        status: &TaskStatus,
        run: &Run,
    ) -> Result<(), PublishError> {
        self.record(TaskEvent::TaskCompleted {
            status: status.clone(),
            run_id: run.run_id,
        });
        Ok(())
    }

    async fn publish_task_failed(
        &self,
        status: &TaskStatus,
        latest_run: Option<&Run>,
    ) -> Result<(), PublishError> {
        self.record(TaskEvent::TaskFailed {
            status: status.clone(),
            run_id: latest_run.map(|r| r.run_id),
            worker_group: latest_run.map(|r| r.worker_group.clone()),
            worker_id: latest_run.map(|r| r.worker_id.clone()),
        });
        Ok(())
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

    #[tokio::test]
    async fn test_noop_publisher_accepts_everything() {
        let publisher = NoopPublisher;
        let status = sample_status();
        publisher.publish_task_pending(&status).await.unwrap();
        publisher.publish_task_failed(&status, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_recording_publisher_records_in_order() {
        let publisher = RecordingPublisher::new();
        let status = sample_status();

        publisher.publish_task_pending(&status).await.unwrap();
        publisher.publish_task_failed(&status, None).await.unwrap();

        let events = publisher.recorded();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type(), "task-pending");
        assert_eq!(events[1].event_type(), "task-failed");
    }
}
