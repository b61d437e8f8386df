//! Broadcast-backed publisher
//!
//! In-process pub/sub over a tokio broadcast channel. Components that want
//! the lifecycle stream (loggers, metrics, a bridge to an external bus)
//! subscribe; sends with no subscribers are dropped, and when the channel
//! is full the oldest events are dropped.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use taskstore::{Run, TaskStatus};

use super::publisher::{PublishError, Publisher};
use super::types::TaskEvent;

/// Default channel capacity (events)
///
/// A reap cycle can resolve one event per expired task, so the buffer is
/// sized for large sweep bursts.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 4096;

/// Publisher delivering events to in-process subscribers
pub struct BroadcastPublisher {
    tx: broadcast::Sender<TaskEvent>,
}

impl BroadcastPublisher {
    /// Create a new publisher with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        debug!(capacity, "BroadcastPublisher::new: creating channel");
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Subscribe to events emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }

    /// Number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    fn emit(&self, event: TaskEvent) {
        debug!(
            event_type = event.event_type(),
            task_id = %event.task_id(),
            "BroadcastPublisher::emit"
        );
        // No subscribers is OK
        let _ = self.tx.send(event);
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

#[async_trait]
impl Publisher for BroadcastPublisher {
    async fn publish_task_pending(&self, status: &TaskStatus) -> Result<(), PublishError> {
        self.emit(TaskEvent::TaskPending {
            status: status.clone(),
        });
        Ok(())
    }

    async fn publish_task_running(
        &self,
        status: &TaskStatus,
        run: &Run,
    ) -> Result<(), PublishError> {
        self.emit(TaskEvent::TaskRunning {
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
        self.emit(TaskEvent::TaskCompleted {
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
        self.emit(TaskEvent::TaskFailed {
            status: status.clone(),
            run_id: latest_run.map(|r| r.run_id),
            worker_group: latest_run.map(|r| r.worker_group.clone()),
            worker_id: latest_run.map(|r| r.worker_id.clone()),
        });
        Ok(())
    }
}
