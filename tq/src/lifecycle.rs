//! Task lifecycle operations
//!
//! The caller-facing surface: create, claim, reclaim, complete, rerun, and
//! the read operations. Each mutation drives one transition of the state
//! machine through a store primitive, then publishes the matching event.
//! Events are published only after the store transaction committed, and a
//! publish failure never undoes the transition - the store is the source
//! of truth.
//!
//! State machine:
//!
//! | From              | To        | Trigger                    |
//! |-------------------|-----------|----------------------------|
//! | pending           | running   | first claim                |
//! | running           | running   | reclaim (same run)         |
//! | running           | pending   | reaper: claim expired      |
//! | running           | completed | worker reports success     |
//! | pending/running   | failed    | reaper: deadline exceeded  |
//! | running           | failed    | reaper: retries exhausted  |
//! | completed/failed  | pending   | rerun                      |

use std::sync::Arc;

use tracing::{debug, warn};

use taskstore::{ClaimAttempt, StoreResult, Task, TaskFilter, TaskId, TaskStore, TaskStatus};

use crate::claim::{ClaimProtocol, WorkClaim};
use crate::events::Publisher;

/// The task lifecycle engine
///
/// Cheap to clone; all shared state lives in the store and the publisher.
#[derive(Clone)]
pub struct TaskLifecycle {
    store: TaskStore,
    claims: ClaimProtocol,
    publisher: Arc<dyn Publisher>,
}

impl TaskLifecycle {
    pub fn new(store: TaskStore, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            claims: ClaimProtocol::new(store.clone()),
            store,
            publisher,
        }
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Submit a new task; it enters the queue pending with no runs
    pub async fn create_task(&self, task: Task) -> StoreResult<TaskStatus> {
        debug!(task_id = %task.task_id, "TaskLifecycle::create_task: called");
        self.store.create(&task)?;
        let status = self.store.get(task.task_id)?;
        self.publish_pending(&status).await;
        Ok(status)
    }

    /// Claim a pending task on behalf of a worker
    ///
    /// Exactly one of N concurrent claimers wins; losers get
    /// [`ClaimAttempt::NotClaimed`] with the state they lost to.
    pub async fn claim_task(
        &self,
        task_id: TaskId,
        claim: &WorkClaim,
    ) -> StoreResult<ClaimAttempt> {
        let attempt = self.claims.claim(task_id, claim, None)?;
        if let ClaimAttempt::Claimed(status) = &attempt {
            match status.latest_run() {
                Some(run) => {
                    if let Err(e) = self.publisher.publish_task_running(status, run).await {
                        warn!(%task_id, error = %e, "Failed to publish task-running event");
                    }
                }
                None => warn!(%task_id, "Claimed task has no runs; skipping task-running event"),
            }
        }
        Ok(attempt)
    }

    /// Extend the claim window of an existing run
    ///
    /// No state transition occurs, so no event is published.
    pub async fn reclaim_task(&self, task_id: TaskId, run_id: u32) -> StoreResult<ClaimAttempt> {
        self.claims.reclaim(task_id, run_id)
    }

    /// Record that the worker finished the current run successfully
    ///
    /// Returns whether the transition happened; a repeat call (or a call
    /// against a task that is not running) is a no-op returning `false`.
    pub async fn complete_task(&self, task_id: TaskId) -> StoreResult<bool> {
        debug!(%task_id, "TaskLifecycle::complete_task: called");
        let (changed, status) = self.store.complete_run(task_id)?;
        if changed {
            match status.latest_run() {
                Some(run) => {
                    if let Err(e) = self.publisher.publish_task_completed(&status, run).await {
                        warn!(%task_id, error = %e, "Failed to publish task-completed event");
                    }
                }
                None => warn!(%task_id, "Completed task has no runs; skipping task-completed event"),
            }
        }
        Ok(changed)
    }

    /// Re-enter the queue from a terminal state with a fresh retry budget
    pub async fn rerun_task(&self, task_id: TaskId, new_retries: u32) -> StoreResult<TaskStatus> {
        debug!(%task_id, new_retries, "TaskLifecycle::rerun_task: called");
        let status = self.store.rerun(task_id, new_retries)?;
        self.publish_pending(&status).await;
        Ok(status)
    }

    /// Fetch a task and all its runs
    pub fn get_task(&self, task_id: TaskId) -> StoreResult<TaskStatus> {
        self.store.get(task_id)
    }

    /// List tasks matching an equality filter
    pub fn list_tasks(&self, filter: &TaskFilter) -> StoreResult<Vec<TaskStatus>> {
        self.store.query(filter)
    }

    async fn publish_pending(&self, status: &TaskStatus) {
        if let Err(e) = self.publisher.publish_task_pending(status).await {
            warn!(task_id = %status.task.task_id, error = %e, "Failed to publish task-pending event");
        }
    }
}
