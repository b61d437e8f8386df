//! Reaper - deadline and claim-timeout enforcement
//!
//! Nothing else in the system proactively fails or re-queues tasks, so a
//! long-lived background loop sweeps for tasks past their deadline, out of
//! retries, or holding an expired claim, and drives them through the same
//! store primitives the caller-facing operations use. Expiry is detected by
//! comparing against wall-clock time during a sweep, not scheduled with
//! per-task timers.
//!
//! The loop re-arms after each cycle completes (sleep, not a fixed-rate
//! ticker), so a slow cycle never overlaps the next one.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use taskstore::{StoreResult, TaskStore};

use crate::events::Publisher;

/// Reaper tuning knobs
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Seconds between the end of one reap cycle and the start of the next
    pub interval_secs: u64,

    /// Consecutive failed cycles tolerated before the reaper gives up
    pub error_limit: u32,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            error_limit: 5,
        }
    }
}

impl ReaperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Where the reaper is in its own lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ReaperStatus {
    #[default]
    Stopped,
    Running,
    /// The error limit was exceeded; carries the last cycle error
    Failed(String),
}

impl std::fmt::Display for ReaperStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Running => write!(f, "running"),
            Self::Failed(e) => write!(f, "failed: {}", e),
        }
    }
}

/// Counts from one reap cycle
#[derive(Debug, Clone, Copy, Default)]
pub struct ReapStats {
    /// Tasks resolved as failed (deadline exceeded or retries exhausted)
    pub failed: usize,
    /// Tasks re-queued as pending (claim expired, retries left)
    pub requeued: usize,
}

struct ReaperTask {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Background sweeper enforcing deadline and claim-timeout invariants
pub struct Reaper {
    store: TaskStore,
    publisher: Arc<dyn Publisher>,
    config: ReaperConfig,
    inner: Mutex<Option<ReaperTask>>,
    status_tx: watch::Sender<ReaperStatus>,
}

impl Reaper {
    pub fn new(store: TaskStore, publisher: Arc<dyn Publisher>, config: ReaperConfig) -> Self {
        let (status_tx, _) = watch::channel(ReaperStatus::Stopped);
        Self {
            store,
            publisher,
            config,
            inner: Mutex::new(None),
            status_tx,
        }
    }

    /// Current lifecycle status
    pub fn status(&self) -> ReaperStatus {
        self.status_tx.borrow().clone()
    }

    /// Subscribe to status changes (for process supervisors)
    pub fn subscribe(&self) -> watch::Receiver<ReaperStatus> {
        self.status_tx.subscribe()
    }

    /// Start the sweep loop; starting an already-running reaper is a no-op
    pub async fn start(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(task) = inner.as_ref() {
            if !task.handle.is_finished() {
                info!("Reaper already running; start is a no-op");
                return;
            }
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let store = self.store.clone();
        let publisher = Arc::clone(&self.publisher);
        let config = self.config.clone();
        let status_tx = self.status_tx.clone();

        let _ = status_tx.send(ReaperStatus::Running);
        let handle = tokio::spawn(run_loop(store, publisher, config, stop_rx, status_tx));
        *inner = Some(ReaperTask { stop_tx, handle });

        info!(
            interval_secs = self.config.interval_secs,
            error_limit = self.config.error_limit,
            "Reaper started"
        );
    }

    /// Stop the sweep loop
    ///
    /// Cancels the pending timer without waiting for an in-flight cycle to
    /// finish; stopping an already-stopped reaper is a no-op.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        match inner.take() {
            Some(task) => {
                let _ = task.stop_tx.send(true);
                info!("Reaper stop requested");
            }
            None => info!("Reaper already stopped; stop is a no-op"),
        }
    }

    /// Run a single reap cycle (useful for testing and manual sweeps)
    pub async fn reap_once(&self) -> StoreResult<ReapStats> {
        reap_cycle(&self.store, self.publisher.as_ref()).await
    }
}

async fn run_loop(
    store: TaskStore,
    publisher: Arc<dyn Publisher>,
    config: ReaperConfig,
    mut stop_rx: watch::Receiver<bool>,
    status_tx: watch::Sender<ReaperStatus>,
) {
    let mut consecutive_errors: u32 = 0;

    loop {
        match reap_cycle(&store, publisher.as_ref()).await {
            Ok(stats) => {
                consecutive_errors = 0;
                if stats.failed > 0 || stats.requeued > 0 {
                    info!(
                        failed = stats.failed,
                        requeued = stats.requeued,
                        "Reap cycle resolved tasks"
                    );
                }
            }
            Err(e) => {
                consecutive_errors += 1;
                warn!(
                    error = %e,
                    consecutive_errors,
                    error_limit = config.error_limit,
                    "Reap cycle failed"
                );
                if consecutive_errors >= config.error_limit {
                    error!(error = %e, "Reaper exceeded error limit; stopping");
                    let _ = status_tx.send(ReaperStatus::Failed(e.to_string()));
                    return;
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(config.interval()) => {}
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    debug!("run_loop: stop signal received");
                    break;
                }
            }
        }
    }

    let _ = status_tx.send(ReaperStatus::Stopped);
    info!("Reaper stopped");
}

/// One sweep: fail what must fail, re-queue what can retry
///
/// Both sweeps are atomic at the store; events are published only after
/// each sweep's transaction committed, and a publish failure is logged
/// without affecting the transition or the cycle result.
async fn reap_cycle(store: &TaskStore, publisher: &dyn Publisher) -> StoreResult<ReapStats> {
    let now = Utc::now();

    let failed = store.find_expired_running(now)?;
    for status in &failed {
        debug!(
            task_id = %status.task.task_id,
            reason = %status.task.reason,
            "reap_cycle: task failed"
        );
        if let Err(e) = publisher.publish_task_failed(status, status.latest_run()).await {
            warn!(
                task_id = %status.task.task_id,
                error = %e,
                "Failed to publish task-failed event"
            );
        }
    }

    let requeued = store.find_expired_claims(now)?;
    for status in &requeued {
        debug!(task_id = %status.task.task_id, "reap_cycle: task re-queued");
        if let Err(e) = publisher.publish_task_pending(status).await {
            warn!(
                task_id = %status.task.task_id,
                error = %e,
                "Failed to publish task-pending event"
            );
        }
    }

    Ok(ReapStats {
        failed: failed.len(),
        requeued: requeued.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::WorkClaim;
    use crate::events::RecordingPublisher;
    use crate::lifecycle::TaskLifecycle;
    use chrono::Duration as ChronoDuration;
    use taskstore::{Reason, Task, TaskState};
    use tempfile::TempDir;
    use uuid::Uuid;

    fn test_setup() -> (TaskStore, Arc<RecordingPublisher>, TempDir) {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = TaskStore::open(dir.path().join("tasks.db")).expect("Failed to open store");
        let publisher = Arc::new(RecordingPublisher::new());
        (store, publisher, dir)
    }

    fn reaper_with(store: &TaskStore, publisher: &Arc<RecordingPublisher>, config: ReaperConfig) -> Reaper {
        Reaper::new(store.clone(), publisher.clone(), config)
    }

    async fn create_and_claim(store: &TaskStore, publisher: &Arc<RecordingPublisher>, timeout_secs: u32, retries: u32) -> Task {
        let lifecycle = TaskLifecycle::new(store.clone(), publisher.clone());
        let mut task = Task::new(
            Uuid::now_v7(),
            "aws",
            "builder",
            Utc::now() + ChronoDuration::hours(1),
        );
        task.timeout_secs = timeout_secs;
        task.retries = retries;
        lifecycle.create_task(task.clone()).await.unwrap();
        lifecycle
            .claim_task(task.task_id, &WorkClaim::new("group-a", "worker-a"))
            .await
            .unwrap();
        task
    }

    #[tokio::test]
    async fn test_reap_once_requeues_expired_claim() {
        let (store, publisher, _dir) = test_setup();
        let task = create_and_claim(&store, &publisher, 0, 2).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let reaper = reaper_with(&store, &publisher, ReaperConfig::default());
        let stats = reaper.reap_once().await.unwrap();

        assert_eq!(stats.requeued, 1);
        assert_eq!(stats.failed, 0);

        let status = store.get(task.task_id).unwrap();
        assert_eq!(status.task.state, TaskState::Pending);
        assert_eq!(status.task.reason, Reason::ClaimExpired);

        let events = publisher.recorded();
        assert_eq!(events.last().unwrap().event_type(), "task-pending");
    }

    #[tokio::test]
    async fn test_reap_once_fails_exhausted_retries() {
        let (store, publisher, _dir) = test_setup();
        let task = create_and_claim(&store, &publisher, 0, 1).await; // retries now 0
        tokio::time::sleep(Duration::from_millis(10)).await;

        let reaper = reaper_with(&store, &publisher, ReaperConfig::default());
        let stats = reaper.reap_once().await.unwrap();

        assert_eq!(stats.failed, 1);
        assert_eq!(stats.requeued, 0);

        let status = store.get(task.task_id).unwrap();
        assert_eq!(status.task.state, TaskState::Failed);
        assert_eq!(status.task.reason, Reason::RetriesExhausted);

        // The failure event carries the run that held the expired claim
        let events = publisher.recorded();
        let last = events.last().unwrap();
        assert_eq!(last.event_type(), "task-failed");
        let json = serde_json::to_string(last).unwrap();
        assert!(json.contains("\"run_id\":1"));
        assert!(json.contains("worker-a"));
    }

    #[tokio::test]
    async fn test_reap_once_fails_past_deadline_even_pending() {
        let (store, publisher, _dir) = test_setup();
        let mut task = Task::new(
            Uuid::now_v7(),
            "aws",
            "builder",
            Utc::now() - ChronoDuration::minutes(1),
        );
        task.retries = 5;
        store.create(&task).unwrap();

        let reaper = reaper_with(&store, &publisher, ReaperConfig::default());
        let stats = reaper.reap_once().await.unwrap();

        assert_eq!(stats.failed, 1);
        let status = store.get(task.task_id).unwrap();
        assert_eq!(status.task.state, TaskState::Failed);
        assert_eq!(status.task.reason, Reason::DeadlineExceeded);

        // No runs ever existed, so the event carries no run details
        let events = publisher.recorded();
        let json = serde_json::to_string(events.last().unwrap()).unwrap();
        assert!(json.contains("\"run_id\":null"));
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let (store, publisher, _dir) = test_setup();
        let reaper = reaper_with(
            &store,
            &publisher,
            ReaperConfig {
                interval_secs: 3600,
                error_limit: 5,
            },
        );
        assert_eq!(reaper.status(), ReaperStatus::Stopped);

        reaper.start().await;
        reaper.start().await; // no-op
        assert_eq!(reaper.status(), ReaperStatus::Running);

        let mut status_rx = reaper.subscribe();
        reaper.stop().await;
        reaper.stop().await; // no-op

        tokio::time::timeout(
            Duration::from_secs(2),
            status_rx.wait_for(|s| *s == ReaperStatus::Stopped),
        )
        .await
        .expect("Reaper did not stop in time")
        .unwrap();
    }

    #[tokio::test]
    async fn test_reaper_sweeps_on_interval() {
        let (store, publisher, _dir) = test_setup();
        let task = create_and_claim(&store, &publisher, 0, 2).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let reaper = reaper_with(
            &store,
            &publisher,
            ReaperConfig {
                interval_secs: 3600,
                error_limit: 5,
            },
        );
        reaper.start().await;

        // The first cycle runs immediately on start
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.get(task.task_id).unwrap().task.state, TaskState::Pending);

        reaper.stop().await;
    }

    #[tokio::test]
    async fn test_error_limit_is_fatal() {
        let (store, publisher, _dir) = test_setup();
        // Make every sweep fail
        store.drop_schema().unwrap();

        let reaper = reaper_with(
            &store,
            &publisher,
            ReaperConfig {
                interval_secs: 0,
                error_limit: 3,
            },
        );
        let mut status_rx = reaper.subscribe();
        reaper.start().await;

        tokio::time::timeout(
            Duration::from_secs(5),
            status_rx.wait_for(|s| matches!(s, ReaperStatus::Failed(_))),
        )
        .await
        .expect("Reaper did not fail in time")
        .unwrap();

        // A failed reaper can be started again after the store recovers
        store.ensure_schema().unwrap();
        reaper.start().await;
        assert_eq!(reaper.status(), ReaperStatus::Running);
        reaper.stop().await;
    }
}
