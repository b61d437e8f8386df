//! Claim protocol
//!
//! A claim is a time-bounded assertion by a worker that it owns the current
//! run of a task. First claims transition `pending -> running` through the
//! store's compare-and-swap and create a new run; reclaims extend the
//! window of an existing run without touching retries. All mutual
//! exclusion lives in the store - there is no in-process lock, so the
//! guarantee holds across process instances.

use chrono::Utc;
use tracing::debug;

use taskstore::{ClaimAttempt, StoreResult, TaskId, TaskStore};

/// Identity of the worker asserting a claim
#[derive(Debug, Clone)]
pub struct WorkClaim {
    pub worker_group: String,
    pub worker_id: String,
}

impl WorkClaim {
    pub fn new(worker_group: impl Into<String>, worker_id: impl Into<String>) -> Self {
        Self {
            worker_group: worker_group.into(),
            worker_id: worker_id.into(),
        }
    }
}

/// The claim/reclaim algorithm over store primitives
#[derive(Debug, Clone)]
pub struct ClaimProtocol {
    store: TaskStore,
}

impl ClaimProtocol {
    pub fn new(store: TaskStore) -> Self {
        Self { store }
    }

    /// Assert a claim on a task
    ///
    /// With `run_id` unset this is a first claim: exactly one of N
    /// concurrent callers wins the compare-and-swap and gets a fresh run.
    /// With `run_id` set it is a reclaim of that run. Losing either race
    /// is a [`ClaimAttempt::NotClaimed`] carrying the observed state, not
    /// an error; a missing task is [`taskstore::StoreError::NotFound`].
    pub fn claim(
        &self,
        task_id: TaskId,
        claim: &WorkClaim,
        run_id: Option<u32>,
    ) -> StoreResult<ClaimAttempt> {
        debug!(
            %task_id,
            worker_group = %claim.worker_group,
            worker_id = %claim.worker_id,
            ?run_id,
            "ClaimProtocol::claim: called"
        );
        match run_id {
            None => self.store.create_claim(
                task_id,
                Utc::now(),
                &claim.worker_group,
                &claim.worker_id,
            ),
            Some(run_id) => self.reclaim(task_id, run_id),
        }
    }

    /// Extend the validity window of an existing run
    pub fn reclaim(&self, task_id: TaskId, run_id: u32) -> StoreResult<ClaimAttempt> {
        debug!(%task_id, run_id, "ClaimProtocol::reclaim: called");
        self.store.refresh_claim(task_id, run_id, Utc::now())
    }
}
