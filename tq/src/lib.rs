//! TaskQueue - the task lifecycle engine
//!
//! Clients submit tasks, workers claim and execute them, and the queue
//! guarantees each task reaches exactly one terminal outcome despite
//! worker crashes and retries. The only coordination primitive is the
//! transactional store underneath: conditional updates make claims a
//! compare-and-swap, so the at-most-one-claim guarantee holds across
//! process instances without a lock service.
//!
//! # Core Concepts
//!
//! - **Claims over locks**: a claim is a time-bounded assertion recorded
//!   in the store, detected as expired by the reaper, never enforced by
//!   in-process timers
//! - **Events after commit**: transitions publish through [`Publisher`]
//!   only after the store transaction committed; a publish failure never
//!   rolls back a transition
//! - **Bounded liveness**: the reaper guarantees a stalled worker cannot
//!   hold a task past its claim window, and no task outlives its deadline
//!
//! # Modules
//!
//! - [`claim`] - the claim/reclaim protocol
//! - [`lifecycle`] - caller-facing create/claim/complete/rerun operations
//! - [`reaper`] - background deadline and claim-timeout enforcement
//! - [`events`] - publisher boundary and event types

pub mod claim;
pub mod events;
pub mod lifecycle;
pub mod reaper;

// Re-export commonly used types
pub use claim::{ClaimProtocol, WorkClaim};
pub use events::{BroadcastPublisher, NoopPublisher, PublishError, Publisher, RecordingPublisher, TaskEvent};
pub use lifecycle::TaskLifecycle;
pub use reaper::{ReapStats, Reaper, ReaperConfig, ReaperStatus};

// Re-export taskstore types for convenience
pub use taskstore::{
    ClaimAttempt, Reason, Run, StoreError, StoreResult, Task, TaskFilter, TaskId, TaskState,
    TaskStatus, TaskStore, epoch,
};
