//! Event publication for task lifecycle transitions
//!
//! The queue emits one event per committed transition through the
//! [`Publisher`] trait. [`BroadcastPublisher`] delivers to in-process
//! subscribers; an external message-bus publisher implements the same
//! trait out of tree.

mod broadcast;
mod publisher;
mod types;

pub use broadcast::{BroadcastPublisher, DEFAULT_CHANNEL_CAPACITY};
pub use publisher::{NoopPublisher, PublishError, Publisher, RecordingPublisher};
pub use types::TaskEvent;
