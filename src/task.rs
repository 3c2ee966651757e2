//! The distributable unit of work.
//!
//! A [`Task`] is cloned once per worker. The controller keeps the original,
//! which owns the aggregate; workers only ever call
//! [`initialize_remote`](Task::initialize_remote) and
//! [`process`](Task::process) on their own copy. Every call to
//! [`merge`](Task::merge) happens on the controller, one partial result at a
//! time, in the order results arrive.

use crate::error::{CalibError, ConfigError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;

/// Contract between a unit of work and the [`WorkManager`](crate::manager::WorkManager).
pub trait Task: Clone + Send {
    /// What a worker receives. Must round-trip through serialization.
    type Item: Serialize + DeserializeOwned + Send;
    /// What a worker returns for one item.
    type Partial: Send;
    /// The aggregate exposed by [`results`](Task::results).
    type Output;

    /// Short name used in log records.
    fn name(&self) -> &str;

    /// Reject a configuration before anything is dispatched.
    ///
    /// # Errors
    /// A [`ConfigError`] aborts the run.
    fn validate(&self, _items: &[Self::Item]) -> Result<(), ConfigError> {
        Ok(())
    }

    /// Reset the aggregate. Called once on the controller before dispatch.
    fn initialize_local(&mut self);

    /// Prepare worker-side state. Called once per worker before its first item.
    /// Must not touch the aggregate.
    ///
    /// # Errors
    /// A failing worker takes no items.
    fn initialize_remote(&mut self, _worker_id: usize) -> anyhow::Result<()> {
        Ok(())
    }

    /// Produce the partial result of one item. Re-running it on the same item
    /// yields an equivalent partial result.
    ///
    /// # Errors
    /// Malformed items and unreadable sources; the item is skipped.
    fn process(&mut self, job_id: usize, item: &Self::Item) -> anyhow::Result<Self::Partial>;

    /// Fold one partial result into the aggregate.
    ///
    /// # Errors
    /// [`CalibError::Merge`] when a key cannot absorb the partial; that key is
    /// poisoned while the rest of the aggregate stays valid.
    fn merge(&mut self, partial: Self::Partial, job_id: usize) -> Result<(), CalibError>;

    /// Called once on the controller after the last merge.
    fn finalize(&mut self) {}

    /// The current aggregate. Valid mid-run and at completion.
    fn results(&self) -> &Self::Output;

    /// Label of an item for logs and failure records.
    fn describe(&self, _item: &Self::Item) -> String {
        String::new()
    }
}

/// Lifecycle of a task under the manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Uninitialized,
    LocalReady,
    RemoteReady,
    Processing,
    Merging,
    Done,
}

impl TaskState {
    /// Whether `next` is a legal successor of `self`.
    #[must_use]
    pub fn can_advance_to(self, next: TaskState) -> bool {
        use TaskState::{Done, LocalReady, Merging, Processing, RemoteReady, Uninitialized};
        matches!(
            (self, next),
            (Uninitialized, LocalReady)
                | (LocalReady, RemoteReady)
                | (RemoteReady | Merging, Processing)
                | (Processing, Merging)
                | (LocalReady | RemoteReady | Processing | Merging, Done)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Uninitialized => "uninitialized",
            TaskState::LocalReady => "local-ready",
            TaskState::RemoteReady => "remote-ready",
            TaskState::Processing => "processing",
            TaskState::Merging => "merging",
            TaskState::Done => "done",
        };
        f.write_str(s)
    }
}
