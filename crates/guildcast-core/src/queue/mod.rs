//! Queue module: state management, retry logic, and in-memory implementation.

mod memory;
mod record;
mod retry;
mod state;

pub use memory::InMemoryTaskQueue;
pub use record::{Claim, QueuedTask};
pub use retry::RetryPolicy;
pub use state::TaskState;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{
    Decision, DefaultDecider, GuildcastError, TaskFailure, TaskId, TaskKind, TaskParameters,
    TaskRecord,
};

/// A claimed task. The worker owns this lease and must either `ack` or `fail`.
///
/// - Queue manages state transitions (Pending -> InProgress -> ...).
/// - Worker/Runtime executes side effects and reports the result.
/// - If the lease is neither acked nor failed before the visibility timeout,
///   the task becomes claimable again and this lease is lost.
#[async_trait]
pub trait TaskLease: Send {
    fn task_id(&self) -> TaskId;

    fn task(&self) -> &TaskRecord;

    /// Mark success: the task leaves the queue.
    ///
    /// Fails with `GuildcastError::LeaseLost` if another worker took over.
    async fn ack(self: Box<Self>) -> Result<(), GuildcastError>;

    /// Mark failure; the queue counts the attempt and decides retry/dead-letter.
    async fn fail(self: Box<Self>, failure: TaskFailure) -> Result<Decision, GuildcastError>;
}

/// Queue port (interface).
///
/// Claims must be exclusive across every worker sharing the same store.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Producer API.
    async fn enqueue(
        &self,
        kind: TaskKind,
        parameters: TaskParameters,
    ) -> Result<TaskId, GuildcastError>;

    /// Claim one claimable task, waiting up to `wait` for one to show up.
    async fn claim(&self, wait: Duration) -> Result<Option<Box<dyn TaskLease>>, GuildcastError>;

    async fn counts(&self) -> Result<QueueCounts, GuildcastError>;

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, GuildcastError>;

    /// Re-enqueue a dead-lettered task as a new task with a fresh attempt budget.
    async fn replay_dead_letter(&self, task_id: TaskId) -> Result<TaskId, GuildcastError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub dead_lettered: usize,
}

impl QueueCounts {
    /// Nothing left to run (dead letters do not count).
    pub fn is_idle(&self) -> bool {
        self.pending == 0 && self.in_progress == 0
    }
}

/// A task that left the active queue without succeeding.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub task_id: TaskId,
    pub task: TaskRecord,
    pub reason: String,
    pub failure: TaskFailure,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Knobs shared by every queue implementation.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub max_attempts: u32,
    pub visibility_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            visibility_timeout: Duration::from_secs(60),
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl QueueSettings {
    pub fn decider(&self) -> DefaultDecider {
        DefaultDecider::new(self.retry_policy.clone(), self.max_attempts)
    }
}
