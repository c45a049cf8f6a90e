//! Events - ドメインイベント
//!
//! キューと fan-out handler が発生させるイベント。EventSink に送られます。

use std::time::Duration;

use super::errors::ErrorKind;
use super::ids::{DispatchId, GuildId, TaskId};
use super::task::TaskKind;

#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    TaskEnqueued {
        task_id: TaskId,
        kind: TaskKind,
    },
    TaskClaimed {
        task_id: TaskId,
        kind: TaskKind,
        failed_attempts: u32,
    },
    TaskSucceeded {
        task_id: TaskId,
        kind: TaskKind,
    },
    RetryScheduled {
        task_id: TaskId,
        kind: TaskKind,
        failed_attempts: u32,
        delay: Duration,
        reason: String,
    },
    /// Operator attention required.
    TaskDeadLettered {
        task_id: TaskId,
        kind: TaskKind,
        failed_attempts: u32,
        error_kind: ErrorKind,
        reason: String,
    },
    RecipientConsumed {
        dispatch_id: DispatchId,
        guild_id: GuildId,
    },
    RecipientDeliveryFailed {
        dispatch_id: DispatchId,
        guild_id: GuildId,
        reason: String,
    },
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::TaskEnqueued { .. } => "task_enqueued",
            DomainEvent::TaskClaimed { .. } => "task_claimed",
            DomainEvent::TaskSucceeded { .. } => "task_succeeded",
            DomainEvent::RetryScheduled { .. } => "retry_scheduled",
            DomainEvent::TaskDeadLettered { .. } => "task_dead_lettered",
            DomainEvent::RecipientConsumed { .. } => "recipient_consumed",
            DomainEvent::RecipientDeliveryFailed { .. } => "recipient_delivery_failed",
        }
    }
}
