//! EventSink port - イベント記録の抽象化
//!
//! - TracingEventSink: tracing にログとして出す（デフォルト）
//! - RecordingEventSink (impls): テストで発生イベントを検査する

use tracing::{debug, error, info, warn};

use crate::domain::DomainEvent;

/// Called outside of any queue/ledger lock; implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: DomainEvent);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: DomainEvent) {
        match &event {
            DomainEvent::TaskEnqueued { task_id, kind } => {
                debug!(event = event.name(), %task_id, %kind, "task enqueued");
            }
            DomainEvent::TaskClaimed {
                task_id,
                kind,
                failed_attempts,
            } => {
                debug!(event = event.name(), %task_id, %kind, failed_attempts, "task claimed");
            }
            DomainEvent::TaskSucceeded { task_id, kind } => {
                info!(event = event.name(), %task_id, %kind, "task succeeded");
            }
            DomainEvent::RetryScheduled {
                task_id,
                kind,
                failed_attempts,
                delay,
                reason,
            } => {
                warn!(
                    event = event.name(),
                    %task_id,
                    %kind,
                    failed_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    %reason,
                    "task failed, retry scheduled"
                );
            }
            DomainEvent::TaskDeadLettered {
                task_id,
                kind,
                failed_attempts,
                error_kind,
                reason,
            } => {
                error!(
                    event = event.name(),
                    %task_id,
                    %kind,
                    failed_attempts,
                    error_kind = error_kind.as_str(),
                    %reason,
                    "task dead-lettered, operator action required"
                );
            }
            DomainEvent::RecipientConsumed {
                dispatch_id,
                guild_id,
            } => {
                debug!(event = event.name(), %dispatch_id, %guild_id, "recipient consumed");
            }
            DomainEvent::RecipientDeliveryFailed {
                dispatch_id,
                guild_id,
                reason,
            } => {
                warn!(event = event.name(), %dispatch_id, %guild_id, %reason, "delivery failed, recipient stays pending");
            }
        }
    }
}
