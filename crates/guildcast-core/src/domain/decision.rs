//! Decision model: what the queue does with a failed attempt.
//!
//! The Decider is a pure function over the task record (already carrying the
//! incremented failure counter) and the failure. Applying the decision
//! (rescheduling or moving to the dead-letter store) is the queue's job.

use std::time::Duration;

use super::errors::{ErrorKind, TaskFailure};
use super::events::DomainEvent;
use super::ids::TaskId;
use super::task::{TaskKind, TaskRecord};
use crate::queue::RetryPolicy;

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Put the task back to Pending, visible again after `delay`.
    Retry { delay: Duration, reason: String },

    /// Remove from the active queue and keep it for inspection.
    DeadLetter { reason: String },
}

impl Decision {
    pub fn is_dead_letter(&self) -> bool {
        matches!(self, Decision::DeadLetter { .. })
    }

    /// The event a queue emits once it has applied this decision.
    pub fn to_event(
        &self,
        task_id: TaskId,
        kind: TaskKind,
        failed_attempts: u32,
        error_kind: ErrorKind,
    ) -> DomainEvent {
        match self {
            Decision::Retry { delay, reason } => DomainEvent::RetryScheduled {
                task_id,
                kind,
                failed_attempts,
                delay: *delay,
                reason: reason.clone(),
            },
            Decision::DeadLetter { reason } => DomainEvent::TaskDeadLettered {
                task_id,
                kind,
                failed_attempts,
                error_kind,
                reason: reason.clone(),
            },
        }
    }
}

pub trait Decider: Send + Sync {
    fn decide(&self, task: &TaskRecord, failure: &TaskFailure) -> Decision;
}

/// Attempt-budget decider:
/// - permanent failures are dead-lettered immediately
/// - otherwise retry while `failed_attempts < max_attempts`
/// - delay comes from the RetryPolicy
#[derive(Debug, Clone)]
pub struct DefaultDecider {
    retry_policy: RetryPolicy,
    max_attempts: u32,
}

impl DefaultDecider {
    pub fn new(retry_policy: RetryPolicy, max_attempts: u32) -> Self {
        Self {
            retry_policy,
            max_attempts,
        }
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, task: &TaskRecord, failure: &TaskFailure) -> Decision {
        if !failure.kind.is_retryable() {
            return Decision::DeadLetter {
                reason: format!("permanent failure: {}", failure.message),
            };
        }

        let attempts = task.failed_attempts();
        if attempts >= self.max_attempts {
            Decision::DeadLetter {
                reason: format!(
                    "max attempts reached ({attempts}/{}): {}",
                    self.max_attempts, failure.message
                ),
            }
        } else {
            let delay = self.retry_policy.next_delay(attempts);
            Decision::Retry {
                delay,
                reason: format!(
                    "retry {}/{} after {:?}: {}",
                    attempts + 1,
                    self.max_attempts,
                    delay,
                    failure.message
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed_n_times(n: u32) -> TaskRecord {
        let mut task = TaskRecord::new(TaskKind::DispatchAlertMessage, Default::default());
        for _ in 0..n {
            task.record_failure();
        }
        task
    }

    #[test]
    fn retries_until_budget_is_spent() {
        let decider = DefaultDecider::new(RetryPolicy::immediate(), 3);
        let failure = TaskFailure::transient("boom");

        assert!(!decider.decide(&failed_n_times(1), &failure).is_dead_letter());
        assert!(!decider.decide(&failed_n_times(2), &failure).is_dead_letter());
        assert!(decider.decide(&failed_n_times(3), &failure).is_dead_letter());
    }

    #[test]
    fn permanent_failure_is_dead_lettered_on_first_attempt() {
        let decider = DefaultDecider::new(RetryPolicy::default(), 5);
        let decision = decider.decide(&failed_n_times(1), &TaskFailure::permanent("no handler"));

        assert!(matches!(decision, Decision::DeadLetter { reason } if reason.contains("no handler")));
    }

    #[test]
    fn expired_claims_spend_the_budget_like_failures() {
        let decider = DefaultDecider::new(RetryPolicy::immediate(), 2);
        let failure = TaskFailure::claim_expired(Duration::from_secs(30));
        assert!(failure.kind.is_retryable());
        assert!(!decider.decide(&failed_n_times(1), &failure).is_dead_letter());

        let decision = decider.decide(&failed_n_times(2), &failure);
        let event = decision.to_event(
            TaskId::from_ulid(ulid::Ulid::new()),
            TaskKind::AddReaction,
            2,
            failure.kind,
        );
        assert!(matches!(
            event,
            DomainEvent::TaskDeadLettered { failed_attempts: 2, error_kind: ErrorKind::Infrastructure, .. }
        ));
    }

    #[test]
    fn retry_delay_follows_policy() {
        let policy = RetryPolicy::default();
        let decider = DefaultDecider::new(policy.clone(), 5);

        let decision = decider.decide(&failed_n_times(2), &TaskFailure::transient("x"));
        match decision {
            Decision::Retry { delay, .. } => assert_eq!(delay, policy.next_delay(2)),
            other => panic!("expected retry, got {other:?}"),
        }
    }
}
