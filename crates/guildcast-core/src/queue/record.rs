//! Queue entry: the task plus its queue bookkeeping.

use chrono::{DateTime, Utc};
use ulid::Ulid;

use super::TaskState;
use crate::domain::{TaskFailure, TaskId, TaskRecord};

/// A worker's exclusive hold on a task until `until`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    pub token: Ulid,
    pub until: DateTime<Utc>,
}

/// Metadata + task for one entry of the active queue.
///
/// All state transitions of an entry happen here.
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub task_id: TaskId,
    pub task: TaskRecord,
    pub state: TaskState,

    /// Not claimable before this instant (backoff).
    pub available_at: DateTime<Utc>,

    pub claim: Option<Claim>,

    pub last_failure: Option<TaskFailure>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueuedTask {
    pub fn new(task_id: TaskId, task: TaskRecord, now: DateTime<Utc>) -> Self {
        Self {
            task_id,
            task,
            state: TaskState::Pending,
            available_at: now,
            claim: None,
            last_failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Pending and past its backoff.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.state == TaskState::Pending && self.available_at <= now
    }

    /// In progress under a claim that ran out without ack or fail.
    pub fn claim_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == TaskState::InProgress && self.claim.is_none_or(|claim| claim.until <= now)
    }

    /// When this entry next needs attention: claimable, or its claim runs out.
    pub fn wakes_at(&self) -> Option<DateTime<Utc>> {
        match self.state {
            TaskState::Pending => Some(self.available_at),
            TaskState::InProgress => self.claim.map(|claim| claim.until),
        }
    }

    pub fn start_claim(&mut self, claim: Claim, now: DateTime<Utc>) {
        self.state = TaskState::InProgress;
        self.claim = Some(claim);
        self.updated_at = now;
    }

    pub fn holds(&self, token: Ulid) -> bool {
        self.state == TaskState::InProgress && self.claim.is_some_and(|claim| claim.token == token)
    }

    /// Count the failure; returns the new counter value.
    pub fn record_failure(&mut self, failure: TaskFailure, now: DateTime<Utc>) -> u32 {
        self.last_failure = Some(failure);
        self.updated_at = now;
        self.task.record_failure()
    }

    /// Back to Pending, claimable again at `available_at`.
    pub fn schedule_retry(&mut self, available_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.state = TaskState::Pending;
        self.available_at = available_at;
        self.claim = None;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskKind;
    use chrono::Duration;

    fn entry(now: DateTime<Utc>) -> QueuedTask {
        QueuedTask::new(
            TaskId::from_ulid(Ulid::new()),
            TaskRecord::new(TaskKind::DispatchAlertMessage, Default::default()),
            now,
        )
    }

    #[test]
    fn claimed_entry_is_hidden_and_expires_at_its_deadline() {
        let now = Utc::now();
        let mut task = entry(now);
        assert!(task.is_claimable(now));

        let token = Ulid::new();
        task.start_claim(
            Claim {
                token,
                until: now + Duration::seconds(30),
            },
            now,
        );
        assert!(task.holds(token));
        assert!(!task.holds(Ulid::new()));
        assert!(!task.is_claimable(now + Duration::seconds(30)));
        assert!(!task.claim_expired(now + Duration::seconds(29)));
        assert!(task.claim_expired(now + Duration::seconds(30)));
    }

    #[test]
    fn retry_hides_entry_until_backoff_elapses() {
        let now = Utc::now();
        let mut task = entry(now);
        task.start_claim(
            Claim {
                token: Ulid::new(),
                until: now + Duration::seconds(30),
            },
            now,
        );

        let attempts = task.record_failure(TaskFailure::transient("boom"), now);
        task.schedule_retry(now + Duration::seconds(4), now);

        assert_eq!(attempts, 1);
        assert_eq!(task.state, TaskState::Pending);
        assert!(task.claim.is_none());
        assert!(!task.is_claimable(now + Duration::seconds(3)));
        assert!(task.is_claimable(now + Duration::seconds(4)));
        assert_eq!(task.wakes_at(), Some(now + Duration::seconds(4)));
    }
}
