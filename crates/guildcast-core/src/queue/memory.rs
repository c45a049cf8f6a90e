//! In-memory queue implementation.
//!
//! The whole queue sits behind one async mutex, so every claim/ack/fail is a
//! single atomic step. Durable, multi-process deployments use the SQLite queue
//! instead; the semantics are the same.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};
use ulid::Ulid;

use super::{Claim, DeadLetter, QueueCounts, QueueSettings, QueuedTask, TaskLease, TaskQueue, TaskState};
use crate::domain::{
    Decider, Decision, DomainEvent, GuildcastError, TaskFailure, TaskId, TaskKind, TaskParameters,
    TaskRecord,
};
use crate::ports::clock::{self, add_std};
use crate::ports::{Clock, EventSink, IdGenerator, SystemClock, TracingEventSink, UlidGenerator};

struct InMemoryQueueState {
    /// Active queue (Pending + InProgress). Single source of truth for tasks.
    records: HashMap<TaskId, QueuedTask>,

    /// Removed from the active queue, kept for inspection and replay.
    dead_letters: BTreeMap<TaskId, DeadLetter>,
}

impl InMemoryQueueState {
    fn new() -> Self {
        Self {
            records: HashMap::new(),
            dead_letters: BTreeMap::new(),
        }
    }

    /// Earliest-available claimable entry.
    fn next_claimable(&self, now: DateTime<Utc>) -> Option<TaskId> {
        self.records
            .values()
            .filter(|entry| entry.is_claimable(now))
            .min_by_key(|entry| (entry.wakes_at(), entry.task_id))
            .map(|entry| entry.task_id)
    }

    fn expired_claims(&self, now: DateTime<Utc>) -> Vec<TaskId> {
        self.records
            .values()
            .filter(|entry| entry.claim_expired(now))
            .map(|entry| entry.task_id)
            .collect()
    }

    /// Count a failed attempt on an in-progress entry and apply the decision.
    /// Returns the event to emit once the lock is released.
    fn settle_failure(
        &mut self,
        task_id: TaskId,
        failure: &TaskFailure,
        decider: &dyn Decider,
        now: DateTime<Utc>,
    ) -> Option<(Decision, DomainEvent)> {
        let entry = self.records.get_mut(&task_id)?;
        let failed_attempts = entry.record_failure(failure.clone(), now);
        let decision = decider.decide(&entry.task, failure);
        let event = decision.to_event(task_id, entry.task.kind(), failed_attempts, failure.kind);

        match &decision {
            Decision::Retry { delay, .. } => {
                entry.schedule_retry(add_std(now, *delay), now);
            }
            Decision::DeadLetter { reason } => {
                if let Some(entry) = self.records.remove(&task_id) {
                    self.dead_letters.insert(
                        task_id,
                        DeadLetter {
                            task_id,
                            task: entry.task,
                            reason: reason.clone(),
                            failure: failure.clone(),
                            dead_lettered_at: now,
                        },
                    );
                }
            }
        }
        Some((decision, event))
    }

    fn next_wake(&self) -> Option<DateTime<Utc>> {
        self.records.values().filter_map(QueuedTask::wakes_at).min()
    }

    fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts {
            dead_lettered: self.dead_letters.len(),
            ..QueueCounts::default()
        };
        for entry in self.records.values() {
            match entry.state {
                TaskState::Pending => counts.pending += 1,
                TaskState::InProgress => counts.in_progress += 1,
            }
        }
        counts
    }
}

struct Shared {
    state: Mutex<InMemoryQueueState>,
    notify: Notify,
    decider: Arc<dyn Decider>,
    visibility_timeout: Duration,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    events: Arc<dyn EventSink>,
}

pub struct InMemoryTaskQueue {
    shared: Arc<Shared>,
}

impl InMemoryTaskQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self::with_parts(settings, Arc::new(SystemClock), Arc::new(TracingEventSink))
    }

    pub fn with_parts(
        settings: QueueSettings,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let ids = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(InMemoryQueueState::new()),
                notify: Notify::new(),
                decider: Arc::new(settings.decider()),
                visibility_timeout: settings.visibility_timeout,
                clock,
                ids,
                events,
            }),
        }
    }

    fn claim_locked(
        &self,
        state: &mut InMemoryQueueState,
        now: DateTime<Utc>,
    ) -> Option<InMemoryLease> {
        let task_id = state.next_claimable(now)?;
        let entry = state.records.get_mut(&task_id)?;

        let token = Ulid::new();
        entry.start_claim(
            Claim {
                token,
                until: add_std(now, self.shared.visibility_timeout),
            },
            now,
        );

        Some(InMemoryLease {
            task_id,
            token,
            task: entry.task.clone(),
            shared: Arc::clone(&self.shared),
        })
    }

    /// Claims past their visibility timeout count as failed attempts, so a task
    /// that keeps hanging or crashing its worker still reaches the dead letters.
    fn reap_expired_locked(
        &self,
        state: &mut InMemoryQueueState,
        now: DateTime<Utc>,
    ) -> Vec<DomainEvent> {
        let failure = TaskFailure::claim_expired(self.shared.visibility_timeout);
        state
            .expired_claims(now)
            .into_iter()
            .filter_map(|task_id| {
                warn!(%task_id, "claim expired, counting it as a failed attempt");
                state
                    .settle_failure(task_id, &failure, &*self.shared.decider, now)
                    .map(|(_, event)| event)
            })
            .collect()
    }

    fn insert_locked(
        &self,
        state: &mut InMemoryQueueState,
        task: TaskRecord,
        now: DateTime<Utc>,
    ) -> TaskId {
        let task_id = self.shared.ids.generate_task_id();
        state
            .records
            .insert(task_id, QueuedTask::new(task_id, task, now));
        task_id
    }

    /// Get a copy of an active entry (for testing)
    #[cfg(test)]
    async fn entry(&self, task_id: TaskId) -> Option<QueuedTask> {
        let state = self.shared.state.lock().await;
        state.records.get(&task_id).cloned()
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(
        &self,
        kind: TaskKind,
        parameters: TaskParameters,
    ) -> Result<TaskId, GuildcastError> {
        let now = self.shared.clock.now();
        let task_id = {
            let mut state = self.shared.state.lock().await;
            self.insert_locked(&mut state, TaskRecord::new(kind, parameters), now)
        };

        // Notify outside the lock
        self.shared.notify.notify_one();
        self.shared
            .events
            .emit(DomainEvent::TaskEnqueued { task_id, kind });
        Ok(task_id)
    }

    async fn claim(&self, wait: Duration) -> Result<Option<Box<dyn TaskLease>>, GuildcastError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let (lease, reaped, next_wake) = {
                let now = self.shared.clock.now();
                let mut state = self.shared.state.lock().await;
                let reaped = self.reap_expired_locked(&mut state, now);
                let lease = self.claim_locked(&mut state, now);
                (lease, reaped, state.next_wake())
            };

            for event in reaped {
                self.shared.events.emit(event);
            }
            if let Some(lease) = lease {
                self.shared.events.emit(DomainEvent::TaskClaimed {
                    task_id: lease.task_id,
                    kind: lease.task.kind(),
                    failed_attempts: lease.task.failed_attempts(),
                });
                let lease: Box<dyn TaskLease> = Box::new(lease);
                return Ok(Some(lease));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            // Wait for notification OR next scheduled wake-up, bounded by `wait`
            let mut sleep_for = deadline - now;
            if let Some(wake_at) = next_wake {
                sleep_for = sleep_for.min(clock::until(self.shared.clock.now(), wake_at));
            }
            tokio::select! {
                _ = self.shared.notify.notified() => {},
                _ = tokio::time::sleep(sleep_for) => {},
            }
        }
    }

    async fn counts(&self) -> Result<QueueCounts, GuildcastError> {
        let state = self.shared.state.lock().await;
        Ok(state.counts())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, GuildcastError> {
        let state = self.shared.state.lock().await;
        Ok(state.dead_letters.values().cloned().collect())
    }

    async fn replay_dead_letter(&self, task_id: TaskId) -> Result<TaskId, GuildcastError> {
        let now = self.shared.clock.now();
        let (new_id, kind) = {
            let mut state = self.shared.state.lock().await;
            let dead = state
                .dead_letters
                .remove(&task_id)
                .ok_or(GuildcastError::TaskNotFound(task_id))?;
            let kind = dead.task.kind();
            (self.insert_locked(&mut state, dead.task.to_replay(), now), kind)
        };

        info!(%task_id, new_task_id = %new_id, "dead letter replayed");
        self.shared.notify.notify_one();
        self.shared.events.emit(DomainEvent::TaskEnqueued {
            task_id: new_id,
            kind,
        });
        Ok(new_id)
    }
}

/// Lease implementation for InMemoryTaskQueue.
struct InMemoryLease {
    task_id: TaskId,
    token: Ulid,
    task: TaskRecord,
    shared: Arc<Shared>,
}

#[async_trait]
impl TaskLease for InMemoryLease {
    fn task_id(&self) -> TaskId {
        self.task_id
    }

    fn task(&self) -> &TaskRecord {
        &self.task
    }

    async fn ack(self: Box<Self>) -> Result<(), GuildcastError> {
        {
            let mut state = self.shared.state.lock().await;
            if !state
                .records
                .get(&self.task_id)
                .is_some_and(|entry| entry.holds(self.token))
            {
                return Err(GuildcastError::LeaseLost(self.task_id));
            }
            state.records.remove(&self.task_id);
        }

        self.shared.events.emit(DomainEvent::TaskSucceeded {
            task_id: self.task_id,
            kind: self.task.kind(),
        });
        Ok(())
    }

    async fn fail(self: Box<Self>, failure: TaskFailure) -> Result<Decision, GuildcastError> {
        let now = self.shared.clock.now();
        let (decision, event) = {
            let mut state = self.shared.state.lock().await;
            if !state
                .records
                .get(&self.task_id)
                .is_some_and(|entry| entry.holds(self.token))
            {
                return Err(GuildcastError::LeaseLost(self.task_id));
            }
            state
                .settle_failure(self.task_id, &failure, &*self.shared.decider, now)
                .ok_or(GuildcastError::LeaseLost(self.task_id))?
        };

        if !decision.is_dead_letter() {
            self.shared.notify.notify_one();
        }
        self.shared.events.emit(event);
        Ok(decision)
    }
}
