//! SqliteTaskQueue - tasks / dead_letters テーブル上のキュー
//!
//! # 書き込みロック
//! claim と fail は `BEGIN IMMEDIATE` で始めます。読んでから書く途中で他の接続に
//! 書き込みを挟まれる (WAL で SQLITE_BUSY になる) ことがなく、ロック待ちは
//! busy_timeout に任せられます。
//!
//! # claim
//! 先に claimed_until を過ぎた in_progress 行を回収し、失敗 1 回として数えます
//! (retry か dead-letter かは fail と同じ Decider が決めます)。
//! そのあと `UPDATE ... WHERE task_id = (SELECT ... LIMIT 1) RETURNING` で pending 行を取り、
//! 新しい claim_token と claimed_until を書き込みます。
//!
//! # ack / fail
//! どちらも claim_token で行を絞り込みます。token が変わっていたら LeaseLost。
//! dead-letter は「dead_letters へ INSERT → tasks から DELETE」を 1 トランザクションで行います。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use guildcast_core::domain::{
    Decider, Decision, DomainEvent, GuildcastError, TaskFailure, TaskId, TaskKind, TaskParameters,
    TaskRecord,
};
use guildcast_core::ports::clock::add_std;
use guildcast_core::ports::{Clock, EventSink, IdGenerator, SystemClock, TracingEventSink, UlidGenerator};
use guildcast_core::queue::{DeadLetter, QueueCounts, QueueSettings, TaskLease, TaskQueue, TaskState};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::db::persistence;

struct Shared {
    pool: SqlitePool,
    decider: Arc<dyn Decider>,
    visibility_timeout: Duration,
    poll_interval: Duration,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    events: Arc<dyn EventSink>,
}

#[derive(Clone)]
pub struct SqliteTaskQueue {
    shared: Arc<Shared>,
}

#[derive(sqlx::FromRow)]
struct ClaimedRow {
    task_id: String,
    kind: String,
    parameters: String,
    failed_attempts: i64,
}

#[derive(sqlx::FromRow)]
struct DeadLetterRow {
    task_id: String,
    kind: String,
    parameters: String,
    failed_attempts: i64,
    reason: String,
    failure: String,
    dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterRow {
    fn into_dead_letter(self) -> Result<DeadLetter, GuildcastError> {
        let failure: TaskFailure = serde_json::from_str(&self.failure)
            .map_err(|e| GuildcastError::Persistence(format!("invalid failure json: {e}")))?;
        Ok(DeadLetter {
            task_id: parse_task_id(&self.task_id)?,
            task: restore_task(&self.kind, &self.parameters, self.failed_attempts)?,
            reason: self.reason,
            failure,
            dead_lettered_at: self.dead_lettered_at,
        })
    }
}

fn parse_task_id(raw: &str) -> Result<TaskId, GuildcastError> {
    Ulid::from_string(raw)
        .map(TaskId::from)
        .map_err(|e| GuildcastError::Persistence(format!("invalid task_id {raw}: {e}")))
}

fn task_key(task_id: TaskId) -> String {
    task_id.as_ulid().to_string()
}

fn restore_task(kind: &str, parameters: &str, failed_attempts: i64) -> Result<TaskRecord, GuildcastError> {
    let kind: TaskKind = kind
        .parse()
        .map_err(|e| GuildcastError::Persistence(format!("stored task: {e}")))?;
    let parameters: TaskParameters = serde_json::from_str(parameters)
        .map_err(|e| GuildcastError::Persistence(format!("invalid parameters json: {e}")))?;
    let failed_attempts = u32::try_from(failed_attempts)
        .map_err(|_| GuildcastError::Persistence(format!("invalid failed_attempts {failed_attempts}")))?;
    Ok(TaskRecord::restore(kind, parameters, failed_attempts))
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, GuildcastError> {
    serde_json::to_string(value).map_err(|e| GuildcastError::Persistence(e.to_string()))
}

/// Write lock up front: claim and fail read a row and then rewrite it.
const BEGIN_IMMEDIATE: &str = "BEGIN IMMEDIATE";

/// The stored record with one more failed attempt counted.
fn with_failure(row: &ClaimedRow) -> Result<(TaskId, TaskRecord), GuildcastError> {
    let stored = restore_task(&row.kind, &row.parameters, row.failed_attempts)?;
    let task = TaskRecord::restore(
        stored.kind(),
        stored.parameters().clone(),
        stored.failed_attempts().saturating_add(1),
    );
    Ok((parse_task_id(&row.task_id)?, task))
}

/// Persist a failure decision for a row. The caller holds the write lock and
/// `task` already carries the incremented counter.
async fn settle(
    conn: &mut SqliteConnection,
    task_id: TaskId,
    task: &TaskRecord,
    failure: &TaskFailure,
    decision: &Decision,
    now: DateTime<Utc>,
) -> Result<(), GuildcastError> {
    let key = task_key(task_id);
    match decision {
        Decision::Retry { delay, .. } => {
            sqlx::query(
                "UPDATE tasks
                 SET state = 'pending', failed_attempts = ?1, available_at = ?2,
                     claim_token = NULL, claimed_until = NULL, last_error = ?3, updated_at = ?4
                 WHERE task_id = ?5",
            )
            .bind(i64::from(task.failed_attempts()))
            .bind(millis(add_std(now, *delay)))
            .bind(to_json(failure)?)
            .bind(millis(now))
            .bind(&key)
            .execute(&mut *conn)
            .await
            .map_err(persistence)?;
        }
        Decision::DeadLetter { reason } => {
            sqlx::query(
                "INSERT INTO dead_letters
                     (task_id, kind, parameters, failed_attempts, reason, error_kind, failure, dead_lettered_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )
            .bind(&key)
            .bind(task.kind().as_str())
            .bind(to_json(task.parameters())?)
            .bind(i64::from(task.failed_attempts()))
            .bind(reason)
            .bind(failure.kind.as_str())
            .bind(to_json(failure)?)
            .bind(now)
            .execute(&mut *conn)
            .await
            .map_err(persistence)?;
            sqlx::query("DELETE FROM tasks WHERE task_id = ?1")
                .bind(&key)
                .execute(&mut *conn)
                .await
                .map_err(persistence)?;
        }
    }
    Ok(())
}

impl SqliteTaskQueue {
    pub fn new(pool: SqlitePool, settings: QueueSettings) -> Self {
        Self::with_parts(pool, settings, Arc::new(SystemClock), Arc::new(TracingEventSink))
    }

    pub fn with_parts(
        pool: SqlitePool,
        settings: QueueSettings,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let ids = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        Self {
            shared: Arc::new(Shared {
                pool,
                decider: Arc::new(settings.decider()),
                visibility_timeout: settings.visibility_timeout,
                poll_interval: Duration::from_millis(100),
                clock,
                ids,
                events,
            }),
        }
    }

    /// How often `claim` re-checks the table while waiting. Other processes can
    /// enqueue into the same file, so there is no in-process wake-up to rely on.
    pub fn with_poll_interval(self, poll_interval: Duration) -> Self {
        let shared = Shared {
            pool: self.shared.pool.clone(),
            decider: Arc::clone(&self.shared.decider),
            visibility_timeout: self.shared.visibility_timeout,
            poll_interval,
            clock: Arc::clone(&self.shared.clock),
            ids: Arc::clone(&self.shared.ids),
            events: Arc::clone(&self.shared.events),
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    async fn insert(&self, task_id: TaskId, task: &TaskRecord) -> Result<(), GuildcastError> {
        let now = millis(self.shared.clock.now());
        sqlx::query(
            "INSERT INTO tasks (task_id, kind, parameters, failed_attempts, state, available_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?5, ?5)",
        )
        .bind(task_key(task_id))
        .bind(task.kind().as_str())
        .bind(to_json(task.parameters())?)
        .bind(i64::from(task.failed_attempts()))
        .bind(now)
        .execute(&self.shared.pool)
        .await
        .map_err(persistence)?;
        Ok(())
    }

    /// Reap expired claims, then claim one pending task, all under one write lock.
    /// Returns the lease (if any) and the events of the reaped tasks.
    async fn try_claim(&self) -> Result<(Option<SqliteLease>, Vec<DomainEvent>), GuildcastError> {
        let now = self.shared.clock.now();
        let mut tx = self
            .shared
            .pool
            .begin_with(BEGIN_IMMEDIATE)
            .await
            .map_err(persistence)?;

        let expired: Vec<ClaimedRow> = sqlx::query_as(
            "SELECT task_id, kind, parameters, failed_attempts FROM tasks
             WHERE state = 'in_progress' AND claimed_until <= ?1",
        )
        .bind(millis(now))
        .fetch_all(&mut *tx)
        .await
        .map_err(persistence)?;

        let failure = TaskFailure::claim_expired(self.shared.visibility_timeout);
        let mut reaped = Vec::with_capacity(expired.len());
        for row in &expired {
            let (task_id, task) = with_failure(row)?;
            warn!(%task_id, "claim expired, counting it as a failed attempt");
            let decision = self.shared.decider.decide(&task, &failure);
            settle(&mut *tx, task_id, &task, &failure, &decision, now).await?;
            reaped.push(decision.to_event(task_id, task.kind(), task.failed_attempts(), failure.kind));
        }

        let token = Ulid::new();
        let claimed_until = add_std(now, self.shared.visibility_timeout);
        let row: Option<ClaimedRow> = sqlx::query_as(
            "UPDATE tasks
             SET state = 'in_progress', claim_token = ?1, claimed_until = ?2, updated_at = ?3
             WHERE task_id = (
                 SELECT task_id FROM tasks
                 WHERE state = 'pending' AND available_at <= ?3
                 ORDER BY available_at, task_id
                 LIMIT 1
             )
             RETURNING task_id, kind, parameters, failed_attempts",
        )
        .bind(token.to_string())
        .bind(millis(claimed_until))
        .bind(millis(now))
        .fetch_optional(&mut *tx)
        .await
        .map_err(persistence)?;

        tx.commit().await.map_err(persistence)?;

        let lease = match row {
            Some(row) => Some(SqliteLease {
                task_id: parse_task_id(&row.task_id)?,
                token,
                task: restore_task(&row.kind, &row.parameters, row.failed_attempts)?,
                shared: Arc::clone(&self.shared),
            }),
            None => None,
        };
        Ok((lease, reaped))
    }
}

#[async_trait]
impl TaskQueue for SqliteTaskQueue {
    async fn enqueue(
        &self,
        kind: TaskKind,
        parameters: TaskParameters,
    ) -> Result<TaskId, GuildcastError> {
        let task_id = self.shared.ids.generate_task_id();
        self.insert(task_id, &TaskRecord::new(kind, parameters))
            .await?;

        self.shared
            .events
            .emit(DomainEvent::TaskEnqueued { task_id, kind });
        Ok(task_id)
    }

    async fn claim(&self, wait: Duration) -> Result<Option<Box<dyn TaskLease>>, GuildcastError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let (lease, reaped) = self.try_claim().await?;
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
            tokio::time::sleep(self.shared.poll_interval.min(deadline - now)).await;
        }
    }

    async fn counts(&self) -> Result<QueueCounts, GuildcastError> {
        let by_state: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM tasks GROUP BY state")
                .fetch_all(&self.shared.pool)
                .await
                .map_err(persistence)?;
        let (dead_lettered,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM dead_letters")
            .fetch_one(&self.shared.pool)
            .await
            .map_err(persistence)?;

        let to_usize = |n: i64| usize::try_from(n).unwrap_or(0);
        let mut counts = QueueCounts {
            dead_lettered: to_usize(dead_lettered),
            ..QueueCounts::default()
        };
        for (state, n) in by_state {
            match TaskState::parse(&state)? {
                TaskState::Pending => counts.pending += to_usize(n),
                TaskState::InProgress => counts.in_progress += to_usize(n),
            }
        }
        Ok(counts)
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, GuildcastError> {
        let rows: Vec<DeadLetterRow> = sqlx::query_as(
            "SELECT task_id, kind, parameters, failed_attempts, reason, failure, dead_lettered_at
             FROM dead_letters
             ORDER BY task_id",
        )
        .fetch_all(&self.shared.pool)
        .await
        .map_err(persistence)?;

        rows.into_iter().map(DeadLetterRow::into_dead_letter).collect()
    }

    async fn replay_dead_letter(&self, task_id: TaskId) -> Result<TaskId, GuildcastError> {
        let mut tx = self.shared.pool.begin().await.map_err(persistence)?;

        let row: Option<DeadLetterRow> = sqlx::query_as(
            "DELETE FROM dead_letters WHERE task_id = ?1
             RETURNING task_id, kind, parameters, failed_attempts, reason, failure, dead_lettered_at",
        )
        .bind(task_key(task_id))
        .fetch_optional(&mut *tx)
        .await
        .map_err(persistence)?;
        let dead = row
            .ok_or(GuildcastError::TaskNotFound(task_id))?
            .into_dead_letter()?;

        let replay = dead.task.to_replay();
        let new_id = self.shared.ids.generate_task_id();
        let now = millis(self.shared.clock.now());
        sqlx::query(
            "INSERT INTO tasks (task_id, kind, parameters, failed_attempts, state, available_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, 0, 'pending', ?4, ?4, ?4)",
        )
        .bind(task_key(new_id))
        .bind(replay.kind().as_str())
        .bind(to_json(replay.parameters())?)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(persistence)?;

        tx.commit().await.map_err(persistence)?;

        info!(%task_id, new_task_id = %new_id, "dead letter replayed");
        self.shared.events.emit(DomainEvent::TaskEnqueued {
            task_id: new_id,
            kind: replay.kind(),
        });
        Ok(new_id)
    }
}

struct SqliteLease {
    task_id: TaskId,
    token: Ulid,
    task: TaskRecord,
    shared: Arc<Shared>,
}

#[async_trait]
impl TaskLease for SqliteLease {
    fn task_id(&self) -> TaskId {
        self.task_id
    }

    fn task(&self) -> &TaskRecord {
        &self.task
    }

    async fn ack(self: Box<Self>) -> Result<(), GuildcastError> {
        let done = sqlx::query("DELETE FROM tasks WHERE task_id = ?1 AND claim_token = ?2")
            .bind(task_key(self.task_id))
            .bind(self.token.to_string())
            .execute(&self.shared.pool)
            .await
            .map_err(persistence)?;
        if done.rows_affected() == 0 {
            return Err(GuildcastError::LeaseLost(self.task_id));
        }

        self.shared.events.emit(DomainEvent::TaskSucceeded {
            task_id: self.task_id,
            kind: self.task.kind(),
        });
        Ok(())
    }

    async fn fail(self: Box<Self>, failure: TaskFailure) -> Result<Decision, GuildcastError> {
        let now = self.shared.clock.now();
        let mut tx = self
            .shared
            .pool
            .begin_with(BEGIN_IMMEDIATE)
            .await
            .map_err(persistence)?;

        let row: Option<ClaimedRow> = sqlx::query_as(
            "SELECT task_id, kind, parameters, failed_attempts FROM tasks
             WHERE task_id = ?1 AND claim_token = ?2",
        )
        .bind(task_key(self.task_id))
        .bind(self.token.to_string())
        .fetch_optional(&mut *tx)
        .await
        .map_err(persistence)?;
        let Some(row) = row else {
            return Err(GuildcastError::LeaseLost(self.task_id));
        };

        let (task_id, task) = with_failure(&row)?;
        let decision = self.shared.decider.decide(&task, &failure);
        settle(&mut *tx, task_id, &task, &failure, &decision, now).await?;
        tx.commit().await.map_err(persistence)?;

        if !decision.is_dead_letter() {
            debug!(%task_id, failed_attempts = task.failed_attempts(), "retry persisted");
        }
        self.shared.events.emit(decision.to_event(
            task_id,
            task.kind(),
            task.failed_attempts(),
            failure.kind,
        ));
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::db::connect;
    use crate::db::testing::TempDb;
    use guildcast_core::domain::ErrorKind;
    use guildcast_core::impls::RecordingEventSink;
    use guildcast_core::ports::FixedClock;
    use guildcast_core::queue::RetryPolicy;

    struct Fixture {
        queue: SqliteTaskQueue,
        clock: Arc<FixedClock>,
        events: Arc<RecordingEventSink>,
    }

    fn settings(max_attempts: u32) -> QueueSettings {
        QueueSettings {
            max_attempts,
            visibility_timeout: Duration::from_secs(30),
            retry_policy: RetryPolicy {
                base_delay: Duration::from_secs(10),
                multiplier: 2.0,
                max_delay: Duration::from_secs(60),
                jitter: Duration::ZERO,
            },
        }
    }

    async fn fixture(max_attempts: u32) -> Fixture {
        let pool = connect("sqlite::memory:").await.unwrap();
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let events = Arc::new(RecordingEventSink::new());
        let queue = SqliteTaskQueue::with_parts(pool, settings(max_attempts), clock.clone(), events.clone())
            .with_poll_interval(Duration::from_millis(5));
        Fixture {
            queue,
            clock,
            events,
        }
    }

    /// Two queues on separate pools over one file, like two worker processes.
    async fn shared_file_queues(db: &TempDb, settings: QueueSettings) -> [SqliteTaskQueue; 2] {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let queue = |pool: SqlitePool| {
            SqliteTaskQueue::with_parts(
                pool,
                settings.clone(),
                clock.clone(),
                Arc::new(RecordingEventSink::new()),
            )
        };
        [queue(db.pool().await), queue(db.pool().await)]
    }

    fn params() -> TaskParameters {
        TaskParameters::from([("dispatchId".to_string(), Ulid::new().to_string())])
    }

    #[tokio::test]
    async fn claim_is_exclusive_and_ack_removes_the_task() {
        let fx = fixture(3).await;
        let task_id = fx
            .queue
            .enqueue(TaskKind::DispatchAlertMessage, params())
            .await
            .unwrap();

        let lease = fx.queue.claim(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(lease.task_id(), task_id);
        assert!(fx.queue.claim(Duration::ZERO).await.unwrap().is_none());
        assert_eq!(fx.queue.counts().await.unwrap().in_progress, 1);

        lease.ack().await.unwrap();
        assert!(fx.queue.counts().await.unwrap().is_idle());
        assert_eq!(
            fx.events.names(),
            vec!["task_enqueued", "task_claimed", "task_succeeded"]
        );
    }

    #[tokio::test]
    async fn failed_task_waits_out_its_backoff() {
        let fx = fixture(3).await;
        fx.queue
            .enqueue(TaskKind::AddReaction, params())
            .await
            .unwrap();

        let lease = fx.queue.claim(Duration::ZERO).await.unwrap().unwrap();
        let decision = lease
            .fail(TaskFailure::transient("channel offline"))
            .await
            .unwrap();
        assert!(matches!(decision, Decision::Retry { delay, .. } if delay == Duration::from_secs(10)));

        assert!(fx.queue.claim(Duration::ZERO).await.unwrap().is_none());
        fx.clock.advance(Duration::from_secs(10));
        let lease = fx.queue.claim(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(lease.task().failed_attempts(), 1);
    }

    #[tokio::test]
    async fn dead_letters_after_max_attempts_with_context() {
        let fx = fixture(2).await;
        let task_id = fx
            .queue
            .enqueue(TaskKind::DispatchAlertMessage, params())
            .await
            .unwrap();
        let failure = TaskFailure {
            kind: ErrorKind::Transient,
            message: "1 pending recipient".into(),
            context: serde_json::json!({ "pending_recipients": ["B"] }),
        };

        for _ in 0..2 {
            let lease = fx.queue.claim(Duration::ZERO).await.unwrap().unwrap();
            lease.fail(failure.clone()).await.unwrap();
            fx.clock.advance(Duration::from_secs(60));
        }

        let counts = fx.queue.counts().await.unwrap();
        assert!(counts.is_idle());
        assert_eq!(counts.dead_lettered, 1);

        let dead = fx.queue.dead_letters().await.unwrap();
        assert_eq!(dead[0].task_id, task_id);
        assert_eq!(dead[0].task.failed_attempts(), 2);
        assert_eq!(dead[0].failure, failure);
        assert!(dead[0].reason.contains("max attempts"));
        assert!(fx.events.names().contains(&"task_dead_lettered"));
    }

    #[tokio::test]
    async fn permanent_failure_skips_the_retry_budget() {
        let fx = fixture(5).await;
        fx.queue
            .enqueue(TaskKind::DispatchAlertMessage, params())
            .await
            .unwrap();

        let lease = fx.queue.claim(Duration::ZERO).await.unwrap().unwrap();
        let decision = lease
            .fail(TaskFailure::permanent("dispatch not found"))
            .await
            .unwrap();

        assert!(decision.is_dead_letter());
        assert_eq!(fx.queue.dead_letters().await.unwrap()[0].task.failed_attempts(), 1);
    }

    #[tokio::test]
    async fn expired_claim_counts_as_an_attempt_and_stale_lease_is_lost() {
        let fx = fixture(3).await;
        fx.queue
            .enqueue(TaskKind::ScheduledDelete, params())
            .await
            .unwrap();

        let stale = fx.queue.claim(Duration::ZERO).await.unwrap().unwrap();
        fx.clock.advance(Duration::from_secs(31));

        // Reaped as a failed attempt, then it waits out the backoff.
        assert!(fx.queue.claim(Duration::ZERO).await.unwrap().is_none());
        assert_eq!(fx.queue.counts().await.unwrap().pending, 1);
        assert!(fx.events.names().contains(&"retry_scheduled"));

        fx.clock.advance(Duration::from_secs(10));
        let fresh = fx.queue.claim(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(stale.task_id(), fresh.task_id());
        assert_eq!(fresh.task().failed_attempts(), 1);

        let stale_id = stale.task_id();
        assert!(matches!(
            stale.ack().await,
            Err(GuildcastError::LeaseLost(id)) if id == stale_id
        ));
        fresh.ack().await.unwrap();
    }

    #[tokio::test]
    async fn task_that_never_reports_back_is_dead_lettered_after_max_attempts() {
        let fx = fixture(2).await;
        let task_id = fx
            .queue
            .enqueue(TaskKind::DispatchAlertMessage, params())
            .await
            .unwrap();

        let mut claims = 0;
        for _ in 0..6 {
            if let Some(lease) = fx.queue.claim(Duration::ZERO).await.unwrap() {
                claims += 1;
                drop(lease);
            }
            fx.clock.advance(Duration::from_secs(60));
        }

        assert_eq!(claims, 2);
        let dead = fx.queue.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].task_id, task_id);
        assert_eq!(dead[0].task.failed_attempts(), 2);
        assert_eq!(dead[0].failure.kind, ErrorKind::Infrastructure);
        assert!(fx.queue.counts().await.unwrap().is_idle());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn claims_across_pools_hand_out_each_task_once() {
        let db = TempDb::new();
        let queues = shared_file_queues(&db, settings(3)).await;
        let mut enqueued = BTreeSet::new();
        for _ in 0..16 {
            enqueued.insert(
                queues[0]
                    .enqueue(TaskKind::DispatchAlertMessage, params())
                    .await
                    .unwrap(),
            );
        }

        let mut workers = Vec::new();
        for worker in 0..8 {
            let queue = queues[worker % 2].clone();
            workers.push(tokio::spawn(async move {
                let mut held = Vec::new();
                while let Some(lease) = queue.claim(Duration::ZERO).await.unwrap() {
                    held.push(lease);
                }
                held
            }));
        }

        let mut claimed = Vec::new();
        for worker in workers {
            claimed.extend(worker.await.unwrap().iter().map(|lease| lease.task_id()));
        }
        assert_eq!(claimed.len(), 16);
        assert_eq!(claimed.into_iter().collect::<BTreeSet<_>>(), enqueued);
        assert_eq!(queues[1].counts().await.unwrap().in_progress, 16);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn failure_reports_under_contention_are_all_counted() {
        let db = TempDb::new();
        let queues = shared_file_queues(
            &db,
            QueueSettings {
                max_attempts: 1000,
                visibility_timeout: Duration::from_secs(30),
                retry_policy: RetryPolicy::immediate(),
            },
        )
        .await;
        for _ in 0..40 {
            queues[0]
                .enqueue(TaskKind::AddReaction, params())
                .await
                .unwrap();
        }

        let mut workers = Vec::new();
        for worker in 0..8 {
            let queue = queues[worker % 2].clone();
            workers.push(tokio::spawn(async move {
                let mut failed = 0_i64;
                for _ in 0..15 {
                    if let Some(lease) = queue.claim(Duration::ZERO).await.unwrap() {
                        let decision = lease.fail(TaskFailure::transient("busy")).await.unwrap();
                        assert!(!decision.is_dead_letter());
                        failed += 1;
                    }
                }
                failed
            }));
        }

        let mut reported = 0;
        for worker in workers {
            reported += worker.await.unwrap();
        }

        let counts = queues[0].counts().await.unwrap();
        assert_eq!(counts.in_progress, 0);
        assert_eq!(counts.pending, 40);

        let pool = db.pool().await;
        let (counted,): (i64,) = sqlx::query_as("SELECT COALESCE(SUM(failed_attempts), 0) FROM tasks")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert!(reported > 0);
        assert_eq!(counted, reported);
    }

    #[tokio::test]
    async fn replay_creates_a_fresh_task() {
        let fx = fixture(1).await;
        let original = fx
            .queue
            .enqueue(TaskKind::DispatchAlertMessage, params())
            .await
            .unwrap();
        let lease = fx.queue.claim(Duration::ZERO).await.unwrap().unwrap();
        lease.fail(TaskFailure::transient("boom")).await.unwrap();

        let replayed = fx.queue.replay_dead_letter(original).await.unwrap();
        assert_ne!(replayed, original);
        assert!(fx.queue.dead_letters().await.unwrap().is_empty());

        let lease = fx.queue.claim(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(lease.task_id(), replayed);
        assert_eq!(lease.task().failed_attempts(), 0);

        assert!(matches!(
            fx.queue.replay_dead_letter(original).await,
            Err(GuildcastError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn waiting_claim_sees_a_later_enqueue() {
        let fx = fixture(3).await;
        let producer = fx.queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer
                .enqueue(TaskKind::AddReaction, params())
                .await
                .unwrap();
        });

        let lease = fx.queue.claim(Duration::from_secs(2)).await.unwrap();
        assert!(lease.is_some());
    }

    #[tokio::test]
    async fn tasks_survive_reopening_the_database() {
        let db = TempDb::new();

        let task_id = {
            let pool = db.pool().await;
            let queue = SqliteTaskQueue::new(pool.clone(), QueueSettings::default());
            let task_id = queue
                .enqueue(TaskKind::DispatchAlertMessage, params())
                .await
                .unwrap();
            pool.close().await;
            task_id
        };

        let pool = db.pool().await;
        let queue = SqliteTaskQueue::new(pool.clone(), QueueSettings::default());
        let lease = queue.claim(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(lease.task_id(), task_id);
        lease.ack().await.unwrap();
        pool.close().await;
    }
}
