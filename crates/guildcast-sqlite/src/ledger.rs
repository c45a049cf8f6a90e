//! SqliteLedger - dispatches / consumptions テーブル
//!
//! consumption の insert-if-absent は `ON CONFLICT DO NOTHING` + `rows_affected`
//! で判定します。DB の一意制約が原子性を保証するので、アプリ側のロックは不要です。

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use guildcast_core::domain::{
    ConsumeOutcome, ConsumptionRecord, DispatchId, DispatchRecord, GuildId, GuildcastError,
};
use guildcast_core::ports::{
    Clock, ConsumptionLedger, DispatchLedger, IdGenerator, SystemClock, UlidGenerator,
};
use sqlx::SqlitePool;
use ulid::Ulid;

use crate::db::{is_foreign_key_violation, persistence};

#[derive(Clone)]
pub struct SqliteLedger {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

#[derive(sqlx::FromRow)]
struct DispatchRow {
    dispatch_id: String,
    origin_guild_id: Option<String>,
    message: String,
    created_at: DateTime<Utc>,
}

impl DispatchRow {
    fn into_record(self) -> Result<DispatchRecord, GuildcastError> {
        Ok(DispatchRecord {
            dispatch_id: parse_dispatch_id(&self.dispatch_id)?,
            origin_guild_id: self.origin_guild_id.map(GuildId::new),
            message: self.message,
            created_at: self.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ConsumptionRow {
    dispatch_id: String,
    guild_id: String,
    consumed_at: DateTime<Utc>,
}

impl ConsumptionRow {
    fn into_record(self) -> Result<ConsumptionRecord, GuildcastError> {
        Ok(ConsumptionRecord {
            dispatch_id: parse_dispatch_id(&self.dispatch_id)?,
            guild_id: GuildId::new(self.guild_id),
            consumed_at: self.consumed_at,
        })
    }
}

fn parse_dispatch_id(raw: &str) -> Result<DispatchId, GuildcastError> {
    Ulid::from_string(raw)
        .map(DispatchId::from)
        .map_err(|e| GuildcastError::Persistence(format!("invalid dispatch_id {raw}: {e}")))
}

fn dispatch_key(dispatch_id: DispatchId) -> String {
    dispatch_id.as_ulid().to_string()
}

impl SqliteLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_clock(pool, Arc::new(SystemClock))
    }

    pub fn with_clock(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        let ids = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        Self { pool, clock, ids }
    }
}

#[async_trait]
impl DispatchLedger for SqliteLedger {
    async fn create_dispatch(
        &self,
        origin_guild_id: Option<GuildId>,
        message: String,
    ) -> Result<DispatchId, GuildcastError> {
        let dispatch_id = self.ids.generate_dispatch_id();

        sqlx::query(
            "INSERT INTO dispatches (dispatch_id, origin_guild_id, message, created_at)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(dispatch_key(dispatch_id))
        .bind(origin_guild_id.as_ref().map(GuildId::as_str))
        .bind(&message)
        .bind(self.clock.now())
        .execute(&self.pool)
        .await
        .map_err(persistence)?;

        Ok(dispatch_id)
    }

    async fn get_dispatch(&self, dispatch_id: DispatchId) -> Result<DispatchRecord, GuildcastError> {
        let row: Option<DispatchRow> = sqlx::query_as(
            "SELECT dispatch_id, origin_guild_id, message, created_at
             FROM dispatches WHERE dispatch_id = ?1",
        )
        .bind(dispatch_key(dispatch_id))
        .fetch_optional(&self.pool)
        .await
        .map_err(persistence)?;

        row.ok_or(GuildcastError::DispatchNotFound(dispatch_id))?
            .into_record()
    }
}

#[async_trait]
impl ConsumptionLedger for SqliteLedger {
    async fn record_consumption(
        &self,
        dispatch_id: DispatchId,
        guild_id: &GuildId,
    ) -> Result<ConsumeOutcome, GuildcastError> {
        let result = sqlx::query(
            "INSERT INTO consumptions (dispatch_id, guild_id, consumed_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (dispatch_id, guild_id) DO NOTHING",
        )
        .bind(dispatch_key(dispatch_id))
        .bind(guild_id.as_str())
        .bind(self.clock.now())
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 1 => Ok(ConsumeOutcome::Recorded),
            Ok(_) => Ok(ConsumeOutcome::AlreadyConsumed),
            Err(err) if is_foreign_key_violation(&err) => {
                Err(GuildcastError::DispatchNotFound(dispatch_id))
            }
            Err(err) => Err(persistence(err)),
        }
    }

    async fn pending_recipients(
        &self,
        dispatch_id: DispatchId,
        all_recipients: &BTreeSet<GuildId>,
    ) -> Result<BTreeSet<GuildId>, GuildcastError> {
        let consumed: Vec<(String,)> =
            sqlx::query_as("SELECT guild_id FROM consumptions WHERE dispatch_id = ?1")
                .bind(dispatch_key(dispatch_id))
                .fetch_all(&self.pool)
                .await
                .map_err(persistence)?;

        let consumed: BTreeSet<GuildId> = consumed
            .into_iter()
            .map(|(guild_id,)| GuildId::new(guild_id))
            .collect();
        Ok(all_recipients.difference(&consumed).cloned().collect())
    }

    async fn consumptions(
        &self,
        dispatch_id: DispatchId,
    ) -> Result<Vec<ConsumptionRecord>, GuildcastError> {
        let rows: Vec<ConsumptionRow> = sqlx::query_as(
            "SELECT dispatch_id, guild_id, consumed_at
             FROM consumptions WHERE dispatch_id = ?1
             ORDER BY guild_id",
        )
        .bind(dispatch_key(dispatch_id))
        .fetch_all(&self.pool)
        .await
        .map_err(persistence)?;

        rows.into_iter().map(ConsumptionRow::into_record).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect;
    use crate::db::testing::TempDb;

    async fn ledger() -> SqliteLedger {
        SqliteLedger::new(connect("sqlite::memory:").await.unwrap())
    }

    #[tokio::test]
    async fn dispatch_round_trips_through_the_table() {
        let ledger = ledger().await;
        let broadcast = ledger.create_dispatch(None, "all hands".into()).await.unwrap();
        let targeted = ledger
            .create_dispatch(Some(GuildId::new("g7")), "just you".into())
            .await
            .unwrap();

        let record = ledger.get_dispatch(broadcast).await.unwrap();
        assert_eq!(record.dispatch_id, broadcast);
        assert_eq!(record.origin_guild_id, None);
        assert_eq!(record.message, "all hands");

        let record = ledger.get_dispatch(targeted).await.unwrap();
        assert_eq!(record.origin_guild_id, Some(GuildId::new("g7")));
    }

    #[tokio::test]
    async fn missing_dispatch_is_not_found() {
        let ledger = ledger().await;
        let missing = DispatchId::from_ulid(Ulid::new());

        assert!(matches!(
            ledger.get_dispatch(missing).await,
            Err(GuildcastError::DispatchNotFound(_))
        ));
        assert!(matches!(
            ledger.record_consumption(missing, &GuildId::new("g1")).await,
            Err(GuildcastError::DispatchNotFound(id)) if id == missing
        ));
    }

    #[tokio::test]
    async fn concurrent_consumption_records_exactly_once() {
        let ledger = ledger().await;
        let dispatch_id = ledger.create_dispatch(None, "hi".into()).await.unwrap();
        let guild = GuildId::new("g1");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let ledger = ledger.clone();
            let guild = guild.clone();
            handles.push(tokio::spawn(async move {
                ledger.record_consumption(dispatch_id, &guild).await.unwrap()
            }));
        }

        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.await.unwrap());
        }
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| **o == ConsumeOutcome::Recorded)
                .count(),
            1
        );
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| **o == ConsumeOutcome::AlreadyConsumed)
                .count(),
            7
        );
        assert_eq!(ledger.consumptions(dispatch_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn pending_excludes_consumed_guilds() {
        let ledger = ledger().await;
        let dispatch_id = ledger.create_dispatch(None, "hi".into()).await.unwrap();
        ledger
            .record_consumption(dispatch_id, &GuildId::new("B"))
            .await
            .unwrap();
        ledger
            .record_consumption(dispatch_id, &GuildId::new("C"))
            .await
            .unwrap();

        let all: BTreeSet<GuildId> = ["A", "B", "C"].into_iter().map(GuildId::from).collect();
        let pending = ledger.pending_recipients(dispatch_id, &all).await.unwrap();
        assert_eq!(pending, BTreeSet::from([GuildId::new("A")]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_processes_on_one_file_record_each_guild_once() {
        let db = TempDb::new();
        // Two pools stand in for two worker processes sharing the file.
        let ledgers = [
            SqliteLedger::new(db.pool().await),
            SqliteLedger::new(db.pool().await),
        ];
        let dispatch_id = ledgers[0].create_dispatch(None, "hi".into()).await.unwrap();
        let guilds: Vec<GuildId> = (0..8).map(|i| GuildId::new(format!("g{i}"))).collect();

        let mut handles = Vec::new();
        for round in 0..4 {
            for guild in &guilds {
                let ledger = ledgers[round % 2].clone();
                let guild = guild.clone();
                handles.push(tokio::spawn(async move {
                    ledger.record_consumption(dispatch_id, &guild).await.unwrap()
                }));
            }
        }

        let mut recorded = 0;
        for handle in handles {
            if handle.await.unwrap() == ConsumeOutcome::Recorded {
                recorded += 1;
            }
        }
        assert_eq!(recorded, guilds.len());

        let consumed: BTreeSet<GuildId> = ledgers[1]
            .consumptions(dispatch_id)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.guild_id)
            .collect();
        assert_eq!(consumed, guilds.into_iter().collect());
    }
}
