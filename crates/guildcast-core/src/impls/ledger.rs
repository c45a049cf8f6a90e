//! InMemoryLedger - 開発用・テスト用の台帳
//!
//! DispatchLedger と ConsumptionLedger を 1 つの Mutex の下で実装します。
//! ロックの中で「存在確認 → 挿入」を行うので insert-if-absent は原子的です。

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{
    ConsumeOutcome, ConsumptionRecord, DispatchId, DispatchRecord, GuildId, GuildcastError,
};
use crate::ports::{Clock, ConsumptionLedger, DispatchLedger, IdGenerator, SystemClock, UlidGenerator};

#[derive(Default)]
struct LedgerState {
    dispatches: HashMap<DispatchId, DispatchRecord>,
    consumptions: HashMap<DispatchId, BTreeMap<GuildId, ConsumptionRecord>>,
}

pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let ids = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        Self {
            state: Mutex::new(LedgerState::default()),
            clock,
            ids,
        }
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DispatchLedger for InMemoryLedger {
    async fn create_dispatch(
        &self,
        origin_guild_id: Option<GuildId>,
        message: String,
    ) -> Result<DispatchId, GuildcastError> {
        let record = DispatchRecord {
            dispatch_id: self.ids.generate_dispatch_id(),
            origin_guild_id,
            message,
            created_at: self.clock.now(),
        };
        let dispatch_id = record.dispatch_id;

        let mut state = self.state.lock().await;
        state.dispatches.insert(dispatch_id, record);
        Ok(dispatch_id)
    }

    async fn get_dispatch(&self, dispatch_id: DispatchId) -> Result<DispatchRecord, GuildcastError> {
        let state = self.state.lock().await;
        state
            .dispatches
            .get(&dispatch_id)
            .cloned()
            .ok_or(GuildcastError::DispatchNotFound(dispatch_id))
    }
}

#[async_trait]
impl ConsumptionLedger for InMemoryLedger {
    async fn record_consumption(
        &self,
        dispatch_id: DispatchId,
        guild_id: &GuildId,
    ) -> Result<ConsumeOutcome, GuildcastError> {
        let consumed_at = self.clock.now();
        let mut state = self.state.lock().await;

        if !state.dispatches.contains_key(&dispatch_id) {
            return Err(GuildcastError::DispatchNotFound(dispatch_id));
        }

        let rows = state.consumptions.entry(dispatch_id).or_default();
        if rows.contains_key(guild_id) {
            return Ok(ConsumeOutcome::AlreadyConsumed);
        }
        rows.insert(
            guild_id.clone(),
            ConsumptionRecord {
                dispatch_id,
                guild_id: guild_id.clone(),
                consumed_at,
            },
        );
        Ok(ConsumeOutcome::Recorded)
    }

    async fn pending_recipients(
        &self,
        dispatch_id: DispatchId,
        all_recipients: &BTreeSet<GuildId>,
    ) -> Result<BTreeSet<GuildId>, GuildcastError> {
        let state = self.state.lock().await;
        let pending = match state.consumptions.get(&dispatch_id) {
            Some(rows) => all_recipients
                .iter()
                .filter(|guild_id| !rows.contains_key(*guild_id))
                .cloned()
                .collect(),
            None => all_recipients.clone(),
        };
        Ok(pending)
    }

    async fn consumptions(
        &self,
        dispatch_id: DispatchId,
    ) -> Result<Vec<ConsumptionRecord>, GuildcastError> {
        let state = self.state.lock().await;
        Ok(state
            .consumptions
            .get(&dispatch_id)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }
}
