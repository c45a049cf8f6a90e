//! ConsumptionLedger port - 受信者ごとの消化記録
//!
//! `(dispatch_id, guild_id)` ごとに高々 1 行。二重配信防止の正本です。

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::domain::{ConsumeOutcome, ConsumptionRecord, DispatchId, GuildId, GuildcastError};

#[async_trait]
pub trait ConsumptionLedger: Send + Sync {
    /// Atomic insert-if-absent.
    ///
    /// Exactly one of any number of concurrent callers for the same pair gets
    /// `Recorded`; everybody else gets `AlreadyConsumed`. A dispatch that does
    /// not exist is rejected with `GuildcastError::DispatchNotFound`.
    async fn record_consumption(
        &self,
        dispatch_id: DispatchId,
        guild_id: &GuildId,
    ) -> Result<ConsumeOutcome, GuildcastError>;

    /// `all_recipients` minus every guild that already consumed `dispatch_id`.
    async fn pending_recipients(
        &self,
        dispatch_id: DispatchId,
        all_recipients: &BTreeSet<GuildId>,
    ) -> Result<BTreeSet<GuildId>, GuildcastError>;

    async fn consumptions(
        &self,
        dispatch_id: DispatchId,
    ) -> Result<Vec<ConsumptionRecord>, GuildcastError>;
}
