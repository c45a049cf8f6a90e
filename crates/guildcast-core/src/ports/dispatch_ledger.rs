//! DispatchLedger port - 配信されたアラートの台帳（append-only）

use async_trait::async_trait;

use crate::domain::{DispatchId, DispatchRecord, GuildId, GuildcastError};

/// Durable store of authored alerts. No update or delete is exposed.
#[async_trait]
pub trait DispatchLedger: Send + Sync {
    /// Write a new dispatch under a freshly generated id.
    ///
    /// Fails with `GuildcastError::Persistence` when the store is unavailable.
    async fn create_dispatch(
        &self,
        origin_guild_id: Option<GuildId>,
        message: String,
    ) -> Result<DispatchId, GuildcastError>;

    /// Fails with `GuildcastError::DispatchNotFound` when no such dispatch exists.
    async fn get_dispatch(&self, dispatch_id: DispatchId) -> Result<DispatchRecord, GuildcastError>;
}
