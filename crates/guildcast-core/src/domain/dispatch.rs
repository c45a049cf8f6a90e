//! Dispatch / consumption records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{DispatchId, GuildId};

/// One authored alert. Created once, never updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub dispatch_id: DispatchId,
    /// `None` means the alert is broadcast to every tenant.
    pub origin_guild_id: Option<GuildId>,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl DispatchRecord {
    pub fn scope(&self) -> RecipientScope {
        match &self.origin_guild_id {
            Some(guild_id) => RecipientScope::Guild(guild_id.clone()),
            None => RecipientScope::All,
        }
    }
}

/// Proof that `guild_id` finished processing `dispatch_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumptionRecord {
    pub dispatch_id: DispatchId,
    pub guild_id: GuildId,
    pub consumed_at: DateTime<Utc>,
}

/// Which tenants a dispatch has to reach.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecipientScope {
    All,
    Guild(GuildId),
}

/// Result of an insert-if-absent into the consumption ledger.
///
/// `AlreadyConsumed` is not an error: another worker (or an earlier attempt)
/// already credited this recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Recorded,
    AlreadyConsumed,
}
