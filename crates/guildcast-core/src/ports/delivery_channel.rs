//! DeliveryChannel port - チャットプラットフォームへの送信

use async_trait::async_trait;

use crate::domain::{GuildId, GuildcastError};

/// Sends one message to one guild.
///
/// May be called again for the same guild on a later attempt while that guild
/// is still pending; the consumption ledger, not the channel, prevents
/// double-crediting.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    /// Fails with `GuildcastError::DeliveryFailed` for this recipient only.
    async fn deliver(&self, guild_id: &GuildId, message: &str) -> Result<(), GuildcastError>;
}
