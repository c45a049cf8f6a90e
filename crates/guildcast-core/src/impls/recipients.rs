//! StaticRecipientResolver - 固定の guild 一覧を返す resolver

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::domain::{GuildId, GuildcastError, RecipientScope};
use crate::ports::RecipientResolver;

/// `All` resolves to the configured guilds; `Guild(g)` resolves to `{g}`.
#[derive(Debug, Default)]
pub struct StaticRecipientResolver {
    guilds: BTreeSet<GuildId>,
    unavailable: AtomicBool,
}

impl StaticRecipientResolver {
    pub fn new<I, G>(guilds: I) -> Self
    where
        I: IntoIterator<Item = G>,
        G: Into<GuildId>,
    {
        Self {
            guilds: guilds.into_iter().map(Into::into).collect(),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Simulates a backend outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl RecipientResolver for StaticRecipientResolver {
    async fn list_recipients(
        &self,
        scope: &RecipientScope,
    ) -> Result<BTreeSet<GuildId>, GuildcastError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(GuildcastError::ResolverUnavailable(
                "guild directory is unavailable".into(),
            ));
        }
        Ok(match scope {
            RecipientScope::All => self.guilds.clone(),
            RecipientScope::Guild(guild_id) => BTreeSet::from([guild_id.clone()]),
        })
    }
}
