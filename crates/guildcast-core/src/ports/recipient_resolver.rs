//! RecipientResolver port - テナント（guild）一覧の取得

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::domain::{GuildId, GuildcastError, RecipientScope};

#[async_trait]
pub trait RecipientResolver: Send + Sync {
    /// Fails with `GuildcastError::ResolverUnavailable` on backend errors; the
    /// caller treats that as retryable.
    async fn list_recipients(
        &self,
        scope: &RecipientScope,
    ) -> Result<BTreeSet<GuildId>, GuildcastError>;
}
