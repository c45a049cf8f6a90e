//! Alerts - アラートの fan-out
//!
//! 1 つの dispatch を全受信者（guild）に届けます。
//!
//! - 受信者ごとの成功は ConsumptionLedger に記録し、記録済みの guild には二度と送らない
//! - 1 受信者の失敗は他の受信者を止めない（pending のまま残す）
//! - pending が残っていれば task 全体を retryable な失敗として返し、キューに再実行させる

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::domain::{
    ConsumeOutcome, DispatchId, DomainEvent, GuildId, GuildcastError, TaskId, TaskKind,
};
use crate::ports::{
    ConsumptionLedger, DeliveryChannel, DispatchLedger, EventSink, RecipientResolver,
    TracingEventSink,
};
use crate::queue::TaskQueue;
use crate::typed::{Handler, ParameterCodec, Task};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertDispatchTask {
    #[serde(rename = "dispatchId")]
    pub dispatch_id: DispatchId,
}

impl Task for AlertDispatchTask {
    const KIND: TaskKind = TaskKind::DispatchAlertMessage;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PublishedAlert {
    pub dispatch_id: DispatchId,
    pub task_id: TaskId,
}

/// Producer side: writes the dispatch, then enqueues its fan-out.
pub struct AlertPublisher {
    dispatches: Arc<dyn DispatchLedger>,
    queue: Arc<dyn TaskQueue>,
}

impl AlertPublisher {
    pub fn new(dispatches: Arc<dyn DispatchLedger>, queue: Arc<dyn TaskQueue>) -> Self {
        Self { dispatches, queue }
    }

    /// `origin_guild_id = None` broadcasts to every guild.
    ///
    /// If the enqueue fails the dispatch row stays behind without a task;
    /// it is never delivered and publishing again creates a new dispatch.
    pub async fn publish(
        &self,
        origin_guild_id: Option<GuildId>,
        message: impl Into<String>,
    ) -> Result<PublishedAlert, GuildcastError> {
        let dispatch_id = self
            .dispatches
            .create_dispatch(origin_guild_id, message.into())
            .await?;
        let parameters = ParameterCodec::encode(&AlertDispatchTask { dispatch_id })?;
        let task_id = self
            .queue
            .enqueue(AlertDispatchTask::KIND, parameters)
            .await?;

        info!(%dispatch_id, %task_id, "alert published");
        Ok(PublishedAlert {
            dispatch_id,
            task_id,
        })
    }
}

#[derive(Debug, Clone)]
pub struct FanOutSettings {
    /// Upper bound for one `deliver` call; exceeding it counts as a failed delivery.
    pub delivery_timeout: Duration,
    pub max_concurrent_deliveries: usize,
}

impl Default for FanOutSettings {
    fn default() -> Self {
        Self {
            delivery_timeout: Duration::from_secs(10),
            max_concurrent_deliveries: 8,
        }
    }
}

enum RecipientOutcome {
    Consumed(ConsumeOutcome),
    DeliveryFailed(GuildcastError),
    LedgerFailed(GuildcastError),
}

pub struct AlertFanOutHandler {
    dispatches: Arc<dyn DispatchLedger>,
    consumptions: Arc<dyn ConsumptionLedger>,
    resolver: Arc<dyn RecipientResolver>,
    channel: Arc<dyn DeliveryChannel>,
    events: Arc<dyn EventSink>,
    settings: FanOutSettings,
}

impl AlertFanOutHandler {
    pub fn new(
        dispatches: Arc<dyn DispatchLedger>,
        consumptions: Arc<dyn ConsumptionLedger>,
        resolver: Arc<dyn RecipientResolver>,
        channel: Arc<dyn DeliveryChannel>,
    ) -> Self {
        Self {
            dispatches,
            consumptions,
            resolver,
            channel,
            events: Arc::new(TracingEventSink),
            settings: FanOutSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: FanOutSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    async fn deliver_all(
        &self,
        dispatch_id: DispatchId,
        message: Arc<str>,
        pending: BTreeSet<GuildId>,
    ) -> Result<(), GuildcastError> {
        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrent_deliveries.max(1)));
        let mut deliveries = JoinSet::new();

        for guild_id in pending.iter().cloned() {
            let semaphore = Arc::clone(&semaphore);
            let channel = Arc::clone(&self.channel);
            let consumptions = Arc::clone(&self.consumptions);
            let message = Arc::clone(&message);
            let timeout = self.settings.delivery_timeout;

            deliveries.spawn(async move {
                let outcome = match semaphore.acquire_owned().await {
                    Ok(_permit) => {
                        deliver_one(&*channel, &*consumptions, dispatch_id, &guild_id, &message, timeout)
                            .await
                    }
                    Err(_) => RecipientOutcome::DeliveryFailed(GuildcastError::DeliveryFailed {
                        guild_id: guild_id.clone(),
                        reason: "delivery slots closed".into(),
                    }),
                };
                (guild_id, outcome)
            });
        }

        let mut still_pending = pending;
        let mut ledger_error = None;
        while let Some(joined) = deliveries.join_next().await {
            let (guild_id, outcome) = match joined {
                Ok(done) => done,
                Err(e) => {
                    warn!(%dispatch_id, error = %e, "delivery task aborted");
                    continue;
                }
            };

            match outcome {
                RecipientOutcome::Consumed(consumed) => {
                    if consumed == ConsumeOutcome::AlreadyConsumed {
                        debug!(%dispatch_id, %guild_id, "recipient already consumed elsewhere");
                    }
                    still_pending.remove(&guild_id);
                    self.events.emit(DomainEvent::RecipientConsumed {
                        dispatch_id,
                        guild_id,
                    });
                }
                RecipientOutcome::DeliveryFailed(err) => {
                    self.events.emit(DomainEvent::RecipientDeliveryFailed {
                        dispatch_id,
                        guild_id,
                        reason: err.to_string(),
                    });
                }
                RecipientOutcome::LedgerFailed(err) => {
                    warn!(%dispatch_id, %guild_id, error = %err, "delivered but not recorded");
                    ledger_error.get_or_insert(err);
                }
            }
        }

        if let Some(err) = ledger_error {
            return Err(err);
        }
        if !still_pending.is_empty() {
            return Err(GuildcastError::PendingRecipients {
                dispatch_id,
                pending: still_pending.into_iter().collect(),
            });
        }
        Ok(())
    }
}

async fn deliver_one(
    channel: &dyn DeliveryChannel,
    consumptions: &dyn ConsumptionLedger,
    dispatch_id: DispatchId,
    guild_id: &GuildId,
    message: &str,
    timeout: Duration,
) -> RecipientOutcome {
    let delivered = match tokio::time::timeout(timeout, channel.deliver(guild_id, message)).await {
        Ok(result) => result,
        Err(_) => Err(GuildcastError::DeliveryTimedOut {
            guild_id: guild_id.clone(),
        }),
    };
    if let Err(err) = delivered {
        return RecipientOutcome::DeliveryFailed(err);
    }

    match consumptions.record_consumption(dispatch_id, guild_id).await {
        Ok(consumed) => RecipientOutcome::Consumed(consumed),
        Err(err) => RecipientOutcome::LedgerFailed(err),
    }
}

#[async_trait]
impl Handler<AlertDispatchTask> for AlertFanOutHandler {
    async fn handle(&self, task: AlertDispatchTask) -> Result<(), GuildcastError> {
        let dispatch = self.dispatches.get_dispatch(task.dispatch_id).await?;
        let dispatch_id = dispatch.dispatch_id;

        let recipients = self.resolver.list_recipients(&dispatch.scope()).await?;
        let pending = self
            .consumptions
            .pending_recipients(dispatch_id, &recipients)
            .await?;

        if pending.is_empty() {
            debug!(%dispatch_id, recipients = recipients.len(), "nothing pending");
            return Ok(());
        }
        debug!(
            %dispatch_id,
            recipients = recipients.len(),
            pending = pending.len(),
            "fanning out"
        );

        self.deliver_all(dispatch_id, Arc::from(dispatch.message), pending)
            .await
    }
}
