//! DeliveryChannel 実装
//!
//! - TracingDeliveryChannel: 送信内容をログに出すだけ（開発用）
//! - RecordingDeliveryChannel: 送信を記録し、guild ごとに失敗や遅延を仕込める（テスト用）

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::domain::{GuildId, GuildcastError};
use crate::ports::DeliveryChannel;

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDeliveryChannel;

#[async_trait]
impl DeliveryChannel for TracingDeliveryChannel {
    async fn deliver(&self, guild_id: &GuildId, message: &str) -> Result<(), GuildcastError> {
        info!(%guild_id, message, "alert delivered");
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Script {
    failing: BTreeSet<GuildId>,
    delays: HashMap<GuildId, Duration>,
    delivered: Vec<(GuildId, String)>,
    attempts: HashMap<GuildId, u32>,
    in_flight: usize,
    max_in_flight: usize,
}

#[derive(Debug, Default)]
pub struct RecordingDeliveryChannel {
    script: Mutex<Script>,
}

impl RecordingDeliveryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_script<R>(&self, f: impl FnOnce(&mut Script) -> R) -> R {
        let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut script)
    }

    /// Deliveries to `guild_id` fail until `recover` is called.
    pub fn fail_for(&self, guild_id: impl Into<GuildId>) {
        let guild_id = guild_id.into();
        self.with_script(|s| {
            s.failing.insert(guild_id);
        });
    }

    pub fn recover(&self, guild_id: &GuildId) {
        self.with_script(|s| {
            s.failing.remove(guild_id);
        });
    }

    pub fn delay_for(&self, guild_id: impl Into<GuildId>, delay: Duration) {
        let guild_id = guild_id.into();
        self.with_script(|s| {
            s.delays.insert(guild_id, delay);
        });
    }

    /// Successful deliveries, in completion order.
    pub fn delivered(&self) -> Vec<(GuildId, String)> {
        self.with_script(|s| s.delivered.clone())
    }

    pub fn delivered_to(&self, guild_id: &GuildId) -> usize {
        self.with_script(|s| s.delivered.iter().filter(|(g, _)| g == guild_id).count())
    }

    /// Highest number of `deliver` calls observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.with_script(|s| s.max_in_flight)
    }

    /// Calls to `deliver`, successful or not.
    pub fn attempts_for(&self, guild_id: &GuildId) -> u32 {
        self.with_script(|s| s.attempts.get(guild_id).copied().unwrap_or(0))
    }
}

#[async_trait]
impl DeliveryChannel for RecordingDeliveryChannel {
    async fn deliver(&self, guild_id: &GuildId, message: &str) -> Result<(), GuildcastError> {
        let delay = self.with_script(|s| {
            *s.attempts.entry(guild_id.clone()).or_default() += 1;
            s.in_flight += 1;
            s.max_in_flight = s.max_in_flight.max(s.in_flight);
            s.delays.get(guild_id).copied()
        });
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.with_script(|s| {
            s.in_flight -= 1;
            if s.failing.contains(guild_id) {
                return Err(GuildcastError::DeliveryFailed {
                    guild_id: guild_id.clone(),
                    reason: "channel rejected the message".into(),
                });
            }
            s.delivered.push((guild_id.clone(), message.to_string()));
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_failures_and_recovery() {
        let channel = RecordingDeliveryChannel::new();
        let guild = GuildId::new("g1");
        channel.fail_for("g1");

        assert!(channel.deliver(&guild, "hi").await.is_err());
        channel.recover(&guild);
        channel.deliver(&guild, "hi").await.unwrap();

        assert_eq!(channel.attempts_for(&guild), 2);
        assert_eq!(channel.delivered_to(&guild), 1);
    }
}
