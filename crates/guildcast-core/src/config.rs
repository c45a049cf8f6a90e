//! Config - TOML 設定の読み込みと検証
//!
//! すべての項目にデフォルト値があるので、空ファイルでも起動できます。
//! `GUILDCAST_DATABASE_URL` が設定されていれば `storage.database_url` を上書きします。

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::app::{FanOutSettings, WorkerSettings};
use crate::domain::GuildcastError;
use crate::queue::{QueueSettings, RetryPolicy};

pub const DATABASE_URL_ENV: &str = "GUILDCAST_DATABASE_URL";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GuildcastConfig {
    pub queue: QueueConfig,
    pub fan_out: FanOutConfig,
    pub workers: WorkerConfig,
    pub storage: StorageConfig,
    pub recipients: RecipientsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    pub max_attempts: u32,
    pub visibility_timeout_secs: u64,
    pub retry_base_delay_ms: u64,
    pub retry_multiplier: f64,
    pub retry_max_delay_ms: u64,
    /// Random extra delay in `[0, retry_jitter_ms]` added to every backoff.
    pub retry_jitter_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            visibility_timeout_secs: 60,
            retry_base_delay_ms: 2_000,
            retry_multiplier: 2.0,
            retry_max_delay_ms: 300_000,
            retry_jitter_ms: 0,
        }
    }
}

impl QueueConfig {
    pub fn settings(&self) -> QueueSettings {
        QueueSettings {
            max_attempts: self.max_attempts,
            visibility_timeout: Duration::from_secs(self.visibility_timeout_secs),
            retry_policy: RetryPolicy {
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
                multiplier: self.retry_multiplier,
                max_delay: Duration::from_millis(self.retry_max_delay_ms),
                jitter: Duration::from_millis(self.retry_jitter_ms),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FanOutConfig {
    pub delivery_timeout_ms: u64,
    pub max_concurrent_deliveries: usize,
}

impl Default for FanOutConfig {
    fn default() -> Self {
        Self {
            delivery_timeout_ms: 10_000,
            max_concurrent_deliveries: 8,
        }
    }
}

impl FanOutConfig {
    pub fn settings(&self) -> FanOutSettings {
        FanOutSettings {
            delivery_timeout: Duration::from_millis(self.delivery_timeout_ms),
            max_concurrent_deliveries: self.max_concurrent_deliveries,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    pub count: usize,
    pub claim_wait_ms: u64,
    pub error_backoff_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 4,
            claim_wait_ms: 1_000,
            error_backoff_ms: 1_000,
        }
    }
}

impl WorkerConfig {
    pub fn settings(&self) -> WorkerSettings {
        WorkerSettings {
            claim_wait: Duration::from_millis(self.claim_wait_ms),
            error_backoff: Duration::from_millis(self.error_backoff_ms),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// `sqlite://...` URL. In-memory storage when unset.
    pub database_url: Option<String>,
}

/// Guilds a broadcast (no origin guild) is delivered to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecipientsConfig {
    pub guilds: Vec<String>,
}

impl GuildcastConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, GuildcastError> {
        toml::from_str(raw).map_err(|e| GuildcastError::Configuration(format!("invalid config: {e}")))
    }

    /// Read `path`, apply environment overrides, validate.
    pub fn load(path: &Path) -> Result<Self, GuildcastError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GuildcastError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a file.
    pub fn from_env() -> Result<Self, GuildcastError> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(DATABASE_URL_ENV).filter(|url| !url.trim().is_empty()) {
            self.storage.database_url = Some(url);
        }
    }

    pub fn validate(&self) -> Result<(), GuildcastError> {
        let invalid = |msg: &str| Err(GuildcastError::Configuration(msg.to_string()));

        if self.queue.max_attempts == 0 {
            return invalid("queue.max_attempts must be at least 1");
        }
        if self.queue.visibility_timeout_secs == 0 {
            return invalid("queue.visibility_timeout_secs must be positive");
        }
        if !(self.queue.retry_multiplier.is_finite() && self.queue.retry_multiplier >= 1.0) {
            return invalid("queue.retry_multiplier must be a finite number >= 1.0");
        }
        if self.queue.retry_max_delay_ms < self.queue.retry_base_delay_ms {
            return invalid("queue.retry_max_delay_ms must not be below retry_base_delay_ms");
        }
        if self.fan_out.max_concurrent_deliveries == 0 {
            return invalid("fan_out.max_concurrent_deliveries must be at least 1");
        }
        if self.fan_out.delivery_timeout_ms == 0 {
            return invalid("fan_out.delivery_timeout_ms must be positive");
        }
        if self.workers.count == 0 {
            return invalid("workers.count must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn empty_file_yields_defaults() {
        let config = GuildcastConfig::from_toml_str("").unwrap();
        assert_eq!(config, GuildcastConfig::default());
        config.validate().unwrap();
    }

    #[test]
    fn sections_override_defaults() {
        let config = GuildcastConfig::from_toml_str(
            r#"
            [queue]
            max_attempts = 3
            retry_base_delay_ms = 500

            [fan_out]
            max_concurrent_deliveries = 2

            [storage]
            database_url = "sqlite://guildcast.db"

            [recipients]
            guilds = ["111", "222"]
            "#,
        )
        .unwrap();

        let queue = config.queue.settings();
        assert_eq!(queue.max_attempts, 3);
        assert_eq!(queue.retry_policy.base_delay, Duration::from_millis(500));
        assert_eq!(queue.visibility_timeout, Duration::from_secs(60));
        assert_eq!(config.fan_out.settings().max_concurrent_deliveries, 2);
        assert_eq!(config.storage.database_url.as_deref(), Some("sqlite://guildcast.db"));
        assert_eq!(config.recipients.guilds, vec!["111", "222"]);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = GuildcastConfig::from_toml_str("[queue]\nmax_attemps = 3\n").unwrap_err();
        assert!(matches!(err, GuildcastError::Configuration(_)));
    }

    #[test]
    fn env_overrides_database_url() {
        let mut config = GuildcastConfig::default();
        config.apply_overrides(|key| {
            (key == DATABASE_URL_ENV).then(|| "sqlite::memory:".to_string())
        });
        assert_eq!(config.storage.database_url.as_deref(), Some("sqlite::memory:"));

        config.apply_overrides(|_| Some("   ".to_string()));
        assert_eq!(config.storage.database_url.as_deref(), Some("sqlite::memory:"));
    }

    #[rstest]
    #[case::zero_attempts("[queue]\nmax_attempts = 0")]
    #[case::zero_visibility("[queue]\nvisibility_timeout_secs = 0")]
    #[case::shrinking_backoff("[queue]\nretry_multiplier = 0.5")]
    #[case::cap_below_base("[queue]\nretry_base_delay_ms = 10\nretry_max_delay_ms = 5")]
    #[case::zero_concurrency("[fan_out]\nmax_concurrent_deliveries = 0")]
    #[case::zero_timeout("[fan_out]\ndelivery_timeout_ms = 0")]
    #[case::zero_workers("[workers]\ncount = 0")]
    fn validate_rejects(#[case] raw: &str) {
        let config = GuildcastConfig::from_toml_str(raw).unwrap();
        assert!(matches!(
            config.validate(),
            Err(GuildcastError::Configuration(_))
        ));
    }
}
