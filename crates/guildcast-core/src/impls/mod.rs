//! Impls - ports の実装（開発用・テスト用）
//!
//! # 含まれる実装
//! - **InMemoryLedger**: DispatchLedger + ConsumptionLedger
//! - **StaticRecipientResolver**: 固定の guild 一覧
//! - **TracingDeliveryChannel** / **RecordingDeliveryChannel**
//! - **RecordingEventSink**
//!
//! # 本番用実装
//! 永続化は別クレートに配置します：
//! - `guildcast-sqlite`: SqliteLedger, SqliteTaskQueue

pub mod delivery;
pub mod events;
pub mod ledger;
pub mod recipients;

pub use self::delivery::{RecordingDeliveryChannel, TracingDeliveryChannel};
pub use self::events::RecordingEventSink;
pub use self::ledger::InMemoryLedger;
pub use self::recipients::StaticRecipientResolver;
