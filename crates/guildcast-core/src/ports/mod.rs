//! Ports - 抽象化レイヤー
//!
//! 各 trait は外部システム（ストレージ、テナント登録、チャットプラットフォーム）への
//! インターフェースです。コアはここに依存し、実装は差し替え可能です。
//!
//! - ledger の原子性はストレージ側が保証する（プロセス内ロックに頼らない）
//! - 配送や解決の失敗は GuildcastError で分類して返す

pub mod clock;
pub mod consumption_ledger;
pub mod delivery_channel;
pub mod dispatch_ledger;
pub mod event_sink;
pub mod id_generator;
pub mod recipient_resolver;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::consumption_ledger::ConsumptionLedger;
pub use self::delivery_channel::DeliveryChannel;
pub use self::dispatch_ledger::DispatchLedger;
pub use self::event_sink::{EventSink, TracingEventSink};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::recipient_resolver::RecipientResolver;
