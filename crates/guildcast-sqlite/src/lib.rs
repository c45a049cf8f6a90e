//! guildcast-sqlite
//!
//! SQLite での永続化。複数プロセスのワーカーが同じ DB ファイルを共有できます。
//!
//! - **db**: 接続とスキーマ作成
//! - **ledger**: DispatchLedger + ConsumptionLedger
//! - **queue**: TaskQueue（visibility timeout 付き claim、dead-letter テーブル）

pub mod db;
pub mod ledger;
pub mod queue;

pub use self::db::connect;
pub use self::ledger::SqliteLedger;
pub use self::queue::SqliteTaskQueue;
