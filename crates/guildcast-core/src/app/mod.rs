//! App - アプリケーション層
//!
//! ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **AppBuilder**: Handler の登録と起動時検証
//! - **Runtime**: task kind → Handler の振り分け
//! - **WorkerGroup**: claim → execute → ack/fail のループ
//! - **AlertPublisher** / **AlertFanOutHandler**: アラート配信

pub mod alerts;
pub mod builder;
pub mod runtime;
pub mod worker;

pub use self::alerts::{
    AlertDispatchTask, AlertFanOutHandler, AlertPublisher, FanOutSettings, PublishedAlert,
};
pub use self::builder::{App, AppBuilder, BuildError};
pub use self::runtime::Runtime;
pub use self::worker::{WorkerGroup, WorkerSettings};
