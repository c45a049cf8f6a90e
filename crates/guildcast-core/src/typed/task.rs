//! Task trait - 型付き Task の定義
//!
//! `TaskKind` と Rust の型を 1:1 で対応付け、パラメータ袋（文字列→文字列）との
//! 変換は `ParameterCodec` に任せます。

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::TaskKind;

/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct AlertDispatchTask {
///     #[serde(rename = "dispatchId")]
///     dispatch_id: DispatchId,
/// }
///
/// impl Task for AlertDispatchTask {
///     const KIND: TaskKind = TaskKind::DispatchAlertMessage;
/// }
/// ```
///
/// Fields must serialize to strings (or be optional and absent); the queue
/// stores parameters as a string map.
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: TaskKind;
}

#[cfg(test)]
pub(crate) mod fixtures {
    use serde::{Deserialize, Serialize};

    use super::Task;
    use crate::domain::TaskKind;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct ReactionTask {
        #[serde(rename = "messageId")]
        pub message_id: String,
        pub emoji: String,
    }

    impl Task for ReactionTask {
        const KIND: TaskKind = TaskKind::AddReaction;
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct DeleteTask {
        #[serde(rename = "messageId")]
        pub message_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub reason: Option<String>,
    }

    impl Task for DeleteTask {
        const KIND: TaskKind = TaskKind::ScheduledDelete;
    }
}
