//! Runtime - 登録済み Handler への振り分け
//!
//! キューから取り出した `TaskRecord` の kind を見て、対応する Handler を呼びます。
//! Handler が無い kind は設定ミスなので Permanent (Configuration) として扱います。

use std::sync::Arc;

use crate::domain::{GuildcastError, TaskRecord};
use crate::typed::TypedRegistry;

pub struct Runtime {
    registry: Arc<TypedRegistry>,
}

impl Runtime {
    pub fn new(registry: Arc<TypedRegistry>) -> Self {
        Self { registry }
    }

    /// Execute one task.
    pub async fn execute(&self, task: &TaskRecord) -> Result<(), GuildcastError> {
        let kind = task.kind();
        let handler = self.registry.get(kind).ok_or_else(|| {
            GuildcastError::Configuration(format!("no handler registered for task kind '{kind}'"))
        })?;

        handler.handle_dyn(task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ErrorKind, TaskKind, TaskParameters};
    use crate::typed::handler::fixtures::ReactionHandler;
    use crate::typed::task::fixtures::ReactionTask;

    #[tokio::test]
    async fn runtime_executes_registered_handler() {
        let mut registry = TypedRegistry::new();
        registry
            .register::<ReactionTask, _>(ReactionHandler::default())
            .unwrap();
        let rt = Runtime::new(Arc::new(registry));

        let parameters = TaskParameters::from([
            ("messageId".to_string(), "m1".to_string()),
            ("emoji".to_string(), "✅".to_string()),
        ]);
        rt.execute(&TaskRecord::new(TaskKind::AddReaction, parameters))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn runtime_errors_when_handler_missing() {
        let rt = Runtime::new(Arc::new(TypedRegistry::new()));

        let task = TaskRecord::new(TaskKind::ScheduledDelete, TaskParameters::new());
        let err = rt.execute(&task).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Permanent);
        assert!(err.to_string().contains("scheduledDelete"));
    }
}
