//! AppBuilder - アプリケーションの構築とワイヤリング
//!
//! # Fail-fast 設計
//! - expect_kinds() で期待される task kind を登録
//! - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
//! - 不足があれば BuildError を返す（起動時に落とす）

use std::sync::Arc;

use super::runtime::Runtime;
use crate::domain::TaskKind;
use crate::typed::{Handler, RegistryError, Task, TypedRegistry};

/// # 使用例
/// ```ignore
/// let app = AppBuilder::new()
///     .register::<AlertDispatchTask, _>(fan_out)?
///     .expect_kinds(&[TaskKind::DispatchAlertMessage])
///     .build()?;
/// let runtime = Arc::new(app.into_runtime());
/// ```
pub struct AppBuilder {
    registry: TypedRegistry,
    expected_kinds: Option<Vec<TaskKind>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing task kinds: {0:?}. These kinds were expected but not registered.")]
    MissingTaskKinds(Vec<TaskKind>),
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            registry: TypedRegistry::new(),
            expected_kinds: None,
        }
    }

    pub fn register<T: Task, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register::<T, H>(handler)?;
        Ok(self)
    }

    pub fn expect_kinds(mut self, kinds: &[TaskKind]) -> Self {
        self.expected_kinds = Some(kinds.to_vec());
        self
    }

    pub fn build(self) -> Result<App, BuildError> {
        if let Some(expected_kinds) = &self.expected_kinds {
            let registered = self.registry.registered_kinds();
            let missing: Vec<TaskKind> = expected_kinds
                .iter()
                .filter(|kind| !registered.contains(kind))
                .copied()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingTaskKinds(missing));
            }
        }
        Ok(App {
            registry: self.registry,
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct App {
    pub registry: TypedRegistry,
}

impl App {
    pub fn into_runtime(self) -> Runtime {
        Runtime::new(Arc::new(self.registry))
    }
}
