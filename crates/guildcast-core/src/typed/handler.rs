//! Handler trait - Task を実行する Handler の定義
//!
//! - 表層: `Handler<T>` は `T` しか受け取れない（型安全）
//! - 内部: `DynHandler` は object-safe で、`TypedHandler<T, H>` が型消去を担う

use async_trait::async_trait;
use std::marker::PhantomData;

use super::codec::ParameterCodec;
use super::task::Task;
use crate::domain::{GuildcastError, TaskKind, TaskRecord};

/// Ok = terminal success; Err is classified by `GuildcastError::kind` and the
/// queue retries or dead-letters accordingly.
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    async fn handle(&self, task: T) -> Result<(), GuildcastError>;
}

#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(&self, task: &TaskRecord) -> Result<(), GuildcastError>;
    fn kind(&self) -> TaskKind;
}

pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    async fn handle_dyn(&self, task: &TaskRecord) -> Result<(), GuildcastError> {
        let typed: T = ParameterCodec::decode(task.parameters())?;
        self.handler.handle(typed).await
    }

    fn kind(&self) -> TaskKind {
        T::KIND
    }
}
