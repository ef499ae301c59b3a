//! HandlerRegistry - キュー名 → ハンドラの対応表
//!
//! `Arc<dyn TaskHandler>` をキュー名で管理する。型付きハンドラは
//! `TypedHandler` でラップして同じ表に入れる。

use std::collections::BTreeMap;
use std::sync::Arc;

use super::handler::{Handler, TaskHandler, TypedHandler};
use super::task::Task;
use crate::ports::validate_queue_name;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("a handler for queue '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("invalid queue name '{0}': must be non-empty and contain no ':' or whitespace")]
    InvalidQueueName(String),
}

/// One handler per queue. Iteration order is by queue name.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        queue: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), RegistryError> {
        let queue = queue.into();
        if validate_queue_name(&queue).is_err() {
            return Err(RegistryError::InvalidQueueName(queue));
        }
        if self.handlers.contains_key(&queue) {
            return Err(RegistryError::AlreadyRegistered(queue));
        }
        self.handlers.insert(queue, handler);
        Ok(())
    }

    /// Register a typed handler on `T::QUEUE`.
    pub fn register<T: Task, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        self.insert(T::QUEUE, Arc::new(TypedHandler::new(handler)))
    }

    pub fn get(&self, queue: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(queue).cloned()
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn TaskHandler>)> {
        self.handlers.iter()
    }
}
