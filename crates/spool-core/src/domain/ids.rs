//! Task identifiers.
//!
//! Producers may hand in any non-empty string as a task id. When they don't,
//! the store asks its [`IdGenerator`](crate::ports::IdGenerator) for one, which
//! renders a ULID behind the `task-` prefix.
//!
//! ## ULID の特性
//! - **時刻でソート可能**: 生成順序でソートできる
//! - **分散生成可能**: 調整なしで複数ワーカーから生成できる

use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

/// Prefix used for generated ids.
pub const GENERATED_ID_PREFIX: &str = "task-";

/// Opaque identifier of a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Render a ULID as a task id (`task-01H...`).
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(format!("{GENERATED_ID_PREFIX}{ulid}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}
