//! Typed - ハンドラ API
//!
//! # 二層構造
//! - **表層（Typed）**: `Task` trait, `Handler<T>` trait - ペイロードを型で受け取る
//! - **内部（Dyn）**: `TaskHandler` trait - object-safe, ポーリングループが呼ぶ

pub mod handler;
pub mod registry;
pub mod task;

pub use self::handler::{Handler, HandlerFn, TaskHandler, TypedHandler, handler_fn};
pub use self::registry::{HandlerRegistry, RegistryError};
pub use self::task::{SubmitError, Task, submit_task, to_payload};
