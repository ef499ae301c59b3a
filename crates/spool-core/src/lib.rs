//! spool-core
//!
//! Reliable consumption of named work queues: claim a task into staging,
//! dispatch it to a handler, then acknowledge, retry or dead-letter it.
//! Delivery is at-least-once.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, envelope, outcome, decision, errors）
//! - **ports**: 抽象化レイヤー（QueueStore, Clock, IdGenerator）
//! - **app**: ワーカー本体（builder, controller, poll_loop, dispatcher, reaper_loop, config）
//! - **typed**: ハンドラ API（TaskHandler, 型付き Handler<T>, Task）
//! - **impls**: QueueStore の実装（InMemoryStore、feature `redis` で RedisStore）

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod typed;

pub use crate::app::{BuildError, Worker, WorkerBuilder, WorkerConfig, WorkerHandle, WorkerReport, run};
pub use crate::domain::{Envelope, HandlerError, Outcome, Payload, StoreError, TaskId, WorkerError};
pub use crate::ports::QueueStore;
pub use crate::typed::{Handler, Task, TaskHandler, handler_fn};
