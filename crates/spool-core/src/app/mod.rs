//! App - アプリケーション層
//!
//! ports を組み合わせてワーカーを組み立てる。
//!
//! # 主要コンポーネント
//! - **WorkerBuilder**: キューとハンドラの登録、起動前の検証
//! - **Worker / WorkerHandle**: ループの起動・停止・エラー集約
//! - **PollLoop**: キューごとの claim → dispatch → decide → resolve
//! - **Dispatcher**: ハンドラ呼び出し（panic / timeout の捕捉）
//! - **ReaperLoop**: 放置された staging エントリの回収

pub mod builder;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod poll_loop;
pub mod reaper_loop;
pub mod status;

pub use self::builder::{BuildError, Worker, WorkerBuilder};
pub use self::config::{ConfigError, WorkerConfig};
pub use self::controller::{ShutdownTrigger, WorkerHandle, run};
pub use self::dispatcher::Dispatcher;
pub use self::poll_loop::{LoopStats, PollLoop};
pub use self::reaper_loop::ReaperLoop;
pub use self::status::{WorkerReport, queue_status};
