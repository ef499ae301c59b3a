//! Ports - 抽象化レイヤー
//!
//! 外部システム（Redis などのブローカー、時計、ID 生成）へのインターフェース。
//! ワーカー本体はこれらの trait にだけ依存し、実装は `impls` に置きます。

pub mod clock;
pub mod id_generator;
pub mod queue_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::queue_store::{
    Claimed, DeadLetter, Lease, QueueDepths, QueueKeys, QueueStore, validate_queue_name,
};
