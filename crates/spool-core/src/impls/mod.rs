//! Impls - QueueStore の実装
//!
//! - **InMemoryStore**: テスト・デモ用
//! - **RedisStore**: 本番用（feature `redis`）

pub mod inmem_store;
#[cfg(feature = "redis")]
pub mod redis_store;

pub use self::inmem_store::InMemoryStore;
#[cfg(feature = "redis")]
pub use self::redis_store::RedisStore;
