//! Redis implementation of the sorted store
//!
//! # Architecture
//!
//! ```text
//! Redis Schema (per namespace):
//! {ns}:tables                     → SET of table names
//! {ns}:t:{table}:meta             → HASH {versioning}
//! {ns}:t:{table}:rows             → ZSET of row keys (score 0, ordered by ZRANGEBYLEX)
//! {ns}:t:{table}:r:{row}          → HASH(cell field → value)
//! {ns}:t:{table}:ts:{row}         → HASH(cell field → newest cell timestamp)
//! {ns}:t:{table}:combiners        → HASH(column family → combiner name)
//! {ns}:t:{table}:iterators        → HASH(combiner name → JSON setting)
//! ```
//!
//! A cell field is `len:family` + `len:qualifier` + `visibility`.
//!
//! Keys are not hash-tagged, so a namespace must live on a single Redis node.
//!
//! # Example
//!
//! ```rust,no_run
//! use rollup_tsdb::redis::{RedisConfig, RedisSortedStore};
//! use rollup_tsdb::engine::traits::SortedStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = RedisSortedStore::connect(RedisConfig::with_url("redis://localhost:6379")).await?;
//! assert_eq!(store.store_id(), "redis-sorted-v1");
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod scripts;
pub mod store;
pub mod util;

pub use connection::{PoolMetricsSnapshot, RedisConfig, RedisPool, RetryPolicy};
pub use scripts::LuaScripts;
pub use store::{RedisBatchWriter, RedisSortedStore};
