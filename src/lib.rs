//! Rollup TSDB - dual-indexed metric roll-ups on a sorted key-value store
//!
//! Every saved metric is written eight times: once per granularity (minutes,
//! hours, days, months) into each of two index tables, one keyed by group and
//! one keyed by type. Row keys carry a reverse timestamp so range scans return
//! the newest bucket first, and a summing combiner folds repeated writes into
//! one aggregate per cell.
//!
//! - [`store::RollupMetricStore`] is the entry point: `save`, `query`, `shutdown`
//! - [`engine`] defines the sorted-store seam and an in-memory implementation
//! - [`redis`] implements the seam on Redis sorted sets and hashes
//! - [`codec`] owns the row key, qualifier and value encodings

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod engine;
pub mod error;
pub mod types;
pub mod visibility;

/// Prometheus metrics and telemetry
pub mod metrics;

/// Configuration management with TOML support
pub mod config;

/// Redis-backed sorted store
pub mod redis;

/// Encoding of metrics into index mutations and the paired writers
pub mod ingest;

/// Query planning and cell decoding
pub mod query;

/// The roll-up store facade
pub mod store;

pub use error::{Error, Result};
pub use query::{MetricQuery, MetricStream};
pub use store::RollupMetricStore;
pub use types::{IndexKind, Metric, MetricTimeUnit, Timestamp};
pub use visibility::Authorizations;
