//! Read path: scan planning and cell decoding
//!
//! ```text
//! MetricQuery ──► QueryPlanner ──► ScanPlan ──► SortedStore::scan ──► MetricStream
//!                 (range, column,                                     (cell → Metric)
//!                  regex filter)
//! ```

pub mod decoder;
pub mod planner;

pub use decoder::{decode_cell, MetricStream};
pub use planner::{MetricQuery, QueryPlanner, ScanMode, ScanPlan};
