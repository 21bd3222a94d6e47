//! The roll-up metric store
//!
//! [`RollupMetricStore`] ties the pieces together: it bootstraps the two index
//! tables with their summing combiner, fans `save` batches out through the
//! paired writers, and plans and decodes `query` scans.
//!
//! # Example
//!
//! ```rust
//! use rollup_tsdb::engine::memory::InMemorySortedStore;
//! use rollup_tsdb::query::MetricQuery;
//! use rollup_tsdb::types::{Metric, MetricTimeUnit};
//! use rollup_tsdb::visibility::Authorizations;
//! use rollup_tsdb::RollupMetricStore;
//! use futures::TryStreamExt;
//! use std::sync::Arc;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let store = RollupMetricStore::new(Arc::new(InMemorySortedStore::new())).await.unwrap();
//! store.save(vec![Metric::new(1_000, "g1", "t1", "n1", 5)]).await.unwrap();
//!
//! let query = MetricQuery::new(0, 2_000, "g1", "t1", Authorizations::empty())
//!     .with_name("n1")
//!     .with_unit(MetricTimeUnit::Minutes);
//! let results: Vec<Metric> = store.query(&query).await.unwrap().try_collect().await.unwrap();
//! assert_eq!(results.len(), 1);
//! assert_eq!(results[0].value, 5);
//! # });
//! ```

use crate::config::{BackendKind, RollupConfig, StoreConfig};
use crate::engine::memory::InMemorySortedStore;
use crate::engine::traits::{CombinerSetting, IteratorScope, SortedStore};
use crate::error::{Result, StoreError};
use crate::ingest::{encode_batch, MetricWriter};
use crate::metrics;
use crate::query::{MetricQuery, MetricStream, QueryPlanner};
use crate::redis::RedisSortedStore;
use crate::types::{Metric, MetricTimeUnit};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Base table name used when none is configured
pub const DEFAULT_TABLE_NAME: &str = "metrics";

/// Suffix of the type-index table
pub const REVERSE_SUFFIX: &str = "_reverse";

/// Registration name of the summing combiner
pub const COMBINER_NAME: &str = "stats";

/// Priority of the summing combiner
pub const COMBINER_PRIORITY: u32 = 10;

/// Dual-indexed roll-up store over a [`SortedStore`]
pub struct RollupMetricStore {
    store: Arc<dyn SortedStore>,
    config: StoreConfig,
    group_table: String,
    type_table: String,
    planner: QueryPlanner,
    writer: MetricWriter,
}

impl RollupMetricStore {
    /// Open with the default table name and batching parameters
    pub async fn new(store: Arc<dyn SortedStore>) -> Result<Self> {
        Self::with_config(store, DEFAULT_TABLE_NAME, StoreConfig::default()).await
    }

    /// Open with an explicit base table name and batching parameters
    ///
    /// Creates `table` (group index) and `table` + `_reverse` (type index)
    /// if they are missing, each with the summing combiner attached to every
    /// granularity family for all iterator scopes.
    pub async fn with_config(
        store: Arc<dyn SortedStore>,
        table: &str,
        config: StoreConfig,
    ) -> Result<Self> {
        config.validate()?;
        let group_table = table.to_string();
        let type_table = format!("{}{}", table, REVERSE_SUFFIX);

        for name in [&group_table, &type_table] {
            ensure_table(store.as_ref(), name).await?;
        }

        let writer_config = config.batch_writer_config();
        let writer = MetricWriter::new(
            store
                .create_batch_writer(&group_table, writer_config.clone())
                .await?,
            store.create_batch_writer(&type_table, writer_config).await?,
        );

        info!(
            backend = store.store_id(),
            group_table = %group_table,
            type_table = %type_table,
            "Roll-up metric store ready"
        );
        Ok(Self {
            planner: QueryPlanner::new(group_table.as_str(), type_table.as_str()),
            store,
            config,
            group_table,
            type_table,
            writer,
        })
    }

    /// Open the backend selected by `config`
    pub async fn from_config(config: &RollupConfig) -> Result<Self> {
        config.validate()?;
        let store: Arc<dyn SortedStore> = match config.backend.kind {
            BackendKind::Memory => Arc::new(InMemorySortedStore::new()),
            BackendKind::Redis => Arc::new(RedisSortedStore::connect(config.redis_config()).await?),
        };
        Self::with_config(store, &config.table.name, config.store.clone()).await
    }

    /// Write a batch of metrics, skipping `None` entries
    ///
    /// Every metric is encoded before anything is buffered, then both index
    /// writers are flushed. Returns the number of metrics written.
    pub async fn save<I>(&self, metrics: I) -> Result<usize>
    where
        I: IntoIterator,
        I::Item: Into<Option<Metric>>,
    {
        let start = Instant::now();
        let result = self.save_inner(metrics).await;

        let elapsed = start.elapsed().as_secs_f64();
        match &result {
            Ok((saved, skipped)) => metrics::record_save(*saved, *skipped, elapsed, true),
            Err(e) => {
                warn!(error = %e, "Save failed");
                metrics::record_save(0, 0, elapsed, false);
            },
        }
        result.map(|(saved, _)| saved)
    }

    async fn save_inner<I>(&self, metrics: I) -> Result<(usize, usize)>
    where
        I: IntoIterator,
        I::Item: Into<Option<Metric>>,
    {
        let batch = encode_batch(metrics)?;
        if batch.skipped > 0 {
            debug!(skipped = batch.skipped, "Skipped null metrics");
        }
        self.writer.write(batch.mutations).await?;
        Ok((batch.accepted, batch.skipped))
    }

    /// Open a lazy scan of aggregated metrics, newest bucket first
    pub async fn query(&self, query: &MetricQuery) -> Result<MetricStream> {
        let start = Instant::now();
        let plan = self.planner.plan(query)?;

        let cells = self
            .store
            .scan(
                &plan.table,
                plan.spec,
                &query.authorizations,
                self.config.max_query_threads,
            )
            .await?;

        metrics::record_query(
            plan.index.as_str(),
            plan.unit.label(),
            &plan.mode.to_string(),
            start.elapsed().as_secs_f64(),
        );
        debug!(
            table = %plan.table,
            unit = %plan.unit,
            mode = %plan.mode,
            "Opened metric scan"
        );
        Ok(MetricStream::new(cells, plan.unit, plan.index))
    }

    /// Flush and close both index writers
    ///
    /// Later `save` calls fail with [`StoreError::WriterClosed`]. Streams
    /// opened earlier are unaffected by this store but may be invalidated by
    /// the backend.
    pub async fn shutdown(&self) -> Result<()> {
        self.writer.close().await?;
        info!(group_table = %self.group_table, type_table = %self.type_table, "Roll-up metric store shut down");
        Ok(())
    }

    /// Group-index table name
    pub fn group_table(&self) -> &str {
        &self.group_table
    }

    /// Type-index table name
    pub fn type_table(&self) -> &str {
        &self.type_table
    }

    /// Batching and scan parameters
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The underlying sorted store
    pub fn sorted_store(&self) -> &Arc<dyn SortedStore> {
        &self.store
    }
}

/// Summing combiner over every granularity family
pub fn stats_combiner() -> CombinerSetting {
    CombinerSetting::sum(
        COMBINER_PRIORITY,
        COMBINER_NAME,
        MetricTimeUnit::ALL
            .iter()
            .map(|unit| unit.label().to_string())
            .collect(),
    )
}

/// Create `table` if needed and (re)attach the summing combiner
///
/// Attaching replaces any combiner of the same name, so an existing table
/// whose creator has not attached it yet is combined before the first write.
async fn ensure_table(store: &dyn SortedStore, table: &str) -> Result<()> {
    if !store.table_exists(table).await? {
        match store.create_table(table, false).await {
            Ok(()) => info!(table, "Created index table"),
            Err(StoreError::TableExists(_)) => debug!(table, "Index table created concurrently"),
            Err(e) => return Err(e.into()),
        }
    }
    store
        .attach_combiner(table, stats_combiner(), &IteratorScope::ALL)
        .await?;
    debug!(table, combiner = COMBINER_NAME, "Summing combiner attached");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::visibility::Authorizations;
    use futures::TryStreamExt;

    async fn memory_store() -> (Arc<InMemorySortedStore>, RollupMetricStore) {
        let backend = Arc::new(InMemorySortedStore::new());
        let store = RollupMetricStore::new(backend.clone()).await.unwrap();
        (backend, store)
    }

    #[tokio::test]
    async fn test_bootstrap_creates_both_tables() {
        let (backend, store) = memory_store().await;
        assert_eq!(store.group_table(), "metrics");
        assert_eq!(store.type_table(), "metrics_reverse");
        assert!(backend.table_exists("metrics").await.unwrap());
        assert!(backend.table_exists("metrics_reverse").await.unwrap());
    }

    #[tokio::test]
    async fn test_bootstrap_is_idempotent() {
        let backend = Arc::new(InMemorySortedStore::new());
        let first = RollupMetricStore::new(backend.clone()).await.unwrap();
        first.save(vec![Metric::new(1_000, "g", "t", "n", 2)]).await.unwrap();

        let second = RollupMetricStore::new(backend.clone()).await.unwrap();
        second.save(vec![Metric::new(1_000, "g", "t", "n", 3)]).await.unwrap();

        let query = MetricQuery::new(0, 1_000, "g", "t", Authorizations::empty()).with_name("n");
        let results: Vec<Metric> = second.query(&query).await.unwrap().try_collect().await.unwrap();
        assert_eq!(results[0].value, 5);
    }

    #[tokio::test]
    async fn test_existing_table_gets_combiner() {
        let backend = Arc::new(InMemorySortedStore::new());
        backend.create_table("metrics", false).await.unwrap();
        backend.create_table("metrics_reverse", false).await.unwrap();

        let store = RollupMetricStore::new(backend.clone()).await.unwrap();
        store.save(vec![Metric::new(1_000, "g", "t", "n", 2)]).await.unwrap();
        store.save(vec![Metric::new(1_000, "g", "t", "n", 3)]).await.unwrap();

        for query in [
            MetricQuery::new(0, 1_000, "g", "t", Authorizations::empty()).with_name("n"),
            MetricQuery::new(0, 1_000, "g", "t", Authorizations::empty())
                .with_name("n")
                .by_group(),
        ] {
            let results: Vec<Metric> = store.query(&query).await.unwrap().try_collect().await.unwrap();
            assert_eq!(results.len(), 1);
            assert_eq!(results[0].value, 5);
        }
    }

    #[tokio::test]
    async fn test_save_counts() {
        let (_, store) = memory_store().await;
        let saved = store
            .save(vec![None, Some(Metric::new(1, "g", "t", "n", 1)), None])
            .await
            .unwrap();
        assert_eq!(saved, 1);
    }

    #[tokio::test]
    async fn test_custom_table_name() {
        let backend = Arc::new(InMemorySortedStore::new());
        let store = RollupMetricStore::with_config(backend.clone(), "app", StoreConfig::default())
            .await
            .unwrap();
        assert_eq!(store.type_table(), "app_reverse");
        assert!(backend.table_exists("app_reverse").await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let backend = Arc::new(InMemorySortedStore::new());
        let config = StoreConfig {
            max_write_threads: 0,
            ..Default::default()
        };
        let result = RollupMetricStore::with_config(backend, "metrics", config).await;
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn test_shutdown_closes_writers() {
        let (_, store) = memory_store().await;
        store.shutdown().await.unwrap();
        let err = store
            .save(vec![Metric::new(1, "g", "t", "n", 1)])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Store(StoreError::WriterClosed(_))));
    }

    #[tokio::test]
    async fn test_from_config_memory_backend() {
        let mut config = RollupConfig::default();
        config.backend.kind = BackendKind::Memory;
        config.table.name = "cfg".into();
        let store = RollupMetricStore::from_config(&config).await.unwrap();
        assert_eq!(store.group_table(), "cfg");
        assert_eq!(store.sorted_store().store_id(), "in-memory-sorted-v1");
    }

    #[test]
    fn test_stats_combiner() {
        let combiner = stats_combiner();
        assert_eq!(combiner.priority, 10);
        assert_eq!(combiner.name, "stats");
        assert_eq!(combiner.columns, vec!["MINUTES", "HOURS", "DAYS", "MONTHS"]);
    }
}
