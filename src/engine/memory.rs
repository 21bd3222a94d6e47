//! In-process sorted store
//!
//! [`InMemorySortedStore`] implements the full [`SortedStore`] contract without
//! any external service: sorted cells, attachable summing combiners, batched
//! writers, regex filters and visibility enforcement. It backs the test suite
//! and the benches, and is a drop-in stand-in for the Redis store during
//! development.
//!
//! # Warning
//!
//! Everything lives in the process heap and is lost when the store is dropped.
//!
//! A scan materializes its matching cells when it is opened. The returned
//! stream is a snapshot: writes flushed afterwards are not seen, and memory
//! use grows with the size of the scanned range.
//!
//! # Combiner overflow
//!
//! Sums saturate at `i64::MAX` and `i64::MIN` instead of wrapping.
//!
//! # Combiner scopes
//!
//! Every write is kept as its own version. Combiners attached for
//! [`IteratorScope::Scan`] sum versions while reading, those attached for
//! [`IteratorScope::MinorCompaction`] pre-sum each flushed batch, and
//! [`InMemorySortedStore::compact`] collapses stored versions for tables with a
//! [`IteratorScope::MajorCompaction`] combiner.
//!
//! # Example
//!
//! ```rust
//! use rollup_tsdb::engine::memory::InMemorySortedStore;
//! use rollup_tsdb::engine::traits::SortedStore;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let store = InMemorySortedStore::new();
//! store.create_table("metrics", false).await.unwrap();
//! assert!(store.table_exists("metrics").await.unwrap());
//! # });
//! ```

use crate::engine::traits::{
    BatchWriter, BatchWriterConfig, Cell, CellStream, CombinerSetting, CompiledRegexFilter,
    IteratorScope, Key, Mutation, ScanSpec, SortedStore,
};
use crate::error::StoreError;
use crate::visibility::{Authorizations, ColumnVisibility};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// (row, family, qualifier, visibility)
type CellCoord = (String, String, String, String);

#[derive(Debug, Clone)]
struct Version {
    timestamp: i64,
    value: Bytes,
}

#[derive(Debug)]
struct MemoryTable {
    name: String,
    versioning: bool,
    /// Versions per coordinate, in write order
    cells: RwLock<BTreeMap<CellCoord, Vec<Version>>>,
    combiners: RwLock<Vec<(CombinerSetting, Vec<IteratorScope>)>>,
}

impl MemoryTable {
    fn new(name: &str, versioning: bool) -> Self {
        Self {
            name: name.to_string(),
            versioning,
            cells: RwLock::new(BTreeMap::new()),
            combiners: RwLock::new(Vec::new()),
        }
    }

    fn combines(&self, scope: IteratorScope, family: &str) -> bool {
        self.combiners
            .read()
            .iter()
            .any(|(setting, scopes)| scopes.contains(&scope) && setting.applies_to(family))
    }

    fn sum(&self, versions: &[Version]) -> Result<Version, StoreError> {
        let mut total: i64 = 0;
        let mut timestamp = i64::MIN;
        for version in versions {
            let value = std::str::from_utf8(&version.value)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(|| StoreError::CorruptValue {
                    table: self.name.clone(),
                    message: format!(
                        "non-numeric value {:?}",
                        String::from_utf8_lossy(&version.value)
                    ),
                })?;
            total = total.saturating_add(value);
            timestamp = timestamp.max(version.timestamp);
        }
        Ok(Version {
            timestamp,
            value: Bytes::from(total.to_string()),
        })
    }

    /// Apply a flushed batch
    fn apply(&self, mutations: Vec<Mutation>) -> Result<usize, StoreError> {
        let mut batch: BTreeMap<CellCoord, Vec<Version>> = BTreeMap::new();
        for mutation in mutations {
            for update in mutation.updates {
                batch
                    .entry((
                        mutation.row.clone(),
                        update.column_family,
                        update.column_qualifier,
                        update.visibility,
                    ))
                    .or_default()
                    .push(Version {
                        timestamp: update.timestamp,
                        value: update.value,
                    });
            }
        }

        // Pre-sum before touching the table so a bad value rejects the whole batch
        let mut prepared = Vec::with_capacity(batch.len());
        for (coord, versions) in batch {
            if versions.len() > 1 && self.combines(IteratorScope::MinorCompaction, &coord.1) {
                let combined = self.sum(&versions)?;
                prepared.push((coord, vec![combined]));
            } else {
                prepared.push((coord, versions));
            }
        }

        let mut written = 0;
        let mut cells = self.cells.write();
        for (coord, versions) in prepared {
            written += versions.len();
            let stored = cells.entry(coord).or_default();
            stored.extend(versions);
            if self.versioning && stored.len() > 1 {
                let newest = newest_first(stored).into_iter().next();
                stored.clear();
                stored.extend(newest);
            }
        }
        Ok(written)
    }
}

/// Versions sorted newest first; equal timestamps keep the later write first
fn newest_first(versions: &[Version]) -> Vec<Version> {
    let mut sorted: Vec<Version> = versions.iter().rev().cloned().collect();
    sorted.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    sorted
}

struct MemoryStoreStatsAtomic {
    mutations_written: AtomicU64,
    flushes: AtomicU64,
    scans: AtomicU64,
}

/// Snapshot of store activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStoreStats {
    /// Cell versions written by writers
    pub mutations_written: u64,
    /// Non-empty writer flushes
    pub flushes: u64,
    /// Scans opened
    pub scans: u64,
}

/// Sorted store held entirely in memory
pub struct InMemorySortedStore {
    tables: RwLock<HashMap<String, Arc<MemoryTable>>>,
    stats: Arc<MemoryStoreStatsAtomic>,
}

impl InMemorySortedStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            stats: Arc::new(MemoryStoreStatsAtomic {
                mutations_written: AtomicU64::new(0),
                flushes: AtomicU64::new(0),
                scans: AtomicU64::new(0),
            }),
        }
    }

    fn table(&self, name: &str) -> Result<Arc<MemoryTable>, StoreError> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::TableNotFound(name.to_string()))
    }

    /// Collapse stored versions of combined families into a single cell
    ///
    /// Only combiners attached for [`IteratorScope::MajorCompaction`] take part.
    /// Returns the number of versions removed.
    pub fn compact(&self, table: &str) -> Result<usize, StoreError> {
        let table = self.table(table)?;
        let mut cells = table.cells.write();

        let mut collapsed = Vec::new();
        for (coord, versions) in cells.iter() {
            if versions.len() > 1 && table.combines(IteratorScope::MajorCompaction, &coord.1) {
                collapsed.push((coord.clone(), table.sum(versions)?, versions.len() - 1));
            }
        }

        let mut removed = 0;
        for (coord, version, dropped) in collapsed {
            cells.insert(coord, vec![version]);
            removed += dropped;
        }

        debug!(table = %table.name, removed, "Compacted in-memory table");
        Ok(removed)
    }

    /// Number of stored cell versions in `table`
    pub fn version_count(&self, table: &str) -> Result<usize, StoreError> {
        Ok(self.table(table)?.cells.read().values().map(Vec::len).sum())
    }

    /// Activity counters
    pub fn stats(&self) -> MemoryStoreStats {
        MemoryStoreStats {
            mutations_written: self.stats.mutations_written.load(Ordering::Relaxed),
            flushes: self.stats.flushes.load(Ordering::Relaxed),
            scans: self.stats.scans.load(Ordering::Relaxed),
        }
    }
}

impl Default for InMemorySortedStore {
    fn default() -> Self {
        Self::new()
    }
}

fn scan_table(
    table: &MemoryTable,
    spec: &ScanSpec,
    filters: &[CompiledRegexFilter],
    auths: &Authorizations,
) -> Vec<Result<Cell, StoreError>> {
    let cells = table.cells.read();
    let lower = (
        spec.range.start().to_string(),
        String::new(),
        String::new(),
        String::new(),
    );

    let mut out = Vec::new();
    for ((row, family, qualifier, visibility), versions) in
        cells.range((Bound::Included(lower), Bound::Unbounded))
    {
        if row.as_str() > spec.range.end() {
            break;
        }
        if !spec.columns.matches(family, qualifier) {
            continue;
        }

        let key_for = |timestamp: i64| Key {
            row: row.clone(),
            column_family: family.clone(),
            column_qualifier: qualifier.clone(),
            visibility: visibility.clone(),
            timestamp,
        };

        // Labels are validated on write; an unparsable one is never visible
        let visible = ColumnVisibility::parse(visibility)
            .map(|vis| vis.evaluate(auths))
            .unwrap_or(false);
        if !visible {
            continue;
        }

        let passing: Vec<Version> = newest_first(versions)
            .into_iter()
            .filter(|v| filters.iter().all(|f| f.accepts(&key_for(v.timestamp), &v.value)))
            .collect();
        if passing.is_empty() {
            continue;
        }

        if table.combines(IteratorScope::Scan, family) {
            match table.sum(&passing) {
                Ok(combined) => out.push(Ok(Cell {
                    key: key_for(combined.timestamp),
                    value: combined.value,
                })),
                Err(e) => {
                    out.push(Err(e));
                    return out;
                },
            }
        } else {
            out.extend(passing.into_iter().map(|v| {
                Ok(Cell {
                    key: key_for(v.timestamp),
                    value: v.value,
                })
            }));
        }
    }
    out
}

#[async_trait]
impl SortedStore for InMemorySortedStore {
    fn store_id(&self) -> &str {
        "in-memory-sorted-v1"
    }

    async fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        Ok(self.tables.read().contains_key(table))
    }

    async fn create_table(&self, table: &str, versioning: bool) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if tables.contains_key(table) {
            return Err(StoreError::TableExists(table.to_string()));
        }
        tables.insert(table.to_string(), Arc::new(MemoryTable::new(table, versioning)));
        debug!(table, versioning, "Created in-memory table");
        Ok(())
    }

    async fn attach_combiner(
        &self,
        table: &str,
        setting: CombinerSetting,
        scopes: &[IteratorScope],
    ) -> Result<(), StoreError> {
        let table = self.table(table)?;
        let mut combiners = table.combiners.write();
        combiners.retain(|(existing, _)| existing.name != setting.name);
        combiners.push((setting, scopes.to_vec()));
        combiners.sort_by_key(|(s, _)| s.priority);
        Ok(())
    }

    async fn create_batch_writer(
        &self,
        table: &str,
        config: BatchWriterConfig,
    ) -> Result<Box<dyn BatchWriter>, StoreError> {
        let table = self.table(table)?;
        Ok(Box::new(InMemoryBatchWriter {
            table,
            config,
            state: Mutex::new(WriterState::default()),
            stats: Arc::clone(&self.stats),
        }))
    }

    async fn scan(
        &self,
        table: &str,
        spec: ScanSpec,
        auths: &Authorizations,
        _query_threads: usize,
    ) -> Result<CellStream, StoreError> {
        let table = self.table(table)?;
        let filters = spec.compile_filters()?;
        self.stats.scans.fetch_add(1, Ordering::Relaxed);

        let cells = scan_table(&table, &spec, &filters, auths);
        Ok(Box::pin(futures::stream::iter(cells)))
    }
}

#[derive(Default)]
struct WriterState {
    buffer: Vec<Mutation>,
    buffered_bytes: usize,
    oldest: Option<Instant>,
    closed: bool,
}

impl WriterState {
    fn take(&mut self) -> Vec<Mutation> {
        self.buffered_bytes = 0;
        self.oldest = None;
        std::mem::take(&mut self.buffer)
    }
}

/// Batch writer for one in-memory table
pub struct InMemoryBatchWriter {
    table: Arc<MemoryTable>,
    config: BatchWriterConfig,
    state: Mutex<WriterState>,
    stats: Arc<MemoryStoreStatsAtomic>,
}

impl InMemoryBatchWriter {
    fn write(&self, mutations: Vec<Mutation>) -> Result<(), StoreError> {
        if mutations.is_empty() {
            return Ok(());
        }
        let written = self.table.apply(mutations)?;
        self.stats
            .mutations_written
            .fetch_add(written as u64, Ordering::Relaxed);
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl BatchWriter for InMemoryBatchWriter {
    fn table(&self) -> &str {
        &self.table.name
    }

    async fn add_mutation(&self, mutation: Mutation) -> Result<(), StoreError> {
        let ready = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(StoreError::WriterClosed(self.table.name.clone()));
            }
            state.buffered_bytes += mutation.estimated_size();
            state.oldest.get_or_insert_with(Instant::now);
            state.buffer.push(mutation);

            let too_big = state.buffered_bytes >= self.config.max_memory;
            let too_old = state
                .oldest
                .is_some_and(|t| t.elapsed() >= self.config.max_latency);
            if too_big || too_old {
                Some(state.take())
            } else {
                None
            }
        };

        match ready {
            Some(mutations) => self.write(mutations),
            None => Ok(()),
        }
    }

    async fn flush(&self) -> Result<(), StoreError> {
        let mutations = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(StoreError::WriterClosed(self.table.name.clone()));
            }
            state.take()
        };
        self.write(mutations)
    }

    async fn close(&self) -> Result<(), StoreError> {
        let mutations = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(StoreError::WriterClosed(self.table.name.clone()));
            }
            state.closed = true;
            state.take()
        };
        self.write(mutations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::traits::{ColumnSelection, RegexFilter, RowRange};
    use futures::StreamExt;
    use std::time::Duration;

    fn put(row: &str, family: &str, qualifier: &str, vis: &str, ts: i64, value: &str) -> Mutation {
        let mut m = Mutation::new(row);
        m.put(family, qualifier, vis, ts, Bytes::copy_from_slice(value.as_bytes()));
        m
    }

    async fn collect(stream: CellStream) -> Vec<Cell> {
        stream.map(|c| c.unwrap()).collect().await
    }

    async fn store_with_table(combine_scopes: &[IteratorScope]) -> InMemorySortedStore {
        let store = InMemorySortedStore::new();
        store.create_table("t", false).await.unwrap();
        if !combine_scopes.is_empty() {
            store
                .attach_combiner(
                    "t",
                    CombinerSetting::sum(10, "stats", vec!["SUM".into()]),
                    combine_scopes,
                )
                .await
                .unwrap();
        }
        store
    }

    fn full_scan() -> ScanSpec {
        ScanSpec::new(RowRange::new("", "\u{10FFFF}").unwrap())
    }

    #[tokio::test]
    async fn test_create_table_twice() {
        let store = InMemorySortedStore::new();
        store.create_table("t", false).await.unwrap();
        let err = store.create_table("t", false).await.unwrap_err();
        assert!(matches!(err, StoreError::TableExists(_)));
    }

    #[tokio::test]
    async fn test_missing_table() {
        let store = InMemorySortedStore::new();
        assert!(!store.table_exists("nope").await.unwrap());
        let err = store
            .create_batch_writer("nope", BatchWriterConfig::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StoreError::TableNotFound(_)));
    }

    #[tokio::test]
    async fn test_scan_combines_versions() {
        let store = store_with_table(&IteratorScope::ALL).await;
        let writer = store
            .create_batch_writer("t", BatchWriterConfig::default())
            .await
            .unwrap();
        writer.add_mutation(put("r", "SUM", "q", "", 1, "5")).await.unwrap();
        writer.flush().await.unwrap();
        writer.add_mutation(put("r", "SUM", "q", "", 3, "7")).await.unwrap();
        writer.flush().await.unwrap();

        let cells = collect(store.scan("t", full_scan(), &Authorizations::empty(), 1).await.unwrap()).await;
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].value, Bytes::from_static(b"12"));
        assert_eq!(cells[0].key.timestamp, 3);
        assert_eq!(store.version_count("t").unwrap(), 2);
    }

    #[tokio::test]
    async fn test_sum_saturates() {
        let store = store_with_table(&IteratorScope::ALL).await;
        let writer = store
            .create_batch_writer("t", BatchWriterConfig::default())
            .await
            .unwrap();
        let max = i64::MAX.to_string();
        let min = i64::MIN.to_string();
        writer.add_mutation(put("hi", "SUM", "q", "", 1, &max)).await.unwrap();
        writer.add_mutation(put("lo", "SUM", "q", "", 1, &min)).await.unwrap();
        writer.flush().await.unwrap();
        writer.add_mutation(put("hi", "SUM", "q", "", 2, "1")).await.unwrap();
        writer.add_mutation(put("lo", "SUM", "q", "", 2, "-1")).await.unwrap();
        writer.flush().await.unwrap();

        let cells = collect(store.scan("t", full_scan(), &Authorizations::empty(), 1).await.unwrap()).await;
        assert_eq!(cells[0].key.row, "hi");
        assert_eq!(cells[0].value, Bytes::from(max.clone()));
        assert_eq!(cells[1].key.row, "lo");
        assert_eq!(cells[1].value, Bytes::from(min.clone()));

        // the same bound holds once versions are collapsed
        store.compact("t").unwrap();
        let cells = collect(store.scan("t", full_scan(), &Authorizations::empty(), 1).await.unwrap()).await;
        assert_eq!(cells[0].value, Bytes::from(max));
        assert_eq!(cells[1].value, Bytes::from(min));
    }

    #[tokio::test]
    async fn test_scan_is_snapshot_at_open() {
        let store = store_with_table(&IteratorScope::ALL).await;
        let writer = store
            .create_batch_writer("t", BatchWriterConfig::default())
            .await
            .unwrap();
        writer.add_mutation(put("a", "SUM", "q", "", 1, "1")).await.unwrap();
        writer.flush().await.unwrap();

        let stream = store.scan("t", full_scan(), &Authorizations::empty(), 1).await.unwrap();
        writer.add_mutation(put("a", "SUM", "q", "", 2, "10")).await.unwrap();
        writer.add_mutation(put("b", "SUM", "q", "", 2, "5")).await.unwrap();
        writer.flush().await.unwrap();

        let cells = collect(stream).await;
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].value, Bytes::from_static(b"1"));
    }

    #[tokio::test]
    async fn test_uncombined_family_keeps_versions() {
        let store = store_with_table(&IteratorScope::ALL).await;
        let writer = store
            .create_batch_writer("t", BatchWriterConfig::default())
            .await
            .unwrap();
        writer.add_mutation(put("r", "RAW", "q", "", 1, "a")).await.unwrap();
        writer.add_mutation(put("r", "RAW", "q", "", 2, "b")).await.unwrap();
        writer.close().await.unwrap();

        let cells = collect(store.scan("t", full_scan(), &Authorizations::empty(), 1).await.unwrap()).await;
        let values: Vec<_> = cells.iter().map(|c| c.value.clone()).collect();
        assert_eq!(values, vec![Bytes::from_static(b"b"), Bytes::from_static(b"a")]);
    }

    #[tokio::test]
    async fn test_minor_compaction_presums_batch() {
        let store = store_with_table(&[IteratorScope::MinorCompaction]).await;
        let writer = store
            .create_batch_writer("t", BatchWriterConfig::default())
            .await
            .unwrap();
        for _ in 0..3 {
            writer.add_mutation(put("r", "SUM", "q", "", 1, "2")).await.unwrap();
        }
        writer.flush().await.unwrap();
        assert_eq!(store.version_count("t").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_major_compaction() {
        let store = store_with_table(&[IteratorScope::Scan, IteratorScope::MajorCompaction]).await;
        let writer = store
            .create_batch_writer("t", BatchWriterConfig::default())
            .await
            .unwrap();
        for i in 0..4 {
            writer.add_mutation(put("r", "SUM", "q", "", i, "1")).await.unwrap();
        }
        writer.flush().await.unwrap();
        assert_eq!(store.version_count("t").unwrap(), 4);

        assert_eq!(store.compact("t").unwrap(), 3);
        assert_eq!(store.version_count("t").unwrap(), 1);

        let cells = collect(store.scan("t", full_scan(), &Authorizations::empty(), 1).await.unwrap()).await;
        assert_eq!(cells[0].value, Bytes::from_static(b"4"));
    }

    #[tokio::test]
    async fn test_versioning_keeps_latest() {
        let store = InMemorySortedStore::new();
        store.create_table("v", true).await.unwrap();
        let writer = store
            .create_batch_writer("v", BatchWriterConfig::default())
            .await
            .unwrap();
        writer.add_mutation(put("r", "F", "q", "", 5, "new")).await.unwrap();
        writer.add_mutation(put("r", "F", "q", "", 1, "old")).await.unwrap();
        writer.flush().await.unwrap();

        assert_eq!(store.version_count("v").unwrap(), 1);
        let cells = collect(store.scan("v", full_scan(), &Authorizations::empty(), 1).await.unwrap()).await;
        assert_eq!(cells[0].value, Bytes::from_static(b"new"));
    }

    #[tokio::test]
    async fn test_corrupt_value_fails_scan() {
        let store = store_with_table(&[IteratorScope::Scan]).await;
        let writer = store
            .create_batch_writer("t", BatchWriterConfig::default())
            .await
            .unwrap();
        writer.add_mutation(put("a", "SUM", "q", "", 1, "1")).await.unwrap();
        writer.add_mutation(put("b", "SUM", "q", "", 1, "x")).await.unwrap();
        writer.flush().await.unwrap();

        let results: Vec<_> = store
            .scan("t", full_scan(), &Authorizations::empty(), 1)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(StoreError::CorruptValue { .. })));
    }

    #[tokio::test]
    async fn test_range_and_columns() {
        let store = store_with_table(&[]).await;
        let writer = store
            .create_batch_writer("t", BatchWriterConfig::default())
            .await
            .unwrap();
        for row in ["a", "b", "c", "d"] {
            writer.add_mutation(put(row, "F", "x", "", 1, "1")).await.unwrap();
            writer.add_mutation(put(row, "G", "y", "", 1, "1")).await.unwrap();
        }
        writer.flush().await.unwrap();

        let mut spec = ScanSpec::new(RowRange::new("b", "c").unwrap());
        spec.columns = ColumnSelection::Family("G".into());
        let cells = collect(store.scan("t", spec, &Authorizations::empty(), 1).await.unwrap()).await;
        let rows: Vec<_> = cells.iter().map(|c| c.key.row.as_str()).collect();
        assert_eq!(rows, vec!["b", "c"]);
        assert!(cells.iter().all(|c| c.key.column_family == "G"));
    }

    #[tokio::test]
    async fn test_regex_filter() {
        let store = store_with_table(&[]).await;
        let writer = store
            .create_batch_writer("t", BatchWriterConfig::default())
            .await
            .unwrap();
        writer.add_mutation(put("r", "F", "keep\u{0}1", "", 1, "1")).await.unwrap();
        writer.add_mutation(put("r", "F", "drop\u{0}1", "", 1, "1")).await.unwrap();
        writer.flush().await.unwrap();

        let mut spec = full_scan();
        spec.filters.push(RegexFilter::qualifier(9, "regex", "keep\u{0}.*"));
        let cells = collect(store.scan("t", spec, &Authorizations::empty(), 1).await.unwrap()).await;
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].key.column_qualifier, "keep\u{0}1");
    }

    #[tokio::test]
    async fn test_visibility_enforced() {
        let store = store_with_table(&[]).await;
        let writer = store
            .create_batch_writer("t", BatchWriterConfig::default())
            .await
            .unwrap();
        writer.add_mutation(put("r", "F", "a", "", 1, "1")).await.unwrap();
        writer.add_mutation(put("r", "F", "b", "secret", 1, "1")).await.unwrap();
        writer.flush().await.unwrap();

        let public = collect(store.scan("t", full_scan(), &Authorizations::empty(), 1).await.unwrap()).await;
        assert_eq!(public.len(), 1);

        let auths = Authorizations::new(["secret"]).unwrap();
        let all = collect(store.scan("t", full_scan(), &auths, 1).await.unwrap()).await;
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_auto_flush_on_memory() {
        let store = store_with_table(&[]).await;
        let config = BatchWriterConfig {
            max_memory: 1,
            max_latency: Duration::from_secs(3600),
            max_write_threads: 1,
        };
        let writer = store.create_batch_writer("t", config).await.unwrap();
        writer.add_mutation(put("r", "F", "q", "", 1, "1")).await.unwrap();

        assert_eq!(store.version_count("t").unwrap(), 1);
        assert_eq!(store.stats().flushes, 1);
    }

    #[tokio::test]
    async fn test_buffered_until_flush() {
        let store = store_with_table(&[]).await;
        let config = BatchWriterConfig {
            max_memory: usize::MAX,
            max_latency: Duration::from_secs(3600),
            max_write_threads: 1,
        };
        let writer = store.create_batch_writer("t", config).await.unwrap();
        writer.add_mutation(put("r", "F", "q", "", 1, "1")).await.unwrap();
        assert_eq!(store.version_count("t").unwrap(), 0);

        writer.flush().await.unwrap();
        assert_eq!(store.version_count("t").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_closed_writer() {
        let store = store_with_table(&[]).await;
        let writer = store
            .create_batch_writer("t", BatchWriterConfig::default())
            .await
            .unwrap();
        writer.add_mutation(put("r", "F", "q", "", 1, "1")).await.unwrap();
        writer.close().await.unwrap();
        assert_eq!(store.version_count("t").unwrap(), 1);

        let err = writer.add_mutation(put("r", "F", "q", "", 1, "1")).await.unwrap_err();
        assert!(matches!(err, StoreError::WriterClosed(_)));
        assert!(matches!(writer.flush().await, Err(StoreError::WriterClosed(_))));
        assert!(matches!(writer.close().await, Err(StoreError::WriterClosed(_))));
    }
}
