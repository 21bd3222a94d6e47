//! [`SortedStore`] backed by Redis
//!
//! Rows live in a lexicographic sorted set so that row ranges map directly to
//! `ZRANGEBYLEX`. Each row's cells are a hash keyed by an unambiguous encoding
//! of (family, qualifier, visibility). Summing combiners are applied at write
//! time by the `put_cells` script with `HINCRBY`, which gives the same result
//! as combining at scan or compaction time.
//!
//! An uncombined cell keeps only the value with the newest cell timestamp;
//! a late write carrying an older timestamp is dropped. Combined sums clamp at
//! the 64-bit bounds, as the in-memory store does.

use super::connection::{RedisConfig, RedisPool};
use super::scripts::LuaScripts;
use crate::engine::traits::{
    BatchWriter, BatchWriterConfig, Cell, CellStream, CombinerSetting, CompiledRegexFilter,
    IteratorScope, Key, Mutation, ScanSpec, SortedStore,
};
use crate::error::StoreError;
use crate::visibility::{Authorizations, ColumnVisibility};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Redis key names for one namespace
#[derive(Debug, Clone)]
struct KeySpace {
    namespace: String,
}

impl KeySpace {
    fn tables(&self) -> String {
        format!("{}:tables", self.namespace)
    }

    fn table(&self, table: &str) -> TableKeys {
        TableKeys {
            prefix: format!("{}:t:{}", self.namespace, table),
        }
    }
}

#[derive(Debug, Clone)]
struct TableKeys {
    prefix: String,
}

impl TableKeys {
    fn meta(&self) -> String {
        format!("{}:meta", self.prefix)
    }

    fn rows(&self) -> String {
        format!("{}:rows", self.prefix)
    }

    fn cells(&self, row: &str) -> String {
        format!("{}:r:{}", self.prefix, row)
    }

    fn timestamps(&self, row: &str) -> String {
        format!("{}:ts:{}", self.prefix, row)
    }

    fn combiners(&self) -> String {
        format!("{}:combiners", self.prefix)
    }

    fn iterators(&self) -> String {
        format!("{}:iterators", self.prefix)
    }
}

/// Encode (family, qualifier, visibility) as `len:family` `len:qualifier` `visibility`
pub(crate) fn encode_field(family: &str, qualifier: &str, visibility: &str) -> String {
    format!(
        "{}:{}{}:{}{}",
        family.len(),
        family,
        qualifier.len(),
        qualifier,
        visibility
    )
}

/// Inverse of [`encode_field`]
pub(crate) fn decode_field(field: &str) -> Option<(&str, &str, &str)> {
    fn take_prefixed(input: &str) -> Option<(&str, &str)> {
        let (len, rest) = input.split_once(':')?;
        let len: usize = len.parse().ok()?;
        if !rest.is_char_boundary(len) || rest.len() < len {
            return None;
        }
        Some(rest.split_at(len))
    }

    let (family, rest) = take_prefixed(field)?;
    let (qualifier, visibility) = take_prefixed(rest)?;
    Some((family, qualifier, visibility))
}

/// Sorted store on a Redis server
pub struct RedisSortedStore {
    pool: Arc<RedisPool>,
    scripts: Arc<LuaScripts>,
    keys: KeySpace,
}

impl RedisSortedStore {
    /// Connect using `config`
    pub async fn connect(config: RedisConfig) -> Result<Self, StoreError> {
        let namespace = config.namespace.clone();
        let pool = RedisPool::new(config).await?;
        info!(namespace = %namespace, "Connected Redis sorted store");
        Ok(Self {
            pool: Arc::new(pool),
            scripts: Arc::new(LuaScripts::new()),
            keys: KeySpace { namespace },
        })
    }

    /// Underlying connection pool
    pub fn pool(&self) -> &RedisPool {
        &self.pool
    }

    async fn require_table(&self, table: &str) -> Result<TableKeys, StoreError> {
        if self.table_exists(table).await? {
            Ok(self.keys.table(table))
        } else {
            Err(StoreError::TableNotFound(table.to_string()))
        }
    }
}

#[async_trait]
impl SortedStore for RedisSortedStore {
    fn store_id(&self) -> &str {
        "redis-sorted-v1"
    }

    async fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        let tables = self.keys.tables();
        self.pool
            .execute(StoreError::Backend, |mut conn| {
                let tables = tables.clone();
                async move {
                    redis::cmd("SISMEMBER")
                        .arg(&tables)
                        .arg(table)
                        .query_async::<bool>(&mut conn)
                        .await
                }
            })
            .await
    }

    async fn create_table(&self, table: &str, versioning: bool) -> Result<(), StoreError> {
        let keys = self.keys.table(table);
        let (tables, meta) = (self.keys.tables(), keys.meta());
        let script = self.scripts.create_table();

        let created: i64 = self
            .pool
            .execute(StoreError::Backend, |mut conn| {
                let script = Arc::clone(&script);
                let (tables, meta) = (tables.clone(), meta.clone());
                async move {
                    script
                        .key(tables)
                        .key(meta)
                        .arg(table)
                        .arg(u8::from(versioning))
                        .invoke_async(&mut conn)
                        .await
                }
            })
            .await?;

        if created == 0 {
            return Err(StoreError::TableExists(table.to_string()));
        }
        debug!(table, versioning, "Created Redis table");
        Ok(())
    }

    async fn attach_combiner(
        &self,
        table: &str,
        setting: CombinerSetting,
        scopes: &[IteratorScope],
    ) -> Result<(), StoreError> {
        let keys = self.keys.table(table);
        let (tables, combiners, iterators) =
            (self.keys.tables(), keys.combiners(), keys.iterators());
        let json = serde_json::json!({ "setting": setting, "scopes": scopes }).to_string();
        let script = self.scripts.attach_combiner();

        let registered: i64 = self
            .pool
            .execute(StoreError::Backend, |mut conn| {
                let mut invocation = script.prepare_invoke();
                invocation
                    .key(&tables)
                    .key(&combiners)
                    .key(&iterators)
                    .arg(table)
                    .arg(&setting.name)
                    .arg(&json);
                for family in &setting.columns {
                    invocation.arg(family);
                }
                async move { invocation.invoke_async(&mut conn).await }
            })
            .await?;

        if registered < 0 {
            return Err(StoreError::TableNotFound(table.to_string()));
        }
        debug!(table, combiner = %setting.name, families = registered, "Attached combiner");
        Ok(())
    }

    async fn create_batch_writer(
        &self,
        table: &str,
        config: BatchWriterConfig,
    ) -> Result<Box<dyn BatchWriter>, StoreError> {
        let keys = self.require_table(table).await?;
        Ok(Box::new(RedisBatchWriter {
            table: table.to_string(),
            keys,
            pool: Arc::clone(&self.pool),
            scripts: Arc::clone(&self.scripts),
            config,
            state: Mutex::new(WriterState::default()),
        }))
    }

    async fn scan(
        &self,
        table: &str,
        spec: ScanSpec,
        auths: &Authorizations,
        query_threads: usize,
    ) -> Result<CellStream, StoreError> {
        let keys = self.require_table(table).await?;
        let filters = Arc::new(spec.compile_filters()?);

        let rows_key = keys.rows();
        let (start, end) = (
            format!("[{}", spec.range.start()),
            format!("[{}", spec.range.end()),
        );
        let rows: Vec<String> = self
            .pool
            .execute(StoreError::Backend, |mut conn| {
                let (rows_key, start, end) = (rows_key.clone(), start.clone(), end.clone());
                async move {
                    redis::cmd("ZRANGEBYLEX")
                        .arg(rows_key)
                        .arg(start)
                        .arg(end)
                        .query_async(&mut conn)
                        .await
                }
            })
            .await?;
        debug!(table, rows = rows.len(), "Opened Redis scan");

        let pool = Arc::clone(&self.pool);
        let spec = Arc::new(spec);
        let auths = auths.clone();

        let cells = stream::iter(rows)
            .map(move |row| {
                let fetch = RowFetch {
                    pool: Arc::clone(&pool),
                    keys: keys.clone(),
                    spec: Arc::clone(&spec),
                    filters: Arc::clone(&filters),
                    auths: auths.clone(),
                };
                async move { fetch.run(row).await }
            })
            .buffered(query_threads.max(1))
            .map_ok(|cells| stream::iter(cells.into_iter().map(Ok::<Cell, StoreError>)))
            .try_flatten();

        Ok(Box::pin(cells))
    }
}

/// Loads and filters the cells of one row
struct RowFetch {
    pool: Arc<RedisPool>,
    keys: TableKeys,
    spec: Arc<ScanSpec>,
    filters: Arc<Vec<CompiledRegexFilter>>,
    auths: Authorizations,
}

impl RowFetch {
    async fn run(self, row: String) -> Result<Vec<Cell>, StoreError> {
        let (cells_key, ts_key) = (self.keys.cells(&row), self.keys.timestamps(&row));
        let (values, stamps): (HashMap<String, Vec<u8>>, HashMap<String, i64>) = self
            .pool
            .execute(StoreError::Backend, |mut conn| {
                let (cells_key, ts_key) = (cells_key.clone(), ts_key.clone());
                async move {
                    redis::pipe()
                        .cmd("HGETALL")
                        .arg(cells_key)
                        .cmd("HGETALL")
                        .arg(ts_key)
                        .query_async(&mut conn)
                        .await
                }
            })
            .await?;

        let mut cells = Vec::with_capacity(values.len());
        for (field, value) in values {
            let (family, qualifier, visibility) =
                decode_field(&field).ok_or_else(|| StoreError::CorruptValue {
                    table: self.keys.prefix.clone(),
                    message: format!("undecodable cell field {:?} in row {:?}", field, row),
                })?;

            if !self.spec.columns.matches(family, qualifier) {
                continue;
            }
            let visible = ColumnVisibility::parse(visibility)
                .map(|vis| vis.evaluate(&self.auths))
                .unwrap_or(false);
            if !visible {
                continue;
            }

            let key = Key {
                row: row.clone(),
                column_family: family.to_string(),
                column_qualifier: qualifier.to_string(),
                visibility: visibility.to_string(),
                timestamp: stamps.get(&field).copied().unwrap_or_default(),
            };
            if self.filters.iter().all(|f| f.accepts(&key, &value)) {
                cells.push(Cell {
                    key,
                    value: Bytes::from(value),
                });
            }
        }
        cells.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(cells)
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

/// Batch writer that applies each row mutation with the `put_cells` script
pub struct RedisBatchWriter {
    table: String,
    keys: TableKeys,
    pool: Arc<RedisPool>,
    scripts: Arc<LuaScripts>,
    config: BatchWriterConfig,
    state: Mutex<WriterState>,
}

impl RedisBatchWriter {
    async fn put(&self, mutation: Mutation) -> Result<(), StoreError> {
        if mutation.updates.is_empty() {
            return Ok(());
        }
        let script = self.scripts.put_cells();
        let keys = [
            self.keys.rows(),
            self.keys.cells(&mutation.row),
            self.keys.timestamps(&mutation.row),
            self.keys.combiners(),
        ];

        let _: i64 = self
            .pool
            .execute(StoreError::MutationsRejected, |mut conn| {
                let mut invocation = script.prepare_invoke();
                for key in &keys {
                    invocation.key(key);
                }
                invocation.arg(&mutation.row);
                for update in &mutation.updates {
                    invocation
                        .arg(encode_field(
                            &update.column_family,
                            &update.column_qualifier,
                            &update.visibility,
                        ))
                        .arg(&update.column_family)
                        .arg(update.value.as_ref())
                        .arg(update.timestamp);
                }
                async move { invocation.invoke_async(&mut conn).await }
            })
            .await?;
        Ok(())
    }

    async fn write(&self, mutations: Vec<Mutation>) -> Result<(), StoreError> {
        if mutations.is_empty() {
            return Ok(());
        }
        let count = mutations.len();
        let start = Instant::now();

        stream::iter(mutations)
            .map(|m| self.put(m))
            .buffer_unordered(self.config.max_write_threads.max(1))
            .try_collect::<Vec<()>>()
            .await?;

        debug!(table = %self.table, mutations = count, elapsed = ?start.elapsed(), "Flushed Redis batch");
        Ok(())
    }
}

#[async_trait]
impl BatchWriter for RedisBatchWriter {
    fn table(&self) -> &str {
        &self.table
    }

    async fn add_mutation(&self, mutation: Mutation) -> Result<(), StoreError> {
        let ready = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(StoreError::WriterClosed(self.table.clone()));
            }
            state.buffered_bytes += mutation.estimated_size();
            state.oldest.get_or_insert_with(Instant::now);
            state.buffer.push(mutation);

            let full = state.buffered_bytes >= self.config.max_memory;
            let stale = state
                .oldest
                .is_some_and(|t| t.elapsed() >= self.config.max_latency);
            (full || stale).then(|| state.take())
        };

        match ready {
            Some(mutations) => self.write(mutations).await,
            None => Ok(()),
        }
    }

    async fn flush(&self) -> Result<(), StoreError> {
        let mutations = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(StoreError::WriterClosed(self.table.clone()));
            }
            state.take()
        };
        self.write(mutations).await
    }

    async fn close(&self) -> Result<(), StoreError> {
        let mutations = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(StoreError::WriterClosed(self.table.clone()));
            }
            state.closed = true;
            state.take()
        };
        self.write(mutations).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::traits::RowRange;

    /// Store in a fresh namespace on `ROLLUP_TEST_REDIS_URL` (default local server)
    async fn live_store() -> RedisSortedStore {
        let url = std::env::var("ROLLUP_TEST_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let namespace = format!("rollup-test-{}", rand::random::<u32>());
        RedisSortedStore::connect(RedisConfig::with_url(url).namespace(namespace))
            .await
            .expect("Redis server required; set ROLLUP_TEST_REDIS_URL")
    }

    fn put(row: &str, family: &str, ts: i64, value: &str) -> Mutation {
        let mut m = Mutation::new(row);
        m.put(family, "q", "", ts, Bytes::copy_from_slice(value.as_bytes()));
        m
    }

    async fn scan_all(store: &RedisSortedStore, table: &str) -> Vec<Cell> {
        let spec = ScanSpec::new(RowRange::new("", "\u{10FFFF}").unwrap());
        store
            .scan(table, spec, &Authorizations::empty(), 2)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap()
    }

    #[tokio::test]
    #[ignore] // requires a Redis server
    async fn test_live_stale_write_ignored() {
        let store = live_store().await;
        store.create_table("t", false).await.unwrap();
        let writer = store
            .create_batch_writer("t", BatchWriterConfig::default())
            .await
            .unwrap();
        writer.add_mutation(put("r", "PLAIN", 20, "new")).await.unwrap();
        writer.flush().await.unwrap();
        writer.add_mutation(put("r", "PLAIN", 10, "old")).await.unwrap();
        writer.close().await.unwrap();

        let cells = scan_all(&store, "t").await;
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].value, Bytes::from_static(b"new"));
        assert_eq!(cells[0].key.timestamp, 20);
    }

    #[tokio::test]
    #[ignore] // requires a Redis server
    async fn test_live_sum_saturates() {
        let store = live_store().await;
        store.create_table("t", false).await.unwrap();
        store
            .attach_combiner(
                "t",
                CombinerSetting::sum(10, "stats", vec!["SUM".into()]),
                &IteratorScope::ALL,
            )
            .await
            .unwrap();
        let writer = store
            .create_batch_writer("t", BatchWriterConfig::default())
            .await
            .unwrap();
        let (max, min) = (i64::MAX.to_string(), i64::MIN.to_string());
        writer.add_mutation(put("hi", "SUM", 1, &max)).await.unwrap();
        writer.add_mutation(put("lo", "SUM", 1, &min)).await.unwrap();
        writer.flush().await.unwrap();
        writer.add_mutation(put("hi", "SUM", 2, "1")).await.unwrap();
        writer.add_mutation(put("lo", "SUM", 2, "-1")).await.unwrap();
        writer.close().await.unwrap();

        let cells = scan_all(&store, "t").await;
        assert_eq!(cells[0].value, Bytes::from(max));
        assert_eq!(cells[1].value, Bytes::from(min));
        assert_eq!(cells[0].key.timestamp, 2);
    }

    #[test]
    fn test_field_round_trip() {
        for (family, qualifier, visibility) in [
            ("MINUTES", "g1\u{0}n1", ""),
            ("HOURS", "a:b", "admin|ops"),
            ("", "", ""),
            ("12:x", "3:", "4:vis"),
        ] {
            let field = encode_field(family, qualifier, visibility);
            assert_eq!(decode_field(&field), Some((family, qualifier, visibility)));
        }
    }

    #[test]
    fn test_decode_field_rejects_garbage() {
        assert_eq!(decode_field("nope"), None);
        assert_eq!(decode_field("9:short"), None);
        assert_eq!(decode_field("x:abc"), None);
    }

    #[test]
    fn test_key_names() {
        let keys = KeySpace {
            namespace: "rollup".to_string(),
        };
        assert_eq!(keys.tables(), "rollup:tables");
        let table = keys.table("metrics_reverse");
        assert_eq!(table.rows(), "rollup:t:metrics_reverse:rows");
        assert_eq!(table.cells("t1\u{0}797389"), "rollup:t:metrics_reverse:r:t1\u{0}797389");
        assert_eq!(table.timestamps("r"), "rollup:t:metrics_reverse:ts:r");
        assert_eq!(table.combiners(), "rollup:t:metrics_reverse:combiners");
        assert_eq!(table.meta(), "rollup:t:metrics_reverse:meta");
        assert_eq!(table.iterators(), "rollup:t:metrics_reverse:iterators");
    }
}
