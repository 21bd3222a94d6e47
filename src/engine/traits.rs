//! Core trait definitions for the sorted key-value store collaborator
//!
//! The roll-up core needs four capabilities from its store: a sorted
//! row/family/qualifier/visibility cell model, a server-side summing combiner,
//! batched mutation writers, and range scans with regex filtering and
//! authorization enforcement. Anything implementing [`SortedStore`] can back a
//! [`RollupMetricStore`](crate::store::RollupMetricStore).

use crate::error::StoreError;
use crate::visibility::Authorizations;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::pin::Pin;
use std::time::Duration;

// =============================================================================
// Cell model
// =============================================================================

/// Fully qualified cell coordinate
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    /// Row key
    pub row: String,
    /// Column family
    pub column_family: String,
    /// Column qualifier
    pub column_qualifier: String,
    /// Visibility expression
    pub visibility: String,
    /// Cell timestamp (epoch millis)
    pub timestamp: i64,
}

impl Ord for Key {
    /// Row, family, qualifier and visibility ascending; newest timestamp first
    fn cmp(&self, other: &Self) -> Ordering {
        self.row
            .cmp(&other.row)
            .then_with(|| self.column_family.cmp(&other.column_family))
            .then_with(|| self.column_qualifier.cmp(&other.column_qualifier))
            .then_with(|| self.visibility.cmp(&other.visibility))
            .then_with(|| other.timestamp.cmp(&self.timestamp))
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A key with its value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    /// Cell coordinate
    pub key: Key,
    /// Raw value
    pub value: Bytes,
}

/// One column write inside a [`Mutation`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnUpdate {
    /// Column family
    pub column_family: String,
    /// Column qualifier
    pub column_qualifier: String,
    /// Visibility expression
    pub visibility: String,
    /// Cell timestamp (epoch millis)
    pub timestamp: i64,
    /// Raw value
    pub value: Bytes,
}

/// All column writes for a single row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    /// Row key
    pub row: String,
    /// Column writes
    pub updates: Vec<ColumnUpdate>,
}

impl Mutation {
    /// Start a mutation for `row`
    pub fn new(row: impl Into<String>) -> Self {
        Self {
            row: row.into(),
            updates: Vec::new(),
        }
    }

    /// Add a column write
    pub fn put(
        &mut self,
        column_family: impl Into<String>,
        column_qualifier: impl Into<String>,
        visibility: impl Into<String>,
        timestamp: i64,
        value: Bytes,
    ) -> &mut Self {
        self.updates.push(ColumnUpdate {
            column_family: column_family.into(),
            column_qualifier: column_qualifier.into(),
            visibility: visibility.into(),
            timestamp,
            value,
        });
        self
    }

    /// Approximate buffered size, used for writer memory accounting
    pub fn estimated_size(&self) -> usize {
        self.row.len()
            + self
                .updates
                .iter()
                .map(|u| {
                    u.column_family.len()
                        + u.column_qualifier.len()
                        + u.visibility.len()
                        + u.value.len()
                        + std::mem::size_of::<i64>()
                })
                .sum::<usize>()
    }
}

// =============================================================================
// Server-side iterators
// =============================================================================

/// When a server-side iterator runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IteratorScope {
    /// While scanning
    Scan,
    /// When in-memory writes are flushed
    MinorCompaction,
    /// When stored versions are rewritten
    MajorCompaction,
}

impl IteratorScope {
    /// All scopes
    pub const ALL: [IteratorScope; 3] = [
        IteratorScope::Scan,
        IteratorScope::MinorCompaction,
        IteratorScope::MajorCompaction,
    ];
}

/// Aggregation applied by a combiner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombinerKind {
    /// Sum decimal-string encoded `i64` values
    Sum,
}

/// Combiner registration for a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombinerSetting {
    /// Lower priorities run closer to the data
    pub priority: u32,
    /// Registration name
    pub name: String,
    /// Column families the combiner applies to
    pub columns: Vec<String>,
    /// Aggregation
    pub kind: CombinerKind,
}

impl CombinerSetting {
    /// Summing combiner over `columns`
    pub fn sum(priority: u32, name: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            priority,
            name: name.into(),
            columns,
            kind: CombinerKind::Sum,
        }
    }

    /// Whether the combiner covers `column_family`
    pub fn applies_to(&self, column_family: &str) -> bool {
        self.columns.iter().any(|c| c == column_family)
    }
}

// =============================================================================
// Scans
// =============================================================================

/// Inclusive row range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowRange {
    start: String,
    end: String,
}

impl RowRange {
    /// Build a range covering every row in `[start, end]`
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Result<Self, StoreError> {
        let (start, end) = (start.into(), end.into());
        if start > end {
            return Err(StoreError::InvalidRange(format!(
                "start row {:?} sorts after end row {:?}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// First row
    pub fn start(&self) -> &str {
        &self.start
    }

    /// Last row
    pub fn end(&self) -> &str {
        &self.end
    }

    /// Whether `row` falls inside the range
    pub fn contains(&self, row: &str) -> bool {
        row >= self.start.as_str() && row <= self.end.as_str()
    }
}

/// Which columns a scan returns
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ColumnSelection {
    /// Every column
    #[default]
    All,
    /// Every qualifier in one family
    Family(String),
    /// A single family/qualifier pair
    Column {
        /// Column family
        family: String,
        /// Column qualifier
        qualifier: String,
    },
}

impl ColumnSelection {
    /// Whether a cell's column is selected
    pub fn matches(&self, family: &str, qualifier: &str) -> bool {
        match self {
            ColumnSelection::All => true,
            ColumnSelection::Family(f) => f == family,
            ColumnSelection::Column {
                family: f,
                qualifier: q,
            } => f == family && q == qualifier,
        }
    }
}

/// Regular expression filter over key parts
///
/// Each pattern must match its whole key part. Unset parts are ignored; a
/// filter with only a qualifier pattern keeps cells whose qualifier matches.
#[derive(Debug, Clone, Default)]
pub struct RegexFilter {
    /// Iterator priority
    pub priority: u32,
    /// Registration name
    pub name: String,
    /// Row pattern
    pub row: Option<String>,
    /// Column family pattern
    pub family: Option<String>,
    /// Column qualifier pattern
    pub qualifier: Option<String>,
    /// Value pattern
    pub value: Option<String>,
}

impl RegexFilter {
    /// Filter on the column qualifier only
    pub fn qualifier(priority: u32, name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            priority,
            name: name.into(),
            qualifier: Some(pattern.into()),
            ..Default::default()
        }
    }

    /// Compile the patterns, anchored to whole-part matches
    pub fn compile(&self) -> Result<CompiledRegexFilter, StoreError> {
        let compile = |pattern: &Option<String>| -> Result<Option<Regex>, StoreError> {
            pattern
                .as_deref()
                .map(|p| {
                    Regex::new(&format!("^(?s:{})$", p)).map_err(|e| {
                        StoreError::InvalidFilter(format!("{}: {}", self.name, e))
                    })
                })
                .transpose()
        };

        Ok(CompiledRegexFilter {
            row: compile(&self.row)?,
            family: compile(&self.family)?,
            qualifier: compile(&self.qualifier)?,
            value: compile(&self.value)?,
        })
    }
}

/// A [`RegexFilter`] ready to evaluate
#[derive(Debug, Clone)]
pub struct CompiledRegexFilter {
    row: Option<Regex>,
    family: Option<Regex>,
    qualifier: Option<Regex>,
    value: Option<Regex>,
}

impl CompiledRegexFilter {
    /// Whether the cell passes every configured pattern
    pub fn accepts(&self, key: &Key, value: &[u8]) -> bool {
        let check = |re: &Option<Regex>, text: &str| re.as_ref().map_or(true, |r| r.is_match(text));
        check(&self.row, &key.row)
            && check(&self.family, &key.column_family)
            && check(&self.qualifier, &key.column_qualifier)
            && check(&self.value, &String::from_utf8_lossy(value))
    }
}

/// Everything a store needs to execute one scan
#[derive(Debug, Clone)]
pub struct ScanSpec {
    /// Rows to visit
    pub range: RowRange,
    /// Columns to return
    pub columns: ColumnSelection,
    /// Server-side filters, applied in priority order
    pub filters: Vec<RegexFilter>,
}

impl ScanSpec {
    /// Scan every column in `range`
    pub fn new(range: RowRange) -> Self {
        Self {
            range,
            columns: ColumnSelection::All,
            filters: Vec::new(),
        }
    }

    /// Compile the filters in priority order
    pub fn compile_filters(&self) -> Result<Vec<CompiledRegexFilter>, StoreError> {
        let mut filters: Vec<&RegexFilter> = self.filters.iter().collect();
        filters.sort_by_key(|f| f.priority);
        filters.into_iter().map(RegexFilter::compile).collect()
    }
}

/// Stream of scanned cells in key order
pub type CellStream = Pin<Box<dyn Stream<Item = Result<Cell, StoreError>> + Send>>;

// =============================================================================
// Writers
// =============================================================================

/// Batching parameters for one writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchWriterConfig {
    /// Buffered bytes that trigger a flush
    pub max_memory: usize,
    /// Age of the oldest buffered mutation that triggers a flush
    pub max_latency: Duration,
    /// Concurrent write operations during a flush
    pub max_write_threads: usize,
}

impl Default for BatchWriterConfig {
    fn default() -> Self {
        Self {
            max_memory: 100_000,
            max_latency: Duration::from_millis(100),
            max_write_threads: 10,
        }
    }
}

/// Batched mutation writer for one table
///
/// Implementations synchronize internally; the core shares one writer per
/// table across callers without adding locks of its own.
#[async_trait]
pub trait BatchWriter: Send + Sync {
    /// Table this writer targets
    fn table(&self) -> &str;

    /// Buffer a mutation, flushing first if the batching limits are reached
    async fn add_mutation(&self, mutation: Mutation) -> Result<(), StoreError>;

    /// Push every buffered mutation to the store
    async fn flush(&self) -> Result<(), StoreError>;

    /// Flush and release the writer; later calls fail with `WriterClosed`
    async fn close(&self) -> Result<(), StoreError>;
}

// =============================================================================
// SortedStore Trait
// =============================================================================

/// Sorted, combiner-capable key-value store
#[async_trait]
pub trait SortedStore: Send + Sync + 'static {
    /// Unique identifier for this store implementation
    fn store_id(&self) -> &str;

    /// Whether `table` exists
    async fn table_exists(&self, table: &str) -> Result<bool, StoreError>;

    /// Create `table`; with `versioning` off every written version is kept
    async fn create_table(&self, table: &str, versioning: bool) -> Result<(), StoreError>;

    /// Attach a combiner to `table` for the given scopes
    async fn attach_combiner(
        &self,
        table: &str,
        setting: CombinerSetting,
        scopes: &[IteratorScope],
    ) -> Result<(), StoreError>;

    /// Open a batched writer on `table`
    async fn create_batch_writer(
        &self,
        table: &str,
        config: BatchWriterConfig,
    ) -> Result<Box<dyn BatchWriter>, StoreError>;

    /// Scan `table`, returning only cells visible under `auths`
    async fn scan(
        &self,
        table: &str,
        spec: ScanSpec,
        auths: &Authorizations,
        query_threads: usize,
    ) -> Result<CellStream, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(row: &str, cf: &str, cq: &str, ts: i64) -> Key {
        Key {
            row: row.to_string(),
            column_family: cf.to_string(),
            column_qualifier: cq.to_string(),
            visibility: String::new(),
            timestamp: ts,
        }
    }

    #[test]
    fn test_key_ordering() {
        assert!(key("a", "x", "q", 0) < key("b", "a", "a", 0));
        assert!(key("a", "x", "a", 0) < key("a", "x", "b", 0));
        // newer versions first
        assert!(key("a", "x", "q", 10) < key("a", "x", "q", 5));
    }

    #[test]
    fn test_row_range() {
        let range = RowRange::new("b", "d").unwrap();
        assert!(range.contains("b"));
        assert!(range.contains("c\u{0}zzz"));
        assert!(range.contains("d"));
        assert!(!range.contains("d\u{0}1"));
        assert!(!range.contains("a"));
        assert!(RowRange::new("d", "b").is_err());
    }

    #[test]
    fn test_column_selection() {
        assert!(ColumnSelection::All.matches("F", "q"));
        assert!(ColumnSelection::Family("F".into()).matches("F", "q"));
        assert!(!ColumnSelection::Family("F".into()).matches("G", "q"));
        let column = ColumnSelection::Column {
            family: "F".into(),
            qualifier: "q".into(),
        };
        assert!(column.matches("F", "q"));
        assert!(!column.matches("F", "r"));
    }

    #[test]
    fn test_regex_filter_full_match() {
        let filter = RegexFilter::qualifier(9, "regex", "g1\u{0}.*").compile().unwrap();
        assert!(filter.accepts(&key("r", "F", "g1\u{0}name", 0), b"1"));
        assert!(filter.accepts(&key("r", "F", "g1\u{0}line\nbreak", 0), b"1"));
        assert!(!filter.accepts(&key("r", "F", "g10\u{0}name", 0), b"1"));
        assert!(!filter.accepts(&key("r", "F", "xg1\u{0}name", 0), b"1"));
    }

    #[test]
    fn test_invalid_regex() {
        let result = RegexFilter::qualifier(9, "regex", "(").compile();
        assert!(matches!(result, Err(StoreError::InvalidFilter(_))));
    }

    #[test]
    fn test_mutation_size() {
        let mut m = Mutation::new("row");
        m.put("F", "q", "", 1, Bytes::from_static(b"10"));
        assert_eq!(m.estimated_size(), 3 + 1 + 1 + 2 + 8);
    }

    #[test]
    fn test_combiner_setting() {
        let setting = CombinerSetting::sum(10, "stats", vec!["MINUTES".into()]);
        assert!(setting.applies_to("MINUTES"));
        assert!(!setting.applies_to("HOURS"));
    }
}
