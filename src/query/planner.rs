//! Query Planner - turns a metric query into a single range scan
//!
//! Reverse timestamps invert time order, so the *end* of the wall-clock window
//! becomes the lower row bound and *start* the upper one:
//!
//! ```text
//! range  = [ lead \0 revTS(end),  lead \0 revTS(start) ]      newest bucket first
//! family = unit label
//!
//! name given    → single column   (unit, other \0 name)
//! name omitted  → whole family + qualifier regex  other \0 .*   (priority 9, "regex")
//! ```
//!
//! `lead` is the type and `other` the group for [`IndexKind::ByType`] (the
//! default), and the other way round for [`IndexKind::ByGroup`].

use crate::codec::{combine, row_key, validate_identifier};
use crate::engine::traits::{ColumnSelection, RegexFilter, RowRange, ScanSpec};
use crate::error::{Error, Result};
use crate::types::{IndexKind, MetricTimeUnit, Timestamp};
use crate::visibility::Authorizations;
use std::fmt;

/// Priority of the query-side qualifier filter
pub const REGEX_FILTER_PRIORITY: u32 = 9;

/// Registration name of the query-side qualifier filter
pub const REGEX_FILTER_NAME: &str = "regex";

// ============================================================================
// Query
// ============================================================================

/// A roll-up query over one granularity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricQuery {
    /// Window start (epoch millis, inclusive bucket)
    pub start: Timestamp,
    /// Window end (epoch millis, inclusive bucket)
    pub end: Timestamp,
    /// Group identifier
    pub group: String,
    /// Metric type
    pub metric_type: String,
    /// Optional metric name; `None` returns every name in the group
    pub name: Option<String>,
    /// Granularity; `None` means minutes
    pub unit: Option<MetricTimeUnit>,
    /// Index table to scan
    pub index: IndexKind,
    /// Labels presented to the store
    pub authorizations: Authorizations,
}

impl MetricQuery {
    /// Query every name of `group`/`metric_type` at minute granularity
    pub fn new(
        start: Timestamp,
        end: Timestamp,
        group: impl Into<String>,
        metric_type: impl Into<String>,
        authorizations: Authorizations,
    ) -> Self {
        Self {
            start,
            end,
            group: group.into(),
            metric_type: metric_type.into(),
            name: None,
            unit: None,
            index: IndexKind::default(),
            authorizations,
        }
    }

    /// Restrict to one metric name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the granularity
    pub fn with_unit(mut self, unit: MetricTimeUnit) -> Self {
        self.unit = Some(unit);
        self
    }

    /// Serve the query from the group-index table
    pub fn by_group(mut self) -> Self {
        self.index = IndexKind::ByGroup;
        self
    }

    /// Effective granularity
    pub fn unit(&self) -> MetricTimeUnit {
        self.unit.unwrap_or_default()
    }
}

// ============================================================================
// Plan
// ============================================================================

/// How columns are selected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// One named column per row
    Point,
    /// Whole family, narrowed by the qualifier regex
    Regex,
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScanMode::Point => "point",
            ScanMode::Regex => "regex",
        })
    }
}

/// A planned scan
#[derive(Debug, Clone)]
pub struct ScanPlan {
    /// Table to scan
    pub table: String,
    /// Index the table belongs to
    pub index: IndexKind,
    /// Granularity being read
    pub unit: MetricTimeUnit,
    /// Column selection mode
    pub mode: ScanMode,
    /// Range, columns and filters
    pub spec: ScanSpec,
}

/// Builds [`ScanPlan`]s for a pair of index tables
#[derive(Debug, Clone)]
pub struct QueryPlanner {
    group_table: String,
    type_table: String,
}

impl QueryPlanner {
    /// Planner for the given group-index and type-index tables
    pub fn new(group_table: impl Into<String>, type_table: impl Into<String>) -> Self {
        Self {
            group_table: group_table.into(),
            type_table: type_table.into(),
        }
    }

    /// Validate `query` and build its scan
    ///
    /// Fails before any I/O on an inverted window, an identifier containing
    /// the key delimiter, or a timestamp outside the encodable range.
    pub fn plan(&self, query: &MetricQuery) -> Result<ScanPlan> {
        if query.start > query.end {
            return Err(Error::InvalidTimeRange {
                start: query.start,
                end: query.end,
            });
        }
        validate_identifier("group", &query.group)?;
        validate_identifier("type", &query.metric_type)?;
        if let Some(name) = &query.name {
            validate_identifier("name", name)?;
        }

        let unit = query.unit();
        let (table, lead, other) = match query.index {
            IndexKind::ByType => (&self.type_table, &query.metric_type, &query.group),
            IndexKind::ByGroup => (&self.group_table, &query.group, &query.metric_type),
        };

        let range = RowRange::new(
            row_key(lead, query.end, unit)?,
            row_key(lead, query.start, unit)?,
        )?;
        let mut spec = ScanSpec::new(range);

        let mode = match &query.name {
            Some(name) => {
                spec.columns = ColumnSelection::Column {
                    family: unit.label().to_string(),
                    qualifier: combine(&[other, name]),
                };
                ScanMode::Point
            },
            None => {
                spec.columns = ColumnSelection::Family(unit.label().to_string());
                spec.filters.push(RegexFilter::qualifier(
                    REGEX_FILTER_PRIORITY,
                    REGEX_FILTER_NAME,
                    qualifier_pattern(other),
                ));
                ScanMode::Regex
            },
        };

        Ok(ScanPlan {
            table: table.clone(),
            index: query.index,
            unit,
            mode,
            spec,
        })
    }
}

/// `identifier \0 <anything>`, with the identifier matched literally
fn qualifier_pattern(identifier: &str) -> String {
    format!("{}\\x00.*", regex::escape(identifier))
}
