//! Write fan-out
//!
//! Every accepted metric becomes eight mutations: one per [`MetricTimeUnit`]
//! in each of the two index tables.
//!
//! ```text
//! table           row                       family   qualifier        value
//! group index     group \0 revTS(unit)      UNIT     type \0 name     value
//! type index      type  \0 revTS(unit)      UNIT     group \0 name    value
//! ```
//!
//! Repeated writes to the same cell are summed by the store's combiner.
//! A whole batch is encoded before anything is buffered, so an invalid
//! metric rejects the batch without partial writes.

use crate::codec::{combine, encode_value, row_key, validate_identifier};
use crate::engine::traits::{BatchWriter, Mutation};
use crate::error::Result;
use crate::metrics;
use crate::types::{IndexKind, Metric, MetricTimeUnit};
use crate::visibility::ColumnVisibility;
use tracing::debug;

/// Mutations for both index tables
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexMutations {
    /// Group-index table mutations
    pub by_group: Vec<Mutation>,
    /// Type-index table mutations
    pub by_type: Vec<Mutation>,
}

impl IndexMutations {
    /// Mutations destined for `index`
    pub fn for_index(&self, index: IndexKind) -> &[Mutation] {
        match index {
            IndexKind::ByGroup => &self.by_group,
            IndexKind::ByType => &self.by_type,
        }
    }

    /// Total mutation count across both tables
    pub fn len(&self) -> usize {
        self.by_group.len() + self.by_type.len()
    }

    /// True when nothing was encoded
    pub fn is_empty(&self) -> bool {
        self.by_group.is_empty() && self.by_type.is_empty()
    }
}

/// An encoded `save` batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodedBatch {
    /// Mutations for both tables
    pub mutations: IndexMutations,
    /// Metrics encoded
    pub accepted: usize,
    /// Null entries skipped
    pub skipped: usize,
}

/// Encode one metric into its eight mutations
pub fn encode_metric(metric: &Metric) -> Result<IndexMutations> {
    validate_identifier("group", &metric.group)?;
    validate_identifier("type", &metric.metric_type)?;
    validate_identifier("name", &metric.name)?;
    ColumnVisibility::parse(&metric.visibility)?;

    let by_group_qualifier = combine(&[&metric.metric_type, &metric.name]);
    let by_type_qualifier = combine(&[&metric.group, &metric.name]);
    let value = encode_value(metric.value);

    let mut encoded = IndexMutations {
        by_group: Vec::with_capacity(MetricTimeUnit::ALL.len()),
        by_type: Vec::with_capacity(MetricTimeUnit::ALL.len()),
    };
    for unit in MetricTimeUnit::ALL {
        let mut group_row = Mutation::new(row_key(&metric.group, metric.timestamp, unit)?);
        group_row.put(
            unit.label(),
            by_group_qualifier.as_str(),
            metric.visibility.as_str(),
            metric.timestamp,
            value.clone(),
        );
        encoded.by_group.push(group_row);

        let mut type_row = Mutation::new(row_key(&metric.metric_type, metric.timestamp, unit)?);
        type_row.put(
            unit.label(),
            by_type_qualifier.as_str(),
            metric.visibility.as_str(),
            metric.timestamp,
            value.clone(),
        );
        encoded.by_type.push(type_row);
    }
    Ok(encoded)
}

/// Encode a batch, skipping `None` entries
pub fn encode_batch<I>(metrics: I) -> Result<EncodedBatch>
where
    I: IntoIterator,
    I::Item: Into<Option<Metric>>,
{
    let mut batch = EncodedBatch::default();
    for metric in metrics {
        match metric.into() {
            Some(metric) => {
                let encoded = encode_metric(&metric)?;
                batch.mutations.by_group.extend(encoded.by_group);
                batch.mutations.by_type.extend(encoded.by_type);
                batch.accepted += 1;
            },
            None => batch.skipped += 1,
        }
    }
    Ok(batch)
}

/// The pair of long-lived writers feeding the two index tables
pub struct MetricWriter {
    by_group: Box<dyn BatchWriter>,
    by_type: Box<dyn BatchWriter>,
}

impl MetricWriter {
    /// Wrap the group-index and type-index writers
    pub fn new(by_group: Box<dyn BatchWriter>, by_type: Box<dyn BatchWriter>) -> Self {
        Self { by_group, by_type }
    }

    /// Buffer every mutation of `batch`, then flush both tables
    ///
    /// The tables are flushed one after the other; a failure in the second
    /// leaves the first already written.
    pub async fn write(&self, batch: IndexMutations) -> Result<()> {
        let (group_count, type_count) = (batch.by_group.len(), batch.by_type.len());

        for mutation in batch.by_group {
            self.by_group.add_mutation(mutation).await?;
        }
        for mutation in batch.by_type {
            self.by_type.add_mutation(mutation).await?;
        }
        self.by_group.flush().await?;
        self.by_type.flush().await?;

        metrics::record_mutations(IndexKind::ByGroup.as_str(), group_count);
        metrics::record_mutations(IndexKind::ByType.as_str(), type_count);
        debug!(
            group_table = self.by_group.table(),
            type_table = self.by_type.table(),
            mutations = group_count + type_count,
            "Flushed index writers"
        );
        Ok(())
    }

    /// Close both writers, reporting the first failure
    pub async fn close(&self) -> Result<()> {
        let group = self.by_group.close().await;
        let by_type = self.by_type.close().await;
        group?;
        by_type?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{parse_row_key, DELIM};
    use crate::error::{CodecError, Error};

    fn sample() -> Metric {
        Metric::new(1_000, "g1", "t1", "n1", 5)
    }

    #[test]
    fn test_eight_mutations_per_metric() {
        let encoded = encode_metric(&sample()).unwrap();
        assert_eq!(encoded.by_group.len(), 4);
        assert_eq!(encoded.by_type.len(), 4);
        assert_eq!(encoded.len(), 8);
    }

    #[test]
    fn test_group_index_layout() {
        let encoded = encode_metric(&sample()).unwrap();
        for (mutation, unit) in encoded.by_group.iter().zip(MetricTimeUnit::ALL) {
            let (identifier, bucket) = parse_row_key(&mutation.row, unit).unwrap();
            assert_eq!(identifier, "g1");
            assert_eq!(bucket, unit.truncate(1_000).unwrap());

            let update = &mutation.updates[0];
            assert_eq!(update.column_family, unit.label());
            assert_eq!(update.column_qualifier, format!("t1{}n1", DELIM));
            assert_eq!(update.value.as_ref(), b"5");
            assert_eq!(update.timestamp, 1_000);
        }
    }

    #[test]
    fn test_type_index_layout() {
        let encoded = encode_metric(&sample().with_visibility("ops")).unwrap();
        for mutation in encoded.for_index(IndexKind::ByType) {
            assert!(mutation.row.starts_with("t1\u{0}"));
            let update = &mutation.updates[0];
            assert_eq!(update.column_qualifier, "g1\u{0}n1");
            assert_eq!(update.visibility, "ops");
        }
    }

    #[test]
    fn test_batch_skips_nulls() {
        let batch = encode_batch(vec![None, Some(sample()), None, Some(sample())]).unwrap();
        assert_eq!(batch.accepted, 2);
        assert_eq!(batch.skipped, 2);
        assert_eq!(batch.mutations.len(), 16);
    }

    #[test]
    fn test_batch_accepts_plain_metrics() {
        let batch = encode_batch(vec![sample()]).unwrap();
        assert_eq!(batch.accepted, 1);
        assert_eq!(batch.skipped, 0);
    }

    #[test]
    fn test_invalid_identifier_rejects_batch() {
        let bad = Metric::new(1_000, "g\u{0}1", "t1", "n1", 1);
        let err = encode_batch(vec![sample(), bad]).unwrap_err();
        assert!(matches!(
            err,
            Error::Codec(CodecError::InvalidIdentifier { field: "group", .. })
        ));
    }

    #[test]
    fn test_invalid_visibility_rejected() {
        let err = encode_metric(&sample().with_visibility("a&b|c")).unwrap_err();
        assert!(matches!(err, Error::Visibility(_)));
    }

    #[test]
    fn test_out_of_range_timestamp_rejected() {
        let err = encode_metric(&Metric::new(i64::MAX, "g", "t", "n", 1)).unwrap_err();
        assert!(matches!(err, Error::Codec(CodecError::TimestampOutOfRange(_))));
    }
}
