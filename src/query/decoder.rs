//! Scanned cell → [`Metric`] decoding
//!
//! The decoded timestamp is the start of the queried bucket; individual sample
//! times are not recoverable after aggregation.

use crate::codec::{decode_value, parse_row_key, DELIM};
use crate::engine::traits::{Cell, CellStream};
use crate::error::{Error, Result};
use crate::metrics::{CELLS_DECODED, DECODE_FAILURES};
use crate::types::{IndexKind, Metric, MetricTimeUnit};
use futures::{Stream, StreamExt};
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Decode one cell scanned from `index` at granularity `unit`
pub fn decode_cell(cell: &Cell, unit: MetricTimeUnit, index: IndexKind) -> Result<Metric> {
    let key = &cell.key;
    if key.column_family != unit.label() {
        return Err(Error::Decode(format!(
            "cell family {:?} does not match unit {}",
            key.column_family, unit
        )));
    }

    let (lead, timestamp) = parse_row_key(&key.row, unit)?;
    let (other, name) = key.column_qualifier.split_once(DELIM).ok_or_else(|| {
        Error::Decode(format!("malformed qualifier {:?}", key.column_qualifier))
    })?;
    let value = decode_value(&cell.value)?;

    let (group, metric_type) = match index {
        IndexKind::ByType => (other, lead),
        IndexKind::ByGroup => (lead, other),
    };

    Ok(Metric {
        timestamp,
        group: group.to_string(),
        metric_type: metric_type.to_string(),
        name: name.to_string(),
        visibility: key.visibility.clone(),
        value,
    })
}

/// Lazy, closeable sequence of decoded metrics
///
/// Cells arrive newest bucket first. The first error, whether from the store
/// or from decoding, is yielded once and ends the stream.
pub struct MetricStream {
    cells: Option<CellStream>,
    unit: MetricTimeUnit,
    index: IndexKind,
}

impl MetricStream {
    /// Decode `cells` scanned from `index` at granularity `unit`
    pub fn new(cells: CellStream, unit: MetricTimeUnit, index: IndexKind) -> Self {
        Self {
            cells: Some(cells),
            unit,
            index,
        }
    }

    /// Granularity of the decoded metrics
    pub fn unit(&self) -> MetricTimeUnit {
        self.unit
    }

    /// Release the underlying scan; later polls return `None`
    pub fn close(&mut self) {
        self.cells = None;
    }

    /// Whether the stream has ended or been closed
    pub fn is_closed(&self) -> bool {
        self.cells.is_none()
    }
}

impl fmt::Debug for MetricStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricStream")
            .field("unit", &self.unit)
            .field("index", &self.index)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Stream for MetricStream {
    type Item = Result<Metric>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let (unit, index) = (self.unit, self.index);
        let Some(cells) = self.cells.as_mut() else {
            return Poll::Ready(None);
        };

        let decoded = match cells.poll_next_unpin(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(None) => None,
            Poll::Ready(Some(Ok(cell))) => Some(decode_cell(&cell, unit, index)),
            Poll::Ready(Some(Err(e))) => Some(Err(e.into())),
        };

        match &decoded {
            Some(Ok(_)) => CELLS_DECODED.inc(),
            Some(Err(_)) => {
                DECODE_FAILURES.inc();
                self.close();
            },
            None => self.close(),
        }
        Poll::Ready(decoded)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match &self.cells {
            Some(cells) => (0, cells.size_hint().1),
            None => (0, Some(0)),
        }
    }
}
