//! Error types for the roll-up store

use thiserror::Error;

/// Main error type for the roll-up store
///
/// Every failure raised by the sorted store collaborator is wrapped into
/// [`Error::Store`] and propagated unchanged; the core never retries or
/// suppresses it.
#[derive(Error, Debug)]
pub enum Error {
    /// Sorted store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Row key / value encoding error
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Visibility label or authorization error
    #[error("Visibility error: {0}")]
    Visibility(#[from] VisibilityError),

    /// A scanned cell could not be turned back into a metric
    #[error("Decode error: {0}")]
    Decode(String),

    /// Query window is inverted
    #[error("Invalid time range: start {start} > end {end}")]
    InvalidTimeRange {
        /// Start of the window (epoch millis)
        start: i64,
        /// End of the window (epoch millis)
        end: i64,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by a [`SortedStore`](crate::engine::SortedStore) implementation
#[derive(Error, Debug)]
pub enum StoreError {
    /// The table does not exist
    #[error("Table not found: {0}")]
    TableNotFound(String),

    /// The table already exists
    #[error("Table already exists: {0}")]
    TableExists(String),

    /// The caller lacks permission for the operation
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Connection to the backing store failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// The store rejected buffered mutations on flush
    #[error("Mutations rejected: {0}")]
    MutationsRejected(String),

    /// The batch writer was already closed
    #[error("Batch writer for table {0} is closed")]
    WriterClosed(String),

    /// A server-side filter could not be constructed
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    /// The scan range is malformed
    #[error("Invalid range: {0}")]
    InvalidRange(String),

    /// A combiner found a value it could not interpret
    #[error("Corrupt value in {table}: {message}")]
    CorruptValue {
        /// Table holding the value
        table: String,
        /// What went wrong
        message: String,
    },

    /// Any other backend failure
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Row key, timestamp and value encoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// An identifier contains the key delimiter and would break key ordering
    #[error("{field} contains the key delimiter: {value:?}")]
    InvalidIdentifier {
        /// Name of the offending field (group, type, name)
        field: &'static str,
        /// The rejected value
        value: String,
    },

    /// Timestamp falls outside the encodable calendar range
    #[error("Timestamp {0} is outside the encodable range (years 0000-9999)")]
    TimestampOutOfRange(i64),

    /// Row key does not have the expected `identifier + delimiter + timestamp` shape
    #[error("Malformed row key: {0:?}")]
    MalformedRowKey(String),

    /// Encoded reverse timestamp could not be parsed
    #[error("Malformed reverse timestamp: {0:?}")]
    MalformedTimestamp(String),

    /// Cell value is not a decimal integer
    #[error("Invalid value: {0:?}")]
    InvalidValue(String),
}

/// Visibility expression and authorization errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VisibilityError {
    /// Expression failed to parse
    #[error("Malformed visibility expression {expression:?}: {message}")]
    MalformedExpression {
        /// The expression as supplied
        expression: String,
        /// Parser message
        message: String,
    },

    /// Authorization label contains characters outside the allowed set
    #[error("Invalid authorization label: {0:?}")]
    InvalidAuthorization(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_wraps_into_error() {
        let err: Error = StoreError::TableNotFound("metrics".to_string()).into();
        assert!(matches!(err, Error::Store(StoreError::TableNotFound(_))));
        assert_eq!(err.to_string(), "Store error: Table not found: metrics");
    }

    #[test]
    fn test_codec_error_display() {
        let err = CodecError::InvalidIdentifier {
            field: "group",
            value: "a\u{0}b".to_string(),
        };
        assert!(err.to_string().starts_with("group contains the key delimiter"));
    }
}
