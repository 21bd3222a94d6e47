//! Sorted key-value store collaborator and its in-process implementation

pub mod memory;
pub mod traits;

pub use memory::InMemorySortedStore;
pub use traits::{
    BatchWriter, BatchWriterConfig, Cell, CellStream, ColumnSelection, ColumnUpdate,
    CombinerKind, CombinerSetting, IteratorScope, Key, Mutation, RegexFilter, RowRange, ScanSpec,
    SortedStore,
};
