use thiserror::Error;

use crate::ids::{ColumnId, RowId};

/// Errors raised by table lookups and mutations.
///
/// Pure read accessors return `Option` instead; these errors surface only
/// where a caller asked for something that must exist.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TableError {
    #[error("Row not found: {0}")]
    RowNotFound(RowId),

    #[error("Column not found: {0}")]
    ColumnNotFound(ColumnId),

    #[error("Invalid id: {0}")]
    InvalidId(String),

    #[error("Invalid cell id: {0}")]
    InvalidCellId(String),

    #[error("Index {index} out of bounds for length {len}")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("Duplicate row id: {0}")]
    DuplicateRow(RowId),

    #[error("Duplicate column id: {0}")]
    DuplicateColumn(ColumnId),

    #[error("Column {0} still holds cell values")]
    ColumnNotEmpty(ColumnId),

    #[error("Cell {row}_{column} does not hold a vote")]
    NotAVote { row: RowId, column: ColumnId },

    #[error("Operation not allowed while a transaction is in progress")]
    TransactionInProgress,

    #[error("Encoding error: {0}")]
    Encode(String),

    #[error("Decoding error: {0}")]
    Decode(String),
}
