//! Shared table model for collaborative editing.
//!
//! A [`Table`] is one replica of the document: ordered typed columns, ordered
//! rows of sparse cells, and a commit pipeline that makes every edit
//! atomic and revertible. Each replica keeps its contents in a yrs document
//! whose updates merge deterministically with those of other replicas.

pub mod collab;
pub mod error;
pub mod events;
pub mod ids;
pub mod sort;
pub mod table;
pub mod undo;
pub mod value;

pub use collab::TableSnapshot;
pub use error::TableError;
pub use events::{EventEmitter, Subscription};
pub use ids::{parse_cell_id, CellId, ColumnId, RowId};
pub use sort::SortDirection;
pub use table::{
    CellLookup, ColumnMut, ColumnRef, Commit, CommitKind, DetachedRow, NewColumn, Op, Revertible,
    RowMut, RowRef, Table, TableChange,
};
pub use undo::UndoRedo;
pub use value::{Cell, CellValue, DateTime, Hint, PropValue, Props, Vote};
