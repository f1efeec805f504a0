//! The shared table: ordered columns and ordered rows of sparse cells.
//!
//! Storage is an arena keyed by id. Rows and columns keep no pointer to the
//! table; read views borrow the table and mutation handles borrow it
//! mutably, so a handle can never outlive the node it names. Every local
//! commit is also written to the table's replicated document.

mod column;
pub mod ops;
mod row;
mod transaction;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub use column::{ColumnMut, ColumnRef, NewColumn};
pub use ops::{ApplyMode, Op, TableChange};
pub use row::{CellLookup, DetachedRow, RowMut, RowRef};
pub use transaction::{Commit, CommitKind, Revertible};

use crate::collab::TableDoc;
use crate::error::TableError;
use crate::events::{EventEmitter, Subscription};
use crate::ids::{parse_cell_id, CellId, ColumnId, RowId};
use crate::value::{Cell, CellValue, Hint, Props};
use transaction::PendingCommit;

/// Stored content of a row.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RowData {
    /// Sparse; an absent entry falls back to the column default.
    pub cells: BTreeMap<ColumnId, Cell>,
    pub props: Props,
}

/// Stored definition of a column.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnData {
    pub name: String,
    pub hint: Option<Hint>,
    pub default_value: Option<CellValue>,
    pub props: Props,
}

impl ColumnData {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct TableData {
    pub(crate) row_order: Vec<RowId>,
    pub(crate) rows: HashMap<RowId, RowData>,
    pub(crate) column_order: Vec<ColumnId>,
    pub(crate) columns: HashMap<ColumnId, ColumnData>,
}

impl TableData {
    pub(crate) fn row_position(&self, id: RowId) -> Option<usize> {
        self.row_order.iter().position(|r| *r == id)
    }

    pub(crate) fn column_position(&self, id: ColumnId) -> Option<usize> {
        self.column_order.iter().position(|c| *c == id)
    }
}

/// A table replica with change notification and transactional editing.
#[derive(Debug, Default)]
pub struct Table {
    pub(crate) data: TableData,
    pub(crate) doc: TableDoc,
    pending: Option<PendingCommit>,
    change_events: EventEmitter<TableChange>,
    commit_events: EventEmitter<Commit>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_data(data: TableData) -> Self {
        let doc = TableDoc::from_data(&data).unwrap_or_else(|e| {
            log::error!("Failed to write initial table into its document: {e}");
            TableDoc::new()
        });
        Self {
            data,
            doc,
            pending: None,
            change_events: EventEmitter::default(),
            commit_events: EventEmitter::default(),
        }
    }

    /// A fresh table with one column of every kind and `row_count` empty rows.
    ///
    /// This is initial state, not an edit: no commit is emitted.
    pub fn with_default_schema(row_count: usize) -> Self {
        let mut data = TableData::default();
        for (name, hint) in [
            ("String", Hint::String),
            ("Number", Hint::Number),
            ("Boolean", Hint::Boolean),
            ("Date", Hint::Date),
            ("Vote", Hint::Vote),
        ] {
            let id = ColumnId::new();
            let mut column = ColumnData::new(name);
            column.hint = Some(hint);
            column.default_value = CellValue::default_for(hint);
            if hint == Hint::Boolean {
                column.props.insert("label".into(), "Done".into());
            }
            data.column_order.push(id);
            data.columns.insert(id, column);
        }
        for _ in 0..row_count {
            let id = RowId::new();
            data.row_order.push(id);
            data.rows.insert(id, RowData::default());
        }
        Self::from_data(data)
    }

    // ---- Change notification ------------------------------------------

    /// Fires once per commit with what it touched.
    pub fn on_change(&self, listener: impl Fn(&TableChange) + 'static) -> Subscription {
        self.change_events.subscribe(listener)
    }

    /// Fires once per commit with its ops and revertible.
    pub fn on_commit(&self, listener: impl Fn(&Commit) + 'static) -> Subscription {
        self.commit_events.subscribe(listener)
    }

    // ---- Reads ---------------------------------------------------------

    pub fn row_count(&self) -> usize {
        self.data.row_order.len()
    }

    pub fn column_count(&self) -> usize {
        self.data.column_order.len()
    }

    pub fn row_ids(&self) -> &[RowId] {
        &self.data.row_order
    }

    pub fn column_ids(&self) -> &[ColumnId] {
        &self.data.column_order
    }

    pub fn rows(&self) -> impl Iterator<Item = RowRef<'_>> {
        self.data
            .row_order
            .iter()
            .enumerate()
            .filter_map(|(index, id)| RowRef::at(&self.data, *id, index))
    }

    pub fn columns(&self) -> impl Iterator<Item = ColumnRef<'_>> {
        self.data
            .column_order
            .iter()
            .enumerate()
            .filter_map(|(index, id)| ColumnRef::at(&self.data, *id, index))
    }

    /// Liveness check for a row id.
    pub fn contains_row(&self, id: RowId) -> bool {
        self.data.rows.contains_key(&id)
    }

    pub fn contains_column(&self, id: ColumnId) -> bool {
        self.data.columns.contains_key(&id)
    }

    pub fn row(&self, id: RowId) -> Option<RowRef<'_>> {
        let index = self.data.row_position(id)?;
        RowRef::at(&self.data, id, index)
    }

    pub fn column(&self, id: ColumnId) -> Option<ColumnRef<'_>> {
        let index = self.data.column_position(id)?;
        ColumnRef::at(&self.data, id, index)
    }

    pub fn get_row(&self, id: RowId) -> Result<RowRef<'_>, TableError> {
        self.row(id).ok_or(TableError::RowNotFound(id))
    }

    pub fn get_column(&self, id: ColumnId) -> Result<ColumnRef<'_>, TableError> {
        self.column(id).ok_or(TableError::ColumnNotFound(id))
    }

    pub fn row_at(&self, index: usize) -> Option<RowRef<'_>> {
        let id = *self.data.row_order.get(index)?;
        RowRef::at(&self.data, id, index)
    }

    pub fn column_at(&self, index: usize) -> Option<ColumnRef<'_>> {
        let id = *self.data.column_order.get(index)?;
        ColumnRef::at(&self.data, id, index)
    }

    /// Resolve a synthetic cell id to its row and column.
    ///
    /// `None` if the id is malformed or either half no longer exists.
    pub fn cell_by_id(&self, cell_id: &str) -> Option<(RowRef<'_>, ColumnRef<'_>)> {
        let (row, column) = parse_cell_id(cell_id)?;
        Some((self.row(row)?, self.column(column)?))
    }

    /// The stored cell addressed by a synthetic id.
    pub fn cell(&self, cell_id: CellId) -> Option<&Cell> {
        self.data.rows.get(&cell_id.row)?.cells.get(&cell_id.column)
    }

    pub fn column_by_cell_id(&self, cell_id: &str) -> Option<ColumnRef<'_>> {
        let (_, column) = parse_cell_id(cell_id)?;
        self.column(column)
    }

    /// Cells whose column no longer exists.
    pub fn orphaned_cells(&self) -> Vec<CellId> {
        self.data
            .row_order
            .iter()
            .filter_map(|id| self.data.rows.get(id).map(|data| (*id, data)))
            .flat_map(|(row, data)| {
                data.cells
                    .keys()
                    .filter(|column| !self.data.columns.contains_key(*column))
                    .map(move |column| CellId::new(row, *column))
            })
            .collect()
    }

    // ---- Row mutations -------------------------------------------------

    /// A row that is not yet part of the table. Insert it with [`Table::insert_rows`].
    pub fn create_detached_row(&self) -> DetachedRow {
        DetachedRow::new()
    }

    /// Splice `rows` in at `index` as one commit. `index == row_count()` appends.
    pub fn insert_rows(&mut self, index: usize, rows: Vec<DetachedRow>) -> Result<(), TableError> {
        let len = self.row_count();
        if index > len {
            return Err(TableError::IndexOutOfBounds { index, len });
        }
        if rows.is_empty() {
            return Ok(());
        }
        let after = index.checked_sub(1).map(|i| self.data.row_order[i]);
        let rows = rows.into_iter().map(DetachedRow::into_parts).collect();
        self.edit(Op::InsertRows { after, rows })?;
        Ok(())
    }

    pub fn append_rows(&mut self, rows: Vec<DetachedRow>) -> Result<(), TableError> {
        self.insert_rows(self.row_count(), rows)
    }

    /// Append one empty row and return its id.
    pub fn add_row(&mut self) -> Result<RowId, TableError> {
        let row = DetachedRow::new();
        let id = row.id();
        self.append_rows(vec![row])?;
        Ok(id)
    }

    /// Remove the given rows as one commit and return how many were removed.
    ///
    /// Ids that are no longer in the table are skipped.
    pub fn delete_rows(&mut self, ids: &[RowId]) -> Result<usize, TableError> {
        let mut live = Vec::with_capacity(ids.len());
        for id in ids {
            if !self.contains_row(*id) {
                log::debug!("Skipping delete of stale row {id}");
            } else if !live.contains(id) {
                live.push(*id);
            }
        }
        if live.is_empty() {
            return Ok(0);
        }
        let removed = live.len();
        self.edit(Op::RemoveRows { ids: live })?;
        Ok(removed)
    }

    pub fn delete_all_rows(&mut self) -> Result<usize, TableError> {
        let ids = self.data.row_order.clone();
        if ids.is_empty() {
            return Ok(0);
        }
        let removed = ids.len();
        self.edit(Op::RemoveRows { ids })?;
        Ok(removed)
    }

    pub fn row_mut(&mut self, id: RowId) -> Result<RowMut<'_>, TableError> {
        if !self.contains_row(id) {
            return Err(TableError::RowNotFound(id));
        }
        Ok(RowMut::new(self, id))
    }

    // ---- Column mutations ----------------------------------------------

    /// Insert a column definition. Existing rows' cells are untouched.
    pub fn insert_column(&mut self, column: NewColumn) -> Result<ColumnId, TableError> {
        let len = self.column_count();
        let index = column.index.unwrap_or(len);
        if index > len {
            return Err(TableError::IndexOutOfBounds { index, len });
        }
        let after = index.checked_sub(1).map(|i| self.data.column_order[i]);
        let id = ColumnId::new();
        self.edit(Op::InsertColumn {
            after,
            id,
            column: column.into_data(),
        })?;
        Ok(id)
    }

    pub fn append_column(&mut self, name: impl Into<String>, hint: Hint) -> Result<ColumnId, TableError> {
        self.insert_column(NewColumn::new(name).hint(hint))
    }

    /// Remove a column and every row's cell for it, as one commit.
    ///
    /// Returns `false` if the column was already gone.
    pub fn delete_column(&mut self, id: ColumnId) -> Result<bool, TableError> {
        if !self.contains_column(id) {
            log::debug!("Skipping delete of stale column {id}");
            return Ok(false);
        }
        let holders: Vec<RowId> = self
            .data
            .row_order
            .iter()
            .filter(|row| {
                self.data
                    .rows
                    .get(*row)
                    .is_some_and(|data| data.cells.contains_key(&id))
            })
            .copied()
            .collect();

        self.run_transaction(|table| {
            for row in holders {
                table.edit(Op::SetCell {
                    row,
                    column: id,
                    cell: None,
                })?;
            }
            table.edit(Op::RemoveColumn { id })
        })?;
        Ok(true)
    }

    /// Clear every cell whose column no longer exists, as one commit.
    pub fn prune_orphaned_cells(&mut self) -> Result<usize, TableError> {
        let orphans = self.orphaned_cells();
        if orphans.is_empty() {
            return Ok(0);
        }
        let count = orphans.len();
        self.run_transaction(|table| {
            for cell in orphans {
                table.edit(Op::SetCell {
                    row: cell.row,
                    column: cell.column,
                    cell: None,
                })?;
            }
            Ok::<_, TableError>(())
        })?;
        Ok(count)
    }

    pub fn column_mut(&mut self, id: ColumnId) -> Result<ColumnMut<'_>, TableError> {
        if !self.contains_column(id) {
            return Err(TableError::ColumnNotFound(id));
        }
        Ok(ColumnMut::new(self, id))
    }
}

/// Anchor for moving an element from `current` so it ends at `clamp(index, 0, len - 1)`.
///
/// `None` when the element is already there.
pub(crate) fn move_anchor<T: Copy>(order: &[T], current: usize, index: isize) -> Option<Option<T>> {
    let last = order.len().checked_sub(1)?;
    let target = index.clamp(0, last as isize) as usize;
    if target == current {
        return None;
    }
    Some(match target {
        0 => None,
        t if t < current => Some(order[t - 1]),
        t => Some(order[t]),
    })
}
