use super::ops::Op;
use super::{move_anchor, RowData, Table, TableData};
use crate::error::TableError;
use crate::ids::{CellId, ColumnId, RowId};
use crate::value::{Cell, CellValue, DateTime, PropValue, Props};

/// A value read through a row, tagged with whether it came from the column default.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CellLookup<'a> {
    pub value: &'a CellValue,
    pub is_default: bool,
}

/// Read view of a live row.
#[derive(Clone, Copy, Debug)]
pub struct RowRef<'a> {
    table: &'a TableData,
    id: RowId,
    index: usize,
    data: &'a RowData,
}

impl<'a> RowRef<'a> {
    pub(super) fn at(table: &'a TableData, id: RowId, index: usize) -> Option<Self> {
        let data = table.rows.get(&id)?;
        Some(Self {
            table,
            id,
            index,
            data,
        })
    }

    pub fn id(&self) -> RowId {
        self.id
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// The stored cell, without default fallback.
    pub fn cell(&self, column: ColumnId) -> Option<&'a Cell> {
        self.data.cells.get(&column)
    }

    /// The stored value, or the column default when no cell is stored.
    pub fn value(&self, column: ColumnId) -> Option<CellLookup<'a>> {
        if let Some(cell) = self.data.cells.get(&column) {
            return Some(CellLookup {
                value: &cell.value,
                is_default: false,
            });
        }
        let default = self.table.columns.get(&column)?.default_value.as_ref()?;
        Some(CellLookup {
            value: default,
            is_default: true,
        })
    }

    /// One entry per current column, in column order. Absent cells are `None`.
    pub fn cells(&self) -> Vec<(ColumnId, Option<&'a Cell>)> {
        self.table
            .column_order
            .iter()
            .map(|column| (*column, self.data.cells.get(column)))
            .collect()
    }

    /// Every stored cell, including any left behind by a removed column.
    pub fn stored_cells(&self) -> impl Iterator<Item = (ColumnId, &'a Cell)> {
        self.data.cells.iter().map(|(column, cell)| (*column, cell))
    }

    pub fn cell_id(&self, column: ColumnId) -> CellId {
        CellId::new(self.id, column)
    }

    pub fn props(&self) -> &'a Props {
        &self.data.props
    }

    pub fn prop(&self, key: &str) -> Option<&'a PropValue> {
        self.data.props.get(key)
    }
}

/// Mutation handle for a live row.
pub struct RowMut<'a> {
    table: &'a mut Table,
    id: RowId,
}

impl<'a> RowMut<'a> {
    pub(super) fn new(table: &'a mut Table, id: RowId) -> Self {
        Self { table, id }
    }

    pub fn id(&self) -> RowId {
        self.id
    }

    pub fn get(&self) -> Result<RowRef<'_>, TableError> {
        self.table.get_row(self.id)
    }

    /// Move so the row ends at `index`, clamped to the table bounds.
    pub fn move_to(&mut self, index: isize) -> Result<(), TableError> {
        let data = &self.table.data;
        let current = data
            .row_position(self.id)
            .ok_or(TableError::RowNotFound(self.id))?;
        let Some(after) = move_anchor(&data.row_order, current, index) else {
            return Ok(());
        };
        self.table.edit(Op::MoveRow { id: self.id, after })?;
        Ok(())
    }

    /// Set or clear a cell's value. Existing cell props are kept.
    pub fn set_cell(&mut self, column: ColumnId, value: Option<CellValue>) -> Result<(), TableError> {
        let cell = match value {
            None => None,
            Some(value) => {
                let props = self
                    .table
                    .data
                    .rows
                    .get(&self.id)
                    .and_then(|row| row.cells.get(&column))
                    .map(|cell| cell.props.clone())
                    .unwrap_or_default();
                Some(Cell { value, props })
            }
        };
        self.table.edit(Op::SetCell {
            row: self.id,
            column,
            cell,
        })?;
        Ok(())
    }

    pub fn set_value(&mut self, column: ColumnId, value: impl Into<CellValue>) -> Result<(), TableError> {
        self.set_cell(column, Some(value.into()))
    }

    pub fn set_cell_with_props(&mut self, column: ColumnId, cell: Cell) -> Result<(), TableError> {
        self.table.edit(Op::SetCell {
            row: self.id,
            column,
            cell: Some(cell),
        })?;
        Ok(())
    }

    /// Returns `false` if there was no cell to delete.
    pub fn delete_cell(&mut self, column: ColumnId) -> Result<bool, TableError> {
        self.table.edit(Op::SetCell {
            row: self.id,
            column,
            cell: None,
        })
    }

    /// Store a date from epoch milliseconds. Invalid instants leave the cell unchanged.
    pub fn set_date(&mut self, column: ColumnId, millis: f64) -> Result<bool, TableError> {
        match DateTime::from_millis_f64(millis) {
            Some(date) => self.set_value(column, date).map(|_| true),
            None => Ok(false),
        }
    }

    /// Store a date from text input. Unparseable input leaves the cell unchanged.
    pub fn set_date_str(&mut self, column: ColumnId, input: &str) -> Result<bool, TableError> {
        match DateTime::parse(input) {
            Some(date) => self.set_value(column, date).map(|_| true),
            None => Ok(false),
        }
    }

    pub fn add_vote(&mut self, column: ColumnId, user_id: &str) -> Result<bool, TableError> {
        self.vote(column, user_id, true)
    }

    pub fn remove_vote(&mut self, column: ColumnId, user_id: &str) -> Result<bool, TableError> {
        self.vote(column, user_id, false)
    }

    /// Flip the user's vote and return whether they have voted afterwards.
    pub fn toggle_vote(&mut self, column: ColumnId, user_id: &str) -> Result<bool, TableError> {
        let voted = self
            .table
            .cell(CellId::new(self.id, column))
            .and_then(|cell| cell.value.as_vote())
            .is_some_and(|vote| vote.has_voted(user_id));
        self.vote(column, user_id, !voted)?;
        Ok(!voted)
    }

    fn vote(&mut self, column: ColumnId, user_id: &str, voted: bool) -> Result<bool, TableError> {
        self.table.edit(Op::SetVote {
            row: self.id,
            column,
            user: user_id.to_string(),
            voted,
        })
    }

    pub fn set_prop(&mut self, key: impl Into<String>, value: Option<PropValue>) -> Result<(), TableError> {
        self.table.edit(Op::SetRowProp {
            id: self.id,
            key: key.into(),
            value,
        })?;
        Ok(())
    }
}

/// A row built off-table, to be inserted in bulk.
///
/// Cells are checked against the table's columns on insert.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DetachedRow {
    id: RowId,
    data: RowData,
}

impl DetachedRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(&self) -> RowId {
        self.id
    }

    pub fn cell(&self, column: ColumnId) -> Option<&Cell> {
        self.data.cells.get(&column)
    }

    pub fn set_value(&mut self, column: ColumnId, value: impl Into<CellValue>) -> &mut Self {
        self.data.cells.insert(column, Cell::new(value));
        self
    }

    pub fn set_cell(&mut self, column: ColumnId, cell: Option<Cell>) -> &mut Self {
        match cell {
            Some(cell) => self.data.cells.insert(column, cell),
            None => self.data.cells.remove(&column),
        };
        self
    }

    pub fn set_prop(&mut self, key: impl Into<String>, value: impl Into<PropValue>) -> &mut Self {
        self.data.props.insert(key.into(), value.into());
        self
    }

    pub(super) fn into_parts(self) -> (RowId, RowData) {
        (self.id, self.data)
    }
}
