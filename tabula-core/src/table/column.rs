use super::ops::Op;
use super::{move_anchor, ColumnData, Table, TableData};
use crate::error::TableError;
use crate::ids::{ColumnId, RowId};
use crate::value::{Cell, CellValue, Hint, PropValue, Props};

/// Read view of a live column.
#[derive(Clone, Copy, Debug)]
pub struct ColumnRef<'a> {
    table: &'a TableData,
    id: ColumnId,
    index: usize,
    data: &'a ColumnData,
}

impl<'a> ColumnRef<'a> {
    pub(super) fn at(table: &'a TableData, id: ColumnId, index: usize) -> Option<Self> {
        let data = table.columns.get(&id)?;
        Some(Self {
            table,
            id,
            index,
            data,
        })
    }

    pub fn id(&self) -> ColumnId {
        self.id
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &'a str {
        &self.data.name
    }

    pub fn hint(&self) -> Option<Hint> {
        self.data.hint
    }

    pub fn default_value(&self) -> Option<&'a CellValue> {
        self.data.default_value.as_ref()
    }

    /// The declared hint, else the kind of the default value.
    pub fn effective_kind(&self) -> Option<Hint> {
        self.data
            .hint
            .or_else(|| self.data.default_value.as_ref().map(CellValue::kind))
    }

    pub fn props(&self) -> &'a Props {
        &self.data.props
    }

    pub fn prop(&self, key: &str) -> Option<&'a PropValue> {
        self.data.props.get(key)
    }

    /// Stored cells of this column, in row order. Rows without a cell are skipped.
    pub fn cells(&self) -> Vec<(RowId, &'a Cell)> {
        let table = self.table;
        table
            .row_order
            .iter()
            .filter_map(|row| {
                let cell = table.rows.get(row)?.cells.get(&self.id)?;
                Some((*row, cell))
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        let table = self.table;
        !table.rows.values().any(|row| row.cells.contains_key(&self.id))
    }
}

/// Mutation handle for a live column.
pub struct ColumnMut<'a> {
    table: &'a mut Table,
    id: ColumnId,
}

impl<'a> ColumnMut<'a> {
    pub(super) fn new(table: &'a mut Table, id: ColumnId) -> Self {
        Self { table, id }
    }

    pub fn id(&self) -> ColumnId {
        self.id
    }

    pub fn get(&self) -> Result<ColumnRef<'_>, TableError> {
        self.table.get_column(self.id)
    }

    /// Move so the column ends at `index`, clamped to the table bounds.
    pub fn move_to(&mut self, index: isize) -> Result<(), TableError> {
        let data = &self.table.data;
        let current = data
            .column_position(self.id)
            .ok_or(TableError::ColumnNotFound(self.id))?;
        let Some(after) = move_anchor(&data.column_order, current, index) else {
            return Ok(());
        };
        self.table.edit(Op::MoveColumn { id: self.id, after })?;
        Ok(())
    }

    pub fn set_name(&mut self, name: impl Into<String>) -> Result<(), TableError> {
        self.table.edit(Op::SetColumnName {
            id: self.id,
            name: name.into(),
        })?;
        Ok(())
    }

    pub fn set_hint(&mut self, hint: Option<Hint>) -> Result<(), TableError> {
        self.table.edit(Op::SetColumnHint { id: self.id, hint })?;
        Ok(())
    }

    pub fn set_default_value(&mut self, value: Option<CellValue>) -> Result<(), TableError> {
        self.table.edit(Op::SetColumnDefault { id: self.id, value })?;
        Ok(())
    }

    pub fn set_prop(&mut self, key: impl Into<String>, value: Option<PropValue>) -> Result<(), TableError> {
        self.table.edit(Op::SetColumnProp {
            id: self.id,
            key: key.into(),
            value,
        })?;
        Ok(())
    }

    /// Change the column's kind, resetting its default to match.
    ///
    /// Only allowed while no row stores a cell for the column.
    pub fn change_kind(&mut self, hint: Hint) -> Result<(), TableError> {
        let id = self.id;
        if !self.get()?.is_empty() {
            return Err(TableError::ColumnNotEmpty(id));
        }
        self.table.run_transaction(|table| {
            table.edit(Op::SetColumnHint { id, hint: Some(hint) })?;
            table.edit(Op::SetColumnDefault {
                id,
                value: CellValue::default_for(hint),
            })?;
            Ok(())
        })
    }
}

/// Definition of a column to insert.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NewColumn {
    pub(super) index: Option<usize>,
    data: ColumnData,
}

impl NewColumn {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            index: None,
            data: ColumnData::new(name),
        }
    }

    /// Declare the kind; the default value follows unless one was set explicitly.
    pub fn hint(mut self, hint: Hint) -> Self {
        self.data.hint = Some(hint);
        if self.data.default_value.is_none() {
            self.data.default_value = CellValue::default_for(hint);
        }
        self
    }

    pub fn default_value(mut self, value: impl Into<CellValue>) -> Self {
        self.data.default_value = Some(value.into());
        self
    }

    pub fn prop(mut self, key: impl Into<String>, value: impl Into<PropValue>) -> Self {
        self.data.props.insert(key.into(), value.into());
        self
    }

    /// Insert at `index` instead of appending.
    pub fn at(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }

    pub(super) fn into_data(self) -> ColumnData {
        self.data
    }
}
