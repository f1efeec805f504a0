//! Id-anchored edit operations and their application to the arena.
//!
//! Positions are expressed relative to a sibling (`after`) rather than as
//! raw indices, which is also how they are written to the yrs document.

use std::collections::{BTreeSet, HashSet};

use super::{ColumnData, RowData, TableData};
use crate::error::TableError;
use crate::ids::{ColumnId, RowId};
use crate::value::{Cell, CellValue, Hint, PropValue, Vote};

/// A single structural or content edit.
#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    /// Insert rows as one contiguous run after `after` (`None` = at the start).
    InsertRows {
        after: Option<RowId>,
        rows: Vec<(RowId, RowData)>,
    },
    RemoveRows {
        ids: Vec<RowId>,
    },
    MoveRow {
        id: RowId,
        after: Option<RowId>,
    },
    InsertColumn {
        after: Option<ColumnId>,
        id: ColumnId,
        column: ColumnData,
    },
    /// Removes the column definition only. Cells are cleared by separate ops.
    RemoveColumn {
        id: ColumnId,
    },
    MoveColumn {
        id: ColumnId,
        after: Option<ColumnId>,
    },
    SetCell {
        row: RowId,
        column: ColumnId,
        cell: Option<Cell>,
    },
    /// Add or withdraw one user's vote. Concurrent votes by different users merge.
    SetVote {
        row: RowId,
        column: ColumnId,
        user: String,
        voted: bool,
    },
    SetColumnName {
        id: ColumnId,
        name: String,
    },
    SetColumnHint {
        id: ColumnId,
        hint: Option<Hint>,
    },
    SetColumnDefault {
        id: ColumnId,
        value: Option<CellValue>,
    },
    SetColumnProp {
        id: ColumnId,
        key: String,
        value: Option<PropValue>,
    },
    SetRowProp {
        id: RowId,
        key: String,
        value: Option<PropValue>,
    },
}

/// How an op treats targets that are missing from the arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyMode {
    /// Missing targets and anchors are errors. Used for local edits and undo.
    Strict,
    /// Missing targets are skipped and missing anchors fall back to appending.
    /// Used for ops derived from the merged document.
    Lenient,
}

/// What a commit touched, for renderers deciding what to re-read.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TableChange {
    /// Row membership or order changed.
    pub row_structure: bool,
    /// Column membership or order changed.
    pub column_structure: bool,
    pub rows: BTreeSet<RowId>,
    pub columns: BTreeSet<ColumnId>,
}

impl TableChange {
    pub fn is_empty(&self) -> bool {
        !self.row_structure && !self.column_structure && self.rows.is_empty() && self.columns.is_empty()
    }

    pub fn merge(&mut self, other: TableChange) {
        self.row_structure |= other.row_structure;
        self.column_structure |= other.column_structure;
        self.rows.extend(other.rows);
        self.columns.extend(other.columns);
    }

    pub fn touches_row(&self, id: RowId) -> bool {
        self.row_structure || self.rows.contains(&id)
    }

    pub fn touches_column(&self, id: ColumnId) -> bool {
        self.column_structure || self.columns.contains(&id)
    }
}

fn missing<T>(mode: ApplyMode, err: TableError) -> Result<Vec<T>, TableError> {
    match mode {
        ApplyMode::Strict => Err(err),
        ApplyMode::Lenient => {
            log::debug!("Skipping op on stale target: {err}");
            Ok(Vec::new())
        }
    }
}

impl TableData {
    /// Apply `op` and return the ops that undo it, in application order.
    ///
    /// An empty result means nothing changed. The arena is validated before
    /// it is touched, so an `Err` leaves it unmodified.
    pub(crate) fn apply(
        &mut self,
        op: &Op,
        mode: ApplyMode,
        change: &mut TableChange,
    ) -> Result<Vec<Op>, TableError> {
        match op {
            Op::InsertRows { after, rows } => self.insert_rows(*after, rows, mode, change),
            Op::RemoveRows { ids } => self.remove_rows(ids, mode, change),
            Op::MoveRow { id, after } => self.move_row(*id, *after, mode, change),
            Op::InsertColumn { after, id, column } => {
                self.insert_column(*after, *id, column, mode, change)
            }
            Op::RemoveColumn { id } => self.remove_column(*id, mode, change),
            Op::MoveColumn { id, after } => self.move_column(*id, *after, mode, change),
            Op::SetCell { row, column, cell } => {
                self.set_cell(*row, *column, cell.as_ref(), mode, change)
            }
            Op::SetVote {
                row,
                column,
                user,
                voted,
            } => self.set_vote(*row, *column, user, *voted, mode, change),
            Op::SetColumnName { id, name } => {
                let Some(column) = self.columns.get_mut(id) else {
                    return missing(mode, TableError::ColumnNotFound(*id));
                };
                if column.name == *name {
                    return Ok(Vec::new());
                }
                let old = std::mem::replace(&mut column.name, name.clone());
                change.columns.insert(*id);
                Ok(vec![Op::SetColumnName { id: *id, name: old }])
            }
            Op::SetColumnHint { id, hint } => {
                let Some(column) = self.columns.get_mut(id) else {
                    return missing(mode, TableError::ColumnNotFound(*id));
                };
                if column.hint == *hint {
                    return Ok(Vec::new());
                }
                let old = std::mem::replace(&mut column.hint, *hint);
                change.columns.insert(*id);
                Ok(vec![Op::SetColumnHint { id: *id, hint: old }])
            }
            Op::SetColumnDefault { id, value } => {
                let Some(column) = self.columns.get_mut(id) else {
                    return missing(mode, TableError::ColumnNotFound(*id));
                };
                if column.default_value == *value {
                    return Ok(Vec::new());
                }
                let old = std::mem::replace(&mut column.default_value, value.clone());
                change.columns.insert(*id);
                Ok(vec![Op::SetColumnDefault { id: *id, value: old }])
            }
            Op::SetColumnProp { id, key, value } => {
                let Some(column) = self.columns.get_mut(id) else {
                    return missing(mode, TableError::ColumnNotFound(*id));
                };
                let old = match value {
                    Some(v) => {
                        if column.props.get(key) == Some(v) {
                            return Ok(Vec::new());
                        }
                        column.props.insert(key.clone(), v.clone())
                    }
                    None => match column.props.remove(key) {
                        Some(old) => Some(old),
                        None => return Ok(Vec::new()),
                    },
                };
                change.columns.insert(*id);
                Ok(vec![Op::SetColumnProp {
                    id: *id,
                    key: key.clone(),
                    value: old,
                }])
            }
            Op::SetRowProp { id, key, value } => {
                let Some(row) = self.rows.get_mut(id) else {
                    return missing(mode, TableError::RowNotFound(*id));
                };
                let old = match value {
                    Some(v) => {
                        if row.props.get(key) == Some(v) {
                            return Ok(Vec::new());
                        }
                        row.props.insert(key.clone(), v.clone())
                    }
                    None => match row.props.remove(key) {
                        Some(old) => Some(old),
                        None => return Ok(Vec::new()),
                    },
                };
                change.rows.insert(*id);
                Ok(vec![Op::SetRowProp {
                    id: *id,
                    key: key.clone(),
                    value: old,
                }])
            }
        }
    }

    fn insert_rows(
        &mut self,
        after: Option<RowId>,
        rows: &[(RowId, RowData)],
        mode: ApplyMode,
        change: &mut TableChange,
    ) -> Result<Vec<Op>, TableError> {
        let position = match after {
            None => 0,
            Some(anchor) => match self.row_position(anchor) {
                Some(index) => index + 1,
                None if mode == ApplyMode::Lenient => self.row_order.len(),
                None => return Err(TableError::RowNotFound(anchor)),
            },
        };

        let mut seen = HashSet::with_capacity(rows.len());
        let mut accepted = Vec::with_capacity(rows.len());
        for (id, data) in rows {
            if self.rows.contains_key(id) || !seen.insert(*id) {
                if mode == ApplyMode::Strict {
                    return Err(TableError::DuplicateRow(*id));
                }
                log::debug!("Skipping insert of existing row {id}");
                continue;
            }

            let mut data = data.clone();
            let unknown = data.cells.keys().find(|c| !self.columns.contains_key(*c)).copied();
            if let Some(column) = unknown {
                if mode == ApplyMode::Strict {
                    return Err(TableError::ColumnNotFound(column));
                }
                data.cells.retain(|c, _| self.columns.contains_key(c));
            }
            accepted.push((*id, data));
        }

        if accepted.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<RowId> = accepted.iter().map(|(id, _)| *id).collect();
        self.row_order.splice(position..position, ids.iter().copied());
        for (id, data) in accepted {
            self.rows.insert(id, data);
        }

        change.row_structure = true;
        change.rows.extend(ids.iter().copied());
        Ok(vec![Op::RemoveRows { ids }])
    }

    fn remove_rows(
        &mut self,
        ids: &[RowId],
        mode: ApplyMode,
        change: &mut TableChange,
    ) -> Result<Vec<Op>, TableError> {
        let mut doomed: HashSet<RowId> = HashSet::with_capacity(ids.len());
        for id in ids {
            if self.rows.contains_key(id) {
                doomed.insert(*id);
            } else if mode == ApplyMode::Strict {
                return Err(TableError::RowNotFound(*id));
            }
        }
        if doomed.is_empty() {
            return Ok(Vec::new());
        }

        // Each maximal run of removed rows is restored after the survivor preceding it.
        let mut inverse = Vec::new();
        let mut anchor: Option<RowId> = None;
        let mut run: Vec<(RowId, RowData)> = Vec::new();
        for id in &self.row_order {
            if doomed.contains(id) {
                if let Some(data) = self.rows.get(id) {
                    run.push((*id, data.clone()));
                }
            } else {
                if !run.is_empty() {
                    inverse.push(Op::InsertRows {
                        after: anchor,
                        rows: std::mem::take(&mut run),
                    });
                }
                anchor = Some(*id);
            }
        }
        if !run.is_empty() {
            inverse.push(Op::InsertRows { after: anchor, rows: run });
        }

        self.row_order.retain(|id| !doomed.contains(id));
        for id in &doomed {
            self.rows.remove(id);
        }

        change.row_structure = true;
        change.rows.extend(doomed);
        Ok(inverse)
    }

    fn move_row(
        &mut self,
        id: RowId,
        after: Option<RowId>,
        mode: ApplyMode,
        change: &mut TableChange,
    ) -> Result<Vec<Op>, TableError> {
        let Some(current) = self.row_position(id) else {
            return missing(mode, TableError::RowNotFound(id));
        };
        if after == Some(id) {
            return Ok(Vec::new());
        }
        let previous = current.checked_sub(1).map(|i| self.row_order[i]);
        if previous == after {
            return Ok(Vec::new());
        }
        if let Some(anchor) = after {
            if !self.rows.contains_key(&anchor) && mode == ApplyMode::Strict {
                return Err(TableError::RowNotFound(anchor));
            }
        }

        self.row_order.remove(current);
        let target = match after {
            None => 0,
            Some(anchor) => self
                .row_position(anchor)
                .map_or(self.row_order.len(), |index| index + 1),
        };
        self.row_order.insert(target, id);

        change.row_structure = true;
        change.rows.insert(id);
        Ok(vec![Op::MoveRow { id, after: previous }])
    }

    fn insert_column(
        &mut self,
        after: Option<ColumnId>,
        id: ColumnId,
        column: &ColumnData,
        mode: ApplyMode,
        change: &mut TableChange,
    ) -> Result<Vec<Op>, TableError> {
        if self.columns.contains_key(&id) {
            return missing(mode, TableError::DuplicateColumn(id));
        }
        let position = match after {
            None => 0,
            Some(anchor) => match self.column_position(anchor) {
                Some(index) => index + 1,
                None if mode == ApplyMode::Lenient => self.column_order.len(),
                None => return Err(TableError::ColumnNotFound(anchor)),
            },
        };

        self.column_order.insert(position, id);
        self.columns.insert(id, column.clone());

        change.column_structure = true;
        change.columns.insert(id);
        Ok(vec![Op::RemoveColumn { id }])
    }

    fn remove_column(
        &mut self,
        id: ColumnId,
        mode: ApplyMode,
        change: &mut TableChange,
    ) -> Result<Vec<Op>, TableError> {
        let Some(position) = self.column_position(id) else {
            return missing(mode, TableError::ColumnNotFound(id));
        };
        let after = position.checked_sub(1).map(|i| self.column_order[i]);
        self.column_order.remove(position);
        let Some(column) = self.columns.remove(&id) else {
            return Err(TableError::ColumnNotFound(id));
        };

        change.column_structure = true;
        change.columns.insert(id);
        Ok(vec![Op::InsertColumn { after, id, column }])
    }

    fn move_column(
        &mut self,
        id: ColumnId,
        after: Option<ColumnId>,
        mode: ApplyMode,
        change: &mut TableChange,
    ) -> Result<Vec<Op>, TableError> {
        let Some(current) = self.column_position(id) else {
            return missing(mode, TableError::ColumnNotFound(id));
        };
        if after == Some(id) {
            return Ok(Vec::new());
        }
        let previous = current.checked_sub(1).map(|i| self.column_order[i]);
        if previous == after {
            return Ok(Vec::new());
        }
        if let Some(anchor) = after {
            if !self.columns.contains_key(&anchor) && mode == ApplyMode::Strict {
                return Err(TableError::ColumnNotFound(anchor));
            }
        }

        self.column_order.remove(current);
        let target = match after {
            None => 0,
            Some(anchor) => self
                .column_position(anchor)
                .map_or(self.column_order.len(), |index| index + 1),
        };
        self.column_order.insert(target, id);

        change.column_structure = true;
        change.columns.insert(id);
        Ok(vec![Op::MoveColumn { id, after: previous }])
    }

    fn set_cell(
        &mut self,
        row: RowId,
        column: ColumnId,
        cell: Option<&Cell>,
        mode: ApplyMode,
        change: &mut TableChange,
    ) -> Result<Vec<Op>, TableError> {
        // Clearing is allowed for dead columns so orphaned cells can be pruned.
        if cell.is_some() && !self.columns.contains_key(&column) {
            return missing(mode, TableError::ColumnNotFound(column));
        }
        let Some(data) = self.rows.get_mut(&row) else {
            return missing(mode, TableError::RowNotFound(row));
        };
        if data.cells.get(&column) == cell {
            return Ok(Vec::new());
        }

        let old = match cell {
            Some(cell) => data.cells.insert(column, cell.clone()),
            None => data.cells.remove(&column),
        };

        change.rows.insert(row);
        change.columns.insert(column);
        Ok(vec![Op::SetCell {
            row,
            column,
            cell: old,
        }])
    }

    fn set_vote(
        &mut self,
        row: RowId,
        column: ColumnId,
        user: &str,
        voted: bool,
        mode: ApplyMode,
        change: &mut TableChange,
    ) -> Result<Vec<Op>, TableError> {
        if !self.columns.contains_key(&column) {
            return missing(mode, TableError::ColumnNotFound(column));
        }
        let Some(data) = self.rows.get_mut(&row) else {
            return missing(mode, TableError::RowNotFound(row));
        };

        let inverse = match data.cells.get_mut(&column) {
            None if !voted => return Ok(Vec::new()),
            None => {
                let mut vote = Vote::new();
                vote.add_vote(user);
                data.cells.insert(column, Cell::new(vote));
                Op::SetCell {
                    row,
                    column,
                    cell: None,
                }
            }
            Some(Cell {
                value: CellValue::Vote(vote),
                ..
            }) => {
                let changed = if voted {
                    vote.add_vote(user)
                } else {
                    vote.remove_vote(user)
                };
                if !changed {
                    return Ok(Vec::new());
                }
                Op::SetVote {
                    row,
                    column,
                    user: user.to_string(),
                    voted: !voted,
                }
            }
            Some(_) => return missing(mode, TableError::NotAVote { row, column }),
        };

        change.rows.insert(row);
        change.columns.insert(column);
        Ok(vec![inverse])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(rows: usize) -> (TableData, Vec<RowId>, ColumnId) {
        let mut data = TableData::default();
        let column = ColumnId::new();
        data.column_order.push(column);
        data.columns.insert(column, ColumnData::new("A"));
        let ids: Vec<RowId> = (0..rows).map(|_| RowId::new()).collect();
        for id in &ids {
            data.row_order.push(*id);
            data.rows.insert(*id, RowData::default());
        }
        (data, ids, column)
    }

    fn undo(data: &mut TableData, inverse: &[Op]) {
        let mut change = TableChange::default();
        for op in inverse {
            data.apply(op, ApplyMode::Strict, &mut change).unwrap();
        }
    }

    #[test]
    fn test_remove_rows_inverse_restores_order() {
        let (mut data, ids, _) = seeded(8);
        let before = data.clone();
        let remove = vec![ids[0], ids[1], ids[3], ids[6], ids[7]];

        let mut change = TableChange::default();
        let inverse = data
            .apply(&Op::RemoveRows { ids: remove }, ApplyMode::Strict, &mut change)
            .unwrap();
        assert_eq!(data.row_order, vec![ids[2], ids[4], ids[5]]);
        assert_eq!(inverse.len(), 3);
        assert!(change.row_structure);

        undo(&mut data, &inverse);
        assert_eq!(data, before);
    }

    #[test]
    fn test_strict_rejects_before_mutating() {
        let (mut data, ids, _) = seeded(3);
        let before = data.clone();
        let mut change = TableChange::default();
        let err = data
            .apply(
                &Op::RemoveRows {
                    ids: vec![ids[0], RowId::new()],
                },
                ApplyMode::Strict,
                &mut change,
            )
            .unwrap_err();
        assert!(matches!(err, TableError::RowNotFound(_)));
        assert_eq!(data, before);
        assert!(change.is_empty());
    }

    #[test]
    fn test_lenient_skips_missing() {
        let (mut data, ids, _) = seeded(3);
        let mut change = TableChange::default();
        let inverse = data
            .apply(
                &Op::RemoveRows {
                    ids: vec![ids[1], RowId::new()],
                },
                ApplyMode::Lenient,
                &mut change,
            )
            .unwrap();
        assert_eq!(data.row_order, vec![ids[0], ids[2]]);
        assert_eq!(inverse.len(), 1);
    }

    #[test]
    fn test_lenient_insert_with_missing_anchor_appends() {
        let (mut data, ids, column) = seeded(2);
        let new_id = RowId::new();
        let mut row = RowData::default();
        row.cells.insert(column, Cell::new("kept"));
        row.cells.insert(ColumnId::new(), Cell::new("dropped"));

        let mut change = TableChange::default();
        data.apply(
            &Op::InsertRows {
                after: Some(RowId::new()),
                rows: vec![(new_id, row)],
            },
            ApplyMode::Lenient,
            &mut change,
        )
        .unwrap();

        assert_eq!(data.row_order, vec![ids[0], ids[1], new_id]);
        assert_eq!(data.rows[&new_id].cells.len(), 1);
    }

    #[test]
    fn test_move_row_inverse() {
        let (mut data, ids, _) = seeded(4);
        let before = data.clone();
        let mut change = TableChange::default();
        let inverse = data
            .apply(
                &Op::MoveRow {
                    id: ids[0],
                    after: Some(ids[2]),
                },
                ApplyMode::Strict,
                &mut change,
            )
            .unwrap();
        assert_eq!(data.row_order, vec![ids[1], ids[2], ids[0], ids[3]]);
        undo(&mut data, &inverse);
        assert_eq!(data, before);
    }

    #[test]
    fn test_unchanged_ops_yield_no_inverse() {
        let (mut data, ids, column) = seeded(2);
        let mut change = TableChange::default();
        let ops = [
            Op::MoveRow {
                id: ids[1],
                after: Some(ids[0]),
            },
            Op::SetCell {
                row: ids[0],
                column,
                cell: None,
            },
            Op::SetColumnName {
                id: column,
                name: "A".into(),
            },
            Op::SetVote {
                row: ids[0],
                column,
                user: "u".into(),
                voted: false,
            },
        ];
        for op in &ops {
            assert!(data.apply(op, ApplyMode::Strict, &mut change).unwrap().is_empty());
        }
        assert!(change.is_empty());
    }

    #[test]
    fn test_concurrent_votes_merge() {
        let (mut data, ids, column) = seeded(1);
        let mut change = TableChange::default();
        for user in ["alice", "bob"] {
            data.apply(
                &Op::SetVote {
                    row: ids[0],
                    column,
                    user: user.into(),
                    voted: true,
                },
                ApplyMode::Lenient,
                &mut change,
            )
            .unwrap();
        }
        let vote = data.rows[&ids[0]].cells[&column].value.as_vote().unwrap();
        assert_eq!(vote.vote_count(), 2);
    }

    #[test]
    fn test_vote_on_non_vote_cell() {
        let (mut data, ids, column) = seeded(1);
        let mut change = TableChange::default();
        data.apply(
            &Op::SetCell {
                row: ids[0],
                column,
                cell: Some(Cell::new(1.0)),
            },
            ApplyMode::Strict,
            &mut change,
        )
        .unwrap();
        let vote = Op::SetVote {
            row: ids[0],
            column,
            user: "u".into(),
            voted: true,
        };
        assert!(matches!(
            data.apply(&vote, ApplyMode::Strict, &mut change),
            Err(TableError::NotAVote { .. })
        ));
        assert!(data.apply(&vote, ApplyMode::Lenient, &mut change).unwrap().is_empty());
    }

    #[test]
    fn test_remove_column_inverse() {
        let (mut data, _, column) = seeded(0);
        let second = ColumnId::new();
        let mut change = TableChange::default();
        data.apply(
            &Op::InsertColumn {
                after: Some(column),
                id: second,
                column: ColumnData::new("B"),
            },
            ApplyMode::Strict,
            &mut change,
        )
        .unwrap();
        let before = data.clone();
        let inverse = data
            .apply(&Op::RemoveColumn { id: second }, ApplyMode::Strict, &mut change)
            .unwrap();
        assert_eq!(data.column_order, vec![column]);
        undo(&mut data, &inverse);
        assert_eq!(data, before);
    }
}
