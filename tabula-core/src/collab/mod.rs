//! Replication of a table between replicas.
//!
//! Each [`Table`] carries a yrs document. Local commits are written to it
//! and shipped as encoded yrs updates ([`Commit::update`]). Received
//! updates are merged into the document and the table is then brought in
//! line with the merged state as one `Remote` commit, so replicas that
//! merged the same updates hold the same table whatever the arrival order.
//!
//! State transfer follows the usual yrs handshake: a joiner sends its
//! [`state_vector`](Table::state_vector) and a peer answers with
//! [`encode_diff`](Table::encode_diff).
//!
//! [`Commit::update`]: crate::table::Commit::update

mod doc;

pub(crate) use doc::TableDoc;

use bincode::config;
use serde::{Deserialize, Serialize};

use crate::error::TableError;
use crate::ids::{ColumnId, RowId};
use crate::table::{ColumnData, Op, RowData, Table, TableData};

/// Full table contents in order, for inspection and JSON export.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub columns: Vec<(ColumnId, ColumnData)>,
    pub rows: Vec<(RowId, RowData)>,
}

impl TableSnapshot {
    pub fn encode(&self) -> Result<Vec<u8>, TableError> {
        bincode::serde::encode_to_vec(self, config::standard())
            .map_err(|e| TableError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TableError> {
        let (snapshot, _) = bincode::serde::decode_from_slice(bytes, config::standard())
            .map_err(|e| TableError::Decode(e.to_string()))?;
        Ok(snapshot)
    }

    fn into_data(self) -> TableData {
        let mut data = TableData::default();
        for (id, column) in self.columns {
            if data.columns.insert(id, column).is_none() {
                data.column_order.push(id);
            }
        }
        for (id, row) in self.rows {
            if data.rows.insert(id, row).is_none() {
                data.row_order.push(id);
            }
        }
        data
    }
}

impl Table {
    pub fn snapshot(&self) -> TableSnapshot {
        let data = &self.data;
        TableSnapshot {
            columns: data
                .column_order
                .iter()
                .filter_map(|id| data.columns.get(id).map(|c| (*id, c.clone())))
                .collect(),
            rows: data
                .row_order
                .iter()
                .filter_map(|id| data.rows.get(id).map(|r| (*id, r.clone())))
                .collect(),
        }
    }

    /// Build a new document from a snapshot. Duplicate ids keep their first position.
    ///
    /// The result is a fresh replica; to join an existing one use
    /// [`load_state`](Self::load_state) on an empty table.
    pub fn from_snapshot(snapshot: TableSnapshot) -> Self {
        Table::from_data(snapshot.into_data())
    }

    /// Encoded yrs state vector of this replica.
    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.state_vector()
    }

    /// Everything this replica holds that a peer with `state_vector` is missing.
    pub fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, TableError> {
        self.doc.encode_diff(state_vector)
    }

    /// The whole document as one encoded update.
    pub fn encode_state(&self) -> Vec<u8> {
        self.doc.encode_state()
    }

    /// Merge an update from another replica and apply the result as one
    /// `Remote` commit.
    ///
    /// Updates may arrive in any order and more than once. One that depends
    /// on edits not yet seen takes effect once those arrive.
    pub fn apply_update(&mut self, bytes: &[u8]) -> Result<(), TableError> {
        if self.in_transaction() {
            return Err(TableError::TransactionInProgress);
        }
        self.doc.apply_update(bytes)?;
        self.refresh_from_doc()
    }

    /// Merge a state from [`encode_state`](Self::encode_state) or
    /// [`encode_diff`](Self::encode_diff). Local edits not in it are kept.
    pub fn load_state(&mut self, bytes: &[u8]) -> Result<(), TableError> {
        self.apply_update(bytes)?;
        log::debug!(
            "Loaded table state: {} columns, {} rows",
            self.column_count(),
            self.row_count()
        );
        Ok(())
    }

    fn refresh_from_doc(&mut self) -> Result<(), TableError> {
        let target = self.doc.materialize();
        let ops = reconcile_ops(&self.data, &target);
        if ops.is_empty() {
            return Ok(());
        }
        log::trace!("Applying {} ops from the merged document", ops.len());
        self.apply_remote(ops)
    }

    /// Pretty JSON of the ordered table contents.
    pub fn to_json(&self) -> Result<String, TableError> {
        serde_json::to_string_pretty(&self.snapshot()).map_err(|e| TableError::Encode(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, TableError> {
        let snapshot: TableSnapshot =
            serde_json::from_str(json).map_err(|e| TableError::Decode(e.to_string()))?;
        Ok(Table::from_snapshot(snapshot))
    }
}

/// Ops that turn `current` into `target`, in application order.
fn reconcile_ops(current: &TableData, target: &TableData) -> Vec<Op> {
    let mut ops = Vec::new();

    let mut order = Vec::with_capacity(current.column_order.len());
    for id in &current.column_order {
        if target.columns.contains_key(id) {
            order.push(*id);
        } else {
            ops.push(Op::RemoveColumn { id: *id });
        }
    }
    let mut after = None;
    for (index, id) in target.column_order.iter().enumerate() {
        let Some(column) = target.columns.get(id) else {
            continue;
        };
        if order.get(index) != Some(id) {
            match order.iter().position(|c| c == id) {
                Some(from) => {
                    order.remove(from);
                    ops.push(Op::MoveColumn { id: *id, after });
                }
                None => ops.push(Op::InsertColumn {
                    after,
                    id: *id,
                    column: column.clone(),
                }),
            }
            order.insert(index, *id);
        }
        if let Some(old) = current.columns.get(id) {
            column_ops(*id, old, column, &mut ops);
        }
        after = Some(*id);
    }

    let mut order = Vec::with_capacity(current.row_order.len());
    let mut removed = Vec::new();
    for id in &current.row_order {
        if target.rows.contains_key(id) {
            order.push(*id);
        } else {
            removed.push(*id);
        }
    }
    if !removed.is_empty() {
        ops.push(Op::RemoveRows { ids: removed });
    }

    let mut after = None;
    let mut index = 0;
    while index < target.row_order.len() {
        let id = target.row_order[index];
        if !current.rows.contains_key(&id) {
            // New rows arrive in runs; one insert per run.
            let run: Vec<(RowId, RowData)> = target.row_order[index..]
                .iter()
                .take_while(|r| !current.rows.contains_key(*r))
                .map(|r| (*r, target.rows.get(r).cloned().unwrap_or_default()))
                .collect();
            let last = run.last().map(|(r, _)| *r);
            order.splice(index..index, run.iter().map(|(r, _)| *r));
            index += run.len();
            ops.push(Op::InsertRows { after, rows: run });
            after = last;
            continue;
        }

        if order.get(index) != Some(&id) {
            if let Some(from) = order.iter().position(|r| *r == id) {
                order.remove(from);
            }
            order.insert(index, id);
            ops.push(Op::MoveRow { id, after });
        }
        if let (Some(old), Some(new)) = (current.rows.get(&id), target.rows.get(&id)) {
            row_ops(id, old, new, &mut ops);
        }
        after = Some(id);
        index += 1;
    }
    ops
}

fn column_ops(id: ColumnId, old: &ColumnData, new: &ColumnData, ops: &mut Vec<Op>) {
    if old == new {
        return;
    }
    if old.name != new.name {
        ops.push(Op::SetColumnName {
            id,
            name: new.name.clone(),
        });
    }
    if old.hint != new.hint {
        ops.push(Op::SetColumnHint { id, hint: new.hint });
    }
    if old.default_value != new.default_value {
        ops.push(Op::SetColumnDefault {
            id,
            value: new.default_value.clone(),
        });
    }
    for (key, value) in &new.props {
        if old.props.get(key) != Some(value) {
            ops.push(Op::SetColumnProp {
                id,
                key: key.clone(),
                value: Some(value.clone()),
            });
        }
    }
    for key in old.props.keys().filter(|key| !new.props.contains_key(*key)) {
        ops.push(Op::SetColumnProp {
            id,
            key: key.clone(),
            value: None,
        });
    }
}

fn row_ops(id: RowId, old: &RowData, new: &RowData, ops: &mut Vec<Op>) {
    if old == new {
        return;
    }
    for (column, cell) in &new.cells {
        if old.cells.get(column) != Some(cell) {
            ops.push(Op::SetCell {
                row: id,
                column: *column,
                cell: Some(cell.clone()),
            });
        }
    }
    for column in old.cells.keys().filter(|c| !new.cells.contains_key(*c)) {
        ops.push(Op::SetCell {
            row: id,
            column: *column,
            cell: None,
        });
    }
    for (key, value) in &new.props {
        if old.props.get(key) != Some(value) {
            ops.push(Op::SetRowProp {
                id,
                key: key.clone(),
                value: Some(value.clone()),
            });
        }
    }
    for key in old.props.keys().filter(|key| !new.props.contains_key(*key)) {
        ops.push(Op::SetRowProp {
            id,
            key: key.clone(),
            value: None,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::CommitKind;
    use crate::undo::UndoRedo;
    use crate::value::{CellValue, DateTime, Hint, Vote};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn capture_updates(table: &Table) -> (Rc<RefCell<Vec<Vec<u8>>>>, crate::events::Subscription) {
        let updates = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&updates);
        let sub = table.on_commit(move |commit| {
            if let Some(update) = &commit.update {
                sink.borrow_mut().push(update.clone());
            }
        });
        (updates, sub)
    }

    fn replay(updates: &RefCell<Vec<Vec<u8>>>, into: &mut Table) {
        for bytes in updates.borrow_mut().drain(..) {
            into.apply_update(&bytes).unwrap();
        }
    }

    fn replica_of(source: &Table) -> Table {
        let mut replica = Table::new();
        replica.load_state(&source.encode_state()).unwrap();
        replica
    }

    /// Exchange pending updates both ways.
    fn exchange(
        a: &mut Table,
        from_a: &RefCell<Vec<Vec<u8>>>,
        b: &mut Table,
        from_b: &RefCell<Vec<Vec<u8>>>,
    ) {
        let a_out: Vec<Vec<u8>> = from_a.borrow_mut().drain(..).collect();
        let b_out: Vec<Vec<u8>> = from_b.borrow_mut().drain(..).collect();
        for bytes in &b_out {
            a.apply_update(bytes).unwrap();
        }
        for bytes in &a_out {
            b.apply_update(bytes).unwrap();
        }
    }

    #[test]
    fn test_state_transfer() {
        let mut source = Table::with_default_schema(3);
        let column = source.column_ids()[0];
        let row = source.row_ids()[1];
        source.row_mut(row).unwrap().set_value(column, "hello").unwrap();

        let replica = replica_of(&source);
        assert_eq!(replica.snapshot(), source.snapshot());
    }

    #[test]
    fn test_load_state_is_one_remote_commit() {
        let source = Table::with_default_schema(2);
        let mut replica = Table::new();
        let undo = UndoRedo::new(&replica);
        let kinds = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&kinds);
        let _sub = replica.on_commit(move |c| sink.borrow_mut().push((c.kind, c.update.is_some())));

        replica.load_state(&source.encode_state()).unwrap();
        assert_eq!(replica.snapshot(), source.snapshot());
        assert_eq!(*kinds.borrow(), vec![(CommitKind::Remote, false)]);
        assert!(!undo.can_undo());

        // Merging the same state again changes nothing.
        replica.load_state(&source.encode_state()).unwrap();
        assert_eq!(kinds.borrow().len(), 1);
    }

    #[test]
    fn test_diff_against_state_vector() {
        let mut source = Table::with_default_schema(2);
        let mut replica = replica_of(&source);
        let column = source.column_ids()[1];
        let row = source.row_ids()[0];
        source.row_mut(row).unwrap().set_value(column, 9.0).unwrap();

        let diff = source.encode_diff(&replica.state_vector()).unwrap();
        assert!(diff.len() < source.encode_state().len());
        replica.load_state(&diff).unwrap();
        assert_eq!(replica.snapshot(), source.snapshot());
    }

    #[test]
    fn test_document_tracks_local_edits() {
        let mut table = Table::with_default_schema(4);
        let ids = table.row_ids().to_vec();
        let columns = table.column_ids().to_vec();

        table.row_mut(ids[0]).unwrap().set_value(columns[0], "a").unwrap();
        table.row_mut(ids[1]).unwrap().toggle_vote(columns[4], "alice").unwrap();
        table.row_mut(ids[1]).unwrap().toggle_vote(columns[4], "bob").unwrap();
        table.row_mut(ids[2]).unwrap().set_prop("color", Some("red".into())).unwrap();
        table.row_mut(ids[3]).unwrap().move_to(0).unwrap();
        table.column_mut(columns[2]).unwrap().set_name("Done?").unwrap();
        table.column_mut(columns[2]).unwrap().move_to(0).unwrap();
        table.column_mut(columns[1]).unwrap().set_hint(None).unwrap();
        table.delete_column(columns[0]).unwrap();
        table.delete_rows(&[ids[2]]).unwrap();
        let extra = table.add_row().unwrap();
        table.row_mut(extra).unwrap().move_to(1).unwrap();

        assert_eq!(table.doc.materialize(), table.data);
    }

    #[test]
    fn test_updates_converge() {
        let mut alice = Table::with_default_schema(2);
        let mut bob = replica_of(&alice);
        let (updates, _sub) = capture_updates(&alice);

        let column = alice.column_ids()[3];
        let first = alice.row_ids()[0];
        alice.add_row().unwrap();
        alice.row_mut(first).unwrap().move_to(2).unwrap();
        alice
            .row_mut(first)
            .unwrap()
            .set_value(column, DateTime::from_millis(0).unwrap())
            .unwrap();
        alice.column_mut(column).unwrap().move_to(0).unwrap();

        replay(&updates, &mut bob);
        assert_eq!(bob.snapshot(), alice.snapshot());
    }

    #[test]
    fn test_out_of_order_updates_wait_for_dependencies() {
        let mut alice = Table::with_default_schema(1);
        let mut bob = replica_of(&alice);
        let (updates, _sub) = capture_updates(&alice);

        let row = alice.add_row().unwrap();
        let column = alice.column_ids()[0];
        alice.row_mut(row).unwrap().set_value(column, "second").unwrap();

        let updates: Vec<Vec<u8>> = updates.borrow_mut().drain(..).collect();
        bob.apply_update(&updates[1]).unwrap();
        assert_eq!(bob.row_count(), 1);
        bob.apply_update(&updates[0]).unwrap();
        assert_eq!(bob.snapshot(), alice.snapshot());
    }

    #[test]
    fn test_concurrent_delete_and_edit() {
        let mut alice = Table::with_default_schema(2);
        let mut bob = replica_of(&alice);
        let (from_alice, _a) = capture_updates(&alice);
        let (from_bob, _b) = capture_updates(&bob);

        let row = alice.row_ids()[0];
        let column = alice.column_ids()[1];
        alice.delete_rows(&[row]).unwrap();
        bob.row_mut(row).unwrap().set_value(column, 5.0).unwrap();

        exchange(&mut alice, &from_alice, &mut bob, &from_bob);
        assert_eq!(alice.snapshot(), bob.snapshot());
        assert_eq!(alice.row_count(), 1);
    }

    #[test]
    fn test_concurrent_writes_to_one_cell_converge() {
        let mut alice = Table::with_default_schema(1);
        let mut bob = replica_of(&alice);
        let (from_alice, _a) = capture_updates(&alice);
        let (from_bob, _b) = capture_updates(&bob);

        let row = alice.row_ids()[0];
        let column = alice.column_ids()[0];
        alice.row_mut(row).unwrap().set_value(column, "from alice").unwrap();
        bob.row_mut(row).unwrap().set_value(column, "from bob").unwrap();

        exchange(&mut alice, &from_alice, &mut bob, &from_bob);
        assert_eq!(alice.snapshot(), bob.snapshot());
        let value = alice.row(row).unwrap().cell(column).map(|c| c.value.clone());
        assert!(matches!(
            value.as_ref().and_then(CellValue::as_str),
            Some("from alice") | Some("from bob")
        ));
    }

    #[test]
    fn test_concurrent_inserts_at_one_position_converge() {
        let mut alice = Table::with_default_schema(3);
        let mut bob = replica_of(&alice);
        let (from_alice, _a) = capture_updates(&alice);
        let (from_bob, _b) = capture_updates(&bob);

        let a_row = alice.create_detached_row();
        let a_id = a_row.id();
        alice.insert_rows(1, vec![a_row]).unwrap();
        let b_row = bob.create_detached_row();
        let b_id = b_row.id();
        bob.insert_rows(1, vec![b_row]).unwrap();

        exchange(&mut alice, &from_alice, &mut bob, &from_bob);
        assert_eq!(alice.row_ids(), bob.row_ids());
        assert_eq!(alice.row_count(), 5);
        let inserted = &alice.row_ids()[1..3];
        assert!(inserted.contains(&a_id) && inserted.contains(&b_id));
    }

    #[test]
    fn test_concurrent_moves_of_one_row_converge() {
        let mut alice = Table::with_default_schema(4);
        let mut bob = replica_of(&alice);
        let (from_alice, _a) = capture_updates(&alice);
        let (from_bob, _b) = capture_updates(&bob);

        let row = alice.row_ids()[0];
        alice.row_mut(row).unwrap().move_to(3).unwrap();
        bob.row_mut(row).unwrap().move_to(1).unwrap();

        exchange(&mut alice, &from_alice, &mut bob, &from_bob);
        assert_eq!(alice.row_ids(), bob.row_ids());
        assert_eq!(alice.row_count(), 4);
        assert_eq!(alice.row_ids().iter().filter(|r| **r == row).count(), 1);

        // The row stays movable after the merge.
        alice.row_mut(row).unwrap().move_to(0).unwrap();
        replay(&from_alice, &mut bob);
        assert_eq!(bob.row_ids()[0], row);
        assert_eq!(alice.row_ids(), bob.row_ids());
    }

    #[test]
    fn test_delete_column_races_cell_write() {
        let mut alice = Table::with_default_schema(2);
        let mut bob = replica_of(&alice);
        let (from_alice, _a) = capture_updates(&alice);
        let (from_bob, _b) = capture_updates(&bob);

        let row = alice.row_ids()[0];
        let column = alice.column_ids()[0];
        alice.delete_column(column).unwrap();
        bob.row_mut(row).unwrap().set_value(column, "late write").unwrap();

        exchange(&mut alice, &from_alice, &mut bob, &from_bob);
        assert!(!bob.contains_column(column));
        assert!(alice.orphaned_cells().is_empty());
        assert!(bob.orphaned_cells().is_empty());
        assert_eq!(alice.snapshot(), bob.snapshot());
    }

    #[test]
    fn test_concurrent_votes_merge() {
        let mut alice = Table::with_default_schema(1);
        let mut bob = replica_of(&alice);
        let (from_alice, _a) = capture_updates(&alice);
        let (from_bob, _b) = capture_updates(&bob);

        let row = alice.row_ids()[0];
        let column = alice.column_ids()[4];
        alice.row_mut(row).unwrap().toggle_vote(column, "alice").unwrap();
        bob.row_mut(row).unwrap().toggle_vote(column, "bob").unwrap();

        exchange(&mut alice, &from_alice, &mut bob, &from_bob);
        assert_eq!(alice.snapshot(), bob.snapshot());
        let cell = alice.row(row).unwrap().cell(column).cloned().unwrap();
        let expected: Vote = ["alice", "bob"].into_iter().collect();
        assert_eq!(cell.value, CellValue::Vote(expected));
    }

    #[test]
    fn test_concurrent_column_edits_converge() {
        let mut alice = Table::with_default_schema(0);
        let mut bob = replica_of(&alice);
        let (from_alice, _a) = capture_updates(&alice);
        let (from_bob, _b) = capture_updates(&bob);

        let column = alice.column_ids()[1];
        alice.column_mut(column).unwrap().set_name("Amount").unwrap();
        bob.column_mut(column).unwrap().set_hint(Some(Hint::String)).unwrap();
        bob.column_mut(column).unwrap().move_to(4).unwrap();

        exchange(&mut alice, &from_alice, &mut bob, &from_bob);
        assert_eq!(alice.snapshot(), bob.snapshot());
        let merged = alice.column(column).unwrap();
        assert_eq!(merged.name(), "Amount");
        assert_eq!(merged.hint(), Some(Hint::String));
        assert_eq!(merged.index(), 4);
    }

    #[test]
    fn test_undo_ships_as_update() {
        let mut alice = Table::with_default_schema(1);
        let mut bob = replica_of(&alice);
        let undo = UndoRedo::new(&alice);
        let (updates, _sub) = capture_updates(&alice);

        alice.add_row().unwrap();
        assert!(undo.undo(&mut alice).unwrap());
        replay(&updates, &mut bob);
        assert_eq!(bob.row_count(), 1);
        assert_eq!(bob.snapshot(), alice.snapshot());
    }

    #[test]
    fn test_json_snapshot() {
        let mut table = Table::with_default_schema(1);
        let row = table.row_ids()[0];
        let column = table.column_ids()[0];
        table.row_mut(row).unwrap().set_value(column, "json").unwrap();

        let json = table.to_json().unwrap();
        assert!(json.contains("json"));
        let restored = Table::from_json(&json).unwrap();
        assert_eq!(restored.snapshot(), table.snapshot());
        assert_eq!(restored.doc.materialize(), restored.data);
        assert_eq!(
            restored.row(row).unwrap().cell(column).map(|c| c.value.clone()),
            Some(CellValue::from("json"))
        );
    }

    #[test]
    fn test_decode_garbage() {
        let mut table = Table::new();
        assert!(matches!(
            table.apply_update(&[0xff, 0xff, 0xff]),
            Err(TableError::Decode(_))
        ));
        assert!(table.encode_diff(&[0xff, 0xff]).is_err());
    }
}
