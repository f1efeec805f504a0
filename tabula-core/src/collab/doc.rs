//! The replicated form of a table, kept in a yrs document.
//!
//! ```text
//!  column_order: Array<columnId>     columns: Map<columnId, Map>
//!  row_order:    Array<rowId>        rows:    Map<rowId, Map>
//! ```
//!
//! A column map holds `name`, `hint`, `default` and one `prop:{key}` entry
//! per property. A row map holds one encoded cell per column id, its
//! `prop:{key}` entries, and a `vote:{columnId}:{user}` marker per vote so
//! that votes cast concurrently by different users merge.
//!
//! yrs decides the merged state; [`TableDoc::materialize`] reads it back.
//! An element is live only while it is both in its order array and in its
//! map. Concurrent moves can leave an id in an order array twice, in which
//! case the first occurrence wins. Cells of dead columns are never read.

use bincode::config;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Array, ArrayRef, Doc, Map, MapPrelim, MapRef, Out, ReadTxn, StateVector, Transact,
    TransactionMut, Update,
};

use crate::error::TableError;
use crate::ids::{ColumnId, RowId};
use crate::table::{ColumnData, Op, RowData, TableData};
use crate::value::{Cell, CellValue, Hint, PropValue, Props, Vote};

const NAME: &str = "name";
const HINT: &str = "hint";
const DEFAULT: &str = "default";
const PROP_PREFIX: &str = "prop:";
const VOTE_PREFIX: &str = "vote:";

pub(crate) struct TableDoc {
    doc: Doc,
    column_order: ArrayRef,
    columns: MapRef,
    row_order: ArrayRef,
    rows: MapRef,
}

impl Default for TableDoc {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TableDoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableDoc").finish_non_exhaustive()
    }
}

impl TableDoc {
    pub(crate) fn new() -> Self {
        let doc = Doc::new();
        let column_order = doc.get_or_insert_array("column_order");
        let columns = doc.get_or_insert_map("columns");
        let row_order = doc.get_or_insert_array("row_order");
        let rows = doc.get_or_insert_map("rows");
        Self {
            doc,
            column_order,
            columns,
            row_order,
            rows,
        }
    }

    /// A document holding `data`, written as one local transaction.
    pub(crate) fn from_data(data: &TableData) -> Result<Self, TableError> {
        let shared = Self::new();
        {
            let mut txn = shared.doc.transact_mut();
            let mut after = None;
            for id in &data.column_order {
                if let Some(column) = data.columns.get(id) {
                    shared.insert_column(&mut txn, after, *id, column)?;
                    after = Some(*id);
                }
            }
            let rows: Vec<(RowId, RowData)> = data
                .row_order
                .iter()
                .filter_map(|id| data.rows.get(id).map(|row| (*id, row.clone())))
                .collect();
            shared.insert_rows(&mut txn, None, &rows)?;
        }
        Ok(shared)
    }

    // ---- Encoding ------------------------------------------------------

    pub(crate) fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Everything this document holds that a peer at `state_vector` lacks.
    pub(crate) fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, TableError> {
        let remote = StateVector::decode_v1(state_vector)
            .map_err(|e| TableError::Decode(e.to_string()))?;
        Ok(self.doc.transact().encode_diff_v1(&remote))
    }

    pub(crate) fn encode_state(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    /// Merge an encoded update. Updates whose dependencies are still missing
    /// are held by yrs until those arrive.
    pub(crate) fn apply_update(&self, bytes: &[u8]) -> Result<(), TableError> {
        let update = Update::decode_v1(bytes).map_err(|e| TableError::Decode(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| TableError::Decode(e.to_string()))
    }

    // ---- Local edits ---------------------------------------------------

    /// Write committed ops as one transaction and return its encoded update.
    pub(crate) fn record(&self, ops: &[Op]) -> Result<Vec<u8>, TableError> {
        let mut txn = self.doc.transact_mut();
        for op in ops {
            self.write_op(&mut txn, op)?;
        }
        Ok(txn.encode_update_v1())
    }

    fn write_op(&self, txn: &mut TransactionMut<'_>, op: &Op) -> Result<(), TableError> {
        match op {
            Op::InsertRows { after, rows } => self.insert_rows(txn, *after, rows)?,
            Op::RemoveRows { ids } => {
                for id in ids {
                    self.rows.remove(txn, &id.to_string());
                }
                remove_ids(&self.row_order, txn, ids);
            }
            Op::MoveRow { id, after } => {
                remove_ids(&self.row_order, txn, &[*id]);
                let index = insert_index(&self.row_order, &*txn, *after);
                self.row_order.insert(txn, index, id_any(id));
            }
            Op::InsertColumn { after, id, column } => self.insert_column(txn, *after, *id, column)?,
            Op::RemoveColumn { id } => {
                self.columns.remove(txn, &id.to_string());
                remove_ids(&self.column_order, txn, &[*id]);
            }
            Op::MoveColumn { id, after } => {
                remove_ids(&self.column_order, txn, &[*id]);
                let index = insert_index(&self.column_order, &*txn, *after);
                self.column_order.insert(txn, index, id_any(id));
            }
            Op::SetCell { row, column, cell } => {
                if let Some(map) = nested(&self.rows, &*txn, row) {
                    write_cell(txn, &map, *column, cell.as_ref())?;
                }
            }
            Op::SetVote {
                row,
                column,
                user,
                voted,
            } => {
                if let Some(map) = nested(&self.rows, &*txn, row) {
                    let key = column.to_string();
                    if map.get(&*txn, &key).is_none() {
                        map.insert(txn, key, encoded(&Cell::new(Vote::new()))?);
                    }
                    let marker = vote_key(*column, user);
                    if *voted {
                        map.insert(txn, marker, Any::Bool(true));
                    } else {
                        map.remove(txn, &marker);
                    }
                }
            }
            Op::SetColumnName { id, name } => {
                if let Some(map) = nested(&self.columns, &*txn, id) {
                    map.insert(txn, NAME, Any::String(name.as_str().into()));
                }
            }
            Op::SetColumnHint { id, hint } => {
                if let Some(map) = nested(&self.columns, &*txn, id) {
                    match hint {
                        Some(hint) => {
                            map.insert(txn, HINT, Any::String(hint.as_str().into()));
                        }
                        None => {
                            map.remove(txn, HINT);
                        }
                    }
                }
            }
            Op::SetColumnDefault { id, value } => {
                if let Some(map) = nested(&self.columns, &*txn, id) {
                    match value {
                        Some(value) => {
                            map.insert(txn, DEFAULT, encoded(value)?);
                        }
                        None => {
                            map.remove(txn, DEFAULT);
                        }
                    }
                }
            }
            Op::SetColumnProp { id, key, value } => {
                if let Some(map) = nested(&self.columns, &*txn, id) {
                    write_prop(txn, &map, key, value.as_ref());
                }
            }
            Op::SetRowProp { id, key, value } => {
                if let Some(map) = nested(&self.rows, &*txn, id) {
                    write_prop(txn, &map, key, value.as_ref());
                }
            }
        }
        Ok(())
    }

    fn insert_rows(
        &self,
        txn: &mut TransactionMut<'_>,
        after: Option<RowId>,
        rows: &[(RowId, RowData)],
    ) -> Result<(), TableError> {
        if rows.is_empty() {
            return Ok(());
        }
        let index = insert_index(&self.row_order, &*txn, after);
        let ids: Vec<Any> = rows.iter().map(|(id, _)| id_any(id)).collect();
        self.row_order.insert_range(txn, index, ids);
        for (id, row) in rows {
            let map: MapRef = self.rows.insert(txn, id.to_string(), MapPrelim::default());
            for (column, cell) in &row.cells {
                write_cell(txn, &map, *column, Some(cell))?;
            }
            for (key, value) in &row.props {
                write_prop(txn, &map, key, Some(value));
            }
        }
        Ok(())
    }

    fn insert_column(
        &self,
        txn: &mut TransactionMut<'_>,
        after: Option<ColumnId>,
        id: ColumnId,
        column: &ColumnData,
    ) -> Result<(), TableError> {
        let index = insert_index(&self.column_order, &*txn, after);
        self.column_order.insert(txn, index, id_any(&id));
        let map: MapRef = self.columns.insert(txn, id.to_string(), MapPrelim::default());
        map.insert(txn, NAME, Any::String(column.name.as_str().into()));
        if let Some(hint) = column.hint {
            map.insert(txn, HINT, Any::String(hint.as_str().into()));
        }
        if let Some(value) = &column.default_value {
            map.insert(txn, DEFAULT, encoded(value)?);
        }
        for (key, value) in &column.props {
            write_prop(txn, &map, key, Some(value));
        }
        Ok(())
    }

    // ---- Reading the merged state --------------------------------------

    /// The table this document currently describes.
    pub(crate) fn materialize(&self) -> TableData {
        let txn = self.doc.transact();
        let mut data = TableData::default();

        for id in ordered_ids::<ColumnId, _>(&self.column_order, &txn) {
            if let Some(map) = nested(&self.columns, &txn, &id) {
                data.columns.insert(id, read_column(&map, &txn));
                data.column_order.push(id);
            }
        }
        for id in ordered_ids::<RowId, _>(&self.row_order, &txn) {
            if let Some(map) = nested(&self.rows, &txn, &id) {
                data.rows.insert(id, read_row(&map, &txn, &data.columns));
                data.row_order.push(id);
            }
        }
        data
    }
}

fn id_any(id: &impl ToString) -> Any {
    Any::String(id.to_string().into())
}

fn vote_key(column: ColumnId, user: &str) -> String {
    format!("{VOTE_PREFIX}{column}:{user}")
}

fn encoded<T: Serialize>(value: &T) -> Result<Any, TableError> {
    let bytes = bincode::serde::encode_to_vec(value, config::standard())
        .map_err(|e| TableError::Encode(e.to_string()))?;
    Ok(Any::Buffer(bytes.into()))
}

fn decoded<T: DeserializeOwned>(value: &Out) -> Option<T> {
    let Out::Any(Any::Buffer(bytes)) = value else {
        return None;
    };
    match bincode::serde::decode_from_slice(bytes, config::standard()) {
        Ok((value, _)) => Some(value),
        Err(e) => {
            log::warn!("Skipping undecodable document entry: {e}");
            None
        }
    }
}

fn prop_any(value: &PropValue) -> Any {
    match value {
        PropValue::String(s) => Any::String(s.as_str().into()),
        PropValue::Number(n) => Any::Number(*n),
        PropValue::Boolean(b) => Any::Bool(*b),
    }
}

fn read_prop(value: &Out) -> Option<PropValue> {
    match value {
        Out::Any(Any::String(s)) => Some(PropValue::String(s.to_string())),
        Out::Any(Any::Number(n)) => Some(PropValue::Number(*n)),
        Out::Any(Any::BigInt(n)) => Some(PropValue::Number(*n as f64)),
        Out::Any(Any::Bool(b)) => Some(PropValue::Boolean(*b)),
        _ => None,
    }
}

/// The nested map stored under `id`, if it is still there.
fn nested<T: ReadTxn>(parent: &MapRef, txn: &T, id: &impl ToString) -> Option<MapRef> {
    match parent.get(txn, &id.to_string()) {
        Some(Out::YMap(map)) => Some(map),
        _ => None,
    }
}

fn write_prop(txn: &mut TransactionMut<'_>, map: &MapRef, key: &str, value: Option<&PropValue>) {
    let key = format!("{PROP_PREFIX}{key}");
    match value {
        Some(value) => {
            map.insert(txn, key, prop_any(value));
        }
        None => {
            map.remove(txn, &key);
        }
    }
}

fn write_cell(
    txn: &mut TransactionMut<'_>,
    map: &MapRef,
    column: ColumnId,
    cell: Option<&Cell>,
) -> Result<(), TableError> {
    let prefix = vote_key(column, "");
    let markers: Vec<String> = map
        .keys(&*txn)
        .filter(|key| key.starts_with(&prefix))
        .map(str::to_string)
        .collect();
    for marker in markers {
        map.remove(txn, &marker);
    }

    let key = column.to_string();
    match cell {
        None => {
            map.remove(txn, &key);
        }
        Some(Cell {
            value: CellValue::Vote(vote),
            props,
        }) => {
            let stored = Cell {
                value: CellValue::Vote(Vote::new()),
                props: props.clone(),
            };
            map.insert(txn, key, encoded(&stored)?);
            for user in vote.voters() {
                map.insert(txn, vote_key(column, user), Any::Bool(true));
            }
        }
        Some(cell) => {
            map.insert(txn, key, encoded(cell)?);
        }
    }
    Ok(())
}

/// Index just after the first occurrence of `after`, or the end if it is gone.
fn insert_index<T: ReadTxn, I: ToString>(array: &ArrayRef, txn: &T, after: Option<I>) -> u32 {
    let Some(anchor) = after.map(|id| id.to_string()) else {
        return 0;
    };
    array
        .iter(txn)
        .position(|value| matches!(&value, Out::Any(Any::String(s)) if &**s == anchor))
        .map_or_else(|| array.len(txn), |index| index as u32 + 1)
}

/// Remove every occurrence of the given ids, in contiguous runs.
fn remove_ids<I: ToString>(array: &ArrayRef, txn: &mut TransactionMut<'_>, ids: &[I]) {
    let doomed: HashSet<String> = ids.iter().map(ToString::to_string).collect();
    let mut runs: Vec<(u32, u32)> = Vec::new();
    for (index, value) in array.iter(&*txn).enumerate() {
        let Out::Any(Any::String(s)) = &value else {
            continue;
        };
        if !doomed.contains(&**s) {
            continue;
        }
        let index = index as u32;
        match runs.last_mut() {
            Some((start, len)) if *start + *len == index => *len += 1,
            _ => runs.push((index, 1)),
        }
    }
    for (start, len) in runs.into_iter().rev() {
        array.remove_range(txn, start, len);
    }
}

/// Parsed ids of an order array, first occurrence only.
fn ordered_ids<I, T>(array: &ArrayRef, txn: &T) -> Vec<I>
where
    I: FromStr + Eq + Hash + Copy,
    T: ReadTxn,
{
    let mut seen = HashSet::new();
    array
        .iter(txn)
        .filter_map(|value| match value {
            Out::Any(Any::String(s)) => s.parse::<I>().ok(),
            _ => None,
        })
        .filter(|id| seen.insert(*id))
        .collect()
}

fn read_column<T: ReadTxn>(map: &MapRef, txn: &T) -> ColumnData {
    let mut column = ColumnData::default();
    for (key, value) in map.iter(txn) {
        match key {
            NAME => {
                if let Out::Any(Any::String(s)) = &value {
                    column.name = s.to_string();
                }
            }
            HINT => {
                if let Out::Any(Any::String(s)) = &value {
                    column.hint = s.parse::<Hint>().ok();
                }
            }
            DEFAULT => column.default_value = decoded::<CellValue>(&value),
            _ => {
                if let Some(prop) = key.strip_prefix(PROP_PREFIX) {
                    if let Some(value) = read_prop(&value) {
                        column.props.insert(prop.to_string(), value);
                    }
                }
            }
        }
    }
    column
}

fn read_row<T: ReadTxn>(
    map: &MapRef,
    txn: &T,
    columns: &HashMap<ColumnId, ColumnData>,
) -> RowData {
    let mut cells = BTreeMap::new();
    let mut props = Props::new();
    let mut voters: HashMap<ColumnId, Vec<String>> = HashMap::new();

    for (key, value) in map.iter(txn) {
        if let Some(prop) = key.strip_prefix(PROP_PREFIX) {
            if let Some(value) = read_prop(&value) {
                props.insert(prop.to_string(), value);
            }
        } else if let Some(marker) = key.strip_prefix(VOTE_PREFIX) {
            let Some((column, user)) = marker.split_once(':') else {
                continue;
            };
            if let (Ok(column), Out::Any(Any::Bool(true))) = (column.parse::<ColumnId>(), &value) {
                voters.entry(column).or_default().push(user.to_string());
            }
        } else if let Ok(column) = key.parse::<ColumnId>() {
            if columns.contains_key(&column) {
                if let Some(cell) = decoded::<Cell>(&value) {
                    cells.insert(column, cell);
                }
            }
        }
    }

    for (column, cell) in cells.iter_mut() {
        if let CellValue::Vote(vote) = &mut cell.value {
            for user in voters.remove(column).unwrap_or_default() {
                vote.add_vote(&user);
            }
        }
    }
    RowData { cells, props }
}
