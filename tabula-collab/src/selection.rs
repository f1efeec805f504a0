//! Per-client table selection shared through a presence slot.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tabula_core::{CellId, ColumnId, RowId, Subscription};

use crate::protocol::SessionId;
use crate::workspace::{ConnectionStatus, LatestState, PresenceError, PresenceUpdated, Workspace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SelectionKind {
    Row,
    Column,
    Cell,
}

/// One selected element. Two selections are equal only if both id and kind match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Selection {
    pub id: String,
    pub kind: SelectionKind,
}

impl Selection {
    pub fn new(id: impl Into<String>, kind: SelectionKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }

    pub fn row(id: RowId) -> Self {
        Self::new(id.to_string(), SelectionKind::Row)
    }

    pub fn column(id: ColumnId) -> Self {
        Self::new(id.to_string(), SelectionKind::Column)
    }

    pub fn cell(id: CellId) -> Self {
        Self::new(id.to_string(), SelectionKind::Cell)
    }

    /// The row this selection refers to, for row and cell selections.
    pub fn row_id(&self) -> Option<RowId> {
        match self.kind {
            SelectionKind::Row => self.id.parse().ok(),
            SelectionKind::Cell => self.id.parse::<CellId>().ok().map(|cell| cell.row),
            SelectionKind::Column => None,
        }
    }

    pub fn column_id(&self) -> Option<ColumnId> {
        match self.kind {
            SelectionKind::Column => self.id.parse().ok(),
            SelectionKind::Cell => self.id.parse::<CellId>().ok().map(|cell| cell.column),
            SelectionKind::Row => None,
        }
    }
}

/// The value each client publishes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectionPackage {
    pub selected: Vec<Selection>,
}

pub struct SelectionManager {
    state: LatestState<SelectionPackage>,
}

impl SelectionManager {
    /// Register the selection slot `name` in `workspace`, starting with nothing selected.
    pub fn new(workspace: &Workspace, name: &str) -> Result<Self, PresenceError> {
        let state = workspace.add(name, SelectionPackage::default())?;
        Ok(Self { state })
    }

    pub fn myself(&self) -> SessionId {
        self.state.myself()
    }

    pub fn test_selection(&self, sel: &Selection) -> bool {
        self.state.local().selected.contains(sel)
    }

    /// Connected remote clients whose selection contains `sel`.
    pub fn test_remote_selection(&self, sel: &Selection) -> Vec<SessionId> {
        self.state
            .client_values()
            .into_iter()
            .filter(|cv| cv.status == ConnectionStatus::Connected && cv.value.selected.contains(sel))
            .map(|cv| cv.session)
            .collect()
    }

    pub fn get_local_selection(&self) -> Vec<Selection> {
        self.state.local().selected
    }

    /// Every selection held by a connected remote client, with the clients holding it.
    pub fn get_remote_selected(&self) -> BTreeMap<Selection, Vec<SessionId>> {
        let mut selected: BTreeMap<Selection, Vec<SessionId>> = BTreeMap::new();
        for cv in self.state.client_values() {
            if cv.status != ConnectionStatus::Connected {
                continue;
            }
            for sel in cv.value.selected {
                selected.entry(sel).or_default().push(cv.session);
            }
        }
        selected
    }

    /// Replace the local selection wholesale. Duplicates are dropped.
    pub fn set_selection(&self, selection: Vec<Selection>) -> Result<(), PresenceError> {
        let mut selected: Vec<Selection> = Vec::with_capacity(selection.len());
        for sel in selection {
            if !selected.contains(&sel) {
                selected.push(sel);
            }
        }
        self.publish(selected)
    }

    pub fn select(&self, sel: Selection) -> Result<(), PresenceError> {
        self.publish(vec![sel])
    }

    pub fn toggle_selection(&self, sel: Selection) -> Result<(), PresenceError> {
        if self.test_selection(&sel) {
            self.remove_from_selection(&sel)
        } else {
            self.add_to_selection(sel)
        }
    }

    pub fn add_to_selection(&self, sel: Selection) -> Result<(), PresenceError> {
        let mut selected = self.state.local().selected;
        if selected.contains(&sel) {
            return Ok(());
        }
        selected.push(sel);
        self.publish(selected)
    }

    pub fn remove_from_selection(&self, sel: &Selection) -> Result<(), PresenceError> {
        let selected = self.state.local().selected;
        if !selected.contains(sel) {
            return Ok(());
        }
        self.publish(selected.into_iter().filter(|s| s != sel).collect())
    }

    pub fn clear_selection(&self) -> Result<(), PresenceError> {
        if self.state.local().selected.is_empty() {
            return Ok(());
        }
        self.publish(Vec::new())
    }

    /// Locally selected entries of one kind, in selection order.
    pub fn selected_of_kind(&self, kind: SelectionKind) -> Vec<Selection> {
        self.state
            .local()
            .selected
            .into_iter()
            .filter(|sel| sel.kind == kind)
            .collect()
    }

    /// Ids of locally selected rows. Unparseable ids are skipped.
    pub fn selected_rows(&self) -> Vec<RowId> {
        self.selected_of_kind(SelectionKind::Row)
            .iter()
            .filter_map(Selection::row_id)
            .collect()
    }

    /// Keep only the local entries matching `keep`. Returns how many were dropped.
    pub fn retain(&self, keep: impl Fn(&Selection) -> bool) -> Result<usize, PresenceError> {
        let selected = self.state.local().selected;
        let before = selected.len();
        let kept: Vec<Selection> = selected.into_iter().filter(|sel| keep(sel)).collect();
        let dropped = before - kept.len();
        if dropped > 0 {
            self.publish(kept)?;
        }
        Ok(dropped)
    }

    pub fn on_updated(&self, listener: impl Fn(&PresenceUpdated) + 'static) -> Subscription {
        self.state.on_updated(listener)
    }

    pub fn on_local_updated(&self, listener: impl Fn() + 'static) -> Subscription {
        self.state.on_local_updated(listener)
    }

    fn publish(&self, selected: Vec<Selection>) -> Result<(), PresenceError> {
        self.state.set_local(SelectionPackage { selected })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SelectionManager {
        SelectionManager::new(&Workspace::new(SessionId::new()), "selection").unwrap()
    }

    #[test]
    fn test_id_and_kind_equality() {
        let sel = manager();
        let row = RowId::new();
        sel.select(Selection::row(row)).unwrap();

        assert!(sel.test_selection(&Selection::row(row)));
        assert!(!sel.test_selection(&Selection::new(row.to_string(), SelectionKind::Cell)));
    }

    #[test]
    fn test_toggle_is_own_inverse() {
        let sel = manager();
        let a = Selection::row(RowId::new());
        let b = Selection::column(ColumnId::new());
        sel.set_selection(vec![a.clone()]).unwrap();

        for entry in [a.clone(), b] {
            let before = sel.get_local_selection();
            sel.toggle_selection(entry.clone()).unwrap();
            sel.toggle_selection(entry).unwrap();
            assert_eq!(sel.get_local_selection(), before);
        }
    }

    #[test]
    fn test_remove_keeps_same_id_other_kind() {
        let sel = manager();
        let row = RowId::new();
        let as_row = Selection::row(row);
        let as_cell = Selection::new(row.to_string(), SelectionKind::Cell);
        sel.set_selection(vec![as_row.clone(), as_cell.clone()]).unwrap();

        sel.remove_from_selection(&as_row).unwrap();
        assert_eq!(sel.get_local_selection(), vec![as_cell]);
    }

    #[test]
    fn test_incremental_and_clear() {
        let sel = manager();
        let a = Selection::row(RowId::new());
        let b = Selection::row(RowId::new());

        sel.add_to_selection(a.clone()).unwrap();
        sel.add_to_selection(b.clone()).unwrap();
        sel.add_to_selection(a.clone()).unwrap();
        assert_eq!(sel.get_local_selection(), vec![a.clone(), b.clone()]);

        sel.set_selection(vec![b.clone(), b.clone()]).unwrap();
        assert_eq!(sel.get_local_selection(), vec![b]);

        sel.clear_selection().unwrap();
        assert!(sel.get_local_selection().is_empty());
    }

    #[test]
    fn test_local_updated_only_on_change() {
        let sel = manager();
        let count = std::rc::Rc::new(std::cell::Cell::new(0));
        let c = std::rc::Rc::clone(&count);
        let _sub = sel.on_local_updated(move || c.set(c.get() + 1));

        sel.clear_selection().unwrap();
        assert_eq!(count.get(), 0);
        let a = Selection::row(RowId::new());
        sel.add_to_selection(a.clone()).unwrap();
        sel.add_to_selection(a.clone()).unwrap();
        sel.remove_from_selection(&Selection::row(RowId::new())).unwrap();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_row_ids_and_retain() {
        let sel = manager();
        let keep = RowId::new();
        let gone = RowId::new();
        let column = ColumnId::new();
        sel.set_selection(vec![
            Selection::row(keep),
            Selection::cell(CellId::new(gone, column)),
            Selection::row(gone),
            Selection::column(column),
        ])
        .unwrap();

        assert_eq!(sel.selected_rows(), vec![keep, gone]);
        assert_eq!(
            Selection::cell(CellId::new(gone, column)).row_id(),
            Some(gone)
        );
        assert_eq!(Selection::column(column).column_id(), Some(column));

        let dropped = sel.retain(|s| s.row_id() != Some(gone)).unwrap();
        assert_eq!(dropped, 2);
        assert_eq!(
            sel.get_local_selection(),
            vec![Selection::row(keep), Selection::column(column)]
        );
    }
}
