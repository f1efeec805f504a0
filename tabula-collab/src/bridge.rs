//! Table + presence → view bridge
//!
//! Funnels every notification a table view cares about into one stream.
//! Views either subscribe for immediate callbacks or poll a dirty flag once
//! per frame.
//!
//! ```text
//!  Table::on_change ─────────┐
//!  SelectionManager::updated ─┼──▸ ChangeBridge ──▸ subscribers
//!  UsersManager::roster ──────┘         │
//!                                   dirty flag
//! ```

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tabula_core::{EventEmitter, Subscription, Table, TableChange};

use crate::selection::SelectionManager;
use crate::users::UsersManager;
use crate::workspace::PresenceUpdated;

/// One notification forwarded by the bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewChange {
    Table(TableChange),
    Selection(PresenceUpdated),
    Users,
}

struct BridgeState {
    dirty: Cell<bool>,
    forwarded: Cell<u64>,
    events: EventEmitter<ViewChange>,
}

impl BridgeState {
    fn forward(&self, change: ViewChange) {
        self.dirty.set(true);
        self.forwarded.set(self.forwarded.get() + 1);
        self.events.emit(&change);
    }
}

pub struct ChangeBridge {
    state: Rc<BridgeState>,
    sources: RefCell<Vec<Subscription>>,
}

impl Default for ChangeBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeBridge {
    pub fn new() -> Self {
        Self {
            state: Rc::new(BridgeState {
                dirty: Cell::new(false),
                forwarded: Cell::new(0),
                events: EventEmitter::new(),
            }),
            sources: RefCell::new(Vec::new()),
        }
    }

    pub fn watch_table(&self, table: &Table) {
        let state = Rc::clone(&self.state);
        let sub = table.on_change(move |change| state.forward(ViewChange::Table(change.clone())));
        self.sources.borrow_mut().push(sub);
    }

    pub fn watch_selection(&self, selection: &SelectionManager) {
        let state = Rc::clone(&self.state);
        let sub = selection.on_updated(move |event| state.forward(ViewChange::Selection(*event)));
        self.sources.borrow_mut().push(sub);
    }

    pub fn watch_users(&self, users: &UsersManager) {
        let state = Rc::clone(&self.state);
        let sub = users.on_roster_changed(move || state.forward(ViewChange::Users));
        self.sources.borrow_mut().push(sub);
    }

    pub fn subscribe(&self, listener: impl Fn(&ViewChange) + 'static) -> Subscription {
        self.state.events.subscribe(listener)
    }

    /// Whether anything changed since the last [`take_dirty`](Self::take_dirty).
    pub fn is_dirty(&self) -> bool {
        self.state.dirty.get()
    }

    /// Read and reset the dirty flag.
    pub fn take_dirty(&self) -> bool {
        self.state.dirty.replace(false)
    }

    /// Notifications forwarded over the bridge's lifetime.
    pub fn forwarded(&self) -> u64 {
        self.state.forwarded.get()
    }

    /// Stop listening to every watched source.
    pub fn unwatch_all(&self) {
        self.sources.borrow_mut().clear();
    }
}
