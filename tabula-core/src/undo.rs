//! Undo/redo stacks fed by table commits.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::TableError;
use crate::events::Subscription;
use crate::table::{CommitKind, Revertible, Table};

#[derive(Debug, Default)]
struct Stacks {
    undo: Vec<Revertible>,
    redo: Vec<Revertible>,
    limit: Option<usize>,
}

impl Stacks {
    fn push_undo(&mut self, revertible: Revertible) {
        self.undo.push(revertible);
        if let Some(limit) = self.limit {
            if self.undo.len() > limit {
                let excess = self.undo.len() - limit;
                self.undo.drain(..excess);
            }
        }
    }
}

/// Records every local commit of a table as one undoable unit.
///
/// Remote commits are not undoable. A new local commit clears the redo stack.
pub struct UndoRedo {
    stacks: Rc<RefCell<Stacks>>,
    subscription: Option<Subscription>,
}

impl UndoRedo {
    pub fn new(table: &Table) -> Self {
        Self::with_limit_opt(table, None)
    }

    /// Keep at most `max_entries` undo units, dropping the oldest.
    pub fn with_limit(table: &Table, max_entries: usize) -> Self {
        Self::with_limit_opt(table, Some(max_entries))
    }

    fn with_limit_opt(table: &Table, limit: Option<usize>) -> Self {
        let stacks = Rc::new(RefCell::new(Stacks {
            limit,
            ..Default::default()
        }));

        let sink = Rc::clone(&stacks);
        let subscription = table.on_commit(move |commit| {
            let mut stacks = sink.borrow_mut();
            match commit.kind {
                CommitKind::Local => {
                    stacks.push_undo(commit.revertible.clone());
                    stacks.redo.clear();
                }
                CommitKind::Undo => stacks.redo.push(commit.revertible.clone()),
                CommitKind::Redo => stacks.push_undo(commit.revertible.clone()),
                CommitKind::Remote => {}
            }
        });

        Self {
            stacks,
            subscription: Some(subscription),
        }
    }

    /// Revert the most recent local unit. `Ok(false)` if there is nothing to undo.
    ///
    /// If the unit can no longer be applied (e.g. a peer deleted its target),
    /// it is discarded and the error returned; the table is unchanged.
    pub fn undo(&self, table: &mut Table) -> Result<bool, TableError> {
        self.step(table, CommitKind::Undo)
    }

    pub fn redo(&self, table: &mut Table) -> Result<bool, TableError> {
        self.step(table, CommitKind::Redo)
    }

    fn step(&self, table: &mut Table, kind: CommitKind) -> Result<bool, TableError> {
        if table.in_transaction() {
            return Err(TableError::TransactionInProgress);
        }
        let popped = {
            let mut stacks = self.stacks.borrow_mut();
            match kind {
                CommitKind::Undo => stacks.undo.pop(),
                _ => stacks.redo.pop(),
            }
        };
        let Some(revertible) = popped else {
            return Ok(false);
        };

        match table.revert(&revertible, kind) {
            Ok(()) => Ok(true),
            Err(e) => {
                log::warn!("Discarding {kind:?} entry that no longer applies: {e}");
                Err(e)
            }
        }
    }

    pub fn can_undo(&self) -> bool {
        !self.stacks.borrow().undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.stacks.borrow().redo.is_empty()
    }

    pub fn undo_len(&self) -> usize {
        self.stacks.borrow().undo.len()
    }

    pub fn redo_len(&self) -> usize {
        self.stacks.borrow().redo.len()
    }

    pub fn clear(&self) {
        let mut stacks = self.stacks.borrow_mut();
        stacks.undo.clear();
        stacks.redo.clear();
    }

    /// Stop listening to the table and drop both stacks.
    pub fn dispose(&mut self) {
        self.subscription.take();
        self.clear();
    }

    pub fn is_disposed(&self) -> bool {
        self.subscription.is_none()
    }
}
