//! Commit grouping for table edits.
//!
//! Every edit runs inside a pending commit. A bare mutation opens and closes
//! its own; `run_transaction` holds one open across a closure so that all
//! edits made inside become a single revertible unit. A closed local commit
//! is written to the replicated document as one yrs transaction.

use serde::{Deserialize, Serialize};

use super::ops::{ApplyMode, Op, TableChange};
use super::Table;
use crate::error::TableError;

/// Where a commit came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommitKind {
    Local,
    Undo,
    Redo,
    Remote,
}

/// Ops that reverse one commit, in application order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Revertible {
    ops: Vec<Op>,
}

impl Revertible {
    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// One completed unit of change.
#[derive(Clone, Debug)]
pub struct Commit {
    pub kind: CommitKind,
    /// The forward ops, as replicas should apply them.
    pub ops: Vec<Op>,
    pub revertible: Revertible,
    pub change: TableChange,
    /// Encoded document update to ship to replicas. `None` for remote commits.
    pub update: Option<Vec<u8>>,
}

#[derive(Debug)]
struct AppliedOp {
    op: Op,
    inverse: Vec<Op>,
}

#[derive(Debug)]
pub(super) struct PendingCommit {
    kind: CommitKind,
    depth: usize,
    applied: Vec<AppliedOp>,
    change: TableChange,
}

impl Table {
    /// Run `body` as one atomic, undoable unit.
    ///
    /// If `body` returns `Err`, every edit it made is rolled back and the
    /// error is returned unchanged. Nested calls join the outermost commit;
    /// an inner `Err` rolls back only the inner edits.
    pub fn run_transaction<T, E>(
        &mut self,
        body: impl FnOnce(&mut Table) -> Result<T, E>,
    ) -> Result<T, E> {
        self.transact(CommitKind::Local, body)
    }

    pub fn in_transaction(&self) -> bool {
        self.pending.is_some()
    }

    /// Apply a revertible as a single strict commit of the given kind.
    ///
    /// Fails without any change if one of its targets is gone.
    pub fn revert(&mut self, revertible: &Revertible, kind: CommitKind) -> Result<(), TableError> {
        if self.in_transaction() {
            return Err(TableError::TransactionInProgress);
        }
        self.transact(kind, |table| {
            for op in revertible.ops() {
                table.record(op.clone(), ApplyMode::Strict)?;
            }
            Ok(())
        })
    }

    /// Apply ops derived from the merged document as one `Remote` commit.
    pub(crate) fn apply_remote(&mut self, ops: Vec<Op>) -> Result<(), TableError> {
        if self.in_transaction() {
            return Err(TableError::TransactionInProgress);
        }
        self.transact(CommitKind::Remote, |table| {
            for op in ops {
                table.record(op, ApplyMode::Lenient)?;
            }
            Ok(())
        })
    }

    /// A single local edit, committed on its own unless a transaction is open.
    pub(crate) fn edit(&mut self, op: Op) -> Result<bool, TableError> {
        self.transact(CommitKind::Local, |table| table.record(op, ApplyMode::Strict))
    }

    pub(super) fn transact<T, E>(
        &mut self,
        kind: CommitKind,
        body: impl FnOnce(&mut Table) -> Result<T, E>,
    ) -> Result<T, E> {
        let mark = self.begin(kind);
        let result = body(self);
        self.end(mark, result.is_ok());
        result
    }

    fn begin(&mut self, kind: CommitKind) -> usize {
        match &mut self.pending {
            Some(pending) => {
                pending.depth += 1;
                pending.applied.len()
            }
            None => {
                self.pending = Some(PendingCommit {
                    kind,
                    depth: 0,
                    applied: Vec::new(),
                    change: TableChange::default(),
                });
                0
            }
        }
    }

    fn record(&mut self, op: Op, mode: ApplyMode) -> Result<bool, TableError> {
        let mut change = TableChange::default();
        let inverse = self.data.apply(&op, mode, &mut change)?;
        if inverse.is_empty() {
            return Ok(false);
        }
        match &mut self.pending {
            Some(pending) => {
                pending.change.merge(change);
                pending.applied.push(AppliedOp { op, inverse });
            }
            None => log::error!("Table edit recorded outside of a commit"),
        }
        Ok(true)
    }

    fn end(&mut self, mark: usize, keep: bool) {
        if !keep {
            self.rollback_to(mark);
        }
        if let Some(pending) = &mut self.pending {
            if pending.depth > 0 {
                pending.depth -= 1;
                return;
            }
        }
        if let Some(pending) = self.pending.take() {
            self.finish(pending);
        }
    }

    fn rollback_to(&mut self, mark: usize) {
        let undone = match &mut self.pending {
            Some(pending) if pending.applied.len() > mark => pending.applied.split_off(mark),
            _ => return,
        };
        let mut scratch = TableChange::default();
        for applied in undone.into_iter().rev() {
            for op in &applied.inverse {
                if let Err(e) = self.data.apply(op, ApplyMode::Strict, &mut scratch) {
                    log::error!("Failed to roll back {:?}: {e}", applied.op);
                }
            }
        }
    }

    fn finish(&mut self, pending: PendingCommit) {
        if pending.applied.is_empty() {
            return;
        }

        let mut ops = Vec::with_capacity(pending.applied.len());
        let mut inverse = Vec::new();
        for applied in pending.applied.into_iter().rev() {
            inverse.extend(applied.inverse);
            ops.push(applied.op);
        }
        ops.reverse();

        let update = match pending.kind {
            CommitKind::Remote => None,
            _ => match self.doc.record(&ops) {
                Ok(update) => Some(update),
                Err(e) => {
                    log::error!("Failed to write {:?} commit to the document: {e}", pending.kind);
                    None
                }
            },
        };

        let commit = Commit {
            kind: pending.kind,
            ops,
            revertible: Revertible { ops: inverse },
            change: pending.change,
            update,
        };
        log::trace!("Commit {:?} with {} ops", commit.kind, commit.ops.len());

        self.change_events.emit(&commit.change);
        self.commit_events.emit(&commit);
    }
}
