//! One client's view of a shared table.
//!
//! A [`Session`] owns a table replica, its undo history and a presence
//! workspace, and keeps them in step with the other sessions connected to
//! the same [`BroadcastGroup`].
//!
//! Lifecycle:
//! - `create` connects the first client, which brings the initial table.
//! - `join` connects with an empty table and sends its state vector
//!   (`SyncStep1`). Every synced peer answers with a targeted `SyncStep2`
//!   holding what the joiner lacks. Deltas are merged as they arrive, before
//!   or after the state; yrs holds back any whose dependencies are missing.
//! - `sync` exchanges everything pending. Nothing happens between calls.
//! - `disconnect` (or drop) tells the peers this client left.

use std::cell::RefCell;
use std::rc::Rc;
use tabula_core::{Subscription, Table, TableError, UndoRedo};
use thiserror::Error;

use crate::broadcast::{BroadcastGroup, Connection};
use crate::protocol::{MessageType, ProtocolError, SessionId, SyncMessage};
use crate::selection::SelectionManager;
use crate::users::{UserInfo, UsersManager};
use crate::workspace::{PresenceError, Workspace};

#[derive(Debug, Error)]
pub enum CollabError {
    #[error(transparent)]
    Table(#[from] TableError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Presence(#[from] PresenceError),

    #[error("Session is not connected")]
    NotConnected,
}

/// Session configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Presence slot carrying each client's selection.
    pub selection_slot: String,
    /// Presence slot carrying each client's identity.
    pub users_slot: String,
    /// Maximum undo units kept; `None` = unbounded.
    pub undo_limit: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            selection_slot: "selection:main".into(),
            users_slot: "users:main".into(),
            undo_limit: None,
        }
    }
}

/// What one call to [`Session::sync`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub received: usize,
    pub sent: usize,
    /// Remote updates and state transfers applied to the table.
    pub remote_commits: usize,
    /// The receiver fell behind and a fresh state was requested.
    pub resynced: bool,
}

pub struct Session {
    id: SessionId,
    connection: Connection,
    connected: bool,
    /// Holds the shared state: created it, or received a `SyncStep2` since
    /// the last request.
    synced: bool,
    clock: u64,
    table: Table,
    undo: UndoRedo,
    workspace: Workspace,
    selection: SelectionManager,
    users: UsersManager,
    /// Encoded local updates not yet sent.
    outbox: Rc<RefCell<Vec<Vec<u8>>>>,
    _outbox_feed: Subscription,
}

impl Session {
    /// Connect as the first client, bringing `table` as the shared document.
    pub fn create(
        group: &BroadcastGroup,
        me: UserInfo,
        table: Table,
        config: SessionConfig,
    ) -> Result<Self, CollabError> {
        let session = Self::connect(group, me, table, config, true)?;
        session.connection.send(&session.workspace.join_message())?;
        log::info!("Session {} created the table", session.id);
        Ok(session)
    }

    /// Connect to a group that already has a document and request its state.
    pub fn join(
        group: &BroadcastGroup,
        me: UserInfo,
        config: SessionConfig,
    ) -> Result<Self, CollabError> {
        let session = Self::connect(group, me, Table::new(), config, false)?;
        let request = SyncMessage::sync_step1(session.id, session.table.state_vector());
        session.connection.send(&request)?;
        session.connection.send(&session.workspace.join_message())?;
        log::info!("Session {} joined, waiting for state", session.id);
        Ok(session)
    }

    fn connect(
        group: &BroadcastGroup,
        me: UserInfo,
        table: Table,
        config: SessionConfig,
        synced: bool,
    ) -> Result<Self, CollabError> {
        let id = SessionId::new();
        let workspace = Workspace::new(id);
        let selection = SelectionManager::new(&workspace, &config.selection_slot)?;
        let users = UsersManager::new(&workspace, &config.users_slot, me)?;
        let undo = match config.undo_limit {
            Some(limit) => UndoRedo::with_limit(&table, limit),
            None => UndoRedo::new(&table),
        };

        let outbox = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&outbox);
        let outbox_feed = table.on_commit(move |commit| {
            if let Some(update) = &commit.update {
                sink.borrow_mut().push(update.clone());
            }
        });

        Ok(Self {
            id,
            connection: group.connect(id),
            connected: true,
            synced,
            clock: 0,
            table,
            undo,
            workspace,
            selection,
            users,
            outbox,
            _outbox_feed: outbox_feed,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    /// Edit the local replica. Commits are sent on the next [`sync`](Self::sync).
    pub fn table_mut(&mut self) -> &mut Table {
        &mut self.table
    }

    pub fn selection(&self) -> &SelectionManager {
        &self.selection
    }

    pub fn users(&self) -> &UsersManager {
        &self.users
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Whether the table holds the shared state (always true for the creator).
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Send pending local changes, then apply everything received.
    pub fn sync(&mut self) -> Result<SyncReport, CollabError> {
        if !self.connected {
            return Err(CollabError::NotConnected);
        }
        let mut report = SyncReport::default();
        self.flush(&mut report)?;

        loop {
            match self.connection.try_recv() {
                Ok(Some(msg)) => {
                    report.received += 1;
                    self.handle(msg, &mut report)?;
                }
                Ok(None) => break,
                Err(ProtocolError::Lagged(missed)) => {
                    log::warn!("Session {} missed {missed} frames, requesting state", self.id);
                    self.synced = false;
                    report.resynced = true;
                }
                Err(e) => return Err(e.into()),
            }
        }

        // Sent only once the receiver is drained, so the request cannot push it behind again.
        if report.resynced {
            self.request_state(&mut report)?;
        }

        if report.remote_commits > 0 {
            self.prune_selection()?;
        }
        // Answers to joins seen above go out now rather than on the next call.
        self.flush(&mut report)?;
        Ok(report)
    }

    fn flush(&mut self, report: &mut SyncReport) -> Result<(), CollabError> {
        let updates = std::mem::take(&mut *self.outbox.borrow_mut());
        for update in updates {
            self.send(SyncMessage::delta(self.id, self.clock, update), report)?;
        }
        for msg in self.workspace.drain_outgoing(self.clock)? {
            self.send(msg, report)?;
        }
        Ok(())
    }

    fn send(&mut self, msg: SyncMessage, report: &mut SyncReport) -> Result<(), CollabError> {
        self.connection.send(&msg)?;
        self.clock += 1;
        report.sent += 1;
        Ok(())
    }

    fn handle(&mut self, msg: SyncMessage, report: &mut SyncReport) -> Result<(), CollabError> {
        match msg.msg_type {
            MessageType::SyncStep1 => {
                if self.synced {
                    let missing = self.table.encode_diff(&msg.payload)?;
                    let reply = SyncMessage::sync_step2(self.id, msg.session, missing);
                    self.send(reply, report)?;
                }
            }
            MessageType::SyncStep2 => {
                // Several peers may answer; merging a state twice is harmless.
                self.table.load_state(&msg.payload)?;
                report.remote_commits += 1;
                if !self.synced {
                    self.synced = true;
                    log::info!(
                        "Session {} synced from {} ({} rows)",
                        self.id,
                        msg.session,
                        self.table.row_count()
                    );
                }
            }
            MessageType::Delta => {
                self.table.apply_update(&msg.payload)?;
                report.remote_commits += 1;
            }
            MessageType::Presence | MessageType::PeerJoined | MessageType::PeerLeft => {
                self.workspace.handle_message(&msg)?;
            }
        }
        Ok(())
    }

    fn request_state(&mut self, report: &mut SyncReport) -> Result<(), CollabError> {
        let request = SyncMessage::sync_step1(self.id, self.table.state_vector());
        self.send(request, report)?;
        // Peers republish presence for a joiner, covering missed presence frames.
        let join = self.workspace.join_message();
        self.send(join, report)
    }

    /// Drop selections whose row or column no longer exists.
    fn prune_selection(&self) -> Result<(), CollabError> {
        let table = &self.table;
        let dropped = self.selection.retain(|sel| {
            sel.row_id().map_or(true, |row| table.contains_row(row))
                && sel.column_id().map_or(true, |column| table.contains_column(column))
        })?;
        if dropped > 0 {
            log::debug!("Dropped {dropped} selections of deleted rows or columns");
        }
        Ok(())
    }

    pub fn undo(&mut self) -> Result<bool, CollabError> {
        Ok(self.undo.undo(&mut self.table)?)
    }

    pub fn redo(&mut self) -> Result<bool, CollabError> {
        Ok(self.undo.redo(&mut self.table)?)
    }

    pub fn can_undo(&self) -> bool {
        self.undo.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.undo.can_redo()
    }

    /// Delete the locally selected rows as one commit and clear the selection.
    ///
    /// Rows already deleted by a peer are skipped. Returns how many rows were deleted.
    pub fn delete_selected_rows(&mut self) -> Result<usize, CollabError> {
        let rows = self.selection.selected_rows();
        let deleted = self.table.delete_rows(&rows)?;
        self.selection.clear_selection()?;
        Ok(deleted)
    }

    /// Tell the peers this client left. Further `sync` calls fail.
    pub fn disconnect(&mut self) -> Result<(), CollabError> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        self.connection.send(&self.workspace.leave_message())?;
        log::info!("Session {} disconnected", self.id);
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            log::warn!("Session {} failed to announce disconnect: {e}", self.id);
        }
    }
}
