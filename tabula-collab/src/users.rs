//! Roster of the people editing a table.

use serde::{Deserialize, Serialize};
use tabula_core::{EventEmitter, Subscription};

use crate::protocol::SessionId;
use crate::workspace::{ConnectionStatus, LatestState, PresenceError, Workspace};

/// Identity handed in by whoever authenticated the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    pub name: String,
}

impl UserInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub info: UserInfo,
    pub session: SessionId,
    pub status: ConnectionStatus,
}

pub struct UsersManager {
    state: LatestState<UserInfo>,
    roster_changed: EventEmitter<()>,
    _sources: Subscription,
}

impl UsersManager {
    pub fn new(workspace: &Workspace, name: &str, me: UserInfo) -> Result<Self, PresenceError> {
        let state = workspace.add(name, me)?;
        let roster_changed = EventEmitter::new();

        let on_update = roster_changed.clone();
        let on_join = roster_changed.clone();
        let on_leave = roster_changed.clone();
        // A disconnect is not a value update.
        let sources = Subscription::all(vec![
            state.on_updated(move |_| on_update.emit(&())),
            workspace.on_attendee_joined(move |_| on_join.emit(&())),
            workspace.on_attendee_disconnected(move |_| on_leave.emit(&())),
        ]);

        Ok(Self {
            state,
            roster_changed,
            _sources: sources,
        })
    }

    /// Remote users that have published an identity, connected or not.
    pub fn get_users(&self) -> Vec<User> {
        self.state
            .client_values()
            .into_iter()
            .map(|cv| User {
                info: cv.value,
                session: cv.session,
                status: cv.status,
            })
            .collect()
    }

    pub fn get_connected_users(&self) -> Vec<User> {
        self.users_with(ConnectionStatus::Connected)
    }

    pub fn get_disconnected_users(&self) -> Vec<User> {
        self.users_with(ConnectionStatus::Disconnected)
    }

    fn users_with(&self, status: ConnectionStatus) -> Vec<User> {
        self.get_users()
            .into_iter()
            .filter(|user| user.status == status)
            .collect()
    }

    pub fn get_myself(&self) -> User {
        User {
            info: self.state.local(),
            session: self.state.myself(),
            status: ConnectionStatus::Connected,
        }
    }

    /// Republish the local identity, e.g. after a rename.
    pub fn update_myself(&self, info: UserInfo) -> Result<(), PresenceError> {
        self.state.set_local(info)
    }

    /// Fires whenever the roster may look different: a value changed, or a client came or went.
    pub fn on_roster_changed(&self, listener: impl Fn() + 'static) -> Subscription {
        self.roster_changed.subscribe(move |_| listener())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn deliver(from: &Workspace, to: &Workspace) {
        for msg in from.drain_outgoing(0).unwrap() {
            to.handle_message(&msg).unwrap();
        }
    }

    #[test]
    fn test_myself_and_rename() {
        let ws = Workspace::new(SessionId::new());
        let users = UsersManager::new(&ws, "users", UserInfo::new("u1", "Alice")).unwrap();
        assert_eq!(users.get_myself().info.name, "Alice");
        assert_eq!(users.get_myself().session, ws.myself());
        assert!(users.get_users().is_empty());

        users.update_myself(UserInfo::new("u1", "Alicia")).unwrap();
        assert_eq!(users.get_myself().info.name, "Alicia");
    }

    #[test]
    fn test_partition_follows_connection_status() {
        let a = Workspace::new(SessionId::new());
        let b = Workspace::new(SessionId::new());
        let a_users = UsersManager::new(&a, "users", UserInfo::new("a", "Alice")).unwrap();
        let _b_users = UsersManager::new(&b, "users", UserInfo::new("b", "Bob")).unwrap();

        let changes = Rc::new(Cell::new(0));
        let c = Rc::clone(&changes);
        let _sub = a_users.on_roster_changed(move || c.set(c.get() + 1));

        a.handle_message(&b.join_message()).unwrap();
        deliver(&b, &a);
        assert_eq!(a_users.get_connected_users().len(), 1);
        assert_eq!(a_users.get_connected_users()[0].info.name, "Bob");
        assert!(a_users.get_disconnected_users().is_empty());
        let after_join = changes.get();
        assert!(after_join >= 2);

        a.handle_message(&b.leave_message()).unwrap();
        assert!(a_users.get_connected_users().is_empty());
        assert_eq!(a_users.get_disconnected_users()[0].info.id, "b");
        assert_eq!(a_users.get_users().len(), 1);
        assert!(changes.get() > after_join);
    }
}
