//! Ephemeral per-client shared state.
//!
//! A [`Workspace`] tracks the clients connected to a table and a set of
//! named slots. Each client owns its value in every slot and publishes it
//! to the others; everyone can read every client's latest value together
//! with that client's connection status.
//!
//! ```text
//! LatestState::set_local()
//!       │  (marks slot dirty)
//!       ▼
//! Workspace::drain_outgoing()  ──►  SyncMessage::Presence  ──► peers
//!                                                               │
//!                                        Workspace::handle_message()
//!                                                               │
//!                                         on_updated listeners  ◄┘
//! ```
//!
//! Values of disconnected clients are kept and reported with
//! [`ConnectionStatus::Disconnected`] so readers can filter them.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use tabula_core::{EventEmitter, Subscription};
use thiserror::Error;

use crate::protocol::{MessageType, PresenceUpdate, ProtocolError, SessionId, SyncMessage};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PresenceError {
    #[error("Presence slot already registered: {0}")]
    DuplicateSlot(String),

    #[error("Failed to encode presence value: {0}")]
    Encode(String),

    #[error("Failed to decode presence value: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

/// A client known to the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attendee {
    pub session: SessionId,
    pub status: ConnectionStatus,
}

/// Why a slot's view changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    Local,
    Remote,
    /// The client disconnected; its last value is now stale.
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceUpdated {
    pub session: SessionId,
    pub origin: UpdateOrigin,
}

/// One remote client's value in a slot.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientValue<T> {
    pub session: SessionId,
    pub status: ConnectionStatus,
    pub value: T,
}

struct RemoteValue {
    revision: u64,
    bytes: Vec<u8>,
}

struct Slot {
    local: Vec<u8>,
    revision: u64,
    remote: BTreeMap<SessionId, RemoteValue>,
    updated: EventEmitter<PresenceUpdated>,
    local_updated: EventEmitter<()>,
}

struct WorkspaceState {
    myself: SessionId,
    attendees: BTreeMap<SessionId, ConnectionStatus>,
    slots: BTreeMap<String, Slot>,
    /// Slots whose local value has not been published yet.
    dirty: BTreeSet<String>,
    joined: EventEmitter<SessionId>,
    disconnected: EventEmitter<SessionId>,
}

impl WorkspaceState {
    fn status_of(&self, session: SessionId) -> ConnectionStatus {
        self.attendees
            .get(&session)
            .copied()
            .unwrap_or(ConnectionStatus::Disconnected)
    }
}

fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, PresenceError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| PresenceError::Encode(e.to_string()))
}

fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, PresenceError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| PresenceError::Decode(e.to_string()))?;
    Ok(value)
}

/// Presence state for one client. Cloning yields another handle to the same state.
#[derive(Clone)]
pub struct Workspace {
    state: Rc<RefCell<WorkspaceState>>,
}

impl Workspace {
    pub fn new(myself: SessionId) -> Self {
        let mut attendees = BTreeMap::new();
        attendees.insert(myself, ConnectionStatus::Connected);
        Self {
            state: Rc::new(RefCell::new(WorkspaceState {
                myself,
                attendees,
                slots: BTreeMap::new(),
                dirty: BTreeSet::new(),
                joined: EventEmitter::new(),
                disconnected: EventEmitter::new(),
            })),
        }
    }

    /// Register a slot with this client's initial value.
    pub fn add<T>(&self, name: &str, initial: T) -> Result<LatestState<T>, PresenceError>
    where
        T: Serialize + DeserializeOwned + Clone + 'static,
    {
        let bytes = encode_value(&initial)?;
        let mut state = self.state.borrow_mut();
        if state.slots.contains_key(name) {
            return Err(PresenceError::DuplicateSlot(name.to_string()));
        }
        state.slots.insert(
            name.to_string(),
            Slot {
                local: bytes,
                revision: 1,
                remote: BTreeMap::new(),
                updated: EventEmitter::new(),
                local_updated: EventEmitter::new(),
            },
        );
        state.dirty.insert(name.to_string());
        drop(state);

        Ok(LatestState {
            state: Rc::clone(&self.state),
            slot: Rc::from(name),
            local: Rc::new(RefCell::new(initial)),
        })
    }

    pub fn myself(&self) -> SessionId {
        self.state.borrow().myself
    }

    /// Every known client, including this one.
    pub fn attendees(&self) -> Vec<Attendee> {
        self.state
            .borrow()
            .attendees
            .iter()
            .map(|(session, status)| Attendee {
                session: *session,
                status: *status,
            })
            .collect()
    }

    pub fn attendee(&self, session: SessionId) -> Option<Attendee> {
        let status = *self.state.borrow().attendees.get(&session)?;
        Some(Attendee { session, status })
    }

    pub fn connection_status(&self, session: SessionId) -> Option<ConnectionStatus> {
        self.state.borrow().attendees.get(&session).copied()
    }

    pub fn join_message(&self) -> SyncMessage {
        SyncMessage::peer_joined(self.myself())
    }

    pub fn leave_message(&self) -> SyncMessage {
        SyncMessage::peer_left(self.myself())
    }

    /// Mark every slot for republishing, e.g. after a peer joined.
    pub fn republish(&self) {
        let mut state = self.state.borrow_mut();
        let names: Vec<String> = state.slots.keys().cloned().collect();
        state.dirty.extend(names);
    }

    pub fn has_outgoing(&self) -> bool {
        !self.state.borrow().dirty.is_empty()
    }

    /// One presence message per slot changed since the last drain.
    pub fn drain_outgoing(&self, clock: u64) -> Result<Vec<SyncMessage>, ProtocolError> {
        let mut state = self.state.borrow_mut();
        let dirty = std::mem::take(&mut state.dirty);
        let mut messages = Vec::with_capacity(dirty.len());
        for name in dirty {
            let Some(slot) = state.slots.get(&name) else {
                continue;
            };
            let update = PresenceUpdate {
                slot: name,
                revision: slot.revision,
                value: slot.local.clone(),
            };
            messages.push(SyncMessage::presence(state.myself, clock, &update)?);
        }
        Ok(messages)
    }

    /// Apply a presence-related message from another client.
    ///
    /// Messages of other types are ignored.
    pub fn handle_message(&self, msg: &SyncMessage) -> Result<(), ProtocolError> {
        if msg.session == self.myself() {
            return Ok(());
        }
        match msg.msg_type {
            MessageType::PeerJoined => {
                self.mark_joined(msg.session);
                // Late joiners only learn existing values if everyone republishes.
                self.republish();
            }
            MessageType::PeerLeft => self.mark_disconnected(msg.session),
            MessageType::Presence => {
                let update = msg.presence_update()?;
                self.apply_remote(msg.session, update);
            }
            _ => {}
        }
        Ok(())
    }

    fn mark_joined(&self, session: SessionId) {
        let joined = {
            let mut state = self.state.borrow_mut();
            if state.attendees.contains_key(&session) {
                return;
            }
            state.attendees.insert(session, ConnectionStatus::Connected);
            state.joined.clone()
        };
        log::debug!("Attendee {session} joined");
        joined.emit(&session);
    }

    fn mark_disconnected(&self, session: SessionId) {
        let (disconnected, affected) = {
            let mut state = self.state.borrow_mut();
            match state.attendees.get_mut(&session) {
                Some(status) if *status == ConnectionStatus::Connected => {
                    *status = ConnectionStatus::Disconnected;
                }
                _ => return,
            }
            let affected: Vec<EventEmitter<PresenceUpdated>> = state
                .slots
                .values()
                .filter(|slot| slot.remote.contains_key(&session))
                .map(|slot| slot.updated.clone())
                .collect();
            (state.disconnected.clone(), affected)
        };

        log::debug!("Attendee {session} disconnected");
        disconnected.emit(&session);
        let event = PresenceUpdated {
            session,
            origin: UpdateOrigin::Disconnected,
        };
        for updated in affected {
            updated.emit(&event);
        }
    }

    fn apply_remote(&self, session: SessionId, update: PresenceUpdate) {
        let newly_seen = {
            let state = self.state.borrow();
            match state.attendees.get(&session) {
                Some(ConnectionStatus::Disconnected) => {
                    log::trace!("Ignoring presence from disconnected {session}");
                    return;
                }
                Some(ConnectionStatus::Connected) => false,
                None => true,
            }
        };
        if newly_seen {
            self.mark_joined(session);
            self.republish();
        }

        let updated = {
            let mut state = self.state.borrow_mut();
            let Some(slot) = state.slots.get_mut(&update.slot) else {
                log::trace!("Ignoring presence for unknown slot {}", update.slot);
                return;
            };
            if let Some(existing) = slot.remote.get(&session) {
                if existing.revision >= update.revision {
                    return;
                }
            }
            slot.remote.insert(
                session,
                RemoteValue {
                    revision: update.revision,
                    bytes: update.value,
                },
            );
            slot.updated.clone()
        };
        updated.emit(&PresenceUpdated {
            session,
            origin: UpdateOrigin::Remote,
        });
    }

    pub fn on_attendee_joined(&self, listener: impl Fn(&SessionId) + 'static) -> Subscription {
        self.state.borrow().joined.subscribe(listener)
    }

    pub fn on_attendee_disconnected(&self, listener: impl Fn(&SessionId) + 'static) -> Subscription {
        self.state.borrow().disconnected.subscribe(listener)
    }
}

/// Typed handle to one slot: this client's value plus everyone else's latest.
pub struct LatestState<T> {
    state: Rc<RefCell<WorkspaceState>>,
    slot: Rc<str>,
    local: Rc<RefCell<T>>,
}

impl<T> Clone for LatestState<T> {
    fn clone(&self) -> Self {
        Self {
            state: Rc::clone(&self.state),
            slot: Rc::clone(&self.slot),
            local: Rc::clone(&self.local),
        }
    }
}

impl<T> LatestState<T>
where
    T: Serialize + DeserializeOwned + Clone + 'static,
{
    pub fn name(&self) -> &str {
        &self.slot
    }

    pub fn myself(&self) -> SessionId {
        self.state.borrow().myself
    }

    pub fn local(&self) -> T {
        self.local.borrow().clone()
    }

    /// Replace this client's value and queue it for publishing.
    pub fn set_local(&self, value: T) -> Result<(), PresenceError> {
        let bytes = encode_value(&value)?;
        let (myself, updated, local_updated) = {
            let mut state = self.state.borrow_mut();
            let myself = state.myself;
            let Some(slot) = state.slots.get_mut(&*self.slot) else {
                return Err(PresenceError::Encode(format!("slot {} is not registered", self.slot)));
            };
            slot.local = bytes;
            slot.revision += 1;
            let emitters = (slot.updated.clone(), slot.local_updated.clone());
            state.dirty.insert(self.slot.to_string());
            (myself, emitters.0, emitters.1)
        };
        *self.local.borrow_mut() = value;

        local_updated.emit(&());
        updated.emit(&PresenceUpdated {
            session: myself,
            origin: UpdateOrigin::Local,
        });
        Ok(())
    }

    /// Latest values of every other client that has published to this slot.
    ///
    /// Values that fail to decode are skipped.
    pub fn client_values(&self) -> Vec<ClientValue<T>> {
        let state = self.state.borrow();
        let Some(slot) = state.slots.get(&*self.slot) else {
            return Vec::new();
        };
        slot.remote
            .iter()
            .filter_map(|(session, remote)| {
                Self::decode_remote(*session, &remote.bytes).map(|value| ClientValue {
                    session: *session,
                    status: state.status_of(*session),
                    value,
                })
            })
            .collect()
    }

    pub fn client_value(&self, session: SessionId) -> Option<ClientValue<T>> {
        let state = self.state.borrow();
        let remote = state.slots.get(&*self.slot)?.remote.get(&session)?;
        let value = Self::decode_remote(session, &remote.bytes)?;
        Some(ClientValue {
            session,
            status: state.status_of(session),
            value,
        })
    }

    fn decode_remote(session: SessionId, bytes: &[u8]) -> Option<T> {
        match decode_value(bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!("Undecodable presence value from {session}: {e}");
                None
            }
        }
    }

    /// Fires when any client's value changes, and when a client with a value disconnects.
    pub fn on_updated(&self, listener: impl Fn(&PresenceUpdated) + 'static) -> Subscription {
        match self.state.borrow().slots.get(&*self.slot) {
            Some(slot) => slot.updated.subscribe(listener),
            None => Subscription::from_fn(|| {}),
        }
    }

    /// Fires only when this client's own value is set.
    pub fn on_local_updated(&self, listener: impl Fn() + 'static) -> Subscription {
        match self.state.borrow().slots.get(&*self.slot) {
            Some(slot) => slot.local_updated.subscribe(move |_| listener()),
            None => Subscription::from_fn(|| {}),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn deliver(from: &Workspace, to: &Workspace, clock: u64) {
        for msg in from.drain_outgoing(clock).unwrap() {
            to.handle_message(&msg).unwrap();
        }
    }

    #[test]
    fn test_duplicate_slot() {
        let ws = Workspace::new(SessionId::new());
        let _slot = ws.add("s", 1u32).unwrap();
        assert!(matches!(ws.add("s", 2u32), Err(PresenceError::DuplicateSlot(_))));
    }

    #[test]
    fn test_remote_value_visible() {
        let a = Workspace::new(SessionId::new());
        let b = Workspace::new(SessionId::new());
        let a_slot = a.add("s", String::from("hello")).unwrap();
        let b_slot = b.add("s", String::new()).unwrap();

        deliver(&a, &b, 1);
        let values = b_slot.client_values();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].session, a.myself());
        assert_eq!(values[0].value, "hello");
        assert_eq!(values[0].status, ConnectionStatus::Connected);

        a_slot.set_local("bye".into()).unwrap();
        deliver(&a, &b, 2);
        assert_eq!(b_slot.client_value(a.myself()).unwrap().value, "bye");
        assert!(a_slot.client_values().is_empty());
    }

    #[test]
    fn test_stale_revision_ignored() {
        let a = Workspace::new(SessionId::new());
        let b = Workspace::new(SessionId::new());
        let a_slot = a.add("s", 0u32).unwrap();
        let b_slot = b.add("s", 0u32).unwrap();

        a_slot.set_local(1).unwrap();
        let old = a.drain_outgoing(1).unwrap();
        a_slot.set_local(2).unwrap();
        let new = a.drain_outgoing(2).unwrap();

        b.handle_message(&new[0]).unwrap();
        b.handle_message(&old[0]).unwrap();
        assert_eq!(b_slot.client_value(a.myself()).unwrap().value, 2);
    }

    #[test]
    fn test_outgoing_is_coalesced() {
        let a = Workspace::new(SessionId::new());
        let slot = a.add("s", 0u32).unwrap();
        for n in 1..10 {
            slot.set_local(n).unwrap();
        }
        assert_eq!(a.drain_outgoing(1).unwrap().len(), 1);
        assert!(!a.has_outgoing());
    }

    #[test]
    fn test_peer_joined_triggers_republish() {
        let a = Workspace::new(SessionId::new());
        let _slot = a.add("s", 0u32).unwrap();
        a.drain_outgoing(1).unwrap();
        assert!(!a.has_outgoing());

        let b = Workspace::new(SessionId::new());
        a.handle_message(&b.join_message()).unwrap();
        assert!(a.has_outgoing());
        assert_eq!(
            a.connection_status(b.myself()),
            Some(ConnectionStatus::Connected)
        );
    }

    #[test]
    fn test_disconnect_keeps_value_and_notifies() {
        let a = Workspace::new(SessionId::new());
        let b = Workspace::new(SessionId::new());
        let _a_slot = a.add("s", 7u32).unwrap();
        let b_slot = b.add("s", 0u32).unwrap();
        deliver(&a, &b, 1);

        let updates = Rc::new(Cell::new(0));
        let u = Rc::clone(&updates);
        let _sub = b_slot.on_updated(move |event| {
            assert_eq!(event.origin, UpdateOrigin::Disconnected);
            u.set(u.get() + 1);
        });
        let gone = Rc::new(Cell::new(false));
        let g = Rc::clone(&gone);
        let _left = b.on_attendee_disconnected(move |_| g.set(true));

        b.handle_message(&a.leave_message()).unwrap();
        assert_eq!(updates.get(), 1);
        assert!(gone.get());

        let value = b_slot.client_value(a.myself()).unwrap();
        assert_eq!(value.value, 7);
        assert_eq!(value.status, ConnectionStatus::Disconnected);

        // A second leave is not a new event.
        b.handle_message(&a.leave_message()).unwrap();
        assert_eq!(updates.get(), 1);
    }

    #[test]
    fn test_local_events() {
        let a = Workspace::new(SessionId::new());
        let slot = a.add("s", 0u32).unwrap();
        let local = Rc::new(Cell::new(0));
        let any = Rc::new(Cell::new(0));

        let l = Rc::clone(&local);
        let _l = slot.on_local_updated(move || l.set(l.get() + 1));
        let n = Rc::clone(&any);
        let _a = slot.on_updated(move |_| n.set(n.get() + 1));

        slot.set_local(3).unwrap();
        assert_eq!((local.get(), any.get()), (1, 1));

        let b = Workspace::new(SessionId::new());
        let _b_slot = b.add("s", 9u32).unwrap();
        deliver(&b, &a, 1);
        assert_eq!((local.get(), any.get()), (1, 2));
    }

    #[test]
    fn test_own_messages_ignored() {
        let a = Workspace::new(SessionId::new());
        let slot = a.add("s", 0u32).unwrap();
        deliver(&a, &a, 1);
        assert!(slot.client_values().is_empty());
    }
}
