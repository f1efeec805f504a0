//! Binary protocol for table replication and presence.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬────────────┬─────────────────┬──────────┬──────────┐
//! │ msg_type │ session    │ target          │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes   │ 0 or 16 bytes   │ varint   │ variable │
//! └──────────┴────────────┴─────────────────┴──────────┴──────────┘
//! ```
//!
//! Payloads by type:
//! - `SyncStep1`: yrs state vector of the requester
//! - `SyncStep2`: yrs update with what the requester lacks, targeted at it
//! - `Delta`: yrs update of one local commit
//! - `Presence`: encoded [`PresenceUpdate`]
//! - `PeerJoined` / `PeerLeft`: empty

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Transient identity of one connected client.
///
/// Assigned per connection; a client that reconnects gets a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// State vector, asking for what the sender lacks
    SyncStep1 = 1,
    /// Missing state, answering a `SyncStep1`
    SyncStep2 = 2,
    /// One committed table update
    Delta = 3,
    /// Latest value of one presence slot
    Presence = 4,
    /// Client connected
    PeerJoined = 5,
    /// Client disconnected
    PeerLeft = 6,
}

/// Latest value of a named presence slot published by one client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub slot: String,
    /// Increases with every local write; stale values are ignored.
    pub revision: u64,
    /// bincode-encoded slot value
    pub value: Vec<u8>,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    /// Sender
    pub session: SessionId,
    /// Recipient for point-to-point replies; `None` = everyone
    pub target: Option<SessionId>,
    /// Sender-local logical clock
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, session: SessionId, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            session,
            target: None,
            clock,
            payload,
        }
    }

    /// Ask connected peers for whatever `state_vector` is missing.
    pub fn sync_step1(session: SessionId, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, session, 0, state_vector)
    }

    /// Answer a `SyncStep1` from `target` with the encoded missing state.
    pub fn sync_step2(session: SessionId, target: SessionId, state: Vec<u8>) -> Self {
        Self {
            target: Some(target),
            ..Self::new(MessageType::SyncStep2, session, 0, state)
        }
    }

    pub fn delta(session: SessionId, clock: u64, update: Vec<u8>) -> Self {
        Self::new(MessageType::Delta, session, clock, update)
    }

    pub fn presence(
        session: SessionId,
        clock: u64,
        update: &PresenceUpdate,
    ) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(update, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self::new(MessageType::Presence, session, clock, payload))
    }

    pub fn peer_joined(session: SessionId) -> Self {
        Self::new(MessageType::PeerJoined, session, 0, Vec::new())
    }

    pub fn peer_left(session: SessionId) -> Self {
        Self::new(MessageType::PeerLeft, session, 0, Vec::new())
    }

    /// Whether `session` should process this message.
    pub fn is_for(&self, session: SessionId) -> bool {
        self.target.map_or(true, |target| target == session)
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse presence payload.
    pub fn presence_update(&self) -> Result<PresenceUpdate, ProtocolError> {
        if self.msg_type != MessageType::Presence {
            return Err(ProtocolError::InvalidMessageType(self.msg_type));
        }
        let (update, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(update)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Unexpected message type {0:?}")]
    InvalidMessageType(MessageType),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Receiver lagged behind, {0} messages dropped")]
    Lagged(u64),
}
