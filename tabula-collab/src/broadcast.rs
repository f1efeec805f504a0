//! In-process fan-out of encoded frames to every connected session.
//!
//! Uses a tokio broadcast channel: one send reaches all receivers, and each
//! receiver buffers up to `capacity` frames. A receiver that falls further
//! behind loses the oldest frames and is told how many it missed.
//!
//! The channel is used through its non-blocking `send` / `try_recv` halves,
//! so no async runtime is required.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

use crate::protocol::{ProtocolError, SessionId, SyncMessage};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Atomic broadcast stats, updated without locking on the hot path.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// A broadcast group for a single shared table.
///
/// Cloning yields another handle to the same group.
#[derive(Clone)]
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    capacity: usize,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// Create a group buffering up to `capacity` frames per receiver (at least 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    /// Connect a session. It receives every frame sent after this call.
    pub fn connect(&self, session: SessionId) -> Connection {
        Connection {
            session,
            sender: self.sender.clone(),
            receiver: self.sender.subscribe(),
            atomic_stats: Arc::clone(&self.atomic_stats),
        }
    }

    /// Broadcast a message to every connected session.
    ///
    /// Returns the number of receivers the frame was queued for.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = Arc::new(msg.encode()?);
        Ok(self.broadcast_raw(encoded))
    }

    /// Broadcast pre-encoded bytes directly.
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.sender.receiver_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// One session's endpoint in a [`BroadcastGroup`].
pub struct Connection {
    session: SessionId,
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    receiver: broadcast::Receiver<Arc<Vec<u8>>>,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl Connection {
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Encode and send a message to every session in the group.
    pub fn send(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = Arc::new(msg.encode()?);
        let count = self.sender.send(encoded).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        log::trace!("{} sent {:?} to {} receivers", self.session, msg.msg_type, count);
        Ok(count)
    }

    /// Next frame addressed to this session, if any is buffered.
    ///
    /// Frames sent by this session and frames targeted at other sessions are
    /// skipped. After `Err(Lagged)` the receiver continues with the oldest
    /// frame still buffered.
    pub fn try_recv(&mut self) -> Result<Option<SyncMessage>, ProtocolError> {
        loop {
            match self.receiver.try_recv() {
                Ok(bytes) => {
                    let msg = SyncMessage::decode(&bytes)?;
                    if msg.session == self.session || !msg.is_for(self.session) {
                        continue;
                    }
                    log::trace!("{} received {:?} from {}", self.session, msg.msg_type, msg.session);
                    return Ok(Some(msg));
                }
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Closed) => return Err(ProtocolError::ConnectionClosed),
                Err(TryRecvError::Lagged(missed)) => {
                    self.atomic_stats
                        .messages_dropped
                        .fetch_add(missed, Ordering::Relaxed);
                    log::warn!("{} lagged behind, {missed} frames dropped", self.session);
                    return Err(ProtocolError::Lagged(missed));
                }
            }
        }
    }
}
