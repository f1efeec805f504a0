//! # tabula-collab: sharing a table between clients
//!
//! Ties [`tabula_core::Table`] replicas and per-client presence together
//! over a broadcast group.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   SyncMessage frames   ┌──────────────┐
//! │ Session (A)  │ ◄────────────────────► │ Session (B)  │
//! └──────┬───────┘    BroadcastGroup      └──────┬───────┘
//!        │                                       │
//!   ┌────┴─────┬───────────┐                ┌────┴─────┐
//!   ▼          ▼           ▼                ▼          ▼
//! Table    Workspace   UndoRedo           Table    Workspace
//!          ├ SelectionManager                      ├ ...
//!          └ UsersManager
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: bincode-encoded `SyncMessage` frames
//! - [`broadcast`]: in-process fan-out with lag detection
//! - [`workspace`]: per-client presence slots with connection status
//! - [`selection`]: shared selection of rows, columns and cells
//! - [`users`]: roster of connected and disconnected users
//! - [`bridge`]: one change stream for table views
//! - [`session`]: a client's table replica kept in sync with its peers

pub mod bridge;
pub mod broadcast;
pub mod protocol;
pub mod selection;
pub mod session;
pub mod users;
pub mod workspace;

pub use bridge::{ChangeBridge, ViewChange};
pub use broadcast::{BroadcastGroup, BroadcastStats, Connection};
pub use protocol::{MessageType, PresenceUpdate, ProtocolError, SessionId, SyncMessage};
pub use selection::{Selection, SelectionKind, SelectionManager, SelectionPackage};
pub use session::{CollabError, Session, SessionConfig, SyncReport};
pub use users::{User, UserInfo, UsersManager};
pub use workspace::{
    Attendee, ClientValue, ConnectionStatus, LatestState, PresenceError, PresenceUpdated,
    UpdateOrigin, Workspace,
};
