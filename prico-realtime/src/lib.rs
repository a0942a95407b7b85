//! # prico-realtime: Real-time room coordination for Prico
//!
//! Groups WebSocket connections into rooms (chat channels, direct messages,
//! editor files, call sessions), tracks who is present, validates and routes
//! client events, and persists the durable ones.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────────┐
//! │ Client      │ ◄─────────────────► │ RealtimeServer   │
//! │ (per tab)   │     JSON events     │ (accept loop)    │
//! └─────────────┘                     └────────┬─────────┘
//!                                              │ Session
//!                                              ▼
//!                                     ┌──────────────────┐
//!                                     │ RoomHub          │
//!                                     │ (rooms by key)   │
//!                                     └────────┬─────────┘
//!                                              │
//!                          ┌───────────────────┼──────────────────┐
//!                          ▼                   ▼                  ▼
//!                   PresenceTracker     Broadcast Router    PersistQueue
//!                                                                 │
//!                                                          DocumentStore
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Inbound commands, outbound events, encoded frames
//! - [`registry`]: Room hub: admission, eviction, shutdown
//! - [`room`]: Room kinds, profiles, and per-room state
//! - [`broadcast`]: Fan-out, unicast, and replies with eviction of stalled peers
//! - [`dispatch`]: Per-connection event validation and handling
//! - [`debounce`]: Debounce window for editor content
//! - [`storage`]: Document store trait, in-memory and RocksDB backends
//! - [`server`]: WebSocket server

pub mod broadcast;
pub mod connection;
pub mod debounce;
pub mod dispatch;
pub mod error;
pub mod identity;
mod persist;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use connection::{Connection, ConnectionHandle, ConnectionId, ConnectionState};
pub use dispatch::Session;
pub use error::{ErrorCode, EventError};
pub use identity::{Credential, HandshakeIdentity, IdentityError, IdentityProvider, Principal};
pub use presence::{ParticipantInfo, PresenceState, PresenceTracker, PresenceUpdate};
pub use protocol::{
    ChatCommand, ChatMessage, ChatTarget, Command, EditorCommand, Frame, Reaction, ReactionAction,
    ReactionSet, ServerEvent, SignalCommand,
};
pub use registry::{HubConfig, HubStats, RoomHub};
pub use room::{EventFamily, FileBinding, JoinAudience, PersistenceBinding, Room, RoomKey, RoomKind, RoomProfile};
pub use server::{parse_route, RealtimeServer, ServerConfig, ServerError, ShutdownHandle};
pub use storage::{
    DocumentStore, MemoryStore, RocksStore, StoreConfig, StoreError, StoreStats, MESSAGES, PROJECTS,
};
