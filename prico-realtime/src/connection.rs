//! Connections: lifecycle, outbound queue, and the handles the hub hands out.
//!
//! ```text
//! admit ──► Connection ──► recv() ──► transport writer
//!              │
//!              └── ConnectionHandle (clone) ──► evict
//! Room ──► Sink::push (try_send, never awaits)
//! ```
//!
//! The room owns the [`Sink`]; dropping it closes the queue, and the
//! transport writer observes `None` from [`Connection::recv`].

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::protocol::Frame;
use crate::room::{Room, RoomKey};

/// Process-unique connection id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) u64);

impl ConnectionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// `Connecting → Open → Closed`. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Open,
            _ => ConnectionState::Closed,
        }
    }
}

/// Lock-free lifecycle cell shared by the sink and every handle.
#[derive(Debug)]
pub(crate) struct Lifecycle(AtomicU8);

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(ConnectionState::Connecting as u8))
    }

    pub(crate) fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// `Connecting → Open`. Fails once the connection was closed.
    pub(crate) fn open(&self) -> bool {
        self.0
            .compare_exchange(
                ConnectionState::Connecting as u8,
                ConnectionState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Moves to `Closed`. Returns `true` only for the call that closed it.
    pub(crate) fn close(&self) -> bool {
        self.0.swap(ConnectionState::Closed as u8, Ordering::AcqRel) != ConnectionState::Closed as u8
    }
}

/// Why a push into an outbound queue failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendFailure {
    /// Queue full: the recipient stopped reading.
    Stalled,
    /// Queue closed: the recipient is gone.
    Gone,
}

/// Room-side end of a connection's outbound queue.
#[derive(Debug)]
pub(crate) struct Sink {
    id: ConnectionId,
    lifecycle: Arc<Lifecycle>,
    tx: mpsc::Sender<Frame>,
}

impl Sink {
    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub(crate) fn push(&self, frame: Frame) -> Result<(), SendFailure> {
        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => SendFailure::Stalled,
            TrySendError::Closed(_) => SendFailure::Gone,
        })
    }
}

/// Creates the queue pair for a new connection, in `Connecting`.
pub(crate) fn channel(
    id: ConnectionId,
    capacity: usize,
) -> (Sink, mpsc::Receiver<Frame>, Arc<Lifecycle>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let lifecycle = Arc::new(Lifecycle::new());
    let sink = Sink {
        id,
        lifecycle: Arc::clone(&lifecycle),
        tx,
    };
    (sink, rx, lifecycle)
}

/// Cheap, clonable reference to an admitted connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    room: RoomKey,
    user_id: String,
    lifecycle: Arc<Lifecycle>,
}

impl ConnectionHandle {
    pub(crate) fn new(id: ConnectionId, room: RoomKey, user_id: String, lifecycle: Arc<Lifecycle>) -> Self {
        Self {
            id,
            room,
            user_id,
            lifecycle,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn room(&self) -> &RoomKey {
        &self.room
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub(crate) fn close(&self) -> bool {
        self.lifecycle.close()
    }
}

/// An admitted connection: its handle, its room, and the receiving end of
/// its outbound queue.
pub struct Connection {
    handle: ConnectionHandle,
    room: Arc<Room>,
    inbox: mpsc::Receiver<Frame>,
}

impl Connection {
    pub(crate) fn new(handle: ConnectionHandle, room: Arc<Room>, inbox: mpsc::Receiver<Frame>) -> Self {
        Self { handle, room, inbox }
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn id(&self) -> ConnectionId {
        self.handle.id
    }

    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    pub fn room(&self) -> &Arc<Room> {
        &self.room
    }

    /// Next outbound frame. `None` once the room dropped this connection
    /// and the queue is drained.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.inbox.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Frame> {
        self.inbox.try_recv().ok()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.handle.id)
            .field("room", &self.handle.room)
            .field("user_id", &self.handle.user_id)
            .field("state", &self.state())
            .finish()
    }
}
