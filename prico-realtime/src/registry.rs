//! Room registry: admission, eviction, and the hub lifecycle.
//!
//! One [`RoomHub`] is created per server and injected wherever rooms are
//! needed; there is no global state. The room map lock is held only for
//! lookup, insert and remove. Work on a room happens under that room's own
//! lock, so rooms proceed independently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::connection::{self, Connection, ConnectionHandle, ConnectionId};
use crate::error::EventError;
use crate::identity::Principal;
use crate::persist::PersistContext;
use crate::presence::ParticipantInfo;
use crate::protocol::ServerEvent;
use crate::room::{Attach, Room, RoomKey};
use crate::storage::DocumentStore;

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Minimum time between snapshot writes of one editor room
    pub debounce_interval: Duration,
    /// Frames buffered per connection before it counts as stalled
    pub outbound_capacity: usize,
    /// Upper bound on a single transport write
    pub send_timeout: Duration,
    /// Chat messages each room remembers before falling back to the store
    pub message_cache_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            debounce_interval: Duration::from_secs(5),
            outbound_capacity: 256,
            send_timeout: Duration::from_secs(5),
            message_cache_capacity: 1024,
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub connections_admitted: u64,
    pub active_connections: u64,
    pub active_rooms: usize,
    pub events_dispatched: u64,
    pub events_rejected: u64,
    pub frames_dropped: u64,
    pub persisted_writes: u64,
    pub persistence_failures: u64,
}

/// Lock-free counters behind [`HubStats`].
#[derive(Debug, Default)]
pub(crate) struct HubCounters {
    pub(crate) connections_admitted: AtomicU64,
    pub(crate) connections_active: AtomicU64,
    pub(crate) events_dispatched: AtomicU64,
    pub(crate) events_rejected: AtomicU64,
    pub(crate) frames_dropped: AtomicU64,
    pub(crate) persisted_writes: AtomicU64,
    pub(crate) persistence_failures: AtomicU64,
}

pub(crate) struct HubShared {
    pub(crate) config: HubConfig,
    pub(crate) rooms: RwLock<HashMap<RoomKey, Arc<Room>>>,
    pub(crate) persist: PersistContext,
    pub(crate) counters: Arc<HubCounters>,
    pub(crate) shutting_down: AtomicBool,
    next_connection: AtomicU64,
}

/// Cheap to clone; clones share the same rooms.
#[derive(Clone)]
pub struct RoomHub {
    shared: Arc<HubShared>,
}

impl RoomHub {
    pub fn new(config: HubConfig, store: Arc<dyn DocumentStore>) -> Self {
        let counters = Arc::new(HubCounters::default());
        Self {
            shared: Arc::new(HubShared {
                config,
                rooms: RwLock::new(HashMap::new()),
                persist: PersistContext::new(store, Arc::clone(&counters)),
                counters,
                shutting_down: AtomicBool::new(false),
                next_connection: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.shared.config
    }

    pub fn store(&self) -> Arc<dyn DocumentStore> {
        Arc::clone(&self.shared.persist.store)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutting_down.load(Ordering::Acquire)
    }

    /// Admits a connection of `principal` into the room `key`, creating the
    /// room if needed, and announces the join.
    pub async fn admit(&self, key: RoomKey, principal: &Principal) -> Result<Connection, EventError> {
        if self.is_shutting_down() {
            return Err(EventError::ShuttingDown);
        }

        let id = ConnectionId(self.shared.next_connection.fetch_add(1, Ordering::Relaxed));
        let (mut sink, inbox, lifecycle) = connection::channel(id, self.shared.config.outbound_capacity);

        loop {
            let room = self.get_or_create(&key).await;
            match room.attach(principal, sink).await {
                Attach::Joined => {
                    let handle = ConnectionHandle::new(id, key, principal.user_id.clone(), lifecycle);
                    return Ok(Connection::new(handle, room, inbox));
                }
                Attach::Dissolved(returned) => {
                    // Lost a race with the last connection leaving.
                    log::debug!("Room {key} dissolved during admission; retrying");
                    sink = returned;
                    room.unregister().await;
                }
                Attach::ShuttingDown => {
                    lifecycle.close();
                    return Err(EventError::ShuttingDown);
                }
            }
        }
    }

    /// Removes a connection. Safe to call more than once.
    pub async fn evict(&self, handle: &ConnectionHandle) {
        match self.room(handle.room()).await {
            Some(room) => room.evict(handle.id()).await,
            None => {
                handle.close();
            }
        }
    }

    async fn get_or_create(&self, key: &RoomKey) -> Arc<Room> {
        // Fast path: read lock
        {
            let rooms = self.shared.rooms.read().await;
            if let Some(room) = rooms.get(key) {
                return Arc::clone(room);
            }
        }

        let mut rooms = self.shared.rooms.write().await;
        if let Some(room) = rooms.get(key) {
            return Arc::clone(room);
        }
        let room = Room::new(key.clone(), &self.shared);
        rooms.insert(key.clone(), Arc::clone(&room));
        log::info!("Room {key} created");
        room
    }

    pub async fn room(&self, key: &RoomKey) -> Option<Arc<Room>> {
        self.shared.rooms.read().await.get(key).cloned()
    }

    /// Participants in first-join order; empty for an unknown room.
    pub async fn list_participants(&self, key: &RoomKey) -> Vec<ParticipantInfo> {
        match self.room(key).await {
            Some(room) => room.participants().await,
            None => Vec::new(),
        }
    }

    pub async fn broadcast(&self, key: &RoomKey, event: &ServerEvent, exclude: Option<ConnectionId>) -> usize {
        match self.room(key).await {
            Some(room) => room.broadcast(event, exclude).await,
            None => 0,
        }
    }

    pub async fn unicast(&self, key: &RoomKey, target: &str, event: &ServerEvent) -> usize {
        match self.room(key).await {
            Some(room) => room.unicast(target, event).await,
            None => 0,
        }
    }

    pub async fn room_count(&self) -> usize {
        self.shared.rooms.read().await.len()
    }

    pub async fn stats(&self) -> HubStats {
        let c = &self.shared.counters;
        HubStats {
            connections_admitted: c.connections_admitted.load(Ordering::Relaxed),
            active_connections: c.connections_active.load(Ordering::Relaxed),
            active_rooms: self.room_count().await,
            events_dispatched: c.events_dispatched.load(Ordering::Relaxed),
            events_rejected: c.events_rejected.load(Ordering::Relaxed),
            frames_dropped: c.frames_dropped.load(Ordering::Relaxed),
            persisted_writes: c.persisted_writes.load(Ordering::Relaxed),
            persistence_failures: c.persistence_failures.load(Ordering::Relaxed),
        }
    }

    /// Evicts every connection, saving pending editor content, and refuses
    /// admissions from now on.
    pub async fn shutdown(&self) {
        self.shared.shutting_down.store(true, Ordering::Release);
        let rooms: Vec<Arc<Room>> = self.shared.rooms.read().await.values().cloned().collect();
        let count = rooms.len();
        for room in rooms {
            room.close_all().await;
        }
        log::info!("Room hub shut down ({count} room(s) closed)");
    }
}
