//! Rooms: per-kind behaviour profiles and serialised per-room state.
//!
//! ```text
//! RoomHub ── RwLock<HashMap<RoomKey, Arc<Room>>>
//!                                      │
//!                                      ▼
//!                  Room ── Mutex<RoomState> ── members / presence / debouncer
//!                    │
//!                    └── PersistQueue (chat: every mutation, editor: snapshots)
//! ```
//!
//! Every operation on a room runs inside [`Room::transact`] with the room
//! lock held. Deliveries that fail during the transaction are evicted
//! before the lock is released, and a room left without connections is
//! marked dissolved and removed from the hub.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use lru::LruCache;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::connection::{ConnectionId, Sink};
use crate::debounce::{Debouncer, Offer};
use crate::identity::Principal;
use crate::persist::{PersistContext, PersistJob, PersistQueue};
use crate::presence::{ParticipantInfo, PresenceState, PresenceTracker, PresenceUpdate};
use crate::protocol::{ReactionSet, ServerEvent};
use crate::registry::{HubCounters, HubShared};
use crate::storage::{DocumentStore, StoreError};

// ─── Kinds and keys ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomKind {
    ChatChannel,
    DirectMessage,
    EditorFile,
    CallSession,
}

/// Command set a room accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFamily {
    Chat,
    Editor,
    Signaling,
}

/// Who hears about a newly joined participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinAudience {
    /// Existing members only.
    Others,
    /// Everyone, the joiner included.
    Everyone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceBinding {
    None,
    /// Chat: each durable mutation is written on its own.
    EveryMutation,
    /// Editor: the latest full content, at most once per debounce interval.
    DebouncedSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomProfile {
    pub family: EventFamily,
    pub join_audience: JoinAudience,
    /// Send `current-users` to each new connection.
    pub greet_joiner: bool,
    pub persistence: PersistenceBinding,
}

impl RoomKind {
    pub const ALL: [RoomKind; 4] = [
        RoomKind::ChatChannel,
        RoomKind::DirectMessage,
        RoomKind::EditorFile,
        RoomKind::CallSession,
    ];

    /// Path segment used in handshake URLs.
    pub fn as_str(self) -> &'static str {
        match self {
            RoomKind::ChatChannel => "chat",
            RoomKind::DirectMessage => "dm",
            RoomKind::EditorFile => "editor",
            RoomKind::CallSession => "call",
        }
    }

    pub fn from_segment(segment: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == segment)
    }

    pub fn family(self) -> EventFamily {
        self.profile().family
    }

    pub fn profile(self) -> RoomProfile {
        match self {
            RoomKind::ChatChannel | RoomKind::DirectMessage => RoomProfile {
                family: EventFamily::Chat,
                join_audience: JoinAudience::Others,
                greet_joiner: true,
                persistence: PersistenceBinding::EveryMutation,
            },
            RoomKind::EditorFile => RoomProfile {
                family: EventFamily::Editor,
                join_audience: JoinAudience::Others,
                greet_joiner: true,
                persistence: PersistenceBinding::DebouncedSnapshot,
            },
            RoomKind::CallSession => RoomProfile {
                family: EventFamily::Signaling,
                join_audience: JoinAudience::Everyone,
                greet_joiner: false,
                persistence: PersistenceBinding::None,
            },
        }
    }
}

impl fmt::Display for RoomKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rooms of different kinds with the same id are distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomKey {
    pub kind: RoomKind,
    pub id: String,
}

impl RoomKey {
    pub fn new(kind: RoomKind, id: impl Into<String>) -> Self {
        Self { kind, id: id.into() }
    }

    pub fn chat(channel_id: impl Into<String>) -> Self {
        Self::new(RoomKind::ChatChannel, channel_id)
    }

    pub fn dm(dm_id: impl Into<String>) -> Self {
        Self::new(RoomKind::DirectMessage, dm_id)
    }

    /// Editor room for `file_path` in `project_id`.
    pub fn editor(project_id: &str, file_path: &str) -> Self {
        Self::new(RoomKind::EditorFile, format!("{project_id}:{file_path}"))
    }

    pub fn call(session_id: impl Into<String>) -> Self {
        Self::new(RoomKind::CallSession, session_id)
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// Where an editor room's content is saved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBinding {
    pub project_id: String,
    pub file_path: String,
}

impl FileBinding {
    /// Splits `project_id:file_path` at the first `:`.
    pub fn parse(room_id: &str) -> Option<Self> {
        let (project_id, file_path) = room_id.split_once(':')?;
        if project_id.is_empty() || file_path.is_empty() {
            return None;
        }
        Some(Self {
            project_id: project_id.to_string(),
            file_path: file_path.to_string(),
        })
    }
}

// ─── Room state ─────────────────────────────────────────────

/// Open connections of one participant.
#[derive(Debug, Default)]
pub(crate) struct Member {
    pub(crate) connections: Vec<Sink>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MessageStatus {
    Live,
    Deleted,
    Unknown,
}

#[derive(Debug)]
enum CachedMessage {
    Live(ReactionSet),
    Deleted,
}

/// Recently used chat messages of this room, with their reactions.
///
/// Bounded: the least recently used entry is dropped once the cache is
/// full, and the store is consulted again on its next reference. Every drop
/// bumps [`MessageCache::epoch`], so a lookup that started before the drop
/// can tell its result may be stale.
pub(crate) struct MessageCache {
    entries: LruCache<String, CachedMessage>,
    epoch: u64,
}

impl MessageCache {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            epoch: 0,
        }
    }

    pub(crate) fn status(&self, id: &str) -> MessageStatus {
        match self.entries.peek(id) {
            Some(CachedMessage::Live(_)) => MessageStatus::Live,
            Some(CachedMessage::Deleted) => MessageStatus::Deleted,
            None => MessageStatus::Unknown,
        }
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Marks `id` as most recently used.
    pub(crate) fn touch(&mut self, id: &str) {
        self.entries.promote(id);
    }

    pub(crate) fn insert(&mut self, id: String) {
        self.put(id, CachedMessage::Live(ReactionSet::new()));
    }

    /// Records a message loaded from the store. Returns `false` when an
    /// entry was dropped since `epoch` was read and the room does not know
    /// `id`; the caller must look it up again.
    pub(crate) fn adopt(&mut self, id: &str, reactions: ReactionSet, epoch: u64) -> bool {
        if self.status(id) != MessageStatus::Unknown {
            return true;
        }
        if self.epoch != epoch {
            return false;
        }
        self.put(id.to_string(), CachedMessage::Live(reactions));
        true
    }

    pub(crate) fn reactions_mut(&mut self, id: &str) -> Option<&mut ReactionSet> {
        match self.entries.get_mut(id) {
            Some(CachedMessage::Live(reactions)) => Some(reactions),
            _ => None,
        }
    }

    pub(crate) fn mark_deleted(&mut self, id: &str) -> bool {
        let was_live = self.status(id) == MessageStatus::Live;
        self.put(id.to_string(), CachedMessage::Deleted);
        was_live
    }

    fn put(&mut self, id: String, entry: CachedMessage) {
        if let Some((dropped, _)) = self.entries.push(id.clone(), entry) {
            if dropped != id {
                self.epoch += 1;
                log::trace!("Message {dropped} dropped from cache");
            }
        }
    }
}

impl fmt::Debug for MessageCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageCache")
            .field("len", &self.entries.len())
            .field("capacity", &self.entries.cap())
            .field("epoch", &self.epoch)
            .finish()
    }
}

#[derive(Debug)]
pub(crate) struct RoomState {
    /// Set once the last connection left. A dissolved room accepts nothing.
    pub(crate) dissolved: bool,
    pub(crate) members: HashMap<String, Member>,
    pub(crate) owners: HashMap<ConnectionId, String>,
    pub(crate) presence: PresenceTracker,
    pub(crate) debouncer: Option<Debouncer<String>>,
    pub(crate) messages: MessageCache,
}

/// Outcome of attaching a connection.
pub(crate) enum Attach {
    Joined,
    /// The room dissolved first; the sink is handed back for a retry.
    Dissolved(Sink),
    ShuttingDown,
}

pub struct Room {
    key: RoomKey,
    profile: RoomProfile,
    binding: Option<FileBinding>,
    state: Mutex<RoomState>,
    persist: Option<PersistQueue>,
    store: Arc<dyn DocumentStore>,
    counters: Arc<HubCounters>,
    hub: Weak<HubShared>,
    me: Weak<Room>,
}

impl Room {
    pub(crate) fn new(key: RoomKey, hub: &Arc<HubShared>) -> Arc<Self> {
        let profile = key.kind.profile();
        let binding = match profile.persistence {
            PersistenceBinding::DebouncedSnapshot => {
                let binding = FileBinding::parse(&key.id);
                if binding.is_none() {
                    log::warn!("Room {key} has no project:file binding; content will not be saved");
                }
                binding
            }
            _ => None,
        };

        let persist = match profile.persistence {
            PersistenceBinding::None => None,
            PersistenceBinding::EveryMutation => Some(Self::spawn_writer(&key, &hub.persist)),
            PersistenceBinding::DebouncedSnapshot => binding
                .as_ref()
                .map(|_| Self::spawn_writer(&key, &hub.persist)),
        };
        let debouncer = binding
            .as_ref()
            .map(|_| Debouncer::new(hub.config.debounce_interval));

        Arc::new_cyclic(|me| Room {
            binding,
            profile,
            state: Mutex::new(RoomState {
                dissolved: false,
                members: HashMap::new(),
                owners: HashMap::new(),
                presence: PresenceTracker::new(),
                debouncer,
                messages: MessageCache::new(hub.config.message_cache_capacity),
            }),
            persist,
            store: Arc::clone(&hub.persist.store),
            counters: Arc::clone(&hub.counters),
            hub: Arc::downgrade(hub),
            me: me.clone(),
            key,
        })
    }

    fn spawn_writer(key: &RoomKey, ctx: &PersistContext) -> PersistQueue {
        PersistQueue::spawn(ctx.clone(), key.to_string())
    }

    pub fn key(&self) -> &RoomKey {
        &self.key
    }

    pub fn kind(&self) -> RoomKind {
        self.key.kind
    }

    pub fn profile(&self) -> RoomProfile {
        self.profile
    }

    pub fn file_binding(&self) -> Option<&FileBinding> {
        self.binding.as_ref()
    }

    pub(crate) fn counters(&self) -> &HubCounters {
        &self.counters
    }

    /// Runs `f` with the room lock held, then evicts every connection whose
    /// delivery failed and unregisters the room if it emptied.
    pub(crate) async fn transact<R>(&self, f: impl FnOnce(&mut RoomTxn<'_>) -> R) -> R {
        let mut state = self.state.lock().await;
        let (out, dissolved) = {
            let mut txn = RoomTxn::new(self, &mut *state);
            let out = f(&mut txn);
            (out, txn.settle())
        };
        drop(state);
        if dissolved {
            self.unregister().await;
        }
        out
    }

    /// Removes this room from the hub if the hub still maps its key to it.
    pub(crate) async fn unregister(&self) {
        let Some(hub) = self.hub.upgrade() else {
            return;
        };
        let mut rooms = hub.rooms.write().await;
        let is_current = rooms
            .get(&self.key)
            .is_some_and(|room| std::ptr::eq(Arc::as_ptr(room), self));
        if is_current {
            rooms.remove(&self.key);
            log::info!("Room {} removed (empty)", self.key);
        }
    }

    fn hub_closing(&self) -> bool {
        self.hub
            .upgrade()
            .map_or(true, |hub| hub.shutting_down.load(Ordering::Acquire))
    }

    pub(crate) async fn attach(&self, principal: &Principal, sink: Sink) -> Attach {
        self.transact(|txn| txn.attach(principal, sink)).await
    }

    pub(crate) async fn evict(&self, id: ConnectionId) {
        self.transact(|txn| txn.queue_eviction(id)).await
    }

    /// Drops every connection without `user-left` announcements.
    pub(crate) async fn close_all(&self) {
        self.transact(|txn| {
            txn.announce_departures = false;
            let ids: Vec<ConnectionId> = txn.state.owners.keys().copied().collect();
            for id in ids {
                txn.queue_eviction(id);
            }
        })
        .await
    }

    pub async fn participants(&self) -> Vec<ParticipantInfo> {
        self.transact(|txn| txn.participants()).await
    }

    pub async fn presence_of(&self, user_id: &str) -> Option<PresenceState> {
        self.transact(|txn| txn.state.presence.get(user_id).cloned()).await
    }

    pub async fn update_presence(&self, user_id: &str, update: PresenceUpdate) -> bool {
        self.transact(|txn| txn.update_presence(user_id, update)).await
    }

    pub async fn connection_count(&self) -> usize {
        self.transact(|txn| txn.state.owners.len()).await
    }

    pub async fn is_dissolved(&self) -> bool {
        self.state.lock().await.dissolved
    }

    /// Point lookup in the backing store, off the async executor.
    pub(crate) async fn load_document(
        &self,
        collection: &'static str,
        id: &str,
    ) -> Result<Option<Value>, StoreError> {
        let store = Arc::clone(&self.store);
        let id = id.to_string();
        tokio::task::spawn_blocking(move || store.find(collection, &id))
            .await
            .map_err(|e| StoreError::Database(format!("lookup task failed: {e}")))?
    }

    /// Waits until the first `upto` queued writes have been applied.
    pub(crate) async fn writes_settled(&self, upto: u64) {
        if let Some(queue) = &self.persist {
            queue.settled(upto).await;
        }
    }

    fn schedule_flush(&self, deadline: Instant) {
        let room = self.me.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(room) = room.upgrade() {
                room.transact(|txn| txn.flush_snapshot(Instant::now())).await;
            }
        });
    }
}

impl fmt::Debug for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Room")
            .field("key", &self.key)
            .field("profile", &self.profile)
            .field("binding", &self.binding)
            .finish()
    }
}

// ─── Transactions ───────────────────────────────────────────

/// Exclusive access to a room's state for the duration of one operation.
pub(crate) struct RoomTxn<'a> {
    pub(crate) room: &'a Room,
    pub(crate) state: &'a mut RoomState,
    /// Connections to evict before the lock is released.
    pub(crate) failed: Vec<ConnectionId>,
    pub(crate) announce_departures: bool,
}

impl<'a> RoomTxn<'a> {
    fn new(room: &'a Room, state: &'a mut RoomState) -> Self {
        Self {
            room,
            state,
            failed: Vec::new(),
            announce_departures: true,
        }
    }

    pub(crate) fn attach(&mut self, principal: &Principal, sink: Sink) -> Attach {
        if self.state.dissolved {
            return Attach::Dissolved(sink);
        }
        if self.room.hub_closing() {
            return Attach::ShuttingDown;
        }

        let id = sink.id();
        sink.lifecycle().open();
        let user_id = principal.user_id.clone();
        let first = !self.state.members.contains_key(&user_id);

        self.state.owners.insert(id, user_id.clone());
        self.state
            .members
            .entry(user_id.clone())
            .or_default()
            .connections
            .push(sink);
        self.room.counters.connections_admitted.fetch_add(1, Ordering::Relaxed);
        self.room.counters.connections_active.fetch_add(1, Ordering::Relaxed);

        if first {
            self.state.presence.join(&user_id, &principal.display_name);
            log::info!("{user_id} joined {} ({id})", self.room.key);
        } else {
            log::info!("{user_id} opened another connection to {} ({id})", self.room.key);
        }

        let profile = self.room.profile;
        if profile.greet_joiner {
            let users = self.state.presence.participants_except(&user_id);
            self.reply(id, &ServerEvent::CurrentUsers { users });
        } else if !first {
            let participants = self.state.presence.participants();
            self.reply(id, &ServerEvent::Participants { participants });
        }

        if first {
            let event = ServerEvent::UserJoined {
                user_id,
                username: principal.display_name.clone(),
                participants: self.state.presence.participants(),
            };
            let exclude = match profile.join_audience {
                JoinAudience::Others => Some(id),
                JoinAudience::Everyone => None,
            };
            self.broadcast(&event, exclude);
        }
        Attach::Joined
    }

    pub(crate) fn queue_eviction(&mut self, id: ConnectionId) {
        self.failed.push(id);
    }

    pub(crate) fn participants(&self) -> Vec<ParticipantInfo> {
        self.state.presence.participants()
    }

    pub(crate) fn update_presence(&mut self, user_id: &str, update: PresenceUpdate) -> bool {
        self.state.presence.update(user_id, update)
    }

    pub(crate) fn messages(&mut self) -> &mut MessageCache {
        &mut self.state.messages
    }

    /// Writes handed to the room's writer so far.
    pub(crate) fn queued_writes(&self) -> u64 {
        self.room.persist.as_ref().map_or(0, PersistQueue::enqueued)
    }

    pub(crate) fn persist(&self, job: PersistJob) {
        match &self.room.persist {
            Some(queue) => queue.enqueue(job),
            None => log::debug!("Room {} does not persist; skipping write", self.room.key),
        }
    }

    /// Offers the latest full content to the debounce window.
    pub(crate) fn offer_snapshot(&mut self, content: String) {
        let Some(debouncer) = self.state.debouncer.as_mut() else {
            log::debug!("Room {} has no file binding; content not saved", self.room.key);
            return;
        };
        match debouncer.offer(Instant::now(), content) {
            Offer::Scheduled(deadline) => self.room.schedule_flush(deadline),
            Offer::Coalesced => log::trace!("Coalesced content update in {}", self.room.key),
        }
    }

    fn flush_snapshot(&mut self, now: Instant) {
        let Some(debouncer) = self.state.debouncer.as_mut() else {
            return;
        };
        let due = debouncer.take_due(now);
        let deadline = debouncer.deadline();
        match (due, deadline) {
            (Some(content), _) => self.write_snapshot(content),
            (None, Some(deadline)) => self.room.schedule_flush(deadline),
            (None, None) => {}
        }
    }

    fn write_snapshot(&self, content: String) {
        if let Some(binding) = &self.room.binding {
            self.persist(PersistJob::WriteFile {
                project_id: binding.project_id.clone(),
                file_path: binding.file_path.clone(),
                content,
            });
        }
    }

    /// Removes a connection's sink. Returns its owner.
    fn detach(&mut self, id: ConnectionId) -> Option<String> {
        let user_id = self.state.owners.remove(&id)?;
        if let Some(member) = self.state.members.get_mut(&user_id) {
            if let Some(pos) = member.connections.iter().position(|s| s.id() == id) {
                let sink = member.connections.swap_remove(pos);
                sink.lifecycle().close();
                self.room.counters.connections_active.fetch_sub(1, Ordering::Relaxed);
            }
            if member.connections.is_empty() {
                self.state.members.remove(&user_id);
            }
        }
        log::debug!("Detached {id} of {user_id} from {}", self.room.key);
        Some(user_id)
    }

    /// Evicts queued connections, announcing departures (which may fail
    /// further deliveries). Returns `true` if the room just dissolved.
    fn settle(&mut self) -> bool {
        while let Some(id) = self.failed.pop() {
            let Some(user_id) = self.detach(id) else {
                continue;
            };
            if self.state.members.contains_key(&user_id) {
                continue;
            }
            self.state.presence.leave(&user_id);
            log::info!("{user_id} left {}", self.room.key);

            if self.announce_departures && !self.state.members.is_empty() {
                let event = ServerEvent::UserLeft {
                    user_id,
                    participants: self.state.presence.participants(),
                };
                self.broadcast(&event, None);
            }
        }

        if self.state.members.is_empty() && !self.state.dissolved {
            self.state.dissolved = true;
            let pending = self
                .state
                .debouncer
                .as_mut()
                .and_then(Debouncer::take_pending);
            if let Some(content) = pending {
                log::info!("Saving pending content of {} before removal", self.room.key);
                self.write_snapshot(content);
            }
            return true;
        }
        false
    }
}
