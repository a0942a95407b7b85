//! Fan-out, targeted, and reply delivery within a room.
//!
//! An event is encoded once; every recipient gets a clone of the same
//! [`Frame`]. Pushes go into each connection's bounded queue with
//! `try_send` and never wait on a recipient. A full queue (stalled peer) or
//! a closed one (gone peer) is treated as a disconnect: the connection is
//! recorded on the transaction and evicted once the fan-out completes,
//! without interrupting delivery to everyone else.

use std::sync::atomic::Ordering;

use crate::connection::{ConnectionId, SendFailure, Sink};
use crate::protocol::{Frame, ServerEvent};
use crate::registry::HubCounters;
use crate::room::{Room, RoomKey, RoomTxn};

fn encode(event: &ServerEvent, key: &RoomKey) -> Option<Frame> {
    match event.encode() {
        Ok(frame) => Some(frame),
        Err(e) => {
            log::error!("Failed to encode {} for {key}: {e}", event.name());
            None
        }
    }
}

fn deliver(
    sink: &Sink,
    frame: &Frame,
    key: &RoomKey,
    counters: &HubCounters,
    failed: &mut Vec<ConnectionId>,
) -> bool {
    match sink.push(frame.clone()) {
        Ok(()) => true,
        Err(failure) => {
            counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
            match failure {
                SendFailure::Stalled => {
                    log::warn!("{} in {key} is not keeping up; evicting", sink.id())
                }
                SendFailure::Gone => log::debug!("{} in {key} is gone; evicting", sink.id()),
            }
            failed.push(sink.id());
            false
        }
    }
}

impl RoomTxn<'_> {
    /// Delivers to every connection except `exclude`. Returns the number of
    /// successful pushes.
    pub(crate) fn broadcast(&mut self, event: &ServerEvent, exclude: Option<ConnectionId>) -> usize {
        let RoomTxn {
            room,
            state,
            failed,
            ..
        } = self;
        let Some(frame) = encode(event, room.key()) else {
            return 0;
        };

        let mut delivered = 0;
        for sink in state.members.values().flat_map(|m| m.connections.iter()) {
            if Some(sink.id()) == exclude {
                continue;
            }
            if deliver(sink, &frame, room.key(), room.counters(), failed) {
                delivered += 1;
            }
        }
        log::debug!("Broadcast {} in {} to {delivered} connection(s)", event.name(), room.key());
        delivered
    }

    /// Delivers to every connection of participant `target`. An absent
    /// target receives nothing.
    pub(crate) fn unicast(&mut self, target: &str, event: &ServerEvent) -> usize {
        let RoomTxn {
            room,
            state,
            failed,
            ..
        } = self;
        let Some(member) = state.members.get(target) else {
            return 0;
        };
        let Some(frame) = encode(event, room.key()) else {
            return 0;
        };

        member
            .connections
            .iter()
            .filter(|sink| deliver(sink, &frame, room.key(), room.counters(), failed))
            .count()
    }

    /// Delivers to a single connection.
    pub(crate) fn reply(&mut self, id: ConnectionId, event: &ServerEvent) -> bool {
        let RoomTxn {
            room,
            state,
            failed,
            ..
        } = self;
        let Some(sink) = state
            .owners
            .get(&id)
            .and_then(|user| state.members.get(user))
            .and_then(|member| member.connections.iter().find(|s| s.id() == id))
        else {
            return false;
        };
        let Some(frame) = encode(event, room.key()) else {
            return false;
        };
        deliver(sink, &frame, room.key(), room.counters(), failed)
    }
}

impl Room {
    pub async fn broadcast(&self, event: &ServerEvent, exclude: Option<ConnectionId>) -> usize {
        self.transact(|txn| txn.broadcast(event, exclude)).await
    }

    pub async fn unicast(&self, target: &str, event: &ServerEvent) -> usize {
        self.transact(|txn| txn.unicast(target, event)).await
    }

    pub async fn reply(&self, id: ConnectionId, event: &ServerEvent) -> bool {
        self.transact(|txn| txn.reply(id, event)).await
    }
}
