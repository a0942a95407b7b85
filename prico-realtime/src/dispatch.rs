//! Inbound event dispatch.
//!
//! A [`Session`] is the per-connection front door: it parses each text frame
//! against the room's command set, applies the command under the room lock,
//! and answers failures with an `error` event to the sender alone. A failed
//! event never closes the connection.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::{json, Value};
use uuid::Uuid;

use crate::connection::ConnectionHandle;
use crate::error::EventError;
use crate::identity::Principal;
use crate::persist::PersistJob;
use crate::presence::PresenceUpdate;
use crate::protocol::{
    timestamp, ChatCommand, ChatMessage, ChatTarget, Command, EditedMessage, EditorCommand, Reaction, ReactionSet,
    ServerEvent, SignalCommand,
};
use crate::room::{MessageStatus, Room, RoomKind};
use crate::storage::MESSAGES;

pub struct Session {
    room: Arc<Room>,
    handle: ConnectionHandle,
    principal: Principal,
}

impl Session {
    pub fn new(room: Arc<Room>, handle: ConnectionHandle, principal: Principal) -> Self {
        Self {
            room,
            handle,
            principal,
        }
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn room(&self) -> &Arc<Room> {
        &self.room
    }

    /// Handles one inbound text frame. Errors have already been replied to
    /// the sender when this returns `Err`.
    pub async fn handle_text(&self, text: &str) -> Result<(), EventError> {
        if !self.handle.is_open() {
            log::debug!("Ignoring event from closed {}", self.handle.id());
            return Ok(());
        }
        let outcome = match Command::parse(self.room.kind().family(), text) {
            Ok(command) => self.apply(command).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => {
                self.room.counters().events_dispatched.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.reject(&e).await;
                Err(e)
            }
        }
    }

    /// Reports `err` to this connection only.
    pub async fn reject(&self, err: &EventError) {
        self.room.counters().events_rejected.fetch_add(1, Ordering::Relaxed);
        log::warn!(
            "Rejected event from {} in {}: {err}",
            self.principal.user_id,
            self.room.key()
        );
        self.room.reply(self.handle.id(), &ServerEvent::error(err)).await;
    }

    async fn apply(&self, command: Command) -> Result<(), EventError> {
        match command {
            Command::Chat(cmd) => self.chat(cmd).await,
            Command::Editor(cmd) => {
                self.editor(cmd).await;
                Ok(())
            }
            Command::Signal(cmd) => {
                self.signal(cmd).await;
                Ok(())
            }
        }
    }

    // ─── Chat ───────────────────────────────────────────────

    async fn chat(&self, command: ChatCommand) -> Result<(), EventError> {
        match command {
            ChatCommand::NewMessage {
                sender_id,
                content,
                target,
                attachments,
            } => {
                self.check_target(&target)?;
                let now = timestamp();
                let message = ChatMessage {
                    id: Uuid::new_v4().to_string(),
                    sender_id,
                    channel_id: target.channel_id,
                    dm_id: target.dm_id,
                    content,
                    attachments,
                    reactions: Vec::new(),
                    created_at: now.clone(),
                    updated_at: now,
                };
                let document = serde_json::to_value(&message)
                    .map_err(|e| EventError::Malformed(e.to_string()))?;

                self.room
                    .transact(|txn| {
                        txn.messages().insert(message.id.clone());
                        txn.persist(PersistJob::SaveMessage(document));
                        txn.broadcast(&ServerEvent::NewMessage { message }, None);
                    })
                    .await;
                Ok(())
            }

            ChatCommand::EditMessage { message_id, content } => {
                self.ensure_message(&message_id).await?;
                let updated_at = timestamp();
                self.room
                    .transact(|txn| {
                        if txn.messages().status(&message_id) != MessageStatus::Live {
                            return Err(EventError::message_not_found(&message_id));
                        }
                        txn.messages().touch(&message_id);
                        txn.persist(PersistJob::UpdateMessage {
                            id: message_id.clone(),
                            partial: json!({"content": content, "updated_at": updated_at}),
                        });
                        let message = EditedMessage {
                            id: message_id,
                            content,
                            updated_at,
                        };
                        txn.broadcast(&ServerEvent::EditMessage { message }, None);
                        Ok(())
                    })
                    .await
            }

            ChatCommand::DeleteMessage { message_id } => {
                self.ensure_message(&message_id).await?;
                self.room
                    .transact(|txn| {
                        if !txn.messages().mark_deleted(&message_id) {
                            return Err(EventError::message_not_found(&message_id));
                        }
                        txn.persist(PersistJob::DeleteMessage {
                            id: message_id.clone(),
                        });
                        txn.broadcast(&ServerEvent::DeleteMessage { message_id }, None);
                        Ok(())
                    })
                    .await
            }

            ChatCommand::Typing { user_id, target } => {
                self.check_target(&target)?;
                log::trace!("{user_id} is typing in {}", self.room.key());
                let event = ServerEvent::Typing {
                    user_id,
                    channel_id: target.channel_id,
                    dm_id: target.dm_id,
                };
                self.room.broadcast(&event, None).await;
                Ok(())
            }

            ChatCommand::Reaction {
                message_id,
                user_id,
                emoji,
                action,
            } => {
                self.ensure_message(&message_id).await?;
                let updated_at = timestamp();
                self.room
                    .transact(|txn| {
                        let Some(reactions) = txn.messages().reactions_mut(&message_id) else {
                            return Err(EventError::message_not_found(&message_id));
                        };
                        reactions.apply(action, Reaction { emoji, user_id });
                        let reactions = reactions.to_vec();

                        txn.persist(PersistJob::UpdateMessage {
                            id: message_id.clone(),
                            partial: json!({"reactions": reactions, "updated_at": updated_at}),
                        });
                        txn.broadcast(
                            &ServerEvent::Reaction {
                                message_id,
                                reactions,
                            },
                            None,
                        );
                        Ok(())
                    })
                    .await
            }
        }
    }

    /// Accepts only the id field of this room's kind, naming this room.
    fn check_target(&self, target: &ChatTarget) -> Result<(), EventError> {
        let (field, other) = target_fields(self.room.kind());
        let (own, foreign) = match self.room.kind() {
            RoomKind::DirectMessage => (&target.dm_id, &target.channel_id),
            _ => (&target.channel_id, &target.dm_id),
        };
        if foreign.is_some() {
            return Err(EventError::invalid(other, "not accepted in this room"));
        }
        match own {
            Some(id) if *id == self.room.key().id => Ok(()),
            Some(_) => Err(EventError::invalid(field, "does not match this room")),
            None => Err(EventError::MissingField(field)),
        }
    }

    /// Makes sure the room knows `message_id`, loading it from the store
    /// when the cache does not hold it.
    async fn ensure_message(&self, message_id: &str) -> Result<(), EventError> {
        for _ in 0..LOOKUP_ATTEMPTS {
            let (status, epoch, queued) = self
                .room
                .transact(|txn| {
                    let messages = txn.messages();
                    (messages.status(message_id), messages.epoch(), txn.queued_writes())
                })
                .await;
            match status {
                MessageStatus::Live => return Ok(()),
                MessageStatus::Deleted => return Err(EventError::message_not_found(message_id)),
                MessageStatus::Unknown => {}
            }

            // Writes queued before the lookup must be visible in the store.
            self.room.writes_settled(queued).await;
            let document = match self.room.load_document(MESSAGES, message_id).await {
                Ok(Some(document)) => document,
                Ok(None) => return Err(EventError::message_not_found(message_id)),
                Err(e) => {
                    log::error!("Failed to load message {message_id} for {}: {e}", self.room.key());
                    return Err(EventError::message_not_found(message_id));
                }
            };
            let (field, _) = target_fields(self.room.kind());
            if document.get(field).and_then(Value::as_str) != Some(self.room.key().id.as_str()) {
                log::debug!("Message {message_id} does not belong to {}", self.room.key());
                return Err(EventError::message_not_found(message_id));
            }

            let reactions = stored_reactions(&document);
            let adopted = self
                .room
                .transact(|txn| txn.messages().adopt(message_id, reactions, epoch))
                .await;
            if adopted {
                return Ok(());
            }
            log::debug!("Message cache of {} moved during lookup of {message_id}", self.room.key());
        }
        log::warn!("Gave up loading message {message_id} for {}", self.room.key());
        Err(EventError::message_not_found(message_id))
    }

    // ─── Editor ─────────────────────────────────────────────

    async fn editor(&self, command: EditorCommand) {
        let from = self.principal.user_id.clone();
        let sender = Some(self.handle.id());
        match command {
            EditorCommand::Change {
                changes,
                origin,
                content,
            } => {
                self.room
                    .transact(|txn| {
                        txn.broadcast(&ServerEvent::Change { changes, origin, from }, sender);
                        if let Some(content) = content {
                            txn.offer_snapshot(content);
                        }
                    })
                    .await;
            }
            EditorCommand::Cursor { cursor } => {
                log::trace!("Cursor update from {from} in {}", self.room.key());
                let username = self.principal.display_name.clone();
                self.room
                    .transact(|txn| {
                        txn.update_presence(&from, PresenceUpdate::Cursor(cursor.clone()));
                        txn.broadcast(
                            &ServerEvent::Cursor {
                                user_id: from,
                                username,
                                cursor,
                            },
                            sender,
                        );
                    })
                    .await;
            }
            EditorCommand::Undo => {
                self.room.broadcast(&ServerEvent::Undo { from }, sender).await;
            }
            EditorCommand::Redo => {
                self.room.broadcast(&ServerEvent::Redo { from }, sender).await;
            }
        }
    }

    // ─── Signaling ──────────────────────────────────────────

    async fn signal(&self, command: SignalCommand) {
        let from = self.principal.user_id.clone();
        match command {
            SignalCommand::Offer { target, offer } => {
                let event = ServerEvent::Offer {
                    offer,
                    from,
                    from_name: self.principal.display_name.clone(),
                };
                self.relay(&target, &event).await;
            }
            SignalCommand::Answer { target, answer } => {
                self.relay(&target, &ServerEvent::Answer { answer, from }).await;
            }
            SignalCommand::IceCandidate { target, candidate } => {
                self.relay(&target, &ServerEvent::IceCandidate { candidate, from })
                    .await;
            }
            SignalCommand::Mute { muted } => {
                self.room
                    .transact(|txn| {
                        txn.update_presence(&from, PresenceUpdate::Muted(muted));
                        txn.broadcast(&ServerEvent::Mute { user_id: from, muted }, None);
                    })
                    .await;
            }
            SignalCommand::Video { enabled } => {
                self.room
                    .transact(|txn| {
                        txn.update_presence(&from, PresenceUpdate::Video(enabled));
                        txn.broadcast(&ServerEvent::Video { user_id: from, enabled }, None);
                    })
                    .await;
            }
            SignalCommand::GetParticipants => {
                let id = self.handle.id();
                self.room
                    .transact(|txn| {
                        let participants = txn.participants();
                        txn.reply(id, &ServerEvent::Participants { participants });
                    })
                    .await;
            }
        }
    }

    async fn relay(&self, target: &str, event: &ServerEvent) {
        let delivered = self.room.unicast(target, event).await;
        if delivered == 0 {
            log::debug!(
                "Dropped {} for absent {target} in {}",
                event.name(),
                self.room.key()
            );
        }
    }
}

/// Store lookups retried when the message cache drops entries meanwhile.
const LOOKUP_ATTEMPTS: usize = 3;

/// The field a chat event of `kind` names its room with, and the one it must
/// leave out.
fn target_fields(kind: RoomKind) -> (&'static str, &'static str) {
    match kind {
        RoomKind::DirectMessage => ("dm_id", "channel_id"),
        _ => ("channel_id", "dm_id"),
    }
}

fn stored_reactions(document: &Value) -> ReactionSet {
    let reactions = document
        .get("reactions")
        .cloned()
        .map(serde_json::from_value::<Vec<Reaction>>)
        .and_then(Result::ok)
        .unwrap_or_default();
    ReactionSet::from_reactions(reactions)
}
