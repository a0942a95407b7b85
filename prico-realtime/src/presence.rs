//! Ephemeral per-room presence: display name, cursor, mute and video flags.
//!
//! Every field is last-write-wins with no history. An entry exists exactly
//! while its participant holds at least one open connection in the room;
//! the room creates it on the first connection and drops it with the last.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Presence of one participant in one room.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceState {
    pub display_name: String,
    /// Opaque cursor/selection payload from the editor.
    pub cursor: Option<Value>,
    pub muted: bool,
    pub video: bool,
    joined_seq: u64,
}

impl PresenceState {
    fn new(display_name: String, joined_seq: u64) -> Self {
        Self {
            display_name,
            cursor: None,
            muted: false,
            video: true,
            joined_seq,
        }
    }
}

/// A single field overwrite.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceUpdate {
    Cursor(Value),
    Muted(bool),
    Video(bool),
}

/// Participant summary as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Value>,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub video: bool,
}

/// Presence entries of a room, keyed by user id.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    entries: HashMap<String, PresenceState>,
    next_seq: u64,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the entry for `user_id`. Returns `false` (and changes nothing)
    /// when the participant is already present.
    pub fn join(&mut self, user_id: &str, display_name: &str) -> bool {
        if self.entries.contains_key(user_id) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            user_id.to_string(),
            PresenceState::new(display_name.to_string(), seq),
        );
        true
    }

    pub fn leave(&mut self, user_id: &str) -> Option<PresenceState> {
        self.entries.remove(user_id)
    }

    /// Overwrites one field. Returns `false` for an absent participant.
    pub fn update(&mut self, user_id: &str, update: PresenceUpdate) -> bool {
        let Some(entry) = self.entries.get_mut(user_id) else {
            return false;
        };
        match update {
            PresenceUpdate::Cursor(cursor) => entry.cursor = Some(cursor),
            PresenceUpdate::Muted(muted) => entry.muted = muted,
            PresenceUpdate::Video(video) => entry.video = video,
        }
        true
    }

    pub fn get(&self, user_id: &str) -> Option<&PresenceState> {
        self.entries.get(user_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All participants in first-join order.
    pub fn participants(&self) -> Vec<ParticipantInfo> {
        self.collect(None)
    }

    /// Everyone except `user_id`, in first-join order.
    pub fn participants_except(&self, user_id: &str) -> Vec<ParticipantInfo> {
        self.collect(Some(user_id))
    }

    fn collect(&self, skip: Option<&str>) -> Vec<ParticipantInfo> {
        let mut ordered: Vec<(&String, &PresenceState)> = self
            .entries
            .iter()
            .filter(|(id, _)| Some(id.as_str()) != skip)
            .collect();
        ordered.sort_by_key(|(_, state)| state.joined_seq);
        ordered
            .into_iter()
            .map(|(id, state)| ParticipantInfo {
                id: id.clone(),
                username: state.display_name.clone(),
                cursor: state.cursor.clone(),
                muted: state.muted,
                video: state.video,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids(list: &[ParticipantInfo]) -> Vec<&str> {
        list.iter().map(|p| p.id.as_str()).collect()
    }

    #[test]
    fn test_join_is_once_per_participant() {
        let mut tracker = PresenceTracker::new();
        assert!(tracker.join("alice", "Alice"));
        assert!(!tracker.join("alice", "Alice (tab 2)"));
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.get("alice").unwrap().display_name, "Alice");
    }

    #[test]
    fn test_participants_keep_join_order() {
        let mut tracker = PresenceTracker::new();
        for user in ["carol", "alice", "bob"] {
            tracker.join(user, user);
        }
        assert_eq!(ids(&tracker.participants()), vec!["carol", "alice", "bob"]);
        assert_eq!(ids(&tracker.participants_except("alice")), vec!["carol", "bob"]);

        tracker.leave("alice");
        tracker.join("alice", "alice");
        assert_eq!(ids(&tracker.participants()), vec!["carol", "bob", "alice"]);
    }

    #[test]
    fn test_update_overwrites() {
        let mut tracker = PresenceTracker::new();
        tracker.join("alice", "Alice");

        assert!(tracker.update("alice", PresenceUpdate::Cursor(json!({"line": 1}))));
        assert!(tracker.update("alice", PresenceUpdate::Cursor(json!({"line": 9}))));
        assert!(tracker.update("alice", PresenceUpdate::Muted(true)));
        assert!(tracker.update("alice", PresenceUpdate::Video(false)));

        let state = tracker.get("alice").unwrap();
        assert_eq!(state.cursor, Some(json!({"line": 9})));
        assert!(state.muted);
        assert!(!state.video);
    }

    #[test]
    fn test_update_absent_participant() {
        let mut tracker = PresenceTracker::new();
        assert!(!tracker.update("ghost", PresenceUpdate::Muted(true)));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_leave_discards_state() {
        let mut tracker = PresenceTracker::new();
        tracker.join("alice", "Alice");
        tracker.update("alice", PresenceUpdate::Muted(true));

        let gone = tracker.leave("alice").unwrap();
        assert!(gone.muted);
        assert!(tracker.get("alice").is_none());

        // Rejoining starts from a clean slate.
        tracker.join("alice", "Alice");
        assert!(!tracker.get("alice").unwrap().muted);
    }

    #[test]
    fn test_participant_info_wire_shape() {
        let mut tracker = PresenceTracker::new();
        tracker.join("u1", "Ada");
        let json = serde_json::to_value(&tracker.participants()[0]).unwrap();
        assert_eq!(json, json!({"id": "u1", "username": "Ada", "muted": false, "video": true}));
    }
}
