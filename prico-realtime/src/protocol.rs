//! JSON wire protocol.
//!
//! Inbound frames are text JSON objects whose `type` field selects a command
//! from the closed set of the room's [`EventFamily`]. Required fields are
//! checked while parsing, so a [`Command`] that exists is valid and the
//! dispatcher never acts on a half-formed event.
//!
//! Outbound events are [`ServerEvent`] values, encoded once into a [`Frame`]
//! and cloned cheaply to every recipient.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};

use crate::error::{ErrorCode, EventError};
use crate::presence::ParticipantInfo;
use crate::room::EventFamily;

/// RFC 3339 timestamp used for `created_at` / `updated_at`.
pub(crate) fn timestamp() -> String {
    Utc::now().to_rfc3339()
}

// ─── Field extraction ───────────────────────────────────────

trait EventFields {
    fn required_str(&self, field: &'static str) -> Result<String, EventError>;
    fn optional_str(&self, field: &'static str) -> Result<Option<String>, EventError>;
    fn required_value(&self, field: &'static str) -> Result<Value, EventError>;
    fn required_payload(&self, field: &'static str) -> Result<Value, EventError>;
    fn required_bool(&self, field: &'static str) -> Result<bool, EventError>;
}

impl EventFields for Value {
    /// Empty strings count as missing.
    fn required_str(&self, field: &'static str) -> Result<String, EventError> {
        self.optional_str(field)?
            .ok_or(EventError::MissingField(field))
    }

    fn optional_str(&self, field: &'static str) -> Result<Option<String>, EventError> {
        match self.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) if s.is_empty() => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(_) => Err(EventError::invalid(field, "expected a string")),
        }
    }

    fn required_value(&self, field: &'static str) -> Result<Value, EventError> {
        match self.get(field) {
            None | Some(Value::Null) => Err(EventError::MissingField(field)),
            Some(value) => Ok(value.clone()),
        }
    }

    /// Like `required_value`, but empty, zero and `false` count as missing.
    fn required_payload(&self, field: &'static str) -> Result<Value, EventError> {
        let value = self.required_value(field)?;
        let empty = match &value {
            Value::Bool(b) => !b,
            Value::Number(n) => n.as_f64() == Some(0.0),
            Value::String(s) => s.is_empty(),
            Value::Array(items) => items.is_empty(),
            Value::Object(map) => map.is_empty(),
            Value::Null => true,
        };
        if empty {
            return Err(EventError::MissingField(field));
        }
        Ok(value)
    }

    fn required_bool(&self, field: &'static str) -> Result<bool, EventError> {
        match self.get(field) {
            None | Some(Value::Null) => Err(EventError::MissingField(field)),
            Some(Value::Bool(b)) => Ok(*b),
            Some(_) => Err(EventError::invalid(field, "expected a boolean")),
        }
    }
}

// ─── Inbound commands ───────────────────────────────────────

/// Channel or DM a chat event refers to. At least one side is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTarget {
    pub channel_id: Option<String>,
    pub dm_id: Option<String>,
}

impl ChatTarget {
    fn parse(value: &Value) -> Result<Self, EventError> {
        let target = ChatTarget {
            channel_id: value.optional_str("channel_id")?,
            dm_id: value.optional_str("dm_id")?,
        };
        if target.channel_id.is_none() && target.dm_id.is_none() {
            return Err(EventError::MissingField("channel_id or dm_id"));
        }
        Ok(target)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionAction {
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatCommand {
    NewMessage {
        sender_id: String,
        content: String,
        target: ChatTarget,
        attachments: Vec<Value>,
    },
    EditMessage {
        message_id: String,
        content: String,
    },
    DeleteMessage {
        message_id: String,
    },
    Typing {
        user_id: String,
        target: ChatTarget,
    },
    Reaction {
        message_id: String,
        user_id: String,
        emoji: String,
        action: ReactionAction,
    },
}

impl ChatCommand {
    fn parse(kind: &str, value: &Value) -> Result<Self, EventError> {
        match kind {
            "new_message" => {
                let sender_id = value.required_str("sender_id")?;
                let content = value.required_str("content")?;
                let target = ChatTarget::parse(value)?;
                let attachments = match value.get("attachments") {
                    None | Some(Value::Null) => Vec::new(),
                    Some(Value::Array(items)) => items.clone(),
                    Some(_) => return Err(EventError::invalid("attachments", "expected an array")),
                };
                Ok(ChatCommand::NewMessage {
                    sender_id,
                    content,
                    target,
                    attachments,
                })
            }
            "edit_message" => Ok(ChatCommand::EditMessage {
                message_id: value.required_str("message_id")?,
                content: value.required_str("content")?,
            }),
            "delete_message" => Ok(ChatCommand::DeleteMessage {
                message_id: value.required_str("message_id")?,
            }),
            "typing" => Ok(ChatCommand::Typing {
                user_id: value.required_str("user_id")?,
                target: ChatTarget::parse(value)?,
            }),
            "reaction" => {
                let message_id = value.required_str("message_id")?;
                let user_id = value.required_str("user_id")?;
                let emoji = value.required_str("emoji")?;
                let action = match value.optional_str("action")?.as_deref() {
                    None | Some("add") => ReactionAction::Add,
                    Some("remove") => ReactionAction::Remove,
                    Some(other) => {
                        return Err(EventError::invalid(
                            "action",
                            format!("expected add or remove, got {other}"),
                        ))
                    }
                };
                Ok(ChatCommand::Reaction {
                    message_id,
                    user_id,
                    emoji,
                    action,
                })
            }
            other => Err(EventError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EditorCommand {
    /// `content`, when present, is the full file text after the change.
    Change {
        changes: Value,
        origin: Value,
        content: Option<String>,
    },
    Cursor {
        cursor: Value,
    },
    Undo,
    Redo,
}

impl EditorCommand {
    fn parse(kind: &str, value: &Value) -> Result<Self, EventError> {
        match kind {
            "change" => {
                let changes = value.required_payload("changes")?;
                let origin = value.required_value("origin")?;
                // Empty content is a valid snapshot.
                let content = match value.get("content") {
                    None | Some(Value::Null) => None,
                    Some(Value::String(s)) => Some(s.clone()),
                    Some(_) => return Err(EventError::invalid("content", "expected a string")),
                };
                Ok(EditorCommand::Change {
                    changes,
                    origin,
                    content,
                })
            }
            "cursor" => Ok(EditorCommand::Cursor {
                cursor: value.required_value("cursor")?,
            }),
            "undo" => Ok(EditorCommand::Undo),
            "redo" => Ok(EditorCommand::Redo),
            other => Err(EventError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalCommand {
    Offer { target: String, offer: Value },
    Answer { target: String, answer: Value },
    IceCandidate { target: String, candidate: Value },
    Mute { muted: bool },
    Video { enabled: bool },
    GetParticipants,
}

impl SignalCommand {
    fn parse(kind: &str, value: &Value) -> Result<Self, EventError> {
        match kind {
            "offer" => Ok(SignalCommand::Offer {
                target: value.required_str("target")?,
                offer: value.required_value("offer")?,
            }),
            "answer" => Ok(SignalCommand::Answer {
                target: value.required_str("target")?,
                answer: value.required_value("answer")?,
            }),
            "ice-candidate" => Ok(SignalCommand::IceCandidate {
                target: value.required_str("target")?,
                candidate: value.required_value("candidate")?,
            }),
            "mute" => Ok(SignalCommand::Mute {
                muted: value.required_bool("muted")?,
            }),
            "video" => Ok(SignalCommand::Video {
                enabled: value.required_bool("enabled")?,
            }),
            "get-participants" => Ok(SignalCommand::GetParticipants),
            other => Err(EventError::UnknownKind(other.to_string())),
        }
    }
}

/// A validated inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Chat(ChatCommand),
    Editor(EditorCommand),
    Signal(SignalCommand),
}

impl Command {
    /// Parses a text frame against the command set of `family`.
    pub fn parse(family: EventFamily, text: &str) -> Result<Self, EventError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| EventError::Malformed(e.to_string()))?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| EventError::Malformed("expected an object with a string `type`".into()))?;

        match family {
            EventFamily::Chat => ChatCommand::parse(kind, &value).map(Command::Chat),
            EventFamily::Editor => EditorCommand::parse(kind, &value).map(Command::Editor),
            EventFamily::Signaling => SignalCommand::parse(kind, &value).map(Command::Signal),
        }
    }
}

// ─── Chat payloads ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reaction {
    pub emoji: String,
    pub user_id: String,
}

/// Reactions of one message; at most one entry per `(emoji, user_id)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReactionSet {
    entries: Vec<Reaction>,
}

impl ReactionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set from stored reactions, dropping duplicates.
    pub fn from_reactions(reactions: impl IntoIterator<Item = Reaction>) -> Self {
        let mut set = Self::new();
        for reaction in reactions {
            set.add(reaction);
        }
        set
    }

    /// Returns `false` when the reaction was already present.
    pub fn add(&mut self, reaction: Reaction) -> bool {
        if self.entries.contains(&reaction) {
            return false;
        }
        self.entries.push(reaction);
        true
    }

    pub fn remove(&mut self, reaction: &Reaction) -> bool {
        let before = self.entries.len();
        self.entries.retain(|r| r != reaction);
        self.entries.len() != before
    }

    pub fn apply(&mut self, action: ReactionAction, reaction: Reaction) -> bool {
        match action {
            ReactionAction::Add => self.add(reaction),
            ReactionAction::Remove => self.remove(&reaction),
        }
    }

    pub fn to_vec(&self) -> Vec<Reaction> {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A chat message as broadcast and as stored in the `messages` collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dm_id: Option<String>,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Value>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditedMessage {
    pub id: String,
    pub content: String,
    pub updated_at: String,
}

// ─── Outbound events ────────────────────────────────────────

/// Every event the server sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "current-users")]
    CurrentUsers { users: Vec<ParticipantInfo> },

    #[serde(rename = "user-joined")]
    UserJoined {
        #[serde(rename = "userId")]
        user_id: String,
        username: String,
        participants: Vec<ParticipantInfo>,
    },

    #[serde(rename = "user-left")]
    UserLeft {
        #[serde(rename = "userId")]
        user_id: String,
        participants: Vec<ParticipantInfo>,
    },

    #[serde(rename = "participants")]
    Participants { participants: Vec<ParticipantInfo> },

    #[serde(rename = "new_message")]
    NewMessage { message: ChatMessage },

    #[serde(rename = "edit_message")]
    EditMessage { message: EditedMessage },

    #[serde(rename = "delete_message")]
    DeleteMessage { message_id: String },

    #[serde(rename = "typing")]
    Typing {
        user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dm_id: Option<String>,
    },

    #[serde(rename = "reaction")]
    Reaction {
        message_id: String,
        reactions: Vec<Reaction>,
    },

    #[serde(rename = "change")]
    Change {
        changes: Value,
        origin: Value,
        from: String,
    },

    #[serde(rename = "cursor")]
    Cursor {
        #[serde(rename = "userId")]
        user_id: String,
        username: String,
        cursor: Value,
    },

    #[serde(rename = "undo")]
    Undo { from: String },

    #[serde(rename = "redo")]
    Redo { from: String },

    #[serde(rename = "offer")]
    Offer {
        offer: Value,
        from: String,
        #[serde(rename = "fromName")]
        from_name: String,
    },

    #[serde(rename = "answer")]
    Answer { answer: Value, from: String },

    #[serde(rename = "ice-candidate")]
    IceCandidate { candidate: Value, from: String },

    #[serde(rename = "mute")]
    Mute {
        #[serde(rename = "userId")]
        user_id: String,
        muted: bool,
    },

    #[serde(rename = "video")]
    Video {
        #[serde(rename = "userId")]
        user_id: String,
        enabled: bool,
    },

    #[serde(rename = "error")]
    Error { code: ErrorCode, error: String },
}

impl ServerEvent {
    pub fn error(err: &EventError) -> Self {
        ServerEvent::Error {
            code: err.code(),
            error: err.to_string(),
        }
    }

    /// Wire name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::CurrentUsers { .. } => "current-users",
            ServerEvent::UserJoined { .. } => "user-joined",
            ServerEvent::UserLeft { .. } => "user-left",
            ServerEvent::Participants { .. } => "participants",
            ServerEvent::NewMessage { .. } => "new_message",
            ServerEvent::EditMessage { .. } => "edit_message",
            ServerEvent::DeleteMessage { .. } => "delete_message",
            ServerEvent::Typing { .. } => "typing",
            ServerEvent::Reaction { .. } => "reaction",
            ServerEvent::Change { .. } => "change",
            ServerEvent::Cursor { .. } => "cursor",
            ServerEvent::Undo { .. } => "undo",
            ServerEvent::Redo { .. } => "redo",
            ServerEvent::Offer { .. } => "offer",
            ServerEvent::Answer { .. } => "answer",
            ServerEvent::IceCandidate { .. } => "ice-candidate",
            ServerEvent::Mute { .. } => "mute",
            ServerEvent::Video { .. } => "video",
            ServerEvent::Error { .. } => "error",
        }
    }

    pub fn encode(&self) -> Result<Frame, serde_json::Error> {
        serde_json::to_string(self).map(|text| Frame(Utf8Bytes::from(text)))
    }
}

/// A pre-encoded text frame. Cloning shares the underlying buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Utf8Bytes);

impl Frame {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn decode(&self) -> Result<ServerEvent, serde_json::Error> {
        serde_json::from_str(self.as_str())
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_str(self.as_str())
    }

    pub fn into_message(self) -> Message {
        Message::Text(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chat(text: Value) -> Result<Command, EventError> {
        Command::parse(EventFamily::Chat, &text.to_string())
    }

    #[test]
    fn test_new_message_parses() {
        let cmd = chat(json!({
            "type": "new_message",
            "sender_id": "u1",
            "content": "hello",
            "channel_id": "c1",
            "attachments": [{"url": "a.png"}]
        }))
        .unwrap();

        assert_eq!(
            cmd,
            Command::Chat(ChatCommand::NewMessage {
                sender_id: "u1".into(),
                content: "hello".into(),
                target: ChatTarget {
                    channel_id: Some("c1".into()),
                    dm_id: None
                },
                attachments: vec![json!({"url": "a.png"})],
            })
        );
    }

    #[test]
    fn test_new_message_requires_fields() {
        let err = chat(json!({"type": "new_message", "content": "hi", "channel_id": "c1"})).unwrap_err();
        assert_eq!(err, EventError::MissingField("sender_id"));

        let err = chat(json!({"type": "new_message", "sender_id": "u1", "content": "", "dm_id": "d1"})).unwrap_err();
        assert_eq!(err, EventError::MissingField("content"));

        let err = chat(json!({"type": "new_message", "sender_id": "u1", "content": "hi"})).unwrap_err();
        assert_eq!(err, EventError::MissingField("channel_id or dm_id"));
        assert_eq!(err.code(), ErrorCode::Validation);
    }

    #[test]
    fn test_wrong_field_type_is_invalid() {
        let err = chat(json!({"type": "edit_message", "message_id": 7, "content": "x"})).unwrap_err();
        assert!(matches!(err, EventError::InvalidField { field: "message_id", .. }));
    }

    #[test]
    fn test_reaction_action_defaults_to_add() {
        let cmd = chat(json!({"type": "reaction", "message_id": "m1", "user_id": "u1", "emoji": "👍"})).unwrap();
        assert!(matches!(
            cmd,
            Command::Chat(ChatCommand::Reaction { action: ReactionAction::Add, .. })
        ));

        let err = chat(json!({"type": "reaction", "message_id": "m1", "user_id": "u1", "emoji": "👍", "action": "toggle"}))
            .unwrap_err();
        assert!(matches!(err, EventError::InvalidField { field: "action", .. }));
    }

    #[test]
    fn test_unknown_kind_per_family() {
        // `change` is an editor event, not a chat one.
        let err = chat(json!({"type": "change", "changes": [], "origin": "x"})).unwrap_err();
        assert_eq!(err, EventError::UnknownKind("change".into()));
        assert_eq!(err.code(), ErrorCode::UnknownKind);
    }

    #[test]
    fn test_malformed_frames() {
        assert!(matches!(Command::parse(EventFamily::Chat, "not json"), Err(EventError::Malformed(_))));
        assert!(matches!(Command::parse(EventFamily::Chat, "[1,2]"), Err(EventError::Malformed(_))));
        assert!(matches!(Command::parse(EventFamily::Chat, r#"{"type": 5}"#), Err(EventError::Malformed(_))));
    }

    #[test]
    fn test_editor_change() {
        let cmd = Command::parse(
            EventFamily::Editor,
            &json!({"type": "change", "changes": [{"from": 0, "insert": "a"}], "origin": "input", "content": "a"}).to_string(),
        )
        .unwrap();
        assert_eq!(
            cmd,
            Command::Editor(EditorCommand::Change {
                changes: json!([{"from": 0, "insert": "a"}]),
                origin: json!("input"),
                content: Some("a".into()),
            })
        );

        let err = Command::parse(EventFamily::Editor, r#"{"type":"change","origin":"input"}"#).unwrap_err();
        assert_eq!(err, EventError::MissingField("changes"));
    }

    #[test]
    fn test_empty_changes_are_missing() {
        for changes in [json!([]), json!(""), json!({}), json!(false), json!(0)] {
            let text = json!({"type": "change", "changes": changes, "origin": "input", "content": "a"}).to_string();
            let err = Command::parse(EventFamily::Editor, &text).unwrap_err();
            assert_eq!(err, EventError::MissingField("changes"), "changes = {changes}");
        }

        let text = json!({"type": "change", "changes": "delta", "origin": "input"}).to_string();
        assert!(Command::parse(EventFamily::Editor, &text).is_ok());
    }

    #[test]
    fn test_signal_commands() {
        let parse = |v: Value| Command::parse(EventFamily::Signaling, &v.to_string());

        assert_eq!(
            parse(json!({"type": "offer", "target": "Y", "offer": {"sdp": "v=0"}})).unwrap(),
            Command::Signal(SignalCommand::Offer {
                target: "Y".into(),
                offer: json!({"sdp": "v=0"})
            })
        );
        assert_eq!(
            parse(json!({"type": "ice-candidate", "candidate": {}})).unwrap_err(),
            EventError::MissingField("target")
        );
        assert_eq!(
            parse(json!({"type": "mute"})).unwrap_err(),
            EventError::MissingField("muted")
        );
        assert_eq!(
            parse(json!({"type": "get-participants"})).unwrap(),
            Command::Signal(SignalCommand::GetParticipants)
        );
    }

    #[test]
    fn test_reaction_set_is_idempotent() {
        let thumbs = Reaction {
            emoji: "👍".into(),
            user_id: "u1".into(),
        };
        let mut set = ReactionSet::new();
        assert!(set.apply(ReactionAction::Add, thumbs.clone()));
        assert!(!set.apply(ReactionAction::Add, thumbs.clone()));
        assert_eq!(set.len(), 1);

        assert!(set.apply(ReactionAction::Remove, thumbs.clone()));
        assert!(set.is_empty());
        assert!(!set.apply(ReactionAction::Remove, thumbs));
    }

    #[test]
    fn test_outbound_shapes() {
        let joined = ServerEvent::UserJoined {
            user_id: "B".into(),
            username: "Bea".into(),
            participants: vec![],
        };
        assert_eq!(
            joined.encode().unwrap().to_value().unwrap(),
            json!({"type": "user-joined", "userId": "B", "username": "Bea", "participants": []})
        );

        let offer = ServerEvent::Offer {
            offer: json!({"sdp": "v=0"}),
            from: "X".into(),
            from_name: "Xavier".into(),
        };
        assert_eq!(
            offer.encode().unwrap().to_value().unwrap(),
            json!({"type": "offer", "offer": {"sdp": "v=0"}, "from": "X", "fromName": "Xavier"})
        );

        let typing = ServerEvent::Typing {
            user_id: "u1".into(),
            channel_id: Some("c1".into()),
            dm_id: None,
        };
        assert_eq!(
            typing.encode().unwrap().to_value().unwrap(),
            json!({"type": "typing", "user_id": "u1", "channel_id": "c1"})
        );

        let err = ServerEvent::error(&EventError::message_not_found("m9"));
        assert_eq!(
            err.encode().unwrap().to_value().unwrap(),
            json!({"type": "error", "code": "not_found", "error": "message not found: m9"})
        );
    }

    #[test]
    fn test_frame_decodes_back() {
        let event = ServerEvent::Undo { from: "u1".into() };
        let frame = event.encode().unwrap();
        assert_eq!(frame.decode().unwrap(), event);
        assert_eq!(event.name(), "undo");
        assert!(matches!(frame.into_message(), Message::Text(_)));
    }
}
