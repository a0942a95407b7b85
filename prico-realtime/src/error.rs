//! Error taxonomy for inbound events.
//!
//! Validation and not-found errors are reported to the originating
//! connection only, as an `error` event carrying an [`ErrorCode`]. They never
//! close the connection. Persistence and transport failures have their own
//! types ([`crate::storage::StoreError`], [`crate::server::ServerError`]).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable code attached to `error` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Validation,
    UnknownKind,
    NotFound,
    Unavailable,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Validation => "validation",
            ErrorCode::UnknownKind => "unknown_kind",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Unavailable => "unavailable",
        }
    }
}

/// Failure to accept or apply a client event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    /// The frame is not a JSON object with a string `type`.
    #[error("malformed event: {0}")]
    Malformed(String),

    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("{field} is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Unknown event type: {0}")]
    UnknownKind(String),

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    /// The hub is draining and refuses new admissions.
    #[error("server is shutting down")]
    ShuttingDown,
}

impl EventError {
    pub fn code(&self) -> ErrorCode {
        match self {
            EventError::Malformed(_)
            | EventError::MissingField(_)
            | EventError::InvalidField { .. } => ErrorCode::Validation,
            EventError::UnknownKind(_) => ErrorCode::UnknownKind,
            EventError::NotFound { .. } => ErrorCode::NotFound,
            EventError::ShuttingDown => ErrorCode::Unavailable,
        }
    }

    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        EventError::InvalidField {
            field,
            reason: reason.into(),
        }
    }

    pub(crate) fn message_not_found(id: impl Into<String>) -> Self {
        EventError::NotFound {
            what: "message",
            id: id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_by_variant() {
        assert_eq!(EventError::MissingField("content").code(), ErrorCode::Validation);
        assert_eq!(EventError::invalid("action", "nope").code(), ErrorCode::Validation);
        assert_eq!(EventError::Malformed("x".into()).code(), ErrorCode::Validation);
        assert_eq!(EventError::UnknownKind("zap".into()).code(), ErrorCode::UnknownKind);
        assert_eq!(EventError::message_not_found("m1").code(), ErrorCode::NotFound);
        assert_eq!(EventError::ShuttingDown.code(), ErrorCode::Unavailable);
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(
            EventError::MissingField("channel_id or dm_id").to_string(),
            "channel_id or dm_id is required"
        );
        assert_eq!(
            EventError::UnknownKind("zap".into()).to_string(),
            "Unknown event type: zap"
        );
        assert_eq!(
            EventError::message_not_found("m1").to_string(),
            "message not found: m1"
        );
    }

    #[test]
    fn test_code_wire_names() {
        let json = serde_json::to_string(&ErrorCode::UnknownKind).unwrap();
        assert_eq!(json, "\"unknown_kind\"");
        assert_eq!(ErrorCode::NotFound.as_str(), "not_found");
    }
}
