//! Validating JSON codec for the wire event vocabulary (spec.md §4.D).
//!
//! Inbound frames are decoded via serde's internally-tagged enum support —
//! an unknown `type` fails deserialization automatically, surfaced to the
//! Hub as `BAD_REQUEST`. Unknown fields are ignored (no
//! `deny_unknown_fields`) for forward compatibility. Field-level constraints
//! (string lengths, mutually-exclusive cursor fields) are re-checked by
//! `InboundFrame::validate`, since serde alone can't express them.

use serde::{Deserialize, Serialize};

use crate::models::{HistoryCursor, Member, Message};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    Join {
        room_id: String,
        #[serde(default)]
        since_ts: Option<i64>,
        #[serde(default)]
        before_id: Option<String>,
    },
    Message {
        room_id: String,
        text: String,
    },
    SetName {
        display_name: String,
    },
    TypingStart {
        room_id: String,
    },
    TypingStop {
        room_id: String,
    },
}

#[derive(Debug)]
pub struct ValidationError(pub &'static str);

impl InboundFrame {
    /// Re-check the constraints serde's shape-only decode can't express.
    /// Returns the trimmed, validated field values a caller needs, or a
    /// static reason string for the `BAD_REQUEST` frame.
    pub fn validate(&self, message_max_chars: usize, display_name_max_chars: usize) -> Result<(), ValidationError> {
        match self {
            InboundFrame::Join { room_id, since_ts, before_id } => {
                if room_id.trim().is_empty() {
                    return Err(ValidationError("room_id must not be empty"));
                }
                if since_ts.is_some() && before_id.is_some() {
                    return Err(ValidationError("at most one of since_ts/before_id may be set"));
                }
                if let Some(ts) = since_ts
                    && *ts < 0
                {
                    return Err(ValidationError("since_ts must be >= 0"));
                }
                Ok(())
            }
            InboundFrame::Message { room_id, text } => {
                if room_id.trim().is_empty() {
                    return Err(ValidationError("room_id must not be empty"));
                }
                let trimmed = text.trim();
                if trimmed.is_empty() || trimmed.chars().count() > message_max_chars {
                    return Err(ValidationError("text must be 1..max_chars after trim"));
                }
                Ok(())
            }
            InboundFrame::SetName { display_name } => {
                let trimmed = display_name.trim();
                if trimmed.is_empty() || trimmed.chars().count() > display_name_max_chars {
                    return Err(ValidationError("display_name must be 1..max_chars after trim"));
                }
                Ok(())
            }
            InboundFrame::TypingStart { room_id } | InboundFrame::TypingStop { room_id } => {
                if room_id.trim().is_empty() {
                    return Err(ValidationError("room_id must not be empty"));
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unauth,
    RateLimit,
    BadRequest,
    ServerError,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Hello {
        self_id: String,
        room_id: String,
        members: Vec<Member>,
    },
    Presence {
        room_id: String,
        members: Vec<Member>,
    },
    Message(Message),
    History {
        room_id: String,
        messages: Vec<Message>,
        #[serde(skip_serializing_if = "Option::is_none")]
        next_cursor: Option<HistoryCursor>,
    },
    UserTyping {
        room_id: String,
        user_id: String,
        display_name: String,
    },
    UserTypingStop {
        room_id: String,
        user_id: String,
    },
    Error {
        code: ErrorCode,
        msg: String,
    },
}

impl OutboundFrame {
    pub fn error(code: ErrorCode, msg: impl Into<String>) -> Self {
        OutboundFrame::Error { code, msg: msg.into() }
    }

    /// Serialize to the wire representation. Infallible for well-formed
    /// outbound values (no non-finite floats, no non-UTF8 bytes reach here).
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("OutboundFrame always serializes")
    }
}

#[derive(Debug)]
pub enum DecodeError {
    Malformed(String),
}

/// Decode one inbound text frame. Malformed JSON or an unrecognized `type`
/// both surface here as a single `DecodeError` — the Hub maps either to
/// `BAD_REQUEST` without distinguishing them further.
pub fn decode_inbound(raw: &str) -> Result<InboundFrame, DecodeError> {
    serde_json::from_str(raw).map_err(|e| DecodeError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_join_with_since_ts() {
        let frame = decode_inbound(r#"{"type":"join","room_id":"default","since_ts":42}"#).unwrap();
        match frame {
            InboundFrame::Join { room_id, since_ts, before_id } => {
                assert_eq!(room_id, "default");
                assert_eq!(since_ts, Some(42));
                assert_eq!(before_id, None);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn rejects_unknown_type() {
        assert!(decode_inbound(r#"{"type":"nonsense"}"#).is_err());
    }

    #[test]
    fn ignores_unknown_fields() {
        let frame = decode_inbound(r#"{"type":"typing_start","room_id":"x","extra":true}"#).unwrap();
        assert!(matches!(frame, InboundFrame::TypingStart { .. }));
    }

    #[test]
    fn rejects_mutually_exclusive_cursor_fields() {
        let frame = InboundFrame::Join {
            room_id: "default".into(),
            since_ts: Some(1),
            before_id: Some("x".into()),
        };
        assert!(frame.validate(2000, 50).is_err());
    }

    #[test]
    fn rejects_empty_message_text_after_trim() {
        let frame = InboundFrame::Message { room_id: "default".into(), text: "   ".into() };
        assert!(frame.validate(2000, 50).is_err());
    }

    #[test]
    fn rejects_blank_room_id_on_join_and_message() {
        let join = InboundFrame::Join { room_id: "   ".into(), since_ts: None, before_id: None };
        assert!(join.validate(2000, 50).is_err());
        let message = InboundFrame::Message { room_id: "".into(), text: "hi".into() };
        assert!(message.validate(2000, 50).is_err());
    }

    #[test]
    fn message_serializes_without_mentions_field_when_absent() {
        let msg = Message {
            id: "01ARZ3NDEKTSV4RRFFQ69G5FAV".into(),
            room_id: "default".into(),
            user_id: "u1".into(),
            display_name: "Alice".into(),
            text: "hi".into(),
            mentions: None,
            ts: 1000,
        };
        let json = OutboundFrame::Message(msg).to_json();
        assert!(!json.contains("mentions"));
    }
}
