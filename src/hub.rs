//! The Hub (spec.md §4.E): per-frame dispatch wiring the History Store,
//! Admission Controller, and Presence Registry together. Grounded on the
//! teacher's `message_stream` route, which is the one place in the teacher
//! that already combines presence join/leave, event replay, and live
//! fan-out in a single flow — this module generalizes that flow to a
//! bidirectional protocol instead of one-way SSE.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::codec::{decode_inbound, ErrorCode, InboundFrame, OutboundFrame, ValidationError};
use crate::config::Config;
use crate::history::{HistoryStore, StorageUnavailable};
use crate::models::{HistoryCursor, Member, Message};
use crate::presence::{Presence, Sink, SinkMessage};
use crate::rate_limit::Admission;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_SUPERSEDED: u16 = 4001;
/// Reserved for an outbound queue that exceeds its backpressure high-water
/// mark (spec.md §5, §6). Not used for protocol-level rejections, which
/// surface as a `BAD_REQUEST` error frame with the connection preserved.
pub const CLOSE_POLICY: u16 = 4008;
pub const CLOSE_SERVER_ERROR: u16 = 4011;

/// Every connection auto-joins this room on authentication (spec.md §4.E).
pub const DEFAULT_ROOM_ID: &str = "default";

pub struct Hub {
    pub history: HistoryStore,
    pub admission: Admission,
    pub presence: Presence,
    pub config: Config,
}

/// What the connection's writer/driver loop should do after a frame has
/// been processed. `Close` carries the close code and reason to send.
pub enum FrameOutcome {
    Continue,
    Close(u16, &'static str),
}

impl Hub {
    pub fn new(config: Config) -> Result<Self, StorageUnavailable> {
        let history = HistoryStore::open(
            &config.database_path,
            config.history_retention_ttl.as_millis() as i64,
            config.history_retention_per_room_cap as i64,
        )?;
        let admission = Admission::new(config.rate_limit_capacity, config.rate_limit_refill_per_second);
        Ok(Self { history, admission, presence: Presence::new(), config })
    }

    /// Register a freshly-authenticated connection. If a prior connection
    /// for the same user was live, it is closed with `CLOSE_SUPERSEDED`
    /// (spec.md §3, "exactly one live connection per user_id"). Per spec.md
    /// §4.E's `Upgrading` → `Active` transition, the connection is then
    /// auto-joined to `DEFAULT_ROOM_ID`, sent `hello` and the initial
    /// `history(recent(100))`, and the room is told about the new member
    /// (excluding the joiner, who already has `hello`).
    pub fn connect(&self, user_id: &str, display_name: &str, tx: mpsc::Sender<SinkMessage>) -> Sink {
        let (sink, prior) = self.presence.attach(user_id, display_name, DEFAULT_ROOM_ID, tx);
        if let Some(prior) = prior {
            prior.send_close(CLOSE_SUPERSEDED, "superseded by a new connection");
        }
        self.presence.join(user_id, DEFAULT_ROOM_ID);

        let members = self.presence.members(DEFAULT_ROOM_ID);
        let hello = OutboundFrame::Hello {
            self_id: user_id.to_string(),
            room_id: DEFAULT_ROOM_ID.to_string(),
            members,
        };
        let _ = self.presence.send_to(user_id, hello.to_json());

        let (messages, next_cursor) = self.fetch_history(DEFAULT_ROOM_ID, None, None);
        let history_frame = OutboundFrame::History { room_id: DEFAULT_ROOM_ID.to_string(), messages, next_cursor };
        let _ = self.presence.send_to(user_id, history_frame.to_json());

        self.broadcast_presence(DEFAULT_ROOM_ID, Some(user_id));
        sink
    }

    /// Whether an upgrade from `origin` is admitted. An empty allow-list
    /// means the operator hasn't opted into origin checking (spec.md §9
    /// open questions are silent on a default; this crate treats "no list
    /// configured" as "don't restrict").
    pub fn is_origin_allowed(&self, origin: Option<&str>) -> bool {
        if self.config.origin_allow_list.is_empty() {
            return true;
        }
        origin.map(|o| self.config.origin_allowed(o)).unwrap_or(false)
    }

    pub fn disconnect(&self, user_id: &str, sink: &Sink) {
        let affected_rooms = self.presence.detach(user_id, sink);
        for room_id in affected_rooms {
            self.broadcast_presence(&room_id, None);
        }
    }

    /// Process one inbound text frame for `user_id`. `hub` must be the
    /// `Arc` wrapping this Hub so typing-expiry timers can outlive the call.
    pub fn handle_frame(hub: &Arc<Hub>, user_id: &str, raw: &str, now: Instant, now_ms: i64) -> FrameOutcome {
        let frame = match decode_inbound(raw) {
            Ok(frame) => frame,
            Err(_) => {
                hub.send_error(user_id, ErrorCode::BadRequest, "malformed frame");
                return FrameOutcome::Continue;
            }
        };

        if let Err(ValidationError(reason)) = frame.validate(hub.config.message_max_chars, hub.config.display_name_max_chars) {
            hub.send_error(user_id, ErrorCode::BadRequest, reason);
            return FrameOutcome::Continue;
        }

        match frame {
            InboundFrame::Join { room_id, since_ts, before_id } => hub.handle_join(user_id, &room_id, since_ts, before_id),
            InboundFrame::Message { room_id, text } => hub.handle_message(user_id, &room_id, &text, now, now_ms),
            InboundFrame::SetName { display_name } => hub.handle_set_name(user_id, &display_name),
            InboundFrame::TypingStart { room_id } => {
                hub.handle_typing_start(hub, user_id, &room_id);
                FrameOutcome::Continue
            }
            InboundFrame::TypingStop { room_id } => {
                hub.handle_typing_stop(user_id, &room_id);
                FrameOutcome::Continue
            }
        }
    }

    fn handle_join(&self, user_id: &str, room_id: &str, since_ts: Option<i64>, before_id: Option<String>) -> FrameOutcome {
        let changed_rooms = self.presence.join(user_id, room_id);
        let members = self.presence.members(room_id);

        let hello = OutboundFrame::Hello { self_id: user_id.to_string(), room_id: room_id.to_string(), members };
        if self.presence.send_to(user_id, hello.to_json()).is_err() {
            return FrameOutcome::Close(CLOSE_SERVER_ERROR, "could not deliver hello");
        }

        let (messages, next_cursor) = self.fetch_history(room_id, since_ts, before_id.as_deref());
        let history_frame = OutboundFrame::History { room_id: room_id.to_string(), messages, next_cursor };
        let _ = self.presence.send_to(user_id, history_frame.to_json());

        for room in changed_rooms {
            self.broadcast_presence(&room, None);
        }
        FrameOutcome::Continue
    }

    /// Fetch the page of history a `join` (or auto-join) should return,
    /// with the cursor spec.md §4.E defines per path: `before_id` carries a
    /// cursor only when the page was full; `since_ts` and `recent` both
    /// carry `before_ts = smallest returned ts`, omitted when empty.
    fn fetch_history(&self, room_id: &str, since_ts: Option<i64>, before_id: Option<&str>) -> (Vec<Message>, Option<HistoryCursor>) {
        let limit = self.config.initial_history_limit;
        if let Some(before_id) = before_id {
            let messages = self.history.before(room_id, before_id, limit);
            let next_cursor = if messages.len() == limit {
                messages.first().map(|m| HistoryCursor { before_id: Some(m.id.clone()), before_ts: None })
            } else {
                None
            };
            (messages, next_cursor)
        } else if let Some(since_ts) = since_ts {
            let messages = self.history.since(room_id, since_ts);
            let next_cursor = messages.first().map(|m| HistoryCursor { before_id: None, before_ts: Some(m.ts) });
            (messages, next_cursor)
        } else {
            let messages = self.history.recent(room_id, limit);
            let next_cursor = messages.first().map(|m| HistoryCursor { before_id: None, before_ts: Some(m.ts) });
            (messages, next_cursor)
        }
    }

    fn handle_message(&self, user_id: &str, room_id: &str, text: &str, now: Instant, now_ms: i64) -> FrameOutcome {
        if !self.admission.try_admit(user_id, now) {
            self.send_error(user_id, ErrorCode::RateLimit, "rate limit exceeded");
            return FrameOutcome::Continue;
        }

        let display_name = match self.presence.display_name(user_id) {
            Some(name) => name,
            None => {
                self.send_error(user_id, ErrorCode::BadRequest, "not joined to a room");
                return FrameOutcome::Continue;
            }
        };
        if self.presence.current_room(user_id).as_deref() != Some(room_id) {
            self.send_error(user_id, ErrorCode::BadRequest, "message sent to a room the connection has not joined");
            return FrameOutcome::Continue;
        }

        let trimmed = text.trim();
        let members = self.presence.members(room_id);
        let mentions = resolve_mentions(trimmed, &members);

        let message = match self.history.append(room_id, user_id, &display_name, trimmed, mentions, now_ms) {
            Ok(message) => message,
            Err(StorageUnavailable(_)) => {
                self.send_error(user_id, ErrorCode::ServerError, "could not store message");
                return FrameOutcome::Close(CLOSE_SERVER_ERROR, "storage unavailable");
            }
        };

        // Sender included: the client's own send is echoed back rather than
        // optimistically rendered, so the server is the single source of
        // truth for the assigned id, timestamp, and resolved mentions.
        self.presence.broadcast(room_id, OutboundFrame::Message(message).to_json(), None);
        FrameOutcome::Continue
    }

    fn handle_set_name(&self, user_id: &str, display_name: &str) -> FrameOutcome {
        match self.presence.set_name(user_id, display_name, self.config.display_name_max_chars) {
            Ok(rooms) => {
                for room in rooms {
                    self.broadcast_presence(&room, None);
                }
            }
            Err(reason) => self.send_error(user_id, ErrorCode::BadRequest, reason),
        }
        FrameOutcome::Continue
    }

    fn handle_typing_start(&self, hub: &Arc<Hub>, user_id: &str, room_id: &str) {
        let generation = self.presence.mark_typing(room_id, user_id);
        let display_name = self.presence.display_name(user_id).unwrap_or_else(|| user_id.to_string());
        let frame = OutboundFrame::UserTyping {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            display_name,
        };
        self.presence.broadcast(room_id, frame.to_json(), Some(user_id));

        let hub = Arc::clone(hub);
        let room_id = room_id.to_string();
        let user_id = user_id.to_string();
        let timeout = self.config.typing_idle_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if hub.presence.expire_typing_if_current(&room_id, &user_id, generation) {
                let frame = OutboundFrame::UserTypingStop { room_id: room_id.clone(), user_id: user_id.clone() };
                hub.presence.broadcast(&room_id, frame.to_json(), Some(&user_id));
            }
        });
    }

    fn handle_typing_stop(&self, user_id: &str, room_id: &str) {
        self.presence.clear_typing(room_id, user_id);
        let frame = OutboundFrame::UserTypingStop { room_id: room_id.to_string(), user_id: user_id.to_string() };
        self.presence.broadcast(room_id, frame.to_json(), Some(user_id));
    }

    fn broadcast_presence(&self, room_id: &str, except: Option<&str>) {
        let members = self.presence.members(room_id);
        let frame = OutboundFrame::Presence { room_id: room_id.to_string(), members };
        self.presence.broadcast(room_id, frame.to_json(), except);
    }

    fn send_error(&self, user_id: &str, code: ErrorCode, msg: impl Into<String>) {
        let _ = self.presence.send_to(user_id, OutboundFrame::error(code, msg).to_json());
    }
}

/// Scan `text` for `@token` mentions (`[A-Za-z0-9._-]{1,50}`) and resolve
/// each, case-insensitively, against the given room's current members.
/// Resolution is server-authoritative: a mention only counts if it matches
/// someone presently in the room. Order of first appearance is preserved,
/// duplicates collapsed (spec.md §4.E).
fn resolve_mentions(text: &str, members: &[Member]) -> Option<Vec<String>> {
    let chars: Vec<char> = text.chars().collect();
    let mut seen = HashSet::new();
    let mut resolved = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '@' {
            let start = i + 1;
            let mut end = start;
            while end < chars.len() && end - start < 50 && is_mention_char(chars[end]) {
                end += 1;
            }
            if end > start {
                let token: String = chars[start..end].iter().collect();
                if let Some(member) = members.iter().find(|m| m.display_name.eq_ignore_ascii_case(&token))
                    && seen.insert(member.id.clone())
                {
                    resolved.push(member.id.clone());
                }
                i = end;
                continue;
            }
        }
        i += 1;
    }
    if resolved.is_empty() { None } else { Some(resolved) }
}

fn is_mention_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: &str, name: &str) -> Member {
        Member { id: id.to_string(), display_name: name.to_string() }
    }

    #[test]
    fn resolves_mention_case_insensitively() {
        let members = vec![member("u1", "Alice")];
        let resolved = resolve_mentions("hey @alice how are you", &members).unwrap();
        assert_eq!(resolved, vec!["u1".to_string()]);
    }

    #[test]
    fn ignores_mention_of_non_member() {
        let members = vec![member("u1", "Alice")];
        assert!(resolve_mentions("hey @bob", &members).is_none());
    }

    #[test]
    fn dedups_repeated_mentions_preserving_first_order() {
        let members = vec![member("u1", "Alice"), member("u2", "Bob")];
        let resolved = resolve_mentions("@bob and @alice and @bob again", &members).unwrap();
        assert_eq!(resolved, vec!["u2".to_string(), "u1".to_string()]);
    }

    #[test]
    fn mention_token_stops_at_disallowed_characters() {
        let members = vec![member("u1", "Alice")];
        let resolved = resolve_mentions("@alice!", &members).unwrap();
        assert_eq!(resolved, vec!["u1".to_string()]);
    }

    #[test]
    fn bare_at_sign_is_not_a_mention() {
        let members = vec![member("u1", "Alice")];
        assert!(resolve_mentions("send it to @ everyone", &members).is_none());
    }
}
