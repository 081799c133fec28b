//! Presence Registry (spec.md §4.C): live roster, room membership, and
//! typing soft-state. Grounded on the teacher's `routes/mod.rs`
//! `PresenceTracker` (`Arc<RwLock<HashMap<...>>>`, join/leave reporting
//! whether the membership actually changed) and its `PresenceGuard`
//! RAII-on-drop idiom, generalized to also own each connection's outbound
//! sink so the registry can fan out frames directly.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use tokio::sync::mpsc;

use crate::models::Member;

/// One outbound frame, or a close instruction, destined for a connection's
/// writer task. A bounded channel gives the connection its backpressure
/// high-water mark (spec.md §5): once it fills, `try_send` fails and the
/// registry reports the sink as unhealthy.
#[derive(Debug, Clone)]
pub enum SinkMessage {
    Frame(String),
    Close(u16, &'static str),
}

pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct Sink {
    tx: mpsc::Sender<SinkMessage>,
    /// Bumped on every `attach` for a user; lets `detach` ignore a stale
    /// connection racing against a newer one that already superseded it.
    generation: u64,
}

impl Sink {
    pub fn new(tx: mpsc::Sender<SinkMessage>, generation: u64) -> Self {
        Self { tx, generation }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn send_frame(&self, frame: String) -> Result<(), ()> {
        self.tx.try_send(SinkMessage::Frame(frame)).map_err(|_| ())
    }

    pub fn send_close(&self, code: u16, reason: &'static str) {
        let _ = self.tx.try_send(SinkMessage::Close(code, reason));
    }
}

struct ConnectionRecord {
    display_name: String,
    room_id: String,
    sink: Sink,
}

struct TypingMark {
    generation: u64,
}

#[derive(Default)]
struct State {
    connections: HashMap<String, ConnectionRecord>,
    rooms: HashMap<String, HashSet<String>>,
    typing: HashMap<(String, String), TypingMark>,
    next_generation: u64,
}

pub struct Presence {
    state: RwLock<State>,
}

impl Default for Presence {
    fn default() -> Self {
        Self::new()
    }
}

impl Presence {
    pub fn new() -> Self {
        Self { state: RwLock::new(State::default()) }
    }

    /// Register (or replace) the connection for `user_id`. Returns the
    /// prior sink, if any, so the caller can close it with a `Superseded`
    /// policy frame — exactly one connection per user is enforced here.
    pub fn attach(&self, user_id: &str, display_name: &str, room_id: &str, tx: mpsc::Sender<SinkMessage>) -> (Sink, Option<Sink>) {
        let mut state = self.state.write().unwrap();
        state.next_generation += 1;
        let generation = state.next_generation;
        let sink = Sink::new(tx, generation);

        let prior = state.connections.insert(
            user_id.to_string(),
            ConnectionRecord {
                display_name: display_name.to_string(),
                room_id: room_id.to_string(),
                sink: sink.clone(),
            },
        );

        (sink, prior.map(|r| r.sink))
    }

    /// Remove the mapping only if `sink` is still the current one — guards
    /// against a supersession race where the old connection's teardown
    /// races the new connection's attach.
    pub fn detach(&self, user_id: &str, sink: &Sink) -> Vec<String> {
        let mut state = self.state.write().unwrap();
        let still_current = state
            .connections
            .get(user_id)
            .map(|r| r.sink.generation() == sink.generation())
            .unwrap_or(false);
        if !still_current {
            return vec![];
        }
        let record = state.connections.remove(user_id);
        state.typing.retain(|(_, uid), _| uid != user_id);

        let mut affected_rooms = Vec::new();
        if let Some(record) = record {
            if let Some(members) = state.rooms.get_mut(&record.room_id) {
                members.remove(user_id);
                if members.is_empty() {
                    state.rooms.remove(&record.room_id);
                }
            }
            affected_rooms.push(record.room_id);
        }
        affected_rooms
    }

    /// Add membership in `room_id`, moving the user out of whatever room
    /// they were previously in (a connection belongs to exactly one room
    /// at a time per spec.md §3's Connection model). Returns the rooms
    /// whose membership changed and therefore need a presence rebroadcast.
    pub fn join(&self, user_id: &str, room_id: &str) -> Vec<String> {
        let mut state = self.state.write().unwrap();
        let previous_room = state.connections.get(user_id).map(|r| r.room_id.clone());

        let mut changed = Vec::new();
        if let Some(prev) = &previous_room
            && prev != room_id
            && let Some(members) = state.rooms.get_mut(prev)
        {
            members.remove(user_id);
            if members.is_empty() {
                state.rooms.remove(prev);
            }
            changed.push(prev.clone());
        }

        let room = state.rooms.entry(room_id.to_string()).or_default();
        let is_new = room.insert(user_id.to_string());

        if let Some(record) = state.connections.get_mut(user_id) {
            record.room_id = room_id.to_string();
        }

        if is_new || previous_room.as_deref() != Some(room_id) {
            changed.push(room_id.to_string());
        }
        changed
    }

    /// Validate and apply a display-name change. Returns the rooms the
    /// user currently belongs to, for presence rebroadcast.
    pub fn set_name(&self, user_id: &str, new_name: &str, max_chars: usize) -> Result<Vec<String>, &'static str> {
        let trimmed = new_name.trim();
        if trimmed.is_empty() || trimmed.chars().count() > max_chars {
            return Err("display_name must be 1..max_chars after trim");
        }
        let mut state = self.state.write().unwrap();
        let room_id = match state.connections.get_mut(user_id) {
            Some(record) => {
                record.display_name = trimmed.to_string();
                record.room_id.clone()
            }
            None => return Ok(vec![]),
        };
        Ok(vec![room_id])
    }

    pub fn mark_typing(&self, room_id: &str, user_id: &str) -> u64 {
        let mut state = self.state.write().unwrap();
        state.next_generation += 1;
        let generation = state.next_generation;
        state
            .typing
            .insert((room_id.to_string(), user_id.to_string()), TypingMark { generation });
        generation
    }

    pub fn clear_typing(&self, room_id: &str, user_id: &str) {
        let mut state = self.state.write().unwrap();
        state.typing.remove(&(room_id.to_string(), user_id.to_string()));
    }

    /// Remove the mark only if `generation` still matches — lets a delayed
    /// 3s timeout task no-op when the mark was already refreshed or cleared.
    pub fn expire_typing_if_current(&self, room_id: &str, user_id: &str, generation: u64) -> bool {
        let mut state = self.state.write().unwrap();
        let key = (room_id.to_string(), user_id.to_string());
        let matches = state.typing.get(&key).map(|m| m.generation == generation).unwrap_or(false);
        if matches {
            state.typing.remove(&key);
        }
        matches
    }

    /// Ordered-by-id member snapshot, diff-friendly across broadcasts.
    pub fn members(&self, room_id: &str) -> Vec<Member> {
        let state = self.state.read().unwrap();
        let mut members: Vec<Member> = state
            .rooms
            .get(room_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| {
                        state.connections.get(id).map(|r| Member {
                            id: id.clone(),
                            display_name: r.display_name.clone(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        members.sort_by(|a, b| a.id.cmp(&b.id));
        members
    }

    pub fn display_name(&self, user_id: &str) -> Option<String> {
        self.state.read().unwrap().connections.get(user_id).map(|r| r.display_name.clone())
    }

    pub fn current_room(&self, user_id: &str) -> Option<String> {
        self.state.read().unwrap().connections.get(user_id).map(|r| r.room_id.clone())
    }

    /// Deliver `frame` to every member of `room_id` except `except`, if
    /// given. Delivery failures don't block other recipients; the caller
    /// gets back the user ids whose sinks were unhealthy so it can tear
    /// those connections down. The registry lock is held only long enough
    /// to snapshot sinks — sends happen after it's released.
    pub fn broadcast(&self, room_id: &str, frame: String, except: Option<&str>) -> Vec<String> {
        let sinks: Vec<(String, Sink)> = {
            let state = self.state.read().unwrap();
            state
                .rooms
                .get(room_id)
                .map(|ids| {
                    ids.iter()
                        .filter(|id| Some(id.as_str()) != except)
                        .filter_map(|id| state.connections.get(id).map(|r| (id.clone(), r.sink.clone())))
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut unhealthy = Vec::new();
        for (user_id, sink) in sinks {
            if sink.send_frame(frame.clone()).is_err() {
                unhealthy.push(user_id);
            }
        }
        unhealthy
    }

    /// Deliver `frame` to a single user's sink, independent of room
    /// membership (used for sender-only frames like `error`/`hello`).
    pub fn send_to(&self, user_id: &str, frame: String) -> Result<(), ()> {
        let sink = {
            let state = self.state.read().unwrap();
            state.connections.get(user_id).map(|r| r.sink.clone())
        };
        match sink {
            Some(sink) => sink.send_frame(frame),
            None => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink() -> (Sink, mpsc::Receiver<SinkMessage>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        (Sink::new(tx, 0), rx)
    }

    #[test]
    fn attach_then_join_populates_members() {
        let presence = Presence::new();
        let (tx, _rx) = mpsc::channel(8);
        presence.attach("u1", "Alice", "default", tx);
        presence.join("u1", "default");
        let members = presence.members("default");
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].display_name, "Alice");
    }

    #[test]
    fn second_attach_supersedes_first() {
        let presence = Presence::new();
        let (tx1, _rx1) = mpsc::channel(8);
        let (tx2, _rx2) = mpsc::channel(8);
        let (_sink1, prior1) = presence.attach("u1", "Alice", "default", tx1);
        assert!(prior1.is_none());
        let (sink2, prior2) = presence.attach("u1", "Alice", "default", tx2);
        assert!(prior2.is_some());
        assert_ne!(prior2.unwrap().generation(), sink2.generation());
    }

    #[test]
    fn detach_ignores_stale_generation() {
        let presence = Presence::new();
        let (tx1, _rx1) = mpsc::channel(8);
        let (tx2, _rx2) = mpsc::channel(8);
        let (sink1, _) = presence.attach("u1", "Alice", "default", tx1);
        presence.join("u1", "default");
        let (_sink2, _) = presence.attach("u1", "Alice", "default", tx2);
        presence.join("u1", "default");

        // Stale detach (from the superseded connection's teardown) must not
        // remove the new connection's membership.
        let affected = presence.detach("u1", &sink1);
        assert!(affected.is_empty());
        assert_eq!(presence.members("default").len(), 1);
    }

    #[test]
    fn detach_removes_membership_and_reports_room() {
        let presence = Presence::new();
        let (tx, _rx) = mpsc::channel(8);
        let (sink, _) = presence.attach("u1", "Alice", "default", tx);
        presence.join("u1", "default");
        let affected = presence.detach("u1", &sink);
        assert_eq!(affected, vec!["default".to_string()]);
        assert!(presence.members("default").is_empty());
    }

    #[test]
    fn members_are_sorted_by_id() {
        let presence = Presence::new();
        let (tx_b, _rb) = mpsc::channel(8);
        let (tx_a, _ra) = mpsc::channel(8);
        presence.attach("bob", "Bob", "default", tx_b);
        presence.join("bob", "default");
        presence.attach("alice", "Alice", "default", tx_a);
        presence.join("alice", "default");
        let members = presence.members("default");
        assert_eq!(members[0].id, "alice");
        assert_eq!(members[1].id, "bob");
    }

    #[test]
    fn broadcast_skips_excepted_sender_and_reports_unhealthy() {
        let presence = Presence::new();
        let (alice_sink, alice_rx) = sink();
        let (bob_sink, bob_rx) = sink();
        {
            let mut state = presence.state.write().unwrap();
            state.connections.insert(
                "alice".into(),
                ConnectionRecord { display_name: "Alice".into(), room_id: "default".into(), sink: alice_sink },
            );
            state.connections.insert(
                "bob".into(),
                ConnectionRecord { display_name: "Bob".into(), room_id: "default".into(), sink: bob_sink },
            );
            state.rooms.entry("default".into()).or_default().insert("alice".into());
            state.rooms.entry("default".into()).or_default().insert("bob".into());
        }
        drop(bob_rx); // bob's sink is now unhealthy (channel closed)

        let unhealthy = presence.broadcast("default", "frame".into(), Some("alice"));
        assert_eq!(unhealthy, vec!["bob".to_string()]);
        drop(alice_rx);
    }

    #[test]
    fn typing_expiry_noops_when_mark_was_refreshed() {
        let presence = Presence::new();
        let g1 = presence.mark_typing("default", "alice");
        let g2 = presence.mark_typing("default", "alice"); // refresh
        assert!(!presence.expire_typing_if_current("default", "alice", g1));
        assert!(presence.expire_typing_if_current("default", "alice", g2));
    }
}
