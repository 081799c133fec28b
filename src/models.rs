use serde::{Deserialize, Serialize};

/// A persisted chat line. Assembled by the History Store on `append`;
/// `display_name` is snapshotted at send time and never rewritten by a
/// later rename (spec.md §3, Message invariants).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub room_id: String,
    pub user_id: String,
    pub display_name: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mentions: Option<Vec<String>>,
    pub ts: i64,
}

/// Live roster entry for a `presence` snapshot. Ordering by `id` is the
/// registry's job (`members()` returns an already-sorted sequence) so that
/// snapshots are diff-friendly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Member {
    pub id: String,
    pub display_name: String,
}

/// Back-pagination / forward-resume cursor attached to a `history` frame.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HistoryCursor {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before_ts: Option<i64>,
}
