//! Background retention sweeper (spec.md §4.A, §5). Grounded on the
//! teacher's `spawn_retention_task`: a `tokio::spawn`'d loop, an initial
//! startup delay, a fixed interval, and `eprintln!`/`println!` logging of
//! what was pruned. The teacher sweeps per-room `max_messages`/
//! `max_message_age_hours` settings; this sweeps the fixed TTL + per-room
//! cap policy via `HistoryStore::sweep`, and adds coalescing so an
//! overlapping manual trigger never runs concurrently with the scheduled
//! tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::history::HistoryStore;
use crate::hub::Hub;

/// Runs `HistoryStore::sweep` every `interval`, skipping a tick if the
/// previous sweep (scheduled or manually triggered) is still in flight.
pub fn spawn_retention_task(hub: Arc<Hub>, interval: Duration, sweeping: Arc<AtomicBool>) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        loop {
            run_coalesced(&hub.history, &sweeping);
            tokio::time::sleep(interval).await;
        }
    });
}

/// Run one sweep now unless another is already in flight. Shared by the
/// background loop and any manual trigger so the two never overlap.
pub fn run_coalesced(history: &HistoryStore, sweeping: &AtomicBool) {
    if sweeping.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
        return;
    }
    let now_ms = crate::now_ms();
    let result = history.sweep(now_ms);
    sweeping.store(false, Ordering::Release);

    if result.ttl_deleted > 0 || result.cap_deleted > 0 {
        println!(
            "🧹 retention sweep: {} expired, {} over per-room cap",
            result.ttl_deleted, result.cap_deleted
        );
    }
}
