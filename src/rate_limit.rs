//! Admission Controller (spec.md §4.B): a per-user token bucket, continuous
//! refill. Grounded on the teacher's `rate_limit.rs` storage shape
//! (`Mutex<HashMap<String, _>>` keyed by user) but the per-key state and
//! refill algorithm are replaced — the teacher counts a sliding window of
//! `Instant`s, this keeps `(tokens, last_refill)` and refills fractionally.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct Admission {
    capacity: f64,
    refill_per_second: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl Admission {
    pub fn new(capacity: f64, refill_per_second: f64) -> Self {
        Self {
            capacity,
            refill_per_second,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Lazily refill, then admit if at least one token is available.
    /// Buckets persist across reconnects — keyed by `user_id`, not by
    /// connection — so a reconnecting user cannot bypass the limiter.
    pub fn try_admit(&self, user_id: &str, now: Instant) -> bool {
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets.entry(user_id.to_string()).or_insert_with(|| Bucket {
            tokens: self.capacity,
            last_refill: now,
        });

        if now < bucket.last_refill {
            // Clock stepped backward: leave tokens untouched, just resync the clock.
            bucket.last_refill = now;
        } else {
            let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
            bucket.tokens = (bucket.tokens + elapsed * self.refill_per_second).min(self.capacity);
            bucket.last_refill = now;
        }

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn burst_up_to_capacity_then_denies() {
        let admission = Admission::new(10.0, 3.0);
        let now = Instant::now();
        for _ in 0..10 {
            assert!(admission.try_admit("alice", now));
        }
        assert!(!admission.try_admit("alice", now));
    }

    #[test]
    fn refills_over_time() {
        let admission = Admission::new(10.0, 3.0);
        let now = Instant::now();
        for _ in 0..10 {
            admission.try_admit("alice", now);
        }
        assert!(!admission.try_admit("alice", now));
        let later = now + Duration::from_millis(400); // 1.2 tokens
        assert!(admission.try_admit("alice", later));
        assert!(!admission.try_admit("alice", later));
    }

    #[test]
    fn buckets_are_independent_per_user() {
        let admission = Admission::new(10.0, 3.0);
        let now = Instant::now();
        for _ in 0..10 {
            assert!(admission.try_admit("alice", now));
        }
        assert!(admission.try_admit("bob", now));
    }

    #[test]
    fn backward_clock_adjustment_leaves_tokens_unchanged() {
        let admission = Admission::new(10.0, 3.0);
        let now = Instant::now() + Duration::from_secs(10);
        for _ in 0..9 {
            assert!(admission.try_admit("alice", now)); // drain to 1 token left
        }
        let earlier = now - Duration::from_secs(5);
        assert!(admission.try_admit("alice", earlier)); // consumes the last token, no bonus refill
        assert!(!admission.try_admit("alice", earlier));
    }

    #[test]
    fn never_exceeds_capacity_after_long_idle() {
        let admission = Admission::new(10.0, 3.0);
        let now = Instant::now();
        admission.try_admit("alice", now);
        let much_later = now + Duration::from_secs(3600);
        for _ in 0..10 {
            assert!(admission.try_admit("alice", much_later));
        }
        assert!(!admission.try_admit("alice", much_later));
    }
}
