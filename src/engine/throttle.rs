//! Per-object apply throttle.
//!
//! A token bucket per object key guards apply attempts so the engine can
//! never thrash against a human or a peer controller. Buckets refill fully
//! when their window rolls over. Repeated denials inside one window are the
//! edit-war signal the patcher uses to pause an object.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::{EDIT_WAR_THRESHOLD, THROTTLE_CAPACITY, THROTTLE_WINDOW};

/// Buckets whose window expired this many windows ago are pruned.
const STALE_WINDOWS: u32 = 2;

/// Map size above which stale buckets are pruned opportunistically.
const GC_THRESHOLD: usize = 256;

#[derive(Debug)]
struct Bucket {
    remaining: u32,
    window_start: Instant,
    denials: u32,
}

/// Outcome of a throttle check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    /// The apply may proceed.
    Allowed,
    /// The bucket is exhausted for this window.
    Denied {
        /// Time until the window rolls and the bucket refills.
        retry_after: Duration,
        /// True once denials in this window reached the edit-war threshold.
        edit_war: bool,
    },
}

/// Token-bucket throttle keyed by `group/kind/namespace/name`.
///
/// Buckets are created lazily on first check and garbage collected
/// opportunistically once the map grows past a threshold.
pub struct Throttle {
    capacity: u32,
    window: Duration,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new(THROTTLE_CAPACITY, THROTTLE_WINDOW)
    }
}

impl Throttle {
    /// Create a throttle with the given bucket capacity and window.
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self {
            capacity,
            window,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Check whether an apply for `key` is currently allowed.
    pub fn check(&self, key: &str) -> ThrottleDecision {
        self.check_at(key, Instant::now())
    }

    /// Check at an explicit point in time. Exposed for deterministic tests.
    pub fn check_at(&self, key: &str, now: Instant) -> ThrottleDecision {
        let mut buckets = self.buckets.lock().expect("throttle lock poisoned");

        if buckets.len() > GC_THRESHOLD {
            let stale = self.window * STALE_WINDOWS;
            buckets.retain(|_, b| now.duration_since(b.window_start) < stale);
        }

        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            remaining: self.capacity,
            window_start: now,
            denials: 0,
        });

        if now.duration_since(bucket.window_start) >= self.window {
            bucket.remaining = self.capacity;
            bucket.window_start = now;
            bucket.denials = 0;
        }

        if bucket.remaining > 0 {
            bucket.remaining -= 1;
            ThrottleDecision::Allowed
        } else {
            bucket.denials += 1;
            let retry_after = (bucket.window_start + self.window).saturating_duration_since(now);
            ThrottleDecision::Denied {
                retry_after,
                edit_war: bucket.denials >= EDIT_WAR_THRESHOLD,
            }
        }
    }
}
