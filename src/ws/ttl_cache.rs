// =============================================================================
// TTL Cache — bounded deduplication of private WS event ids
// =============================================================================
//
// The private stream can replay position events after reconnects. Every
// event id is remembered for the TTL (default 5 min) with a hard capacity
// cap; the oldest entries fall out first.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

struct Inner {
    expiry: HashMap<String, DateTime<Utc>>,
    order: VecDeque<String>,
}

pub struct TtlCache {
    inner: Mutex<Inner>,
    ttl: Duration,
    capacity: usize,
}

impl TtlCache {
    pub fn new(ttl_secs: u64, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                expiry: HashMap::new(),
                order: VecDeque::new(),
            }),
            ttl: Duration::seconds(ttl_secs as i64),
            capacity,
        }
    }

    /// Record `id` at `now`. Returns `false` when the id is already present
    /// and unexpired — i.e. the event is a duplicate.
    pub fn insert(&self, id: &str, now: DateTime<Utc>) -> bool {
        let mut guard = self.inner.lock();
        let Inner { expiry, order } = &mut *guard;

        // Evict expired entries from the front.
        while let Some(front) = order.front() {
            let expired = expiry.get(front).map_or(true, |exp| *exp <= now);
            if !expired {
                break;
            }
            if let Some(key) = order.pop_front() {
                expiry.remove(&key);
            }
        }

        if let Some(exp) = expiry.get(id) {
            if *exp > now {
                return false;
            }
        }

        // Capacity cap: drop the oldest.
        while order.len() >= self.capacity {
            if let Some(oldest) = order.pop_front() {
                expiry.remove(&oldest);
            }
        }

        expiry.insert(id.to_string(), now + self.ttl);
        order.push_back(id.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expiry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
