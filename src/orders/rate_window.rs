// =============================================================================
// Cancel/Amend Rate Window — per-symbol sliding 5-minute counter
// =============================================================================
//
// The exchange tolerates a limited churn of cancels and amends. This tracker
// keeps a sliding window per symbol and flags symbols that exceed the
// configured threshold so the sweep can log a warning instead of hammering
// the venue.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::warn;

/// Window length for the churn counter.
const WINDOW: Duration = Duration::seconds(300);

#[derive(Debug, Default)]
pub struct RateWindow {
    events: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl RateWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one cancel or amend for `symbol` and return the in-window
    /// count (including this event).
    pub fn record(&self, symbol: &str, now: DateTime<Utc>) -> usize {
        let mut events = self.events.lock();
        let queue = events.entry(symbol.to_string()).or_default();
        queue.push_back(now);
        let cutoff = now - WINDOW;
        while queue.front().is_some_and(|t| *t < cutoff) {
            queue.pop_front();
        }
        queue.len()
    }

    /// Record and warn when the threshold is exceeded. Returns `true` when
    /// the warning fired.
    pub fn record_and_check(&self, symbol: &str, now: DateTime<Utc>, threshold: u32) -> bool {
        let count = self.record(symbol, now);
        if count > threshold as usize {
            warn!(
                symbol,
                count,
                threshold,
                "cancel/amend churn above threshold in 5-minute window"
            );
            return true;
        }
        false
    }

    pub fn count(&self, symbol: &str, now: DateTime<Utc>) -> usize {
        let mut events = self.events.lock();
        match events.get_mut(symbol) {
            Some(queue) => {
                let cutoff = now - WINDOW;
                while queue.front().is_some_and(|t| *t < cutoff) {
                    queue.pop_front();
                }
                queue.len()
            }
            None => 0,
        }
    }
}
