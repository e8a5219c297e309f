// =============================================================================
// SLO Counters & rate-limited alerts
// =============================================================================
//
// Operational counters mirrored into the archived-log replay tooling. Names
// are part of the log contract; do not rename without versioning the event
// schema. Alerts piggyback on `tracing::warn!` with a per-metric cooldown so
// a flapping condition cannot flood the log.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

/// Minimum spacing between alerts for the same metric.
const ALERT_COOLDOWN: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
pub struct SloCounters {
    pub ws_stale_signal_fallback: AtomicU64,
    pub ws_stale_watchdog: AtomicU64,
    pub close_pipeline_errors: AtomicU64,
    pub pnl_mismatch: AtomicU64,
    pub ws_parse_errors: AtomicU64,
    pub same_side_reentry_count: AtomicU64,
    last_alert: Mutex<HashMap<&'static str, Instant>>,
}

/// Serializable view of all counters.
#[derive(Debug, Clone, Serialize)]
pub struct SloSnapshot {
    pub ws_stale_signal_fallback: u64,
    pub ws_stale_watchdog: u64,
    pub close_pipeline_errors: u64,
    pub pnl_mismatch: u64,
    pub ws_parse_errors: u64,
    pub same_side_reentry_count: u64,
}

impl SloCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SloSnapshot {
        SloSnapshot {
            ws_stale_signal_fallback: self.ws_stale_signal_fallback.load(Ordering::Relaxed),
            ws_stale_watchdog: self.ws_stale_watchdog.load(Ordering::Relaxed),
            close_pipeline_errors: self.close_pipeline_errors.load(Ordering::Relaxed),
            pnl_mismatch: self.pnl_mismatch.load(Ordering::Relaxed),
            ws_parse_errors: self.ws_parse_errors.load(Ordering::Relaxed),
            same_side_reentry_count: self.same_side_reentry_count.load(Ordering::Relaxed),
        }
    }

    /// Increment a counter and emit a rate-limited warning. Returns `true`
    /// when the alert actually fired (cooldown expired).
    pub fn alert(&self, counter: &AtomicU64, metric: &'static str, detail: &str) -> bool {
        counter.fetch_add(1, Ordering::Relaxed);

        let mut last = self.last_alert.lock();
        let now = Instant::now();
        let due = last
            .get(metric)
            .map(|t| now.duration_since(*t) >= ALERT_COOLDOWN)
            .unwrap_or(true);
        if due {
            last.insert(metric, now);
            warn!(metric, detail, "SLO alert");
        }
        due
    }
}
