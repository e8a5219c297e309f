use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::Timeframe;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A single OHLCV candle. Timestamps are unix seconds (candle open time).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Structural sanity: `low <= open, close <= high`, all prices positive.
    pub fn is_well_formed(&self) -> bool {
        self.timestamp > 0
            && self.low > 0.0
            && self.low <= self.high
            && self.low <= self.open
            && self.open <= self.high
            && self.low <= self.close
            && self.close <= self.high
            && self.volume >= 0.0
            && [self.open, self.high, self.low, self.close, self.volume]
                .iter()
                .all(|v| v.is_finite())
    }
}

/// Composite key identifying a unique candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl CandleKey {
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
        }
    }
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.timeframe)
    }
}

// ---------------------------------------------------------------------------
// CandleBuffer -- bounded ring buffer per (symbol, timeframe)
// ---------------------------------------------------------------------------

/// Thread-safe ring buffer of the most recent candles per key.
///
/// Appends deduplicate by timestamp: a candle whose timestamp equals the last
/// stored one replaces it in place (in-progress update), a newer timestamp is
/// appended and the ring is trimmed to the timeframe's budget, and an older
/// timestamp is dropped so the series stays monotone.
pub struct CandleBuffer {
    buffers: RwLock<HashMap<CandleKey, VecDeque<Candle>>>,
    /// Count of updates rejected for being out of order or malformed.
    dropped: std::sync::atomic::AtomicU64,
}

impl CandleBuffer {
    pub fn new() -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            dropped: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Insert or replace the latest candle for the key.
    pub fn append(&self, key: CandleKey, candle: Candle) {
        if !candle.is_well_formed() {
            self.dropped
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            warn!(key = %key, ts = candle.timestamp, "malformed candle dropped");
            return;
        }

        let max = key.timeframe.max_candles();
        let mut map = self.buffers.write();
        let ring = map
            .entry(key)
            .or_insert_with(|| VecDeque::with_capacity(max + 1));

        match ring.back() {
            Some(last) if last.timestamp == candle.timestamp => {
                // In-progress update of the current candle.
                ring.pop_back();
                ring.push_back(candle);
            }
            Some(last) if last.timestamp > candle.timestamp => {
                // Late or duplicate-older delivery. Replace in place if the
                // timestamp exists, otherwise drop to keep monotonicity.
                if let Some(slot) = ring.iter_mut().find(|c| c.timestamp == candle.timestamp) {
                    *slot = candle;
                } else {
                    self.dropped
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    debug!(ts = candle.timestamp, "out-of-order candle dropped");
                }
            }
            _ => {
                ring.push_back(candle);
                while ring.len() > max {
                    ring.pop_front();
                }
            }
        }
    }

    /// Replace the buffer for `key` atomically with `candles`, sorted
    /// ascending by timestamp and trimmed to the timeframe budget.
    pub fn initialize(&self, key: CandleKey, mut candles: Vec<Candle>) {
        candles.retain(Candle::is_well_formed);
        candles.sort_by_key(|c| c.timestamp);
        candles.dedup_by_key(|c| c.timestamp);

        let max = key.timeframe.max_candles();
        let skip = candles.len().saturating_sub(max);
        let ring: VecDeque<Candle> = candles.into_iter().skip(skip).collect();

        debug!(key = %key, count = ring.len(), "candle buffer initialized");
        self.buffers.write().insert(key, ring);
    }

    /// Return the most recent `count` candles (oldest-first order).
    pub fn latest(&self, key: &CandleKey, count: usize) -> Vec<Candle> {
        let map = self.buffers.read();
        match map.get(key) {
            Some(ring) => {
                let start = ring.len().saturating_sub(count);
                ring.iter().skip(start).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Return the most recent `count` close prices (oldest-first order).
    pub fn closes(&self, key: &CandleKey, count: usize) -> Vec<f64> {
        self.latest(key, count).iter().map(|c| c.close).collect()
    }

    /// Close price of the newest candle, if any.
    pub fn last_close(&self, key: &CandleKey) -> Option<f64> {
        let map = self.buffers.read();
        map.get(key).and_then(|ring| ring.back().map(|c| c.close))
    }

    pub fn len(&self, key: &CandleKey) -> usize {
        let map = self.buffers.read();
        map.get(key).map_or(0, VecDeque::len)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(std::sync::atomic::Ordering::Relaxed)
    }
}

impl Default for CandleBuffer {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ts: i64, close: f64) -> Candle {
        Candle {
            timestamp: ts,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 10.0,
        }
    }

    fn key(sym: &str, tf: Timeframe) -> CandleKey {
        CandleKey::new(sym, tf)
    }

    #[test]
    fn ring_trims_to_timeframe_budget() {
        let buf = CandleBuffer::new();
        let k = key("BTC-USDT", Timeframe::D1); // budget 10

        for i in 0..15 {
            buf.append(k.clone(), sample(86_400 * (i + 1), 100.0 + i as f64));
        }

        assert_eq!(buf.len(&k), 10);
        let closes = buf.closes(&k, 100);
        assert_eq!(closes.first().copied(), Some(105.0));
        assert_eq!(closes.last().copied(), Some(114.0));
    }

    #[test]
    fn duplicate_timestamp_replaces_in_place() {
        let buf = CandleBuffer::new();
        let k = key("ETH-USDT", Timeframe::M1);

        buf.append(k.clone(), sample(60, 50.0));
        buf.append(k.clone(), sample(60, 51.0));
        buf.append(k.clone(), sample(60, 52.0));

        assert_eq!(buf.len(&k), 1);
        assert_eq!(buf.last_close(&k), Some(52.0));
    }

    #[test]
    fn out_of_order_append_does_not_grow_buffer() {
        let buf = CandleBuffer::new();
        let k = key("BTC-USDT", Timeframe::M1);

        buf.append(k.clone(), sample(60, 100.0));
        buf.append(k.clone(), sample(120, 101.0));
        // Unknown old timestamp -> dropped.
        buf.append(k.clone(), sample(30, 99.0));
        assert_eq!(buf.len(&k), 2);
        assert_eq!(buf.dropped_count(), 1);

        // Known old timestamp -> replaced in place.
        buf.append(k.clone(), sample(60, 100.5));
        assert_eq!(buf.len(&k), 2);
        let closes = buf.closes(&k, 10);
        assert_eq!(closes, vec![100.5, 101.0]);
    }

    #[test]
    fn malformed_candle_rejected() {
        let buf = CandleBuffer::new();
        let k = key("BTC-USDT", Timeframe::M1);

        let mut bad = sample(60, 100.0);
        bad.low = 200.0; // low above high
        buf.append(k.clone(), bad);

        assert_eq!(buf.len(&k), 0);
        assert_eq!(buf.dropped_count(), 1);
    }

    #[test]
    fn initialize_sorts_and_trims() {
        let buf = CandleBuffer::new();
        let k = key("BTC-USDT", Timeframe::D1); // budget 10

        let candles: Vec<Candle> = (1..=20)
            .rev()
            .map(|i| sample(86_400 * i, 100.0 + i as f64))
            .collect();
        buf.initialize(k.clone(), candles);

        assert_eq!(buf.len(&k), 10);
        let closes = buf.closes(&k, 100);
        // Ascending order, exactly the last 10.
        assert_eq!(closes.first().copied(), Some(111.0));
        assert_eq!(closes.last().copied(), Some(120.0));
        assert!(closes.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn latest_returns_tail_in_order() {
        let buf = CandleBuffer::new();
        let k = key("BTC-USDT", Timeframe::M5);

        for i in 1..=5 {
            buf.append(k.clone(), sample(300 * i, 100.0 + i as f64));
        }
        let last3 = buf.latest(&k, 3);
        assert_eq!(last3.len(), 3);
        assert_eq!(last3[0].close, 103.0);
        assert_eq!(last3[2].close, 105.0);
    }
}
