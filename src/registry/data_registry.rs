// =============================================================================
// Data Registry — single source of truth for market & account observables
// =============================================================================
//
// Owns: candle buffers per (symbol, timeframe), latest ticker per symbol,
// regime per symbol plus the global regime, the balance snapshot with its
// derived profile, the margin snapshot, and the per-symbol indicator cache.
//
// Failure semantics: never fatal. Malformed updates are dropped and counted.
// A stale ticker is reported as stale to callers but not deleted.
//
// Locking: one RwLock per category so ticker traffic never contends with
// candle appends. Readers always receive owned copies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::indicators::IndicatorSnapshot;
use crate::market_data::{Candle, CandleBuffer, CandleKey};
use crate::types::{BalanceProfile, BalanceSnapshot, MarginSnapshot, Regime, Ticker, Timeframe};

/// Number of candles per timeframe included in a market snapshot.
const SNAPSHOT_CANDLES: usize = 100;

/// Internally consistent view of one symbol's market state.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub ticker: Option<Ticker>,
    /// Age of the ticker in seconds at snapshot time; `None` without ticker.
    pub ticker_age_secs: Option<f64>,
    /// True when the ticker is older than the configured staleness threshold.
    pub ticker_stale: bool,
    pub candles: HashMap<Timeframe, Vec<Candle>>,
    pub indicators: IndicatorSnapshot,
    pub regime: Regime,
}

impl MarketSnapshot {
    /// Best price for decisions: fresh ticker last, else the newest close
    /// from the finest timeframe that has candles.
    pub fn current_price(&self) -> Option<f64> {
        if let Some(t) = &self.ticker {
            if t.last > 0.0 {
                return Some(t.last);
            }
        }
        Timeframe::ALL
            .iter()
            .find_map(|tf| self.candles.get(tf).and_then(|c| c.last()))
            .map(|c| c.close)
    }
}

pub struct DataRegistry {
    candles: CandleBuffer,
    tickers: RwLock<HashMap<String, Ticker>>,
    indicators: RwLock<HashMap<String, IndicatorSnapshot>>,
    regimes: RwLock<HashMap<String, Regime>>,
    global_regime: RwLock<Regime>,
    balance: RwLock<BalanceSnapshot>,
    margin: RwLock<MarginSnapshot>,
    /// Malformed updates dropped (ticker + margin + balance).
    rejected_updates: AtomicU64,
    /// Tickers older than this many seconds are reported stale.
    stale_threshold_secs: f64,
}

impl DataRegistry {
    pub fn new(stale_threshold_secs: f64) -> Self {
        Self {
            candles: CandleBuffer::new(),
            tickers: RwLock::new(HashMap::new()),
            indicators: RwLock::new(HashMap::new()),
            regimes: RwLock::new(HashMap::new()),
            global_regime: RwLock::new(Regime::Unknown),
            balance: RwLock::new(BalanceSnapshot::default()),
            margin: RwLock::new(MarginSnapshot::default()),
            rejected_updates: AtomicU64::new(0),
            stale_threshold_secs,
        }
    }

    // -------------------------------------------------------------------------
    // Tickers
    // -------------------------------------------------------------------------

    /// Store the latest ticker. Malformed fields drop the update silently
    /// (counter incremented).
    pub fn update_ticker(&self, ticker: Ticker) {
        let well_formed = ticker.last > 0.0
            && ticker.last.is_finite()
            && ticker.best_bid >= 0.0
            && ticker.best_ask >= 0.0
            && (ticker.best_bid == 0.0
                || ticker.best_ask == 0.0
                || ticker.best_bid <= ticker.best_ask);
        if !well_formed {
            self.rejected_updates.fetch_add(1, Ordering::Relaxed);
            debug!(symbol = %ticker.symbol, last = ticker.last, "malformed ticker dropped");
            return;
        }
        self.tickers.write().insert(ticker.symbol.clone(), ticker);
    }

    pub fn get_ticker(&self, symbol: &str) -> Option<Ticker> {
        self.tickers.read().get(symbol).cloned()
    }

    /// Last traded price, regardless of staleness. Callers that care about
    /// freshness use `get_market_data`.
    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.get_ticker(symbol).map(|t| t.last)
    }

    fn ticker_age_secs(&self, ticker: &Ticker) -> f64 {
        let now_ms = chrono::Utc::now().timestamp_millis();
        ((now_ms - ticker.timestamp_ms).max(0)) as f64 / 1000.0
    }

    // -------------------------------------------------------------------------
    // Candles
    // -------------------------------------------------------------------------

    /// Append (or replace in place) one candle. Deduplicated by timestamp,
    /// oldest evicted past the timeframe budget.
    pub fn append_candle(&self, symbol: &str, timeframe: Timeframe, candle: Candle) {
        self.candles
            .append(CandleKey::new(symbol, timeframe), candle);
    }

    /// Replace the buffer atomically, sorted ascending by timestamp. Used by
    /// the REST bootstrap at startup.
    pub fn initialize_candles(&self, symbol: &str, timeframe: Timeframe, candles: Vec<Candle>) {
        self.candles
            .initialize(CandleKey::new(symbol, timeframe), candles);
    }

    pub fn latest_candles(&self, symbol: &str, timeframe: Timeframe, count: usize) -> Vec<Candle> {
        self.candles
            .latest(&CandleKey::new(symbol, timeframe), count)
    }

    /// Recompute and cache the indicator snapshot for a symbol from its 5m
    /// series. Called after candle updates.
    pub fn refresh_indicators(&self, symbol: &str) {
        let candles = self.latest_candles(symbol, Timeframe::M5, SNAPSHOT_CANDLES);
        if candles.len() < 30 {
            return;
        }
        let snapshot = IndicatorSnapshot::compute(&candles);
        self.indicators
            .write()
            .insert(symbol.to_string(), snapshot);
    }

    pub fn get_indicators(&self, symbol: &str) -> IndicatorSnapshot {
        self.indicators
            .read()
            .get(symbol)
            .cloned()
            .unwrap_or_default()
    }

    // -------------------------------------------------------------------------
    // Snapshot
    // -------------------------------------------------------------------------

    /// Build an internally consistent snapshot for one symbol: latest ticker
    /// (with staleness), latest candles per timeframe, cached indicators and
    /// the current regime.
    pub fn get_market_data(&self, symbol: &str) -> MarketSnapshot {
        let ticker = self.get_ticker(symbol);
        let ticker_age_secs = ticker.as_ref().map(|t| self.ticker_age_secs(t));
        let ticker_stale = ticker_age_secs
            .map(|age| age > self.stale_threshold_secs)
            .unwrap_or(true);

        let mut candles = HashMap::new();
        for tf in Timeframe::ALL {
            let series = self.latest_candles(symbol, tf, SNAPSHOT_CANDLES);
            if !series.is_empty() {
                candles.insert(tf, series);
            }
        }

        MarketSnapshot {
            symbol: symbol.to_string(),
            ticker,
            ticker_age_secs,
            ticker_stale,
            candles,
            indicators: self.get_indicators(symbol),
            regime: self.get_regime(symbol),
        }
    }

    // -------------------------------------------------------------------------
    // Regime
    // -------------------------------------------------------------------------

    /// Update a symbol's regime. Returns the previous value when it changed
    /// so the caller can journal the transition.
    pub fn update_regime(&self, symbol: &str, regime: Regime) -> Option<Regime> {
        let mut regimes = self.regimes.write();
        let prev = regimes.insert(symbol.to_string(), regime);
        match prev {
            Some(p) if p != regime => Some(p),
            None if regime != Regime::Unknown => Some(Regime::Unknown),
            _ => None,
        }
    }

    pub fn get_regime(&self, symbol: &str) -> Regime {
        self.regimes
            .read()
            .get(symbol)
            .copied()
            .unwrap_or(*self.global_regime.read())
    }

    pub fn update_global_regime(&self, regime: Regime) {
        *self.global_regime.write() = regime;
    }

    pub fn global_regime(&self) -> Regime {
        *self.global_regime.read()
    }

    // -------------------------------------------------------------------------
    // Balance & margin
    // -------------------------------------------------------------------------

    /// Overwrite the balance snapshot. Negative or non-finite equity is
    /// rejected.
    pub fn update_balance(&self, equity: f64, profile: BalanceProfile) {
        if !equity.is_finite() || equity < 0.0 {
            self.rejected_updates.fetch_add(1, Ordering::Relaxed);
            warn!(equity, "malformed balance update dropped");
            return;
        }
        *self.balance.write() = BalanceSnapshot { equity, profile };
    }

    pub fn get_balance(&self) -> BalanceSnapshot {
        *self.balance.read()
    }

    /// Overwrite the margin snapshot. Enforces `used + available == total`
    /// within tolerance by recomputing `available` from the other two.
    pub fn update_margin(&self, used: f64, available: f64, total: f64) {
        if !(used.is_finite() && available.is_finite() && total.is_finite()) || used < 0.0 {
            self.rejected_updates.fetch_add(1, Ordering::Relaxed);
            warn!(used, available, total, "malformed margin update dropped");
            return;
        }
        let available = if (used + available - total).abs() > 1e-6 {
            (total - used).max(0.0)
        } else {
            available
        };
        *self.margin.write() = MarginSnapshot {
            used,
            available,
            total,
        };
    }

    pub fn get_margin(&self) -> MarginSnapshot {
        *self.margin.read()
    }

    pub fn rejected_update_count(&self) -> u64 {
        self.rejected_updates.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for DataRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataRegistry")
            .field("tickers", &self.tickers.read().len())
            .field("rejected_updates", &self.rejected_update_count())
            .finish()
    }
}
