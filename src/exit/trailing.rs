// =============================================================================
// Trailing Stop Loss — per-symbol ratcheting stop
// =============================================================================
//
// State per position: peak price and stop price, both monotone in the
// favorable direction; the stop is never rewound. On every tick the stop is
// re-derived from the peak and the close decision runs in a fixed order:
//
//   1. TIMEOUT      — position age exceeded `timeout_minutes`.
//   2. SL           — margin loss beyond `sl_percent`, only while the trail
//                     has not armed and min-holding has passed.
//   3. TRAILING     — price crossed the stop with enough net profit.
//   4. LOSS CUT     — raw loss beyond `loss_cut_percent / leverage`.
//
// All thresholds are resolved per regime at initialization and recorded so a
// restart re-creates the same stop deterministically.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::types::{ExitReason, Regime, Side};

/// Loss-cut becomes eligible this quickly; it exists to stop runaway losses.
const LOSS_CUT_MIN_AGE_SECS: f64 = 5.0;

/// Resolved trailing parameters, fixed at initialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailingParams {
    pub trailing_percent: f64,
    pub min_profit_to_close: f64,
    pub loss_cut_percent: f64,
    pub timeout_minutes: f64,
    pub min_holding_seconds: f64,
    pub sl_percent: Option<f64>,
    pub extend_time_on_profit: bool,
    pub extend_time_multiplier: f64,
    pub leverage: u32,
    /// Round-trip fee rate (both sides summed).
    pub fee_rate_round_trip: f64,
}

impl TrailingParams {
    /// Resolve per-regime parameters from configuration. `min_holding` may
    /// be overridden by position metadata.
    pub fn resolve(
        config: &Config,
        symbol: &str,
        regime: Regime,
        min_holding_override: Option<f64>,
    ) -> Self {
        let resolve = |pick: fn(&crate::config::AdaptiveParams) -> Option<f64>| {
            config.resolve(symbol, regime, pick)
        };
        Self {
            trailing_percent: resolve(|p| p.trailing_percent).unwrap_or(0.5),
            min_profit_to_close: resolve(|p| p.min_profit_to_close).unwrap_or(0.1),
            loss_cut_percent: resolve(|p| p.loss_cut_percent).unwrap_or(3.0),
            timeout_minutes: resolve(|p| p.timeout_minutes).unwrap_or(240.0),
            min_holding_seconds: min_holding_override
                .or_else(|| resolve(|p| p.min_holding_minutes).map(|m| m * 60.0))
                .unwrap_or(0.0),
            sl_percent: resolve(|p| p.sl_percent),
            extend_time_on_profit: config
                .resolve(symbol, regime, |p| p.extend_time_on_profit)
                .unwrap_or(false),
            extend_time_multiplier: resolve(|p| p.extend_time_multiplier).unwrap_or(1.5),
            leverage: config.leverage(),
            fee_rate_round_trip: config.maker_fee_rate() + config.taker_fee_rate(),
        }
    }
}

/// Mutable trailing state for one position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailingStop {
    pub symbol: String,
    pub entry_price: f64,
    pub side: Side,
    pub entry_time: DateTime<Utc>,
    pub regime: Regime,
    pub peak_price: f64,
    pub stop_price: f64,
    /// True once the stop has ratcheted past its initial seed.
    pub armed: bool,
    pub params: TrailingParams,
}

impl TrailingStop {
    pub fn new(
        symbol: &str,
        entry_price: f64,
        side: Side,
        entry_time: DateTime<Utc>,
        regime: Regime,
        params: TrailingParams,
    ) -> Self {
        let stop_price = Self::stop_from_peak(entry_price, side, params.trailing_percent);
        info!(
            symbol,
            entry_price,
            side = %side,
            regime = %regime,
            trailing_percent = params.trailing_percent,
            stop_price,
            "trailing stop initialised"
        );
        Self {
            symbol: symbol.to_string(),
            entry_price,
            side,
            entry_time,
            regime,
            peak_price: entry_price,
            stop_price,
            armed: false,
            params,
        }
    }

    fn stop_from_peak(peak: f64, side: Side, trailing_percent: f64) -> f64 {
        match side {
            Side::Long => peak * (1.0 - trailing_percent / 100.0),
            Side::Short => peak * (1.0 + trailing_percent / 100.0),
        }
    }

    // -------------------------------------------------------------------------
    // Profit accounting
    // -------------------------------------------------------------------------

    /// Raw price move in percent, signed in the position's favor.
    pub fn profit_pct(&self, price: f64) -> f64 {
        (price / self.entry_price - 1.0) * self.side.dir() * 100.0
    }

    /// Net profit percent after the leverage-scaled round-trip fee.
    pub fn profit_pct_net(&self, price: f64) -> f64 {
        self.profit_pct(price)
            - self.params.fee_rate_round_trip * self.params.leverage as f64 * 100.0
    }

    /// Profit measured against margin (price move times leverage).
    pub fn profit_pct_from_margin(&self, price: f64) -> f64 {
        self.profit_pct(price) * self.params.leverage as f64
    }

    pub fn age_seconds(&self, now: DateTime<Utc>) -> f64 {
        (now - self.entry_time).num_milliseconds() as f64 / 1000.0
    }

    /// Effective min-holding, extended while the position is profitable when
    /// configured.
    fn effective_min_holding(&self, price: f64) -> f64 {
        if self.params.extend_time_on_profit && self.profit_pct(price) > 0.0 {
            self.params.min_holding_seconds * self.params.extend_time_multiplier
        } else {
            self.params.min_holding_seconds
        }
    }

    // -------------------------------------------------------------------------
    // Update rule
    // -------------------------------------------------------------------------

    /// Advance the peak/stop for a new price and return the close decision,
    /// if any. The stop never moves against the favorable direction.
    pub fn on_price(&mut self, price: f64, now: DateTime<Utc>) -> Option<ExitReason> {
        if price <= 0.0 || !price.is_finite() {
            warn!(symbol = %self.symbol, price, "invalid price ignored by trailing stop");
            return None;
        }

        // 1. Peak ratchet, favorable direction only.
        let improved = match self.side {
            Side::Long => price > self.peak_price,
            Side::Short => price < self.peak_price,
        };
        if improved {
            self.peak_price = price;
            let candidate = Self::stop_from_peak(self.peak_price, self.side, self.params.trailing_percent);
            // 2. Stop ratchet, never rewound.
            let advances = match self.side {
                Side::Long => candidate > self.stop_price,
                Side::Short => candidate < self.stop_price,
            };
            if advances {
                self.stop_price = candidate;
                self.armed = true;
                debug!(
                    symbol = %self.symbol,
                    peak = self.peak_price,
                    stop = self.stop_price,
                    "trailing stop advanced"
                );
            }
        }

        let age = self.age_seconds(now);
        let min_holding = self.effective_min_holding(price);

        // 3a. TIMEOUT.
        if age >= self.params.timeout_minutes * 60.0 {
            return Some(ExitReason::Timeout);
        }

        // 3b. SL while the trail has not armed.
        if let Some(sl) = self.params.sl_percent {
            if !self.armed
                && age >= min_holding
                && self.profit_pct_from_margin(price) <= -sl
            {
                return Some(ExitReason::Sl);
            }
        }

        // 3c. Trailing trip.
        let tripped = match self.side {
            Side::Long => price <= self.stop_price,
            Side::Short => price >= self.stop_price,
        };
        if tripped
            && age >= min_holding
            && self.profit_pct_net(price) >= self.params.min_profit_to_close
        {
            return Some(ExitReason::TrailingStop);
        }

        // 3d. Loss cut.
        if age >= LOSS_CUT_MIN_AGE_SECS
            && self.profit_pct(price) <= -self.params.loss_cut_percent / self.params.leverage as f64
        {
            return Some(ExitReason::LossCut);
        }

        None
    }
}

// =============================================================================
// Coordinator — owns all trailing state, single writer
// =============================================================================

pub struct TrailingSlCoordinator {
    stops: RwLock<HashMap<String, TrailingStop>>,
}

impl TrailingSlCoordinator {
    pub fn new() -> Self {
        Self {
            stops: RwLock::new(HashMap::new()),
        }
    }

    /// Create (or replace) the trailing stop for a position.
    pub fn init(
        &self,
        symbol: &str,
        entry_price: f64,
        side: Side,
        entry_time: DateTime<Utc>,
        regime: Regime,
        params: TrailingParams,
    ) {
        let stop = TrailingStop::new(symbol, entry_price, side, entry_time, regime, params);
        self.stops.write().insert(symbol.to_string(), stop);
    }

    /// Drop the trailing state when the position closes.
    pub fn remove(&self, symbol: &str) -> Option<TrailingStop> {
        self.stops.write().remove(symbol)
    }

    pub fn has(&self, symbol: &str) -> bool {
        self.stops.read().contains_key(symbol)
    }

    /// True once the symbol's trail has ratcheted at least once.
    pub fn is_armed(&self, symbol: &str) -> bool {
        self.stops
            .read()
            .get(symbol)
            .map(|s| s.armed)
            .unwrap_or(false)
    }

    pub fn snapshot(&self, symbol: &str) -> Option<TrailingStop> {
        self.stops.read().get(symbol).cloned()
    }

    /// Tick-driven update. Returns the close decision, if any; the caller
    /// owns the close pipeline.
    pub fn on_price(&self, symbol: &str, price: f64, now: DateTime<Utc>) -> Option<ExitReason> {
        let mut stops = self.stops.write();
        stops.get_mut(symbol)?.on_price(price, now)
    }

    /// Periodic fallback: evaluate every tracked symbol against the last
    /// known price, in case no tick has arrived. Returns all decisions.
    pub fn periodic_check<F>(&self, now: DateTime<Utc>, last_price: F) -> Vec<(String, ExitReason)>
    where
        F: Fn(&str) -> Option<f64>,
    {
        let mut decisions = Vec::new();
        let mut stops = self.stops.write();
        for (symbol, stop) in stops.iter_mut() {
            if let Some(price) = last_price(symbol) {
                if let Some(reason) = stop.on_price(price, now) {
                    decisions.push((symbol.clone(), reason));
                }
            }
        }
        decisions
    }

    pub fn tracked_symbols(&self) -> Vec<String> {
        self.stops.read().keys().cloned().collect()
    }
}

impl Default for TrailingSlCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn params() -> TrailingParams {
        TrailingParams {
            trailing_percent: 0.5,
            min_profit_to_close: 0.1,
            loss_cut_percent: 3.0,
            timeout_minutes: 240.0,
            min_holding_seconds: 0.0,
            sl_percent: None,
            extend_time_on_profit: false,
            extend_time_multiplier: 1.5,
            leverage: 1,
            fee_rate_round_trip: 0.0,
        }
    }

    #[test]
    fn stop_ratchets_and_never_rewinds() {
        // Tick sequence from the trailing-stop scenario: 100.4, 100.8,
        // 100.6, 100.9, 100.2 with 0.5 % trailing.
        let t0 = Utc::now();
        let mut tsl = TrailingStop::new("BTC-USDT", 100.0, Side::Long, t0, Regime::Ranging, params());

        assert!(tsl.on_price(100.4, t0 + Duration::seconds(10)).is_none());
        assert!((tsl.peak_price - 100.4).abs() < 1e-9);
        assert!((tsl.stop_price - 100.4 * 0.995).abs() < 1e-9);

        assert!(tsl.on_price(100.8, t0 + Duration::seconds(20)).is_none());
        let stop_after_high = tsl.stop_price;
        assert!((stop_after_high - 100.8 * 0.995).abs() < 1e-9);

        // Pullback: peak and stop unchanged.
        assert!(tsl.on_price(100.6, t0 + Duration::seconds(30)).is_none());
        assert!((tsl.stop_price - stop_after_high).abs() < 1e-12);

        // New high: stop advances monotonically.
        assert!(tsl.on_price(100.9, t0 + Duration::seconds(40)).is_none());
        assert!(tsl.stop_price > stop_after_high);
        let final_stop = tsl.stop_price;
        assert!((final_stop - 100.9 * 0.995).abs() < 1e-9);

        // Drop through the stop: trailing trip.
        let decision = tsl.on_price(100.2, t0 + Duration::seconds(50));
        assert_eq!(decision, Some(ExitReason::TrailingStop));
        // Stop never decreased across the sequence.
        assert!((tsl.stop_price - final_stop).abs() < 1e-12);
    }

    #[test]
    fn short_side_is_symmetric() {
        let t0 = Utc::now();
        let mut tsl =
            TrailingStop::new("BTC-USDT", 100.0, Side::Short, t0, Regime::Ranging, params());

        assert!(tsl.on_price(99.0, t0 + Duration::seconds(10)).is_none());
        assert!((tsl.stop_price - 99.0 * 1.005).abs() < 1e-9);

        // Rally through the stop with profit above the minimum.
        let decision = tsl.on_price(99.6, t0 + Duration::seconds(20));
        assert_eq!(decision, Some(ExitReason::TrailingStop));
    }

    #[test]
    fn trailing_respects_min_profit_net_of_fees() {
        let t0 = Utc::now();
        let mut p = params();
        p.leverage = 5;
        p.fee_rate_round_trip = 0.002; // 0.2 % x5 = 1 % net drag
        p.min_profit_to_close = 0.1;
        let mut tsl = TrailingStop::new("BTC-USDT", 100.0, Side::Long, t0, Regime::Ranging, p);

        // Peak at 100.8, then price falls through the stop. Raw profit
        // ~0.29 %, net after 1 % fees is negative -> hold instead of
        // trailing-stop.
        tsl.on_price(100.8, t0 + Duration::seconds(10));
        let decision = tsl.on_price(100.29, t0 + Duration::seconds(20));
        assert_ne!(decision, Some(ExitReason::TrailingStop));
    }

    #[test]
    fn min_holding_blocks_trailing_trip() {
        let t0 = Utc::now();
        let mut p = params();
        p.min_holding_seconds = 300.0;
        let mut tsl = TrailingStop::new("BTC-USDT", 100.0, Side::Long, t0, Regime::Ranging, p);

        tsl.on_price(100.8, t0 + Duration::seconds(10));
        // Stop is hit but the position is only 20 s old.
        assert!(tsl.on_price(100.2, t0 + Duration::seconds(20)).is_none());
        // Same price after min-holding: trip fires.
        let decision = tsl.on_price(100.2, t0 + Duration::seconds(301));
        assert_eq!(decision, Some(ExitReason::TrailingStop));
    }

    #[test]
    fn timeout_closes_regardless_of_profit() {
        let t0 = Utc::now();
        let mut p = params();
        p.timeout_minutes = 1.0;
        let mut tsl = TrailingStop::new("BTC-USDT", 100.0, Side::Long, t0, Regime::Ranging, p);

        let decision = tsl.on_price(100.01, t0 + Duration::seconds(61));
        assert_eq!(decision, Some(ExitReason::Timeout));
    }

    #[test]
    fn sl_fires_only_before_trail_arms() {
        let t0 = Utc::now();
        let mut p = params();
        p.sl_percent = Some(2.0);
        p.leverage = 5;
        let mut tsl = TrailingStop::new("BTC-USDT", 100.0, Side::Long, t0, Regime::Ranging, p.clone());

        // -0.5 % move x5 leverage = -2.5 % from margin <= -2 % -> SL.
        let decision = tsl.on_price(99.5, t0 + Duration::seconds(30));
        assert_eq!(decision, Some(ExitReason::Sl));

        // Armed trail suppresses the SL path.
        let mut armed = TrailingStop::new("BTC-USDT", 100.0, Side::Long, t0, Regime::Ranging, p);
        armed.on_price(101.0, t0 + Duration::seconds(10));
        assert!(armed.armed);
        let decision = armed.on_price(99.5, t0 + Duration::seconds(30));
        assert_ne!(decision, Some(ExitReason::Sl));
    }

    #[test]
    fn loss_cut_waits_five_seconds() {
        let t0 = Utc::now();
        let mut p = params();
        p.loss_cut_percent = 3.0;
        p.leverage = 5; // cut at -0.6 % raw move
        let mut tsl = TrailingStop::new("BTC-USDT", 100.0, Side::Long, t0, Regime::Ranging, p);

        assert!(tsl.on_price(99.3, t0 + Duration::seconds(2)).is_none());
        let decision = tsl.on_price(99.3, t0 + Duration::seconds(6));
        assert_eq!(decision, Some(ExitReason::LossCut));
    }

    #[test]
    fn profitable_position_extends_min_holding() {
        let t0 = Utc::now();
        let mut p = params();
        p.min_holding_seconds = 100.0;
        p.extend_time_on_profit = true;
        p.extend_time_multiplier = 2.0;
        let mut tsl = TrailingStop::new("BTC-USDT", 100.0, Side::Long, t0, Regime::Ranging, p);

        tsl.on_price(101.0, t0 + Duration::seconds(10));
        // 150 s: past the base 100 s but inside the extended 200 s window,
        // and the position is profitable -> no trailing trip yet.
        assert!(tsl.on_price(100.45, t0 + Duration::seconds(150)).is_none());
        // Past the extended window the trip fires.
        let decision = tsl.on_price(100.45, t0 + Duration::seconds(201));
        assert_eq!(decision, Some(ExitReason::TrailingStop));
    }

    #[test]
    fn coordinator_owns_state_per_symbol() {
        let coord = TrailingSlCoordinator::new();
        let t0 = Utc::now();
        coord.init("BTC-USDT", 100.0, Side::Long, t0, Regime::Ranging, params());
        coord.init("ETH-USDT", 50.0, Side::Short, t0, Regime::Trending, params());

        assert!(coord.has("BTC-USDT"));
        assert!(!coord.is_armed("BTC-USDT"));
        coord.on_price("BTC-USDT", 101.0, t0 + Duration::seconds(10));
        assert!(coord.is_armed("BTC-USDT"));
        assert!(!coord.is_armed("ETH-USDT"));

        let removed = coord.remove("BTC-USDT");
        assert!(removed.is_some());
        assert!(!coord.has("BTC-USDT"));
    }

    #[test]
    fn periodic_check_uses_last_known_price() {
        let coord = TrailingSlCoordinator::new();
        let t0 = Utc::now();
        let mut p = params();
        p.loss_cut_percent = 3.0;
        coord.init("BTC-USDT", 100.0, Side::Long, t0, Regime::Ranging, p);

        // Last price from the registry shows a deep loss.
        let decisions = coord.periodic_check(t0 + Duration::seconds(10), |sym| {
            (sym == "BTC-USDT").then_some(95.0)
        });
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].1, ExitReason::LossCut);
    }
}
