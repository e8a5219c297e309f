// =============================================================================
// Risk Manager — position sizing, notional caps, drawdown emergency stop
// =============================================================================
//
// Sizing pipeline (per candidate signal):
//   1. Balance profile from equity (monotone thresholds).
//   2. Base USD from the profile: fixed, or progressive-linear between
//      `size_at_min` and `size_at_max` over [min_balance, max_balance].
//   3. Per-symbol multiplier, then profile clamps, then the
//      `max_position_percent * equity` clamp.
//   4. Per-trade risk cap: risk% * equity * leverage / price (in coins).
//   5. MaxSizeLimiter: total/single notional caps, open-position count.
//   6. USD -> coins -> contracts, rounded down to the exchange step;
//      below `min_size` rejects the signal.
//
// The emergency stop tracks drawdown from the balance at startup and blocks
// all new entries after a breach; it auto-unlocks once the drawdown recovers
// under `unlock_threshold_percent` of the limit and the lock has aged past
// `min_lock_minutes` for the regime.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::types::{BalanceProfile, Regime, SymbolSpec};

// =============================================================================
// Sizing result
// =============================================================================

/// A fully quantized position size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SizedPosition {
    pub usd: f64,
    pub coins: f64,
    pub contracts: f64,
    pub profile: BalanceProfile,
}

/// Why sizing rejected the signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeRejection {
    BelowMinSize,
    InvalidPrice,
    MaxTotalSize,
    MaxSingleSize,
    MaxPositions,
}

impl SizeRejection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BelowMinSize => "below_min_size",
            Self::InvalidPrice => "invalid_price",
            Self::MaxTotalSize => "max_total_size",
            Self::MaxSingleSize => "max_single_size",
            Self::MaxPositions => "max_positions",
        }
    }
}

// =============================================================================
// MaxSizeLimiter
// =============================================================================

/// Tracks open notional per symbol and enforces the hard caps.
#[derive(Debug, Default)]
pub struct MaxSizeLimiter {
    position_sizes: RwLock<HashMap<String, f64>>,
}

impl MaxSizeLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_position(&self, symbol: &str, notional_usd: f64) {
        self.position_sizes
            .write()
            .insert(symbol.to_string(), notional_usd);
    }

    pub fn remove_position(&self, symbol: &str) {
        self.position_sizes.write().remove(symbol);
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.position_sizes.read().contains_key(symbol)
    }

    pub fn total_notional(&self) -> f64 {
        self.position_sizes.read().values().sum()
    }

    pub fn open_count(&self) -> usize {
        self.position_sizes.read().len()
    }

    pub fn notional(&self, symbol: &str) -> Option<f64> {
        self.position_sizes.read().get(symbol).copied()
    }

    /// Check whether a new position of `notional_usd` fits under the caps.
    fn admit(
        &self,
        symbol: &str,
        notional_usd: f64,
        max_total: f64,
        max_single: f64,
        max_positions: u32,
    ) -> Result<(), SizeRejection> {
        let sizes = self.position_sizes.read();
        if notional_usd > max_single {
            return Err(SizeRejection::MaxSingleSize);
        }
        let already_open = sizes.contains_key(symbol);
        if !already_open && sizes.len() as u32 >= max_positions {
            return Err(SizeRejection::MaxPositions);
        }
        let total: f64 = sizes
            .iter()
            .filter(|(s, _)| s.as_str() != symbol)
            .map(|(_, v)| v)
            .sum();
        if total + notional_usd > max_total {
            return Err(SizeRejection::MaxTotalSize);
        }
        Ok(())
    }
}

// =============================================================================
// Emergency stop
// =============================================================================

#[derive(Debug, Clone, Copy, Serialize)]
pub struct EmergencyStopState {
    pub active: bool,
    pub stop_time: Option<DateTime<Utc>>,
    pub stop_balance: f64,
}

// =============================================================================
// Risk Manager
// =============================================================================

pub struct RiskManager {
    config: Arc<Config>,
    pub limiter: MaxSizeLimiter,
    /// Balance recorded at startup; drawdown is measured against it.
    initial_balance: RwLock<f64>,
    emergency: RwLock<EmergencyStopState>,
}

impl RiskManager {
    pub fn new(config: Arc<Config>, initial_balance: f64) -> Self {
        info!(initial_balance, "risk manager initialised");
        Self {
            config,
            limiter: MaxSizeLimiter::new(),
            initial_balance: RwLock::new(initial_balance),
            emergency: RwLock::new(EmergencyStopState {
                active: false,
                stop_time: None,
                stop_balance: 0.0,
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Position sizing
    // -------------------------------------------------------------------------

    /// Compute the position size in coins/contracts for a candidate entry.
    pub fn compute_position_size(
        &self,
        symbol: &str,
        equity: f64,
        price: f64,
        regime: Regime,
        spec: &SymbolSpec,
    ) -> Result<SizedPosition, SizeRejection> {
        if price <= 0.0 || !price.is_finite() {
            return Err(SizeRejection::InvalidPrice);
        }

        let cfg = &self.config;
        let profile_kind = cfg.profile_for_equity(equity);
        let profile = cfg.profiles.get(profile_kind);

        // 2. Base USD — progressive-linear when endpoints are configured.
        let mut usd = match (profile.size_at_min, profile.size_at_max) {
            (Some(lo), Some(hi)) if profile.max_balance > profile.min_balance => {
                let t = ((equity - profile.min_balance)
                    / (profile.max_balance - profile.min_balance))
                    .clamp(0.0, 1.0);
                lo + t * (hi - lo)
            }
            _ => profile.base_position_usd.unwrap_or(0.0),
        };

        // 3. Per-symbol multiplier, profile clamps, equity-percent clamp.
        if let Some(mult) = cfg.resolve(symbol, regime, |p| p.size_multiplier) {
            usd *= mult;
        }
        usd = usd.clamp(
            profile.min_position_usd.unwrap_or(0.0),
            profile.max_position_usd.unwrap_or(f64::MAX),
        );
        let pct_cap = profile.max_position_percent.unwrap_or(100.0) / 100.0 * equity;
        usd = usd.min(pct_cap);

        // 4. Per-trade risk cap in coins.
        let risk_pct = cfg.risk_percentage(symbol, regime);
        let leverage = cfg.leverage() as f64;
        let risk_cap_coins = risk_pct / 100.0 * equity * leverage / price;
        let mut coins = (usd / price).min(risk_cap_coins);
        usd = coins * price;

        // 5. Hard notional caps.
        self.limiter.admit(
            symbol,
            usd,
            cfg.limits.max_total_size_usd,
            cfg.limits.max_single_size_usd,
            cfg.limits.max_positions.min(profile.max_open_positions.unwrap_or(u32::MAX)),
        )?;

        // 6. Quantize to the exchange step and enforce min size.
        let coin_step = spec.lot_size * spec.ct_val;
        if coin_step > 0.0 {
            coins = (coins / coin_step).floor() * coin_step;
        }
        let contracts = if spec.ct_val > 0.0 {
            coins / spec.ct_val
        } else {
            0.0
        };
        if contracts < spec.min_size || contracts <= 0.0 {
            debug!(
                symbol,
                coins,
                contracts,
                min_size = spec.min_size,
                "sized position below exchange minimum"
            );
            return Err(SizeRejection::BelowMinSize);
        }

        Ok(SizedPosition {
            usd: coins * price,
            coins,
            contracts,
            profile: profile_kind,
        })
    }

    /// Maximum concurrent positions for the current balance profile.
    pub fn max_concurrent_positions(&self, equity: f64) -> u32 {
        let profile = self.config.profiles.get(self.config.profile_for_equity(equity));
        profile
            .max_open_positions
            .unwrap_or(self.config.limits.max_positions)
            .min(self.config.limits.max_positions)
    }

    // -------------------------------------------------------------------------
    // Drawdown & emergency stop
    // -------------------------------------------------------------------------

    pub fn initial_balance(&self) -> f64 {
        *self.initial_balance.read()
    }

    pub fn set_initial_balance(&self, balance: f64) {
        *self.initial_balance.write() = balance;
    }

    pub fn emergency_state(&self) -> EmergencyStopState {
        *self.emergency.read()
    }

    pub fn emergency_stop_active(&self) -> bool {
        self.emergency.read().active
    }

    /// Current drawdown fraction from the initial balance (0.06 = 6 %).
    pub fn current_drawdown(&self, current_balance: f64) -> f64 {
        let initial = self.initial_balance();
        if initial <= 0.0 {
            return 0.0;
        }
        ((initial - current_balance) / initial).max(0.0)
    }

    /// Check the drawdown limit for the regime. Returns `true` when the
    /// breach just triggered the emergency stop (the caller closes all
    /// positions and blocks entries).
    pub fn check_drawdown(&self, current_balance: f64, regime: Regime, now: DateTime<Utc>) -> bool {
        if self.emergency.read().active {
            return false;
        }
        let limit_pct = match self
            .config
            .resolve("", regime, |p| p.max_drawdown_percent)
        {
            Some(v) => v,
            None => return false,
        };

        let drawdown = self.current_drawdown(current_balance);
        if drawdown * 100.0 > limit_pct {
            let mut em = self.emergency.write();
            em.active = true;
            em.stop_time = Some(now);
            em.stop_balance = current_balance;
            warn!(
                drawdown_pct = drawdown * 100.0,
                limit_pct,
                regime = %regime,
                current_balance,
                "EMERGENCY STOP triggered by drawdown"
            );
            return true;
        }
        false
    }

    /// Auto-unlock: enough lock time elapsed AND the drawdown has recovered
    /// below `unlock_threshold_percent` of the limit. Returns `true` when
    /// the flag was cleared.
    pub fn try_unlock(&self, current_balance: f64, regime: Regime, now: DateTime<Utc>) -> bool {
        let state = *self.emergency.read();
        if !state.active {
            return false;
        }
        let stop_time = match state.stop_time {
            Some(t) => t,
            None => return false,
        };

        let min_lock_minutes = self
            .config
            .resolve("", regime, |p| p.min_lock_minutes)
            .unwrap_or(5.0);
        if (now - stop_time).num_seconds() < (min_lock_minutes * 60.0) as i64 {
            return false;
        }

        let limit_pct = match self.config.resolve("", regime, |p| p.max_drawdown_percent) {
            Some(v) => v,
            None => return false,
        };
        let unlock_pct = self.config.emergency_stop.unlock_threshold_percent / 100.0 * limit_pct;

        let drawdown_pct = self.current_drawdown(current_balance) * 100.0;
        if drawdown_pct < unlock_pct {
            let mut em = self.emergency.write();
            em.active = false;
            em.stop_time = None;
            info!(
                drawdown_pct,
                unlock_pct,
                current_balance,
                "emergency stop cleared, trading resumes"
            );
            return true;
        }
        false
    }
}

impl std::fmt::Debug for RiskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskManager")
            .field("initial_balance", &self.initial_balance())
            .field("emergency_active", &self.emergency_stop_active())
            .field("open_positions", &self.limiter.open_count())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn test_config() -> Arc<Config> {
        let yaml = crate::config::test_yaml();
        let mut cfg: Config = serde_yaml::from_str(&yaml).unwrap();
        // Emergency-stop knobs used by scenario tests.
        cfg.adaptive_regime
            .regimes
            .entry(Regime::Ranging)
            .or_default()
            .max_drawdown_percent = Some(5.0);
        cfg.adaptive_regime
            .regimes
            .entry(Regime::Ranging)
            .or_default()
            .min_lock_minutes = Some(5.0);
        cfg.validate().unwrap();
        Arc::new(cfg)
    }

    fn btc_spec() -> SymbolSpec {
        SymbolSpec {
            symbol: "BTC-USDT".into(),
            ct_val: 0.01,
            min_size: 1.0,
            tick_size: 0.1,
            lot_size: 1.0,
            leverage: 5,
        }
    }

    /// Config with a risk cap loose enough for the profile size to win.
    fn loose_risk_config() -> Arc<Config> {
        let mut raw = (*test_config()).clone();
        raw.risk.risk_per_trade_percent = Some(10.0);
        Arc::new(raw)
    }

    #[test]
    fn sizing_uses_profile_base_and_quantizes() {
        let rm = RiskManager::new(loose_risk_config(), 1000.0);
        // equity 1000 -> medium profile, base 200 USD @ price 100 -> 2 coins
        // -> 200 contracts of 0.01.
        let sized = rm
            .compute_position_size("BTC-USDT", 1000.0, 100.0, Regime::Ranging, &btc_spec())
            .unwrap();
        assert_eq!(sized.profile, BalanceProfile::Medium);
        assert!((sized.coins - 2.0).abs() < 1e-9);
        assert!((sized.contracts - 200.0).abs() < 1e-9);
    }

    #[test]
    fn size_rounded_to_zero_rejects() {
        let rm = RiskManager::new(loose_risk_config(), 1000.0);
        let spec = SymbolSpec {
            ct_val: 1.0,
            min_size: 1.0,
            lot_size: 1.0,
            ..btc_spec()
        };
        // 200 USD at price 50 000 -> 0.004 coins -> floors to 0 contracts.
        let err = rm
            .compute_position_size("BTC-USDT", 1000.0, 50_000.0, Regime::Ranging, &spec)
            .unwrap_err();
        assert_eq!(err, SizeRejection::BelowMinSize);
    }

    #[test]
    fn risk_cap_limits_coins() {
        let cfg = test_config();
        let rm = RiskManager::new(cfg, 1000.0);
        // risk 1% default: cap = 0.01 * 1000 * 5 / 100 = 0.5 coins, below the
        // 2-coin profile size.
        let sized = rm
            .compute_position_size("BTC-USDT", 1000.0, 100.0, Regime::Choppy, &btc_spec())
            .unwrap();
        assert!(sized.coins <= 0.5 + 1e-9);
    }

    #[test]
    fn limiter_enforces_total_and_count() {
        let mut raw = (*test_config()).clone();
        raw.risk.risk_per_trade_percent = Some(10.0);
        raw.limits.max_total_size_usd = 300.0;
        raw.limits.max_single_size_usd = 250.0;
        raw.limits.max_positions = 2;
        let rm = RiskManager::new(Arc::new(raw), 1000.0);

        rm.limiter.set_position("ETH-USDT", 200.0);
        // 200 already open; a 200-USD add breaches the 300 total.
        let err = rm
            .compute_position_size("BTC-USDT", 1000.0, 100.0, Regime::Ranging, &btc_spec())
            .unwrap_err();
        assert_eq!(err, SizeRejection::MaxTotalSize);

        rm.limiter.set_position("SOL-USDT", 50.0);
        rm.limiter.remove_position("ETH-USDT");
        rm.limiter.set_position("XRP-USDT", 50.0);
        // Count is 2 == max_positions.
        let err = rm
            .compute_position_size("BTC-USDT", 1000.0, 100.0, Regime::Ranging, &btc_spec())
            .unwrap_err();
        assert_eq!(err, SizeRejection::MaxPositions);
    }

    #[test]
    fn progressive_linear_sizing_interpolates() {
        let mut raw = (*test_config()).clone();
        raw.risk.risk_per_trade_percent = Some(10.0);
        raw.profiles.medium.size_at_min = Some(100.0);
        raw.profiles.medium.size_at_max = Some(300.0);
        // Band [500, 5000]; equity 2750 is the midpoint -> 200 USD.
        let rm = RiskManager::new(Arc::new(raw), 2750.0);
        let sized = rm
            .compute_position_size("ETH-USDT", 2750.0, 100.0, Regime::Ranging, &btc_spec())
            .unwrap();
        assert!((sized.usd - 200.0).abs() < 1.0);
    }

    #[test]
    fn emergency_stop_triggers_and_auto_unlocks() {
        // Spec scenario: initial 1000, limit 5 % (ranging), unlock at 70 %,
        // lock >= 5 min.
        let rm = RiskManager::new(test_config(), 1000.0);
        let t0 = Utc::now();

        // 6 % drawdown -> trigger.
        assert!(rm.check_drawdown(940.0, Regime::Ranging, t0));
        assert!(rm.emergency_stop_active());
        // Re-check while active does not re-trigger.
        assert!(!rm.check_drawdown(940.0, Regime::Ranging, t0));

        // Recovery to 3 % but only 1 minute elapsed: stays locked.
        assert!(!rm.try_unlock(970.0, Regime::Ranging, t0 + Duration::minutes(1)));
        assert!(rm.emergency_stop_active());

        // 3 % < 5 % * 0.7 = 3.5 % and >= 5 min elapsed: unlock.
        assert!(rm.try_unlock(970.0, Regime::Ranging, t0 + Duration::minutes(5)));
        assert!(!rm.emergency_stop_active());
    }

    #[test]
    fn drawdown_below_limit_does_not_trigger() {
        let rm = RiskManager::new(test_config(), 1000.0);
        assert!(!rm.check_drawdown(960.0, Regime::Ranging, Utc::now()));
        assert!(!rm.emergency_stop_active());
    }

    #[test]
    fn unlock_requires_recovery_not_only_time() {
        let rm = RiskManager::new(test_config(), 1000.0);
        let t0 = Utc::now();
        assert!(rm.check_drawdown(940.0, Regime::Ranging, t0));
        // Still at 6 % after the lock window: stays locked.
        assert!(!rm.try_unlock(940.0, Regime::Ranging, t0 + Duration::minutes(10)));
        assert!(rm.emergency_stop_active());
    }
}
