// =============================================================================
// Exit Analyzer — adaptive per-position exit decisions
// =============================================================================
//
// Runs after the trailing stop has not triggered. Decision order:
//
//   1. Emergency loss protection (exempt from min-holding).
//   2. Profit Harvest — quick small profits inside a short window; parameters
//      come strictly from the per-regime configuration.
//   3. Adaptive take-profit, with TP extension instead of close in strong
//      trends.
//   4. Big-profit trailing exit over the 5-minute net-PnL high.
//   5. Partial take-profit (at most once per position).
//   6. Smart indicator filter — can force a close, or explicitly block the
//      less reliable time-based exit for this tick.
//   7. Time-based exit with a one-shot profitable extension.
//
// Every path except emergency/loss-cut/timeout respects `min_holding`; a
// decision suppressed by min-holding is logged with the blocked reason.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::config::Config;
use crate::exit::smart::{self, SmartVerdict};
use crate::registry::{MarketSnapshot, Position, PositionMetadata};
use crate::types::{ExitReason, Regime};

/// Window for the big-profit trailing high of net PnL.
const BIG_PROFIT_WINDOW_SECS: i64 = 300;

/// Outcome of one analysis pass over a position.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitDecision {
    Hold,
    Close { reason: ExitReason },
    PartialClose { fraction: f64, reason: ExitReason },
    /// TP threshold raised instead of closing; the new value is already
    /// recorded in the metadata passed to `analyze`.
    ExtendTp { new_tp_percent: f64 },
}

pub struct ExitAnalyzer {
    config: Arc<Config>,
    /// Net-PnL history per symbol for the big-profit trailing exit.
    pnl_history: RwLock<HashMap<String, VecDeque<(DateTime<Utc>, f64)>>>,
}

impl ExitAnalyzer {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            pnl_history: RwLock::new(HashMap::new()),
        }
    }

    /// Drop per-symbol state once the position is gone.
    pub fn forget(&self, symbol: &str) {
        self.pnl_history.write().remove(symbol);
    }

    // -------------------------------------------------------------------------
    // PnL accounting
    // -------------------------------------------------------------------------

    /// Estimated round-trip commission in USDT: maker on open, taker on the
    /// (market) close.
    fn commission_usd(&self, entry_price: f64, current_price: f64, size_coins: f64) -> f64 {
        entry_price * size_coins * self.config.maker_fee_rate()
            + current_price * size_coins * self.config.taker_fee_rate()
    }

    /// Round-trip commission as a percentage of margin.
    fn commission_pct_from_margin(&self) -> f64 {
        (self.config.maker_fee_rate() + self.config.taker_fee_rate())
            * self.config.leverage() as f64
            * 100.0
    }

    fn profit_pct_from_margin(position: &Position) -> f64 {
        if position.margin <= 0.0 {
            return 0.0;
        }
        position.unrealized_pnl / position.margin * 100.0
    }

    // -------------------------------------------------------------------------
    // Analysis
    // -------------------------------------------------------------------------

    /// Analyze one position. `metadata` is a working copy: TP / holding
    /// extensions are recorded on it and the caller persists the changes.
    pub fn analyze(
        &self,
        position: &Position,
        metadata: &mut PositionMetadata,
        snapshot: &MarketSnapshot,
        now: DateTime<Utc>,
    ) -> ExitDecision {
        let symbol = &position.symbol;
        let regime = if metadata.regime == Regime::Unknown {
            snapshot.regime
        } else {
            metadata.regime
        };
        let current_price = match snapshot.current_price() {
            Some(p) if p > 0.0 => p,
            _ => return ExitDecision::Hold,
        };

        let age = metadata.age_seconds(now);
        let min_holding = metadata
            .min_holding_seconds
            .or_else(|| {
                self.config
                    .resolve(symbol, regime, |p| p.min_holding_minutes)
                    .map(|m| m * 60.0)
            })
            .unwrap_or(0.0);

        let pnl_from_margin = Self::profit_pct_from_margin(position);
        let net_pnl_usd = position.unrealized_pnl
            - self.commission_usd(position.entry_price, current_price, position.size_coins);

        // ── 1. Emergency loss protection ─────────────────────────────────
        let exits = &self.config.exits;
        if pnl_from_margin <= -exits.max_emergency_loss_percent
            && age >= exits.emergency_min_age_seconds
        {
            info!(
                symbol,
                pnl_from_margin,
                limit = -exits.max_emergency_loss_percent,
                "emergency loss protection"
            );
            return ExitDecision::Close {
                reason: ExitReason::EmergencyLossProtection,
            };
        }

        // ── 2. Profit Harvest (strictly per-regime parameters) ───────────
        let regime_params = self.config.adaptive_regime.regimes.get(&regime);
        if let Some(rp) = regime_params {
            if let (Some(threshold), Some(time_limit)) =
                (rp.ph_threshold_usd, rp.ph_time_limit_seconds)
            {
                if net_pnl_usd >= threshold && age < time_limit {
                    if age >= min_holding {
                        info!(symbol, net_pnl_usd, threshold, "profit harvest");
                        return ExitDecision::Close {
                            reason: ExitReason::ProfitHarvest,
                        };
                    }
                    debug!(symbol, age, min_holding, "profit_harvest blocked by min holding");
                }
            }
        }

        // ── 3. Adaptive take-profit ──────────────────────────────────────
        if let Some(decision) =
            self.check_take_profit(position, metadata, snapshot, regime, age, min_holding, pnl_from_margin)
        {
            return decision;
        }

        // ── 4. Big-profit trailing exit ──────────────────────────────────
        if let Some(decision) = self.check_big_profit(
            symbol,
            regime,
            snapshot.indicators.adx_14,
            net_pnl_usd,
            age,
            min_holding,
            now,
        ) {
            return decision;
        }

        // ── 5. Partial take-profit (once per position) ───────────────────
        if !metadata.partial_tp_done {
            if let (Some(trigger), Some(fraction)) = (
                self.config
                    .resolve(symbol, regime, |p| p.partial_tp_trigger_percent),
                self.config
                    .resolve(symbol, regime, |p| p.partial_tp_fraction),
            ) {
                let partial_min_holding = self
                    .config
                    .resolve(symbol, regime, |p| p.partial_tp_min_holding_seconds)
                    .unwrap_or(min_holding);
                if pnl_from_margin >= trigger {
                    if age >= partial_min_holding {
                        info!(symbol, pnl_from_margin, trigger, fraction, "partial take-profit");
                        return ExitDecision::PartialClose {
                            fraction,
                            reason: ExitReason::PartialTp,
                        };
                    }
                    debug!(symbol, age, partial_min_holding, "partial_tp blocked by min holding");
                }
            }
        }

        // ── 6. Smart indicator filter ────────────────────────────────────
        if self.config.exits.smart_exit_enabled {
            match smart::evaluate(position.side, &snapshot.indicators) {
                SmartVerdict::Close => {
                    if age >= min_holding {
                        info!(symbol, "smart indicator exit");
                        return ExitDecision::Close {
                            reason: ExitReason::SmartIndicatorFilter,
                        };
                    }
                    debug!(symbol, age, min_holding, "smart_indicator_filter blocked by min holding");
                }
                SmartVerdict::Block => {
                    // Trend continuation: suppress the less reliable
                    // time-based exit for this tick.
                    debug!(symbol, "smart filter blocks time-based exit");
                    return ExitDecision::Hold;
                }
                SmartVerdict::Neutral => {}
            }
        }

        // ── 7. Time-based exit ───────────────────────────────────────────
        self.check_time_exit(position, metadata, regime, age, pnl_from_margin)
    }

    // -------------------------------------------------------------------------
    // Take-profit
    // -------------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn check_take_profit(
        &self,
        position: &Position,
        metadata: &mut PositionMetadata,
        snapshot: &MarketSnapshot,
        regime: Regime,
        age: f64,
        min_holding: f64,
        pnl_from_margin: f64,
    ) -> Option<ExitDecision> {
        let symbol = &position.symbol;

        // Extended threshold (prior extend_tp) wins, then metadata, then the
        // adaptive chain.
        let mut tp_percent = metadata
            .extended_tp_percent
            .or(metadata.tp_percent)
            .or_else(|| self.config.resolve(symbol, regime, |p| p.tp_percent))?;

        // Optional ATR-derived target (price ATR% scaled to margin).
        if let Some(mult) = self.config.resolve(symbol, regime, |p| p.tp_atr_multiplier) {
            if let Some(atr_pct) = snapshot.indicators.atr_pct_14 {
                if metadata.extended_tp_percent.is_none() {
                    let atr_tp = atr_pct * mult * self.config.leverage() as f64;
                    if atr_tp > 0.0 {
                        tp_percent = atr_tp;
                    }
                }
            }
        }

        // Cover commission, slippage and the safety buffer.
        let effective_trigger = tp_percent
            + self.commission_pct_from_margin()
            + self.config.exits.slippage_buffer_percent;

        if pnl_from_margin < effective_trigger {
            return None;
        }
        if age < min_holding {
            debug!(symbol, age, min_holding, "tp blocked by min holding");
            return None;
        }

        // Strong trend: raise the bar instead of closing.
        let min_trend = self
            .config
            .resolve(symbol, regime, |p| p.min_trend_strength);
        let strong_trend = matches!(
            (regime, min_trend, snapshot.indicators.adx_14),
            (Regime::Trending, Some(min), Some(adx)) if adx >= min
        );
        if strong_trend {
            let step = self
                .config
                .resolve(symbol, regime, |p| p.tp_extension_step)
                .unwrap_or(0.5);
            let cap = self
                .config
                .resolve(symbol, regime, |p| p.max_tp_percent)
                .unwrap_or(tp_percent);
            let new_tp = (tp_percent + step).min(cap);
            if new_tp > tp_percent {
                metadata.extended_tp_percent = Some(new_tp);
                info!(symbol, old_tp = tp_percent, new_tp, "TP extended in strong trend");
                return Some(ExitDecision::ExtendTp {
                    new_tp_percent: new_tp,
                });
            }
        }

        info!(symbol, pnl_from_margin, effective_trigger, "take-profit");
        Some(ExitDecision::Close {
            reason: ExitReason::Tp,
        })
    }

    // -------------------------------------------------------------------------
    // Big-profit trailing
    // -------------------------------------------------------------------------

    /// Big-profit trailing check over the shared 5-minute net-PnL high.
    /// Also called by the position manager's defensive tick, so both paths
    /// ratchet the same high-water mark.
    #[allow(clippy::too_many_arguments)]
    pub fn check_big_profit(
        &self,
        symbol: &str,
        regime: Regime,
        adx: Option<f64>,
        net_pnl_usd: f64,
        age: f64,
        min_holding: f64,
        now: DateTime<Utc>,
    ) -> Option<ExitDecision> {
        let threshold = self
            .config
            .resolve(symbol, regime, |p| p.big_profit_threshold_usd)?;

        // Track the trailing high over the window even below the threshold.
        let high = {
            let mut history = self.pnl_history.write();
            let entry = history.entry(symbol.to_string()).or_default();
            entry.push_back((now, net_pnl_usd));
            let cutoff = now - Duration::seconds(BIG_PROFIT_WINDOW_SECS);
            while entry.front().is_some_and(|(t, _)| *t < cutoff) {
                entry.pop_front();
            }
            entry
                .iter()
                .map(|(_, pnl)| *pnl)
                .fold(f64::NEG_INFINITY, f64::max)
        };

        if net_pnl_usd < threshold || high <= 0.0 {
            return None;
        }

        let min_trend = self.config.resolve(symbol, regime, |p| p.min_trend_strength);
        let strong_trend = matches!(
            (min_trend, adx),
            (Some(min), Some(adx)) if adx >= min
        );
        let trailing_pct = if strong_trend {
            self.config
                .resolve(symbol, regime, |p| p.big_profit_strong_trend_trailing_pct)
                .unwrap_or(40.0)
        } else {
            self.config
                .resolve(symbol, regime, |p| p.big_profit_trailing_pct)
                .unwrap_or(30.0)
        };

        let drawdown_pct = (high - net_pnl_usd) / high * 100.0;
        if drawdown_pct < trailing_pct {
            return None;
        }
        if age < min_holding {
            debug!(symbol, age, min_holding, "big_profit_exit blocked by min holding");
            return None;
        }

        info!(symbol, net_pnl_usd, high, drawdown_pct, "big-profit trailing exit");
        Some(ExitDecision::Close {
            reason: ExitReason::BigProfitExit,
        })
    }

    // -------------------------------------------------------------------------
    // Time-based exit
    // -------------------------------------------------------------------------

    fn check_time_exit(
        &self,
        position: &Position,
        metadata: &mut PositionMetadata,
        regime: Regime,
        age: f64,
        pnl_from_margin: f64,
    ) -> ExitDecision {
        let symbol = &position.symbol;
        let original_max = match self
            .config
            .resolve(symbol, regime, |p| p.max_holding_minutes)
        {
            Some(m) => m,
            None => return ExitDecision::Hold,
        };
        let effective_max = metadata.extended_max_holding_minutes.unwrap_or(original_max);

        if age < effective_max * 60.0 {
            return ExitDecision::Hold;
        }

        // One profitable extension before the clock runs out for good.
        let min_profit_for_extension = self
            .config
            .resolve(symbol, regime, |p| p.min_profit_for_extension)
            .unwrap_or(f64::INFINITY);
        if metadata.extended_max_holding_minutes.is_none()
            && pnl_from_margin > min_profit_for_extension
        {
            let extension_pct = self
                .config
                .resolve(symbol, regime, |p| p.holding_extension_percent)
                .unwrap_or(50.0);
            let extended = original_max + extension_pct / 100.0 * original_max;
            metadata.extended_max_holding_minutes = Some(extended);
            info!(symbol, original_max, extended, "max holding extended on profit");
            return ExitDecision::Hold;
        }

        // Let the trailing stop manage a position that still has real profit.
        let min_profit_to_close = self
            .config
            .resolve(symbol, regime, |p| p.min_profit_to_close)
            .unwrap_or(0.1);
        if pnl_from_margin > min_profit_to_close {
            return ExitDecision::Hold;
        }

        // Never close losers by time: only SL / loss-cut / TSL may do that.
        if pnl_from_margin <= 0.0 {
            return ExitDecision::Hold;
        }

        info!(symbol, age_minutes = age / 60.0, effective_max, "max holding time exit");
        ExitDecision::Close {
            reason: ExitReason::MaxHoldingTime,
        }
    }
}
