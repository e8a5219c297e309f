// =============================================================================
// Margin Calculator — isolated-margin safety checks
// =============================================================================
//
// For each position:
//   available_margin = equity - margin_used + pnl
//   margin_ratio     = available_margin / margin_used
//
// Corrective fallbacks, applied in order:
//   (a) brand-new positions (< 30 s old) read as ratio 2.0 — the exchange's
//       own fields lag right after a fill;
//   (b) small positions (margin_used < 50 USDT) use the equity-based
//       recomputation `equity / margin_used`;
//   (c) a negative ratio paired with a small PnL is treated as a reporting
//       glitch: recompute `equity / margin_used`, and clamp to 1.0 when the
//       recomputed value is still below 0.5.
//
// A position is safe iff `margin_ratio >= safety_threshold[regime]`; the
// threshold comes from configuration with no hardcoded default.

use serde::Serialize;
use tracing::{debug, warn};

use crate::types::Side;

/// Age below which the exchange's margin fields are not yet trustworthy.
const FRESH_POSITION_AGE_SECS: f64 = 30.0;
/// Neutral ratio assigned to brand-new positions.
const FRESH_POSITION_RATIO: f64 = 2.0;
/// Positions with less margin than this use the equity-based recomputation.
const SMALL_POSITION_MARGIN_USDT: f64 = 50.0;
/// |pnl| below this fraction of margin marks a negative ratio as suspect.
const SMALL_PNL_FRACTION: f64 = 0.10;
/// Floor under which the protective recomputation clamps to 1.0.
const PROTECTIVE_CLAMP_FLOOR: f64 = 0.5;

/// Emergency-close gating (false-trigger protection).
const EMERGENCY_MIN_AGE_SECS: f64 = 30.0;
const EMERGENCY_MIN_LOSS_FRACTION: f64 = 0.02;
const EMERGENCY_RATIO_CEILING: f64 = 1.2;

/// Tagged outcome of a margin safety check. The policy function maps the tag
/// to an action instead of raising.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MarginSafetyResult {
    Safe {
        ratio: f64,
    },
    /// The raw numbers look unsafe but match a known false-trigger pattern;
    /// no action should be taken this tick.
    SuspectFalseTrigger {
        reason: &'static str,
        ratio: f64,
    },
    Unsafe {
        ratio: f64,
    },
}

impl MarginSafetyResult {
    pub fn is_safe(&self) -> bool {
        !matches!(self, Self::Unsafe { .. })
    }

    pub fn ratio(&self) -> f64 {
        match self {
            Self::Safe { ratio } | Self::SuspectFalseTrigger { ratio, .. } | Self::Unsafe { ratio } => {
                *ratio
            }
        }
    }
}

/// Margin calculator for isolated-margin futures.
#[derive(Debug, Clone)]
pub struct MarginCalculator {
    pub maintenance_margin_ratio: f64,
    pub initial_margin_ratio: f64,
}

impl MarginCalculator {
    pub fn new(maintenance_margin_ratio: f64, initial_margin_ratio: f64) -> Self {
        Self {
            maintenance_margin_ratio,
            initial_margin_ratio,
        }
    }

    // -------------------------------------------------------------------------
    // Ratio computation
    // -------------------------------------------------------------------------

    /// Compute the margin ratio with all corrective fallbacks applied.
    pub fn margin_ratio(
        &self,
        equity: f64,
        margin_used: f64,
        pnl: f64,
        position_age_secs: f64,
    ) -> f64 {
        if margin_used <= 0.0 {
            return f64::INFINITY;
        }

        // (a) Fresh position: exchange fields lag the fill.
        if position_age_secs < FRESH_POSITION_AGE_SECS {
            return FRESH_POSITION_RATIO;
        }

        // (b) Small position: per-position equity is noisy at this scale.
        if margin_used < SMALL_POSITION_MARGIN_USDT {
            return equity / margin_used;
        }

        let available = equity - margin_used + pnl;
        let ratio = available / margin_used;

        // (c) Negative ratio with small PnL: reporting glitch, recompute.
        if ratio < 0.0 && pnl.abs() < margin_used * SMALL_PNL_FRACTION {
            let recomputed = equity / margin_used;
            if recomputed < PROTECTIVE_CLAMP_FLOOR {
                warn!(
                    equity,
                    margin_used,
                    pnl,
                    recomputed,
                    "protective margin recompute still low, clamping to 1.0"
                );
                return 1.0;
            }
            return recomputed;
        }

        ratio
    }

    /// Full safety evaluation against the regime's configured threshold.
    pub fn check_position_safety(
        &self,
        equity: f64,
        margin_used: f64,
        pnl: f64,
        position_age_secs: f64,
        safety_threshold: f64,
    ) -> MarginSafetyResult {
        let ratio = self.margin_ratio(equity, margin_used, pnl, position_age_secs);

        if position_age_secs < FRESH_POSITION_AGE_SECS {
            return MarginSafetyResult::SuspectFalseTrigger {
                reason: "position_younger_than_30s",
                ratio,
            };
        }

        if ratio >= safety_threshold {
            MarginSafetyResult::Safe { ratio }
        } else {
            debug!(ratio, safety_threshold, "position below margin safety threshold");
            MarginSafetyResult::Unsafe { ratio }
        }
    }

    /// False-trigger protection: an emergency close by the position manager
    /// requires all three conditions.
    pub fn emergency_close_allowed(
        &self,
        position_age_secs: f64,
        unrealized_pnl: f64,
        margin_used: f64,
        margin_ratio: f64,
    ) -> bool {
        if margin_used <= 0.0 {
            return false;
        }
        position_age_secs >= EMERGENCY_MIN_AGE_SECS
            && (unrealized_pnl.abs() / margin_used) >= EMERGENCY_MIN_LOSS_FRACTION
            && margin_ratio > 0.0
            && margin_ratio < EMERGENCY_RATIO_CEILING
    }

    // -------------------------------------------------------------------------
    // Sizing helpers
    // -------------------------------------------------------------------------

    /// Maximum position size in coins for the given equity and leverage.
    pub fn max_position_size(&self, equity: f64, price: f64, leverage: u32) -> f64 {
        if price <= 0.0 {
            return 0.0;
        }
        equity * leverage as f64 / price
    }

    /// Estimated liquidation price for an isolated position.
    pub fn liquidation_price(&self, side: Side, entry_price: f64, leverage: u32) -> f64 {
        let lev = leverage.max(1) as f64;
        match side {
            Side::Long => entry_price * (1.0 - 1.0 / lev + self.maintenance_margin_ratio),
            Side::Short => entry_price * (1.0 + 1.0 / lev - self.maintenance_margin_ratio),
        }
    }
}
