// =============================================================================
// Shared types used across the Meridian trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Direction of a position or entry order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1.0 for long, -1.0 for short. Multiplies price deltas into PnL.
    pub fn dir(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    /// The order side string the exchange expects ("buy" / "sell").
    pub fn order_side(self) -> &'static str {
        match self {
            Self::Long => "buy",
            Self::Short => "sell",
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }

    /// Parse the exchange's `posSide` field; falls back to the sign of `pos`.
    pub fn from_pos_side(pos_side: &str, pos: f64) -> Self {
        match pos_side.to_ascii_lowercase().as_str() {
            "long" => Self::Long,
            "short" => Self::Short,
            _ => {
                if pos >= 0.0 {
                    Self::Long
                } else {
                    Self::Short
                }
            }
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

/// Market regime classification. Drives most adaptive parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Regime {
    Trending,
    Ranging,
    Choppy,
    Unknown,
}

impl Regime {
    /// Key used for per-regime configuration sections.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trending => "trending",
            Self::Ranging => "ranging",
            Self::Choppy => "choppy",
            Self::Unknown => "unknown",
        }
    }
}

impl Default for Regime {
    fn default() -> Self {
        Self::Unknown
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Account size bucket derived from equity via monotonic thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BalanceProfile {
    Small,
    Medium,
    Large,
}

impl BalanceProfile {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }
}

impl Default for BalanceProfile {
    fn default() -> Self {
        Self::Small
    }
}

impl std::fmt::Display for BalanceProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a position was (fully or partially) closed. Serialized into the trade
/// journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Tp,
    Sl,
    TrailingStop,
    LossCut,
    Timeout,
    MaxHoldingTime,
    ProfitHarvest,
    BigProfitExit,
    EmergencyLossProtection,
    SmartIndicatorFilter,
    PartialTp,
    Manual,
    OppositePositionOnLoad,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tp => "tp",
            Self::Sl => "sl",
            Self::TrailingStop => "trailing_stop",
            Self::LossCut => "loss_cut",
            Self::Timeout => "timeout",
            Self::MaxHoldingTime => "max_holding_time",
            Self::ProfitHarvest => "profit_harvest",
            Self::BigProfitExit => "big_profit_exit",
            Self::EmergencyLossProtection => "emergency_loss_protection",
            Self::SmartIndicatorFilter => "smart_indicator_filter",
            Self::PartialTp => "partial_tp",
            Self::Manual => "manual",
            Self::OppositePositionOnLoad => "opposite_position_on_load",
        }
    }

    /// Exit paths allowed to fire before `min_holding_seconds` has elapsed.
    pub fn ignores_min_holding(self) -> bool {
        matches!(
            self,
            Self::EmergencyLossProtection | Self::LossCut | Self::Timeout
        )
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Candle timeframe. Each timeframe carries its own ring-buffer budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    H1,
    D1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 4] = [Self::M1, Self::M5, Self::H1, Self::D1];

    /// Channel suffix understood by the exchange ("1m", "5m", "1H", "1D").
    pub fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::H1 => "1H",
            Self::D1 => "1D",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "1m" => Some(Self::M1),
            "5m" => Some(Self::M5),
            "1H" | "1h" => Some(Self::H1),
            "1D" | "1d" => Some(Self::D1),
            _ => None,
        }
    }

    /// Ring-buffer capacity per (symbol, timeframe).
    pub fn max_candles(self) -> usize {
        match self {
            Self::M1 => 200,
            Self::M5 => 200,
            Self::H1 => 100,
            Self::D1 => 10,
        }
    }

    pub fn seconds(self) -> i64 {
        match self {
            Self::M1 => 60,
            Self::M5 => 300,
            Self::H1 => 3_600,
            Self::D1 => 86_400,
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest ticker snapshot for a symbol. Overwritten on every update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last: f64,
    #[serde(default)]
    pub best_bid: f64,
    #[serde(default)]
    pub best_ask: f64,
    #[serde(default)]
    pub mark: f64,
    /// Unix milliseconds at ingestion.
    pub timestamp_ms: i64,
}

impl Ticker {
    /// Mid price when both sides of the book are known, else last.
    pub fn mid(&self) -> f64 {
        if self.best_bid > 0.0 && self.best_ask > 0.0 {
            (self.best_bid + self.best_ask) / 2.0
        } else {
            self.last
        }
    }
}

/// Account equity snapshot (USDT).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub equity: f64,
    pub profile: BalanceProfile,
}

/// Account margin snapshot. Invariant: `used + available == total`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MarginSnapshot {
    pub used: f64,
    pub available: f64,
    pub total: f64,
}

/// Immutable per-symbol contract parameters, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolSpec {
    pub symbol: String,
    /// Coins per contract. `coins = contracts * ct_val`.
    pub ct_val: f64,
    /// Minimum order size in contracts.
    pub min_size: f64,
    /// Price tick.
    pub tick_size: f64,
    /// Size step (lot size) in contracts.
    pub lot_size: f64,
    pub leverage: u32,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_direction_and_opposite() {
        assert_eq!(Side::Long.dir(), 1.0);
        assert_eq!(Side::Short.dir(), -1.0);
        assert_eq!(Side::Long.opposite(), Side::Short);
        assert_eq!(Side::Long.order_side(), "buy");
    }

    #[test]
    fn side_from_pos_side_falls_back_to_sign() {
        assert_eq!(Side::from_pos_side("long", -3.0), Side::Long);
        assert_eq!(Side::from_pos_side("", -3.0), Side::Short);
        assert_eq!(Side::from_pos_side("net", 1.0), Side::Long);
    }

    #[test]
    fn exit_reason_strings_match_journal_vocabulary() {
        assert_eq!(ExitReason::TrailingStop.as_str(), "trailing_stop");
        assert_eq!(ExitReason::ProfitHarvest.as_str(), "profit_harvest");
        assert_eq!(
            ExitReason::OppositePositionOnLoad.as_str(),
            "opposite_position_on_load"
        );
    }

    #[test]
    fn min_holding_exemptions() {
        assert!(ExitReason::LossCut.ignores_min_holding());
        assert!(ExitReason::Timeout.ignores_min_holding());
        assert!(!ExitReason::Tp.ignores_min_holding());
        assert!(!ExitReason::TrailingStop.ignores_min_holding());
    }

    #[test]
    fn timeframe_buffer_budgets() {
        assert_eq!(Timeframe::M1.max_candles(), 200);
        assert_eq!(Timeframe::H1.max_candles(), 100);
        assert_eq!(Timeframe::D1.max_candles(), 10);
        assert_eq!(Timeframe::from_str_opt("1H"), Some(Timeframe::H1));
        assert_eq!(Timeframe::from_str_opt("3m"), None);
    }

    #[test]
    fn ticker_mid_prefers_book() {
        let t = Ticker {
            symbol: "BTC-USDT".into(),
            last: 100.0,
            best_bid: 99.0,
            best_ask: 101.0,
            mark: 100.0,
            timestamp_ms: 0,
        };
        assert!((t.mid() - 100.0).abs() < f64::EPSILON);

        let t2 = Ticker { best_bid: 0.0, ..t };
        assert!((t2.mid() - 100.0).abs() < f64::EPSILON);
    }
}
