// =============================================================================
// Configuration — single typed YAML tree with startup validation
// =============================================================================
//
// Every tunable lives here. Loading never panics: missing required keys are
// reported with the exact YAML path so the operator can fix the file, and the
// process exits with code 1.
//
// Adaptive parameter resolution follows a fixed priority chain:
//   symbol_profiles[symbol].regimes[regime]  (per-symbol x per-regime)
//   symbol_profiles[symbol]                  (per-symbol)
//   adaptive_regime.regimes[regime]          (per-regime)
//   scalping                                 (global)
// implemented as the pure function `Config::resolve`.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::EngineError;
use crate::types::{BalanceProfile, Regime};

// =============================================================================
// Adaptive parameters
// =============================================================================

/// The full set of parameters that may be overridden per symbol, per regime,
/// or both. Every field is optional; `Config::resolve` walks the priority
/// chain and the caller decides whether a hard fallback is allowed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdaptiveParams {
    // --- Entry / exit thresholds --------------------------------------------
    pub tp_percent: Option<f64>,
    pub sl_percent: Option<f64>,
    pub tp_atr_multiplier: Option<f64>,
    pub min_holding_minutes: Option<f64>,
    pub entry_offset_pct: Option<f64>,
    pub size_multiplier: Option<f64>,
    pub risk_per_trade_percent: Option<f64>,

    // --- Trailing stop -------------------------------------------------------
    pub trailing_percent: Option<f64>,
    pub min_profit_to_close: Option<f64>,
    pub loss_cut_percent: Option<f64>,
    pub timeout_minutes: Option<f64>,
    pub extend_time_on_profit: Option<bool>,
    pub extend_time_multiplier: Option<f64>,

    // --- Margin safety -------------------------------------------------------
    pub safety_threshold: Option<f64>,

    // --- Emergency stop ------------------------------------------------------
    pub max_drawdown_percent: Option<f64>,
    pub min_lock_minutes: Option<f64>,

    // --- Profit harvest ------------------------------------------------------
    pub ph_threshold_usd: Option<f64>,
    pub ph_time_limit_seconds: Option<f64>,

    // --- Partial take-profit -------------------------------------------------
    pub partial_tp_trigger_percent: Option<f64>,
    pub partial_tp_fraction: Option<f64>,
    pub partial_tp_limit_offset_bps: Option<f64>,
    pub partial_tp_min_holding_seconds: Option<f64>,

    // --- Time-based exit -----------------------------------------------------
    pub max_holding_minutes: Option<f64>,
    pub min_profit_for_extension: Option<f64>,
    pub holding_extension_percent: Option<f64>,

    // --- TP extension in strong trends ---------------------------------------
    pub min_trend_strength: Option<f64>,
    pub tp_extension_step: Option<f64>,
    pub max_tp_percent: Option<f64>,

    // --- Big-profit trailing exit --------------------------------------------
    pub big_profit_threshold_usd: Option<f64>,
    pub big_profit_trailing_pct: Option<f64>,
    pub big_profit_strong_trend_trailing_pct: Option<f64>,

    // --- Position sync -------------------------------------------------------
    pub sync_interval_multiplier: Option<f64>,
}

// =============================================================================
// Section structs
// =============================================================================

fn default_rest_url() -> String {
    "https://www.okx.com".to_string()
}

fn default_ws_public() -> String {
    "wss://ws.okx.com:8443/ws/v5/public".to_string()
}

fn default_ws_private() -> String {
    "wss://ws.okx.com:8443/ws/v5/private".to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_api_request_delay_ms() -> u64 {
    200
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default = "default_rest_url")]
    pub rest_url: String,
    #[serde(default = "default_ws_public")]
    pub ws_public_url: String,
    #[serde(default = "default_ws_private")]
    pub ws_private_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Floor between REST price fallbacks while the WS is stale.
    #[serde(default = "default_api_request_delay_ms")]
    pub api_request_delay_ms: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            rest_url: default_rest_url(),
            ws_public_url: default_ws_public(),
            ws_private_url: default_ws_private(),
            request_timeout_secs: default_request_timeout_secs(),
            api_request_delay_ms: default_api_request_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommissionConfig {
    pub maker_fee_rate: Option<f64>,
    pub taker_fee_rate: Option<f64>,
    /// Single-rate shorthand; used for both sides when the split rates are
    /// absent.
    pub trading_fee_rate: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarginConfig {
    pub maintenance_margin_ratio: Option<f64>,
    pub initial_margin_ratio: Option<f64>,
    #[serde(default)]
    pub by_regime: HashMap<Regime, AdaptiveParams>,
}

/// Per-balance-profile sizing parameters. All required.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileConfig {
    #[serde(default)]
    pub min_balance: f64,
    /// Upper bound of the progressive sizing band; `0` means unbounded.
    #[serde(default)]
    pub max_balance: f64,
    pub base_position_usd: Option<f64>,
    pub min_position_usd: Option<f64>,
    pub max_position_usd: Option<f64>,
    pub max_open_positions: Option<u32>,
    /// Per-position notional cap as a percentage of equity.
    pub max_position_percent: Option<f64>,
    /// Progressive-linear sizing endpoints; when present they replace
    /// `base_position_usd` over `[min_balance, max_balance]`.
    pub size_at_min: Option<f64>,
    pub size_at_max: Option<f64>,
    /// Scale-in cap for `scaling_history` (hard cap 4).
    #[serde(default = "default_max_additions")]
    pub max_additions: u32,
}

fn default_max_additions() -> u32 {
    2
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfilesConfig {
    #[serde(default)]
    pub small: ProfileConfig,
    #[serde(default)]
    pub medium: ProfileConfig,
    #[serde(default)]
    pub large: ProfileConfig,
}

impl ProfilesConfig {
    pub fn get(&self, profile: BalanceProfile) -> &ProfileConfig {
        match profile {
            BalanceProfile::Small => &self.small,
            BalanceProfile::Medium => &self.medium,
            BalanceProfile::Large => &self.large,
        }
    }
}

fn default_max_total_size_usd() -> f64 {
    10_000.0
}

fn default_max_single_size_usd() -> f64 {
    2_000.0
}

fn default_max_positions() -> u32 {
    5
}

/// Hard notional caps enforced by the MaxSizeLimiter on top of profile
/// sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_total_size_usd")]
    pub max_total_size_usd: f64,
    #[serde(default = "default_max_single_size_usd")]
    pub max_single_size_usd: f64,
    #[serde(default = "default_max_positions")]
    pub max_positions: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_total_size_usd: default_max_total_size_usd(),
            max_single_size_usd: default_max_single_size_usd(),
            max_positions: default_max_positions(),
        }
    }
}

fn default_check_interval_secs() -> f64 {
    5.0
}

fn default_signal_cooldown_seconds() -> f64 {
    60.0
}

fn default_entry_window_seconds() -> f64 {
    90.0
}

fn default_order_type() -> String {
    "limit".to_string()
}

fn default_true() -> bool {
    true
}

/// Global scalping section. Carries the bottom level of the adaptive chain
/// plus engine cadence knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalpingConfig {
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: f64,
    #[serde(default = "default_signal_cooldown_seconds")]
    pub signal_cooldown_seconds: f64,
    /// How long the entry order may sit unfilled before the entry aborts.
    #[serde(default = "default_entry_window_seconds")]
    pub entry_window_seconds: f64,
    #[serde(default = "default_order_type")]
    pub order_type: String,
    #[serde(default = "default_true")]
    pub post_only: bool,
    pub base_risk_percentage: Option<f64>,
    #[serde(flatten)]
    pub params: AdaptiveParams,
}

impl Default for ScalpingConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            signal_cooldown_seconds: default_signal_cooldown_seconds(),
            entry_window_seconds: default_entry_window_seconds(),
            order_type: default_order_type(),
            post_only: true,
            base_risk_percentage: None,
            params: AdaptiveParams::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskConfig {
    pub risk_per_trade_percent: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdaptiveRegimeConfig {
    #[serde(default)]
    pub regimes: HashMap<Regime, AdaptiveParams>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymbolProfileConfig {
    #[serde(flatten)]
    pub params: AdaptiveParams,
    #[serde(default)]
    pub regimes: HashMap<Regime, AdaptiveParams>,
}

fn default_max_wait_seconds() -> f64 {
    60.0
}

fn default_drift_cancel_threshold_pct() -> f64 {
    0.1
}

fn default_reprice_threshold_pct() -> f64 {
    0.2
}

fn default_amend_throttle_secs() -> f64 {
    2.0
}

fn default_post_only_offset_pct() -> f64 {
    0.01
}

fn default_post_only_stuck_secs() -> f64 {
    5.0
}

fn default_market_replace_budget() -> u32 {
    2
}

fn default_reentry_block_minutes() -> f64 {
    2.0
}

fn default_sweep_interval_secs() -> f64 {
    5.0
}

fn default_adverse_move_cancel_pct() -> f64 {
    0.5
}

fn default_cancel_rate_warn_threshold() -> u32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrdersConfig {
    #[serde(default = "default_max_wait_seconds")]
    pub max_wait_seconds: f64,
    #[serde(default = "default_drift_cancel_threshold_pct")]
    pub drift_cancel_threshold_pct: f64,
    #[serde(default = "default_reprice_threshold_pct")]
    pub reprice_threshold_pct: f64,
    #[serde(default = "default_amend_throttle_secs")]
    pub amend_throttle_secs: f64,
    /// Offset from best bid/ask used when repricing a post-only order.
    #[serde(default = "default_post_only_offset_pct")]
    pub post_only_offset_pct: f64,
    #[serde(default = "default_post_only_stuck_secs")]
    pub post_only_stuck_secs: f64,
    /// Precedence between the post-only-stuck replacement and the
    /// drift-cancel exclusion when both apply.
    #[serde(default = "default_true")]
    pub post_only_stuck_wins: bool,
    #[serde(default = "default_true")]
    pub replace_with_market: bool,
    /// Consecutive market replacements allowed per symbol.
    #[serde(default = "default_market_replace_budget")]
    pub market_replace_budget: u32,
    #[serde(default = "default_reentry_block_minutes")]
    pub reentry_block_minutes: f64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: f64,
    /// Market moved this far against a timed-out order => cancel even if the
    /// originating signal is still live.
    #[serde(default = "default_adverse_move_cancel_pct")]
    pub adverse_move_cancel_pct: f64,
    #[serde(default = "default_cancel_rate_warn_threshold")]
    pub cancel_rate_warn_threshold: u32,
}

impl Default for OrdersConfig {
    fn default() -> Self {
        Self {
            max_wait_seconds: default_max_wait_seconds(),
            drift_cancel_threshold_pct: default_drift_cancel_threshold_pct(),
            reprice_threshold_pct: default_reprice_threshold_pct(),
            amend_throttle_secs: default_amend_throttle_secs(),
            post_only_offset_pct: default_post_only_offset_pct(),
            post_only_stuck_secs: default_post_only_stuck_secs(),
            post_only_stuck_wins: true,
            replace_with_market: true,
            market_replace_budget: default_market_replace_budget(),
            reentry_block_minutes: default_reentry_block_minutes(),
            sweep_interval_secs: default_sweep_interval_secs(),
            adverse_move_cancel_pct: default_adverse_move_cancel_pct(),
            cancel_rate_warn_threshold: default_cancel_rate_warn_threshold(),
        }
    }
}

fn default_max_emergency_loss_percent() -> f64 {
    15.0
}

fn default_emergency_min_age_seconds() -> f64 {
    30.0
}

fn default_unlock_threshold_percent() -> f64 {
    70.0
}

fn default_slippage_buffer_percent() -> f64 {
    0.15
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitsConfig {
    /// Loss from margin at which the emergency-loss exit fires regardless of
    /// min-holding.
    #[serde(default = "default_max_emergency_loss_percent")]
    pub max_emergency_loss_percent: f64,
    #[serde(default = "default_emergency_min_age_seconds")]
    pub emergency_min_age_seconds: f64,
    /// Added on top of the TP threshold together with the round-trip
    /// commission.
    #[serde(default = "default_slippage_buffer_percent")]
    pub slippage_buffer_percent: f64,
    #[serde(default = "default_true")]
    pub smart_exit_enabled: bool,
}

impl Default for ExitsConfig {
    fn default() -> Self {
        Self {
            max_emergency_loss_percent: default_max_emergency_loss_percent(),
            emergency_min_age_seconds: default_emergency_min_age_seconds(),
            slippage_buffer_percent: default_slippage_buffer_percent(),
            smart_exit_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyStopConfig {
    #[serde(default = "default_unlock_threshold_percent")]
    pub unlock_threshold_percent: f64,
}

impl Default for EmergencyStopConfig {
    fn default() -> Self {
        Self {
            unlock_threshold_percent: default_unlock_threshold_percent(),
        }
    }
}

fn default_positions_sync_interval_minutes() -> f64 {
    5.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_positions_sync_interval_minutes")]
    pub positions_sync_interval_minutes: f64,
    #[serde(default)]
    pub allow_concurrent_positions: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            positions_sync_interval_minutes: default_positions_sync_interval_minutes(),
            allow_concurrent_positions: false,
        }
    }
}

fn default_heartbeat_secs() -> u64 {
    22
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_backoff_base_secs() -> u64 {
    5
}

fn default_backoff_cap_secs() -> u64 {
    300
}

fn default_ws_stale_seconds() -> f64 {
    30.0
}

fn default_dedup_ttl_secs() -> u64 {
    300
}

fn default_dedup_capacity() -> usize {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebsocketConfig {
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
    #[serde(default = "default_ws_stale_seconds")]
    pub ws_stale_seconds: f64,
    #[serde(default = "default_dedup_ttl_secs")]
    pub dedup_ttl_secs: u64,
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
}

impl Default for WebsocketConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat_secs(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_cap_secs: default_backoff_cap_secs(),
            ws_stale_seconds: default_ws_stale_seconds(),
            dedup_ttl_secs: default_dedup_ttl_secs(),
            dedup_capacity: default_dedup_capacity(),
        }
    }
}

fn default_trades_csv() -> String {
    "trades.csv".to_string()
}

fn default_events_jsonl() -> String {
    "events.jsonl".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalConfig {
    #[serde(default = "default_trades_csv")]
    pub trades_csv: String,
    #[serde(default = "default_events_jsonl")]
    pub events_jsonl: String,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            trades_csv: default_trades_csv(),
            events_jsonl: default_events_jsonl(),
        }
    }
}

// =============================================================================
// Top-level config
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub symbols: Vec<String>,
    /// Required. Applied to every symbol at startup via `set_leverage`.
    pub leverage: Option<u32>,
    #[serde(default)]
    pub commission: CommissionConfig,
    #[serde(default)]
    pub margin: MarginConfig,
    #[serde(default)]
    pub profiles: ProfilesConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub scalping: ScalpingConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub adaptive_regime: AdaptiveRegimeConfig,
    #[serde(default)]
    pub symbol_profiles: HashMap<String, SymbolProfileConfig>,
    #[serde(default)]
    pub orders: OrdersConfig,
    #[serde(default)]
    pub exits: ExitsConfig,
    #[serde(default)]
    pub emergency_stop: EmergencyStopConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub websocket: WebsocketConfig,
    #[serde(default)]
    pub journal: JournalConfig,
}

impl Config {
    /// Load and validate the configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::config(path.display().to_string(), format!("cannot read file: {e}"))
        })?;

        let config: Self = serde_yaml::from_str(&content).map_err(|e| {
            EngineError::config(path.display().to_string(), format!("invalid YAML: {e}"))
        })?;

        config.validate()?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            leverage = config.leverage,
            "configuration loaded"
        );
        Ok(config)
    }

    /// Startup validation of every required key. The error carries the exact
    /// YAML path that is missing or invalid.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.symbols.is_empty() {
            return Err(EngineError::config("symbols", "at least one symbol is required"));
        }

        match self.leverage {
            Some(l) if l >= 1 => {}
            _ => return Err(EngineError::config("leverage", "key is required and must be >= 1")),
        }

        // Commission: split rates or the single-rate shorthand.
        let has_split =
            self.commission.maker_fee_rate.is_some() && self.commission.taker_fee_rate.is_some();
        if !has_split && self.commission.trading_fee_rate.is_none() {
            return Err(EngineError::config(
                "commission.maker_fee_rate",
                "maker_fee_rate + taker_fee_rate (or trading_fee_rate) are required",
            ));
        }

        if self.margin.maintenance_margin_ratio.is_none() {
            return Err(EngineError::config(
                "margin.maintenance_margin_ratio",
                "key is required",
            ));
        }
        if self.margin.initial_margin_ratio.is_none() {
            return Err(EngineError::config("margin.initial_margin_ratio", "key is required"));
        }

        // Margin safety thresholds: required for every tradable regime, no
        // hardcoded default.
        for regime in [Regime::Trending, Regime::Ranging, Regime::Choppy] {
            let present = self
                .margin
                .by_regime
                .get(&regime)
                .and_then(|p| p.safety_threshold)
                .is_some();
            if !present {
                return Err(EngineError::config(
                    format!("margin.by_regime.{}.safety_threshold", regime),
                    format!("key is required for regime `{regime}`"),
                ));
            }
        }

        // Profiles: every sizing key is mandatory.
        for (name, profile) in [
            ("small", &self.profiles.small),
            ("medium", &self.profiles.medium),
            ("large", &self.profiles.large),
        ] {
            let checks: [(&str, bool); 5] = [
                ("base_position_usd", profile.base_position_usd.unwrap_or(0.0) > 0.0),
                ("min_position_usd", profile.min_position_usd.unwrap_or(0.0) > 0.0),
                ("max_position_usd", profile.max_position_usd.unwrap_or(0.0) > 0.0),
                ("max_open_positions", profile.max_open_positions.unwrap_or(0) > 0),
                (
                    "max_position_percent",
                    profile.max_position_percent.unwrap_or(0.0) > 0.0,
                ),
            ];
            for (key, ok) in checks {
                if !ok {
                    return Err(EngineError::config(
                        format!("profiles.{name}.{key}"),
                        "key is required and must be positive",
                    ));
                }
            }
            if profile.max_additions > 4 {
                return Err(EngineError::config(
                    format!("profiles.{name}.max_additions"),
                    "scale-in cap is 4",
                ));
            }
        }

        // Profile thresholds must be monotone so the equity -> profile mapping
        // is unambiguous.
        if self.profiles.medium.min_balance <= self.profiles.small.min_balance
            || self.profiles.large.min_balance <= self.profiles.medium.min_balance
        {
            return Err(EngineError::config(
                "profiles.medium.min_balance",
                "profile min_balance thresholds must be strictly increasing",
            ));
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Adaptive resolution (§ priority chain in the module header)
    // -------------------------------------------------------------------------

    /// Resolve one adaptive parameter for `(symbol, regime)`.
    ///
    /// `pick` selects the field from an [`AdaptiveParams`] view; the first
    /// level of the chain that has the field set wins. Returns `None` when no
    /// level defines it — the caller applies its documented hard fallback or
    /// refuses.
    pub fn resolve<T, F>(&self, symbol: &str, regime: Regime, pick: F) -> Option<T>
    where
        F: Fn(&AdaptiveParams) -> Option<T>,
    {
        if let Some(sp) = self.symbol_profiles.get(symbol) {
            if let Some(v) = sp.regimes.get(&regime).and_then(&pick) {
                return Some(v);
            }
            if let Some(v) = pick(&sp.params) {
                return Some(v);
            }
        }
        if let Some(v) = self.adaptive_regime.regimes.get(&regime).and_then(&pick) {
            return Some(v);
        }
        pick(&self.scalping.params)
    }

    /// Margin safety threshold for a regime. Required by validation, so the
    /// zero fallback is unreachable in a validated config. An unknown regime
    /// uses the ranging thresholds.
    pub fn safety_threshold(&self, regime: Regime) -> f64 {
        let regime = if regime == Regime::Unknown {
            Regime::Ranging
        } else {
            regime
        };
        self.margin
            .by_regime
            .get(&regime)
            .and_then(|p| p.safety_threshold)
            .unwrap_or(0.0)
    }

    pub fn maker_fee_rate(&self) -> f64 {
        self.commission
            .maker_fee_rate
            .or(self.commission.trading_fee_rate)
            .unwrap_or(0.0)
    }

    pub fn taker_fee_rate(&self) -> f64 {
        self.commission
            .taker_fee_rate
            .or(self.commission.trading_fee_rate)
            .unwrap_or(0.0)
    }

    pub fn leverage(&self) -> u32 {
        self.leverage.unwrap_or(1)
    }

    /// Risk percentage priority chain from sizing (§4.4.1):
    /// regime -> global risk -> scalping base -> 1 %.
    pub fn risk_percentage(&self, symbol: &str, regime: Regime) -> f64 {
        self.resolve(symbol, regime, |p| p.risk_per_trade_percent)
            .or(self.risk.risk_per_trade_percent)
            .or(self.scalping.base_risk_percentage)
            .unwrap_or(1.0)
    }

    /// Derive the balance profile from equity via the monotone thresholds.
    pub fn profile_for_equity(&self, equity: f64) -> BalanceProfile {
        if equity >= self.profiles.large.min_balance && self.profiles.large.min_balance > 0.0 {
            BalanceProfile::Large
        } else if equity >= self.profiles.medium.min_balance
            && self.profiles.medium.min_balance > 0.0
        {
            BalanceProfile::Medium
        } else {
            BalanceProfile::Small
        }
    }
}

/// Minimal valid configuration used as a fixture across the crate's tests.
#[cfg(test)]
pub(crate) fn test_yaml() -> String {
        r#"
symbols: [BTC-USDT]
leverage: 5
commission:
  trading_fee_rate: 0.001
margin:
  maintenance_margin_ratio: 0.01
  initial_margin_ratio: 0.1
  by_regime:
    trending: { safety_threshold: 1.5 }
    ranging: { safety_threshold: 1.8 }
    choppy: { safety_threshold: 2.0 }
profiles:
  small:
    min_balance: 0
    max_balance: 500
    base_position_usd: 50
    min_position_usd: 10
    max_position_usd: 100
    max_open_positions: 2
    max_position_percent: 30
  medium:
    min_balance: 500
    max_balance: 5000
    base_position_usd: 200
    min_position_usd: 50
    max_position_usd: 500
    max_open_positions: 3
    max_position_percent: 25
  large:
    min_balance: 5000
    max_balance: 0
    base_position_usd: 1000
    min_position_usd: 100
    max_position_usd: 3000
    max_open_positions: 5
    max_position_percent: 20
scalping:
  tp_percent: 0.8
  sl_percent: 1.2
  min_holding_minutes: 5
adaptive_regime:
  regimes:
    ranging: { tp_percent: 1.0, min_holding_minutes: 35 }
    trending: { tp_percent: 1.6 }
symbol_profiles:
  BTC-USDT:
    tp_percent: 0.9
    regimes:
      trending: { tp_percent: 2.0 }
"#
    .to_string()
}
