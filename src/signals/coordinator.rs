// =============================================================================
// Signal Coordinator — global gating between generation and entry
// =============================================================================
//
// Per candidate signal, in order:
//   1. Per-symbol lock (try-acquire; a held lock drops the signal as
//      `concurrent_lock`).
//   2. Existing position in the registry.
//   3. Re-entry block / per-symbol signal cooldown.
//   4. Emergency stop.
//   5. Max concurrent positions for the balance profile.
//   6. Risk sizing (rejects below the exchange minimum).
//   7. Delegate to the Entry Manager.
//
// Different symbols process independently; the same symbol is serialized by
// its lock — the limit-order timeout re-validation takes the same lock.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::Config;
use crate::entry::{EntryManager, EntryOutcome};
use crate::metrics::{ConversionMetrics, SloCounters};
use crate::orders::OrderCoordinator;
use crate::registry::{DataRegistry, PositionRegistry};
use crate::risk::RiskManager;
use crate::signals::Signal;
use crate::types::{Side, SymbolSpec};

pub struct SignalCoordinator {
    config: Arc<Config>,
    registry: Arc<PositionRegistry>,
    data: Arc<DataRegistry>,
    risk: Arc<RiskManager>,
    orders: Arc<OrderCoordinator>,
    entry: Arc<EntryManager>,
    metrics: Arc<ConversionMetrics>,
    slo: Arc<SloCounters>,
    specs: Arc<HashMap<String, SymbolSpec>>,
    /// Per-symbol serialization of entries and re-validations.
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
    /// Last accepted order time and side per symbol, for the signal
    /// cooldown and the same-side re-entry counter.
    last_order: RwLock<HashMap<String, (DateTime<Utc>, Side)>>,
}

impl SignalCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        registry: Arc<PositionRegistry>,
        data: Arc<DataRegistry>,
        risk: Arc<RiskManager>,
        orders: Arc<OrderCoordinator>,
        entry: Arc<EntryManager>,
        metrics: Arc<ConversionMetrics>,
        slo: Arc<SloCounters>,
        specs: Arc<HashMap<String, SymbolSpec>>,
    ) -> Self {
        Self {
            config,
            registry,
            data,
            risk,
            orders,
            entry,
            metrics,
            slo,
            specs,
            locks: RwLock::new(HashMap::new()),
            last_order: RwLock::new(HashMap::new()),
        }
    }

    /// The per-symbol lock shared by entries and order re-validation.
    pub fn symbol_lock(&self, symbol: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.read().get(symbol) {
            return lock.clone();
        }
        self.locks
            .write()
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Process a batch of candidate signals.
    pub async fn process(&self, signals: Vec<Signal>) {
        for signal in signals {
            self.metrics.record_generated(&signal.symbol);
            self.process_one(&signal).await;
        }
    }

    /// Gate one signal; on success the Entry Manager opens the position.
    pub async fn process_one(&self, signal: &Signal) -> Option<EntryOutcome> {
        let symbol = &signal.symbol;
        let now = Utc::now();

        // ── 1. Per-symbol lock, non-blocking ─────────────────────────────
        let lock = self.symbol_lock(symbol);
        let guard = match lock.try_lock() {
            Ok(g) => g,
            Err(_) => {
                self.metrics.record_filtered(symbol, "concurrent_lock");
                return None;
            }
        };

        // ── 2. Existing position ─────────────────────────────────────────
        if self.registry.has(symbol) {
            self.metrics.record_filtered(symbol, "position_exists");
            return None;
        }

        // ── 3. Cooldowns ─────────────────────────────────────────────────
        if self.orders.is_reentry_blocked(symbol, now) {
            self.metrics.record_filtered(symbol, "reentry_block");
            return None;
        }
        if let Some((last_at, _)) = self.last_order.read().get(symbol) {
            let elapsed = (now - *last_at).num_milliseconds() as f64 / 1000.0;
            if elapsed < self.config.scalping.signal_cooldown_seconds {
                debug!(symbol, elapsed, "signal inside cooldown window");
                self.metrics.record_filtered(symbol, "cooldown");
                return None;
            }
        }

        // ── 4. Emergency stop ────────────────────────────────────────────
        if self.risk.emergency_stop_active() {
            self.metrics.record_filtered(symbol, "emergency_stop");
            return None;
        }

        // ── 5. Max concurrent positions ──────────────────────────────────
        let balance = self.data.get_balance();
        let max_positions = self.risk.max_concurrent_positions(balance.equity);
        if self.registry.count() as u32 >= max_positions {
            self.metrics.record_filtered(symbol, "max_positions");
            return None;
        }

        // ── 6. Sizing ────────────────────────────────────────────────────
        let spec = match self.specs.get(symbol) {
            Some(s) => s,
            None => {
                self.metrics.record_filtered(symbol, "unknown_symbol");
                return None;
            }
        };
        let sized = match self.risk.compute_position_size(
            symbol,
            balance.equity,
            signal.price,
            signal.regime,
            spec,
        ) {
            Ok(s) => s,
            Err(rejection) => {
                self.metrics.record_filtered(symbol, rejection.as_str());
                return None;
            }
        };

        // ── 7. Entry ─────────────────────────────────────────────────────
        info!(
            symbol,
            side = %signal.side,
            strength = signal.strength,
            coins = sized.coins,
            "signal accepted, opening position"
        );
        let outcome = self.entry.open_position(signal, sized).await;
        if matches!(outcome, EntryOutcome::Opened { .. }) {
            let previous = self
                .last_order
                .write()
                .insert(symbol.clone(), (now, signal.side));
            if previous.is_some_and(|(_, side)| side == signal.side) {
                self.slo
                    .same_side_reentry_count
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        }
        drop(guard);
        Some(outcome)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit::trailing::TrailingSlCoordinator;
    use crate::journal::TradeJournal;
    use crate::okx::{
        AccountConfig, ActiveOrder, ExchangeApi, ExchangePosition, InstrumentDetails, MarginInfo,
        OrderAck, OrderRequest, PriceLimits,
    };
    use crate::types::{BalanceProfile, Regime, Side, Ticker};
    use anyhow::Result;
    use async_trait::async_trait;
    use parking_lot::Mutex as PlMutex;

    /// Mock exchange that fills entries instantly and shows the position.
    struct FillingExchange {
        placed: PlMutex<Vec<OrderRequest>>,
        show_position: PlMutex<bool>,
    }

    impl FillingExchange {
        fn new() -> Self {
            Self {
                placed: PlMutex::new(Vec::new()),
                show_position: PlMutex::new(false),
            }
        }
    }

    #[async_trait]
    impl ExchangeApi for FillingExchange {
        async fn get_balance(&self) -> Result<f64> {
            Ok(1000.0)
        }
        async fn get_positions(&self, _symbol: Option<&str>) -> Result<Vec<ExchangePosition>> {
            if *self.show_position.lock() {
                Ok(vec![ExchangePosition {
                    inst_id: "BTC-USDT-SWAP".into(),
                    pos: 50.0,
                    pos_side: "long".into(),
                    avg_px: 100.02,
                    mark_px: 100.02,
                    margin: 100.0,
                    upl: 0.0,
                    lever: 5,
                    c_time: Some(1_732_200_000_000),
                    u_time: None,
                    adl_rank: 1,
                }])
            } else {
                Ok(Vec::new())
            }
        }
        async fn get_instrument_details(&self, _symbol: &str) -> Result<InstrumentDetails> {
            Ok(InstrumentDetails {
                inst_id: "BTC-USDT-SWAP".into(),
                ct_val: 0.01,
                min_size: 1.0,
                tick_size: 0.1,
                lot_size: 1.0,
            })
        }
        async fn get_ticker(&self, symbol: &str) -> Result<Ticker> {
            Ok(Ticker {
                symbol: symbol.to_string(),
                last: 100.0,
                best_bid: 99.95,
                best_ask: 100.05,
                mark: 100.0,
                timestamp_ms: Utc::now().timestamp_millis(),
            })
        }
        async fn get_price_limits(&self, _symbol: &str) -> Result<PriceLimits> {
            Ok(PriceLimits {
                last: 100.0,
                best_bid: 99.95,
                best_ask: 100.05,
                max_buy_price: 110.0,
                min_sell_price: 90.0,
            })
        }
        async fn get_active_orders(&self, _symbol: &str) -> Result<Vec<ActiveOrder>> {
            // Entry orders never rest in this mock: instant fill.
            *self.show_position.lock() = true;
            Ok(Vec::new())
        }
        async fn cancel_order(&self, _symbol: &str, _order_id: &str) -> Result<()> {
            Ok(())
        }
        async fn amend_order_price(&self, _s: &str, _o: &str, _p: f64) -> Result<()> {
            Ok(())
        }
        async fn place_futures_order(&self, r: &OrderRequest) -> Result<OrderAck> {
            self.placed.lock().push(r.clone());
            Ok(OrderAck {
                order_id: "entry-1".into(),
                code: "0".into(),
                message: String::new(),
            })
        }
        async fn set_leverage(&self, _s: &str, _l: u32, _p: Option<Side>) -> Result<()> {
            Ok(())
        }
        async fn get_account_config(&self) -> Result<AccountConfig> {
            Ok(AccountConfig {
                pos_mode: "long_short_mode".into(),
            })
        }
        async fn get_margin_info(&self, _symbol: &str) -> Result<MarginInfo> {
            Ok(MarginInfo::default())
        }
        async fn get_candles(
            &self,
            _symbol: &str,
            _tf: crate::types::Timeframe,
            _limit: usize,
        ) -> Result<Vec<crate::market_data::Candle>> {
            Ok(Vec::new())
        }
    }

    struct Harness {
        coordinator: SignalCoordinator,
        registry: Arc<PositionRegistry>,
        trailing: Arc<TrailingSlCoordinator>,
        metrics: Arc<ConversionMetrics>,
        risk: Arc<RiskManager>,
    }

    fn harness() -> Harness {
        let mut cfg: Config = serde_yaml::from_str(&crate::config::test_yaml()).unwrap();
        cfg.scalping.entry_window_seconds = 0.0;
        {
            let ranging = cfg.adaptive_regime.regimes.entry(Regime::Ranging).or_default();
            ranging.max_drawdown_percent = Some(5.0);
            ranging.min_lock_minutes = Some(5.0);
        }
        cfg.validate().unwrap();
        let config = Arc::new(cfg);

        let client: Arc<dyn ExchangeApi> = Arc::new(FillingExchange::new());
        let registry = Arc::new(PositionRegistry::new());
        let data = Arc::new(DataRegistry::new(30.0));
        data.update_balance(1000.0, BalanceProfile::Medium);
        data.update_regime("BTC-USDT", Regime::Ranging);

        let dir = std::env::temp_dir().join(format!("meridian-sig-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let journal = Arc::new(TradeJournal::new(dir.join("t.csv"), dir.join("e.jsonl")));

        let orders = Arc::new(OrderCoordinator::new(
            client.clone(),
            data.clone(),
            config.clone(),
            journal.clone(),
        ));
        let trailing = Arc::new(TrailingSlCoordinator::new());
        let metrics = Arc::new(ConversionMetrics::new());
        let risk = Arc::new(RiskManager::new(config.clone(), 1000.0));

        let mut specs = HashMap::new();
        specs.insert(
            "BTC-USDT".to_string(),
            SymbolSpec {
                symbol: "BTC-USDT".into(),
                ct_val: 0.01,
                min_size: 1.0,
                tick_size: 0.1,
                lot_size: 1.0,
                leverage: 5,
            },
        );
        let specs = Arc::new(specs);

        let entry = Arc::new(EntryManager::new(
            client,
            config.clone(),
            registry.clone(),
            data.clone(),
            orders.clone(),
            trailing.clone(),
            metrics.clone(),
            journal,
            specs.clone(),
        ));

        let coordinator = SignalCoordinator::new(
            config,
            registry.clone(),
            data,
            risk.clone(),
            orders,
            entry,
            metrics.clone(),
            Arc::new(SloCounters::new()),
            specs,
        );

        Harness {
            coordinator,
            registry,
            trailing,
            metrics,
            risk,
        }
    }

    fn signal(symbol: &str) -> Signal {
        Signal {
            symbol: symbol.to_string(),
            side: Side::Long,
            strength: 0.8,
            filters_passed: 4,
            price: 100.0,
            regime: Regime::Ranging,
            tp_percent: None,
            sl_percent: None,
            source: "ensemble",
            generated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn accepted_signal_opens_registers_and_seeds_tsl() {
        let h = harness();
        let outcome = h.coordinator.process_one(&signal("BTC-USDT")).await;
        assert!(matches!(outcome, Some(EntryOutcome::Opened { .. })));

        assert!(h.registry.has("BTC-USDT"));
        let meta = h.registry.get_metadata("BTC-USDT").unwrap();
        // entry_time comes from the exchange cTime.
        assert_eq!(meta.entry_time.to_rfc3339(), "2024-11-21T14:40:00+00:00");
        assert_eq!(meta.regime, Regime::Ranging);
        assert!(h.trailing.has("BTC-USDT"));
    }

    #[tokio::test]
    async fn second_signal_filtered_by_existing_position() {
        let h = harness();
        h.coordinator.process_one(&signal("BTC-USDT")).await;
        let outcome = h.coordinator.process_one(&signal("BTC-USDT")).await;
        assert!(outcome.is_none());
        assert_eq!(h.metrics.filtered_count("BTC-USDT", "position_exists"), 1);
    }

    #[tokio::test]
    async fn held_lock_drops_signal_as_concurrent() {
        let h = harness();
        let lock = h.coordinator.symbol_lock("BTC-USDT");
        let _held = lock.lock().await;

        let outcome = h.coordinator.process_one(&signal("BTC-USDT")).await;
        assert!(outcome.is_none());
        assert_eq!(h.metrics.filtered_count("BTC-USDT", "concurrent_lock"), 1);
    }

    #[tokio::test]
    async fn emergency_stop_blocks_signals() {
        let h = harness();
        // 10 % drawdown against the 5 % ranging limit trips the stop.
        assert!(h.risk.check_drawdown(900.0, Regime::Ranging, Utc::now()));
        assert!(h.risk.emergency_stop_active());

        let outcome = h.coordinator.process_one(&signal("BTC-USDT")).await;
        assert!(outcome.is_none());
        assert_eq!(h.metrics.filtered_count("BTC-USDT", "emergency_stop"), 1);
    }

    #[tokio::test]
    async fn unknown_symbol_filtered() {
        let h = harness();
        let outcome = h.coordinator.process_one(&signal("DOGE-USDT")).await;
        assert!(outcome.is_none());
        assert_eq!(h.metrics.filtered_count("DOGE-USDT", "unknown_symbol"), 1);
    }

    #[tokio::test]
    async fn cooldown_filters_fast_reentry() {
        let h = harness();
        let first = h.coordinator.process_one(&signal("BTC-USDT")).await;
        assert!(matches!(first, Some(EntryOutcome::Opened { .. })));

        // Clear the registry so only the cooldown can reject.
        h.registry.unregister("BTC-USDT");
        let outcome = h.coordinator.process_one(&signal("BTC-USDT")).await;
        assert!(outcome.is_none());
        assert_eq!(h.metrics.filtered_count("BTC-USDT", "cooldown"), 1);
    }
}
