// =============================================================================
// Position Sync — reconcile local state against the exchange
// =============================================================================
//
// Runs on a regime- and balance-adaptive interval, and unconditionally when
// forced (startup, after closes, after market replacements).
//
//   DRIFT_ADD    — the exchange shows a position the registry lacks: rebuild
//                  it (ctVal, size in coins, entry time from cTime/uTime),
//                  register, and seed a trailing stop.
//   DRIFT_REMOVE — the registry holds a symbol the exchange no longer shows:
//                  unregister, reset the trailing stop, release the size
//                  limiter, and mark cached orders closed.
//
// Drift is reconciled silently: it is never surfaced as an error.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::entry::entry_time_from_ms;
use crate::exit::trailing::{TrailingParams, TrailingSlCoordinator};
use crate::journal::{TradeJournal, TradeRecord};
use crate::okx::{ExchangeApi, ExchangePosition, OrderRequest};
use crate::orders::OrderCoordinator;
use crate::registry::{DataRegistry, Position, PositionMetadata, PositionRegistry};
use crate::risk::RiskManager;
use crate::types::{ExitReason, Regime, SymbolSpec};

/// Sizes below this are treated as closed.
const SIZE_EPSILON: f64 = 1e-8;

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub drift_added: u32,
    pub drift_removed: u32,
    pub updated: u32,
}

pub struct PositionSync {
    client: Arc<dyn ExchangeApi>,
    config: Arc<Config>,
    registry: Arc<PositionRegistry>,
    data: Arc<DataRegistry>,
    trailing: Arc<TrailingSlCoordinator>,
    risk: Arc<RiskManager>,
    orders: Arc<OrderCoordinator>,
    journal: Arc<TradeJournal>,
    specs: Arc<HashMap<String, SymbolSpec>>,
    last_sync: Mutex<Option<DateTime<Utc>>>,
}

impl PositionSync {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<dyn ExchangeApi>,
        config: Arc<Config>,
        registry: Arc<PositionRegistry>,
        data: Arc<DataRegistry>,
        trailing: Arc<TrailingSlCoordinator>,
        risk: Arc<RiskManager>,
        orders: Arc<OrderCoordinator>,
        journal: Arc<TradeJournal>,
        specs: Arc<HashMap<String, SymbolSpec>>,
    ) -> Self {
        Self {
            client,
            config,
            registry,
            data,
            trailing,
            risk,
            orders,
            journal,
            specs,
            last_sync: Mutex::new(None),
        }
    }

    /// Regime- and balance-adaptive sync interval in seconds.
    fn interval_secs(&self) -> f64 {
        let base = self.config.sync.positions_sync_interval_minutes * 60.0;
        let regime = self.data.global_regime();
        let multiplier = self
            .config
            .resolve("", regime, |p| p.sync_interval_multiplier)
            .unwrap_or(1.0);
        base * multiplier
    }

    /// Reconcile once. Without `force` the call is a no-op until the
    /// adaptive interval has elapsed.
    pub async fn sync(&self, force: bool) -> Result<SyncReport> {
        let now = Utc::now();
        if !force {
            let last = *self.last_sync.lock();
            if let Some(last) = last {
                if (now - last).num_milliseconds() as f64 / 1000.0 < self.interval_secs() {
                    return Ok(SyncReport::default());
                }
            }
        }

        let exchange_positions = match self.client.get_positions(None).await {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "position sync skipped, exchange unavailable");
                return Ok(SyncReport::default());
            }
        };
        *self.last_sync.lock() = Some(now);

        let mut report = SyncReport::default();
        let mut seen: HashSet<String> = HashSet::new();
        let mut total_margin = 0.0;

        for pos in &exchange_positions {
            if pos.size_contracts() < SIZE_EPSILON || pos.inst_id.is_empty() {
                continue;
            }
            let symbol = pos.symbol();
            seen.insert(symbol.clone());
            total_margin += pos.margin;

            if self.registry.has(&symbol) {
                self.update_in_place(&symbol, pos);
                report.updated += 1;
            } else {
                self.drift_add(&symbol, pos).await;
                report.drift_added += 1;
            }

            // Keep the limiter aligned with reality.
            if pos.avg_px > 0.0 {
                let coins = pos.size_contracts() * self.ct_val(&symbol).await;
                self.risk
                    .limiter
                    .set_position(&symbol, coins * pos.avg_px);
            }

            // A registered position without a trailing stop is degraded
            // (failed seed at entry): re-attempt initialization here.
            if self.registry.has(&symbol) && !self.trailing.has(&symbol) {
                self.seed_trailing(&symbol, pos);
                info!(symbol = %symbol, "DRIFT_ADD_TSL_CREATED");
            }
        }

        // DRIFT_REMOVE: local positions the exchange no longer reports.
        let stale: Vec<String> = self
            .registry
            .get_all()
            .into_keys()
            .filter(|s| !seen.contains(s))
            .collect();
        for symbol in stale {
            warn!(symbol = %symbol, "DRIFT_REMOVE: not on exchange");
            self.registry.unregister(&symbol);
            if let Some(tsl) = self.trailing.remove(&symbol) {
                debug!(symbol = %symbol, stop = tsl.stop_price, "trailing stop reset");
            }
            self.risk.limiter.remove_position(&symbol);
            self.orders.mark_symbol_closed(&symbol);
            report.drift_removed += 1;
        }

        // Margin snapshot refresh from the position sum.
        let balance = self.data.get_balance().equity;
        if balance > 0.0 {
            self.data
                .update_margin(total_margin, balance - total_margin, balance);
        }

        debug!(
            added = report.drift_added,
            removed = report.drift_removed,
            updated = report.updated,
            "position sync completed"
        );
        Ok(report)
    }

    // -------------------------------------------------------------------------
    // Drift handling
    // -------------------------------------------------------------------------

    async fn drift_add(&self, symbol: &str, pos: &ExchangePosition) {
        let side = pos.side();
        warn!(
            symbol,
            side = %side,
            size = pos.size_contracts(),
            "DRIFT_ADD: exchange position missing from local registry"
        );

        let ct_val = self.ct_val(symbol).await;
        let size_coins = pos.size_contracts() * ct_val;
        let entry_time = entry_time_from_ms(pos.open_time_ms());
        let regime = match self.data.get_regime(symbol) {
            Regime::Unknown => Regime::Ranging,
            r => r,
        };
        let balance = self.data.get_balance();

        let mut metadata = PositionMetadata::new(
            symbol,
            entry_time,
            regime,
            balance.profile,
            pos.avg_px,
            side,
            None,
            if pos.lever > 0 { pos.lever } else { self.config.leverage() },
            size_coins,
            pos.margin,
        );
        metadata.tp_percent = self.config.resolve(symbol, regime, |p| p.tp_percent);
        metadata.sl_percent = self.config.resolve(symbol, regime, |p| p.sl_percent);
        metadata.min_holding_seconds = self
            .config
            .resolve(symbol, regime, |p| p.min_holding_minutes)
            .map(|m| m * 60.0);

        let position = Position {
            symbol: symbol.to_string(),
            side,
            size_contracts: pos.size_contracts(),
            size_coins,
            entry_price: pos.avg_px,
            mark_price: if pos.mark_px > 0.0 { pos.mark_px } else { pos.avg_px },
            leverage: if pos.lever > 0 { pos.lever } else { self.config.leverage() },
            unrealized_pnl: pos.upl,
            margin: pos.margin,
            open_time: pos
                .open_time_ms()
                .map(|ms| entry_time_from_ms(Some(ms))),
            adl_rank: pos.adl_rank,
        };

        self.registry.register(symbol, position, metadata);
        self.seed_trailing(symbol, pos);
        info!(symbol, entry_time = %entry_time, regime = %regime, "DRIFT_ADD_SYNCED");
        self.journal.record_event(
            "drift_add",
            serde_json::json!({
                "symbol": symbol,
                "side": side,
                "size_coins": size_coins,
                "entry_time": entry_time.to_rfc3339(),
            }),
        );
    }

    /// Merge an exchange update into an existing record, preserving the
    /// locally-owned metadata fields the exchange cannot know.
    fn update_in_place(&self, symbol: &str, pos: &ExchangePosition) {
        self.registry.update(symbol, |local, _meta| {
            let coins_per_contract = if local.size_contracts > 0.0 {
                local.size_coins / local.size_contracts
            } else {
                1.0
            };
            local.size_contracts = pos.size_contracts();
            local.size_coins = local.size_contracts * coins_per_contract;
            if pos.mark_px > 0.0 {
                local.mark_price = pos.mark_px;
            }
            local.unrealized_pnl = pos.upl;
            if pos.margin > 0.0 {
                local.margin = pos.margin;
            }
            local.adl_rank = pos.adl_rank;
            // entry_price only when the exchange actually reports one.
            if pos.avg_px > 0.0 {
                local.entry_price = pos.avg_px;
            }
            // entry_time, regime, position_side, balance_profile, tp/sl stay
            // untouched: the exchange omits them.
        });
    }

    fn seed_trailing(&self, symbol: &str, pos: &ExchangePosition) {
        if pos.avg_px <= 0.0 {
            return;
        }
        let regime = match self.data.get_regime(symbol) {
            Regime::Unknown => Regime::Ranging,
            r => r,
        };
        let min_holding = self
            .registry
            .get_metadata(symbol)
            .and_then(|m| m.min_holding_seconds);
        let params = TrailingParams::resolve(&self.config, symbol, regime, min_holding);
        self.trailing.init(
            symbol,
            pos.avg_px,
            pos.side(),
            entry_time_from_ms(pos.open_time_ms()),
            regime,
            params,
        );
    }

    async fn ct_val(&self, symbol: &str) -> f64 {
        if let Some(spec) = self.specs.get(symbol) {
            return spec.ct_val;
        }
        match self.client.get_instrument_details(symbol).await {
            Ok(details) if details.ct_val > 0.0 => details.ct_val,
            _ => 1.0,
        }
    }

    // -------------------------------------------------------------------------
    // Startup
    // -------------------------------------------------------------------------

    /// Startup pass. When hedged long+short pairs exist for a symbol and
    /// concurrent positions are disallowed, close the side with the lower
    /// (more negative) unrealized PnL, then load the survivor via a forced
    /// sync.
    pub async fn startup_reconcile(&self) -> Result<SyncReport> {
        if !self.config.sync.allow_concurrent_positions {
            let positions = self.client.get_positions(None).await.unwrap_or_default();
            let mut by_symbol: HashMap<String, Vec<&ExchangePosition>> = HashMap::new();
            for pos in positions.iter().filter(|p| p.size_contracts() > SIZE_EPSILON) {
                by_symbol.entry(pos.symbol()).or_default().push(pos);
            }

            for (symbol, sides) in by_symbol {
                if sides.len() < 2 {
                    continue;
                }
                let loser = sides
                    .iter()
                    .min_by(|a, b| a.upl.total_cmp(&b.upl))
                    .copied();
                if let Some(loser) = loser {
                    warn!(
                        symbol = %symbol,
                        side = %loser.side(),
                        upl = loser.upl,
                        "hedged pair on load, closing the losing side"
                    );
                    let request = OrderRequest::market(
                        &symbol,
                        loser.side().opposite(),
                        loser.size_contracts(),
                        true,
                    );
                    match self.client.place_futures_order(&request).await {
                        Ok(ack) if ack.accepted() => {
                            let coins = loser.size_contracts() * self.ct_val(&symbol).await;
                            self.journal.record_trade(&TradeRecord {
                                timestamp: Utc::now(),
                                symbol: symbol.clone(),
                                side: loser.side(),
                                entry_price: loser.avg_px,
                                exit_price: loser.mark_px,
                                size_coins: coins,
                                gross_pnl: loser.upl,
                                commission_open: 0.0,
                                commission_close: loser.mark_px
                                    * coins
                                    * self.config.taker_fee_rate(),
                                net_pnl: loser.upl
                                    - loser.mark_px * coins * self.config.taker_fee_rate(),
                                duration_sec: 0.0,
                                reason: ExitReason::OppositePositionOnLoad,
                                position_id: String::new(),
                            });
                        }
                        Ok(ack) => {
                            warn!(symbol = %symbol, code = %ack.code, "hedge close rejected")
                        }
                        Err(e) => warn!(symbol = %symbol, error = %e, "hedge close failed"),
                    }
                }
            }
        }

        self.sync(true).await
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::okx::{
        AccountConfig, ActiveOrder, InstrumentDetails, MarginInfo, OrderAck, PriceLimits,
    };
    use crate::types::{BalanceProfile, Side, Ticker};
    use async_trait::async_trait;
    use parking_lot::Mutex as PlMutex;

    struct SyncExchange {
        positions: PlMutex<Vec<ExchangePosition>>,
        orders: PlMutex<Vec<OrderRequest>>,
    }

    impl SyncExchange {
        fn new(positions: Vec<ExchangePosition>) -> Self {
            Self {
                positions: PlMutex::new(positions),
                orders: PlMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ExchangeApi for SyncExchange {
        async fn get_balance(&self) -> Result<f64> {
            Ok(1000.0)
        }
        async fn get_positions(&self, _s: Option<&str>) -> Result<Vec<ExchangePosition>> {
            Ok(self.positions.lock().clone())
        }
        async fn get_instrument_details(&self, _s: &str) -> Result<InstrumentDetails> {
            Ok(InstrumentDetails {
                inst_id: "BTC-USDT-SWAP".into(),
                ct_val: 0.001,
                min_size: 1.0,
                tick_size: 0.1,
                lot_size: 1.0,
            })
        }
        async fn get_ticker(&self, symbol: &str) -> Result<Ticker> {
            Ok(Ticker {
                symbol: symbol.to_string(),
                last: 50_000.0,
                best_bid: 49_990.0,
                best_ask: 50_010.0,
                mark: 50_000.0,
                timestamp_ms: Utc::now().timestamp_millis(),
            })
        }
        async fn get_price_limits(&self, _s: &str) -> Result<PriceLimits> {
            Ok(PriceLimits::default())
        }
        async fn get_active_orders(&self, _s: &str) -> Result<Vec<ActiveOrder>> {
            Ok(Vec::new())
        }
        async fn cancel_order(&self, _s: &str, _o: &str) -> Result<()> {
            Ok(())
        }
        async fn amend_order_price(&self, _s: &str, _o: &str, _p: f64) -> Result<()> {
            Ok(())
        }
        async fn place_futures_order(&self, r: &OrderRequest) -> Result<OrderAck> {
            self.orders.lock().push(r.clone());
            Ok(OrderAck {
                order_id: "sync-close".into(),
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
        async fn get_margin_info(&self, _s: &str) -> Result<MarginInfo> {
            Ok(MarginInfo::default())
        }
        async fn get_candles(
            &self,
            _s: &str,
            _tf: crate::types::Timeframe,
            _l: usize,
        ) -> Result<Vec<crate::market_data::Candle>> {
            Ok(Vec::new())
        }
    }

    fn btc_position(pos: f64, upl: f64) -> ExchangePosition {
        ExchangePosition {
            inst_id: "BTC-USDT-SWAP".into(),
            pos,
            pos_side: if pos >= 0.0 { "long" } else { "short" }.into(),
            avg_px: 50_000.0,
            mark_px: 50_100.0,
            margin: 500.0,
            upl,
            lever: 5,
            c_time: Some(1_732_200_000_000),
            u_time: None,
            adl_rank: 2,
        }
    }

    struct Harness {
        sync: PositionSync,
        registry: Arc<PositionRegistry>,
        trailing: Arc<TrailingSlCoordinator>,
        risk: Arc<RiskManager>,
        data: Arc<DataRegistry>,
        exchange: Arc<SyncExchange>,
    }

    fn harness(positions: Vec<ExchangePosition>) -> Harness {
        let cfg: Config = serde_yaml::from_str(&crate::config::test_yaml()).unwrap();
        let config = Arc::new(cfg);
        let exchange = Arc::new(SyncExchange::new(positions));
        let client: Arc<dyn ExchangeApi> = exchange.clone();

        let registry = Arc::new(PositionRegistry::new());
        let data = Arc::new(DataRegistry::new(30.0));
        data.update_balance(1000.0, BalanceProfile::Medium);

        let dir = std::env::temp_dir().join(format!("meridian-sync-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let journal = Arc::new(TradeJournal::new(dir.join("t.csv"), dir.join("e.jsonl")));

        let orders = Arc::new(OrderCoordinator::new(
            client.clone(),
            data.clone(),
            config.clone(),
            journal.clone(),
        ));
        let trailing = Arc::new(TrailingSlCoordinator::new());
        let risk = Arc::new(RiskManager::new(config.clone(), 1000.0));

        let sync = PositionSync::new(
            client,
            config,
            registry.clone(),
            data.clone(),
            trailing.clone(),
            risk.clone(),
            orders,
            journal,
            Arc::new(HashMap::new()),
        );

        Harness {
            sync,
            registry,
            trailing,
            risk,
            data,
            exchange,
        }
    }

    #[tokio::test]
    async fn drift_add_registers_with_exchange_entry_time() {
        // Exchange holds a 10-contract long (ctVal 0.001 -> 0.01 BTC) the
        // engine does not know about.
        let h = harness(vec![btc_position(10.0, 25.0)]);
        h.data.update_regime("BTC-USDT", Regime::Ranging);

        let report = h.sync.sync(true).await.unwrap();
        assert_eq!(report.drift_added, 1);

        let meta = h.registry.get_metadata("BTC-USDT").unwrap();
        assert_eq!(meta.entry_time.to_rfc3339(), "2024-11-21T14:40:00+00:00");
        assert_eq!(meta.regime, Regime::Ranging);

        let pos = h.registry.get("BTC-USDT").unwrap();
        assert!((pos.size_coins - 0.01).abs() < 1e-12);

        // Trailing stop seeded with the reconstructed parameters.
        assert!(h.trailing.has("BTC-USDT"));
        // Notional tracked by the limiter: 0.01 * 50 000 = 500.
        assert!((h.risk.limiter.notional("BTC-USDT").unwrap() - 500.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn drift_remove_clears_all_structures() {
        let h = harness(vec![btc_position(10.0, 0.0)]);
        h.sync.sync(true).await.unwrap();
        assert!(h.registry.has("BTC-USDT"));

        // Position vanishes from the exchange.
        h.exchange.positions.lock().clear();
        let report = h.sync.sync(true).await.unwrap();
        assert_eq!(report.drift_removed, 1);

        assert!(!h.registry.has("BTC-USDT"));
        assert!(!h.trailing.has("BTC-USDT"));
        assert!(!h.risk.limiter.contains("BTC-USDT"));
    }

    #[tokio::test]
    async fn update_preserves_local_metadata() {
        let h = harness(vec![btc_position(10.0, 0.0)]);
        h.sync.sync(true).await.unwrap();

        // Pin local metadata, then let the exchange omit those fields.
        h.registry.update("BTC-USDT", |_, meta| {
            meta.tp_percent = Some(1.7);
            meta.sl_percent = Some(0.9);
        });
        let original_entry = h.registry.get_metadata("BTC-USDT").unwrap().entry_time;

        h.exchange.positions.lock()[0].upl = 42.0;
        let report = h.sync.sync(true).await.unwrap();
        assert_eq!(report.updated, 1);

        let meta = h.registry.get_metadata("BTC-USDT").unwrap();
        assert_eq!(meta.entry_time, original_entry);
        assert_eq!(meta.tp_percent, Some(1.7));
        assert_eq!(meta.sl_percent, Some(0.9));
        assert!((h.registry.get("BTC-USDT").unwrap().unrealized_pnl - 42.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn margin_snapshot_refreshed_from_position_sum() {
        let h = harness(vec![btc_position(10.0, 0.0)]);
        h.sync.sync(true).await.unwrap();

        let margin = h.data.get_margin();
        assert!((margin.used - 500.0).abs() < 1e-9);
        assert!((margin.available - 500.0).abs() < 1e-9);
        assert!((margin.total - 1000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn interval_gates_unforced_sync() {
        let h = harness(vec![btc_position(10.0, 0.0)]);
        h.sync.sync(true).await.unwrap();

        // Immediately after, an unforced sync is a no-op.
        h.exchange.positions.lock().clear();
        let report = h.sync.sync(false).await.unwrap();
        assert_eq!(report, SyncReport::default());
        assert!(h.registry.has("BTC-USDT"));
    }

    #[tokio::test]
    async fn hedged_pair_on_startup_closes_losing_side() {
        let long = btc_position(10.0, -50.0);
        let mut short = btc_position(-4.0, 20.0);
        short.pos_side = "short".into();
        let h = harness(vec![long, short]);

        h.sync.startup_reconcile().await.unwrap();

        let orders = h.exchange.orders.lock();
        // Exactly one reduce-only market close for the losing (long) side.
        assert_eq!(orders.len(), 1);
        assert!(orders[0].reduce_only);
        assert_eq!(orders[0].side, Side::Short);
        assert!((orders[0].size_contracts - 10.0).abs() < 1e-9);
    }
}
