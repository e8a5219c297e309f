// =============================================================================
// Order Coordinator — non-terminal limit-order lifecycle
// =============================================================================
//
// State machine per order:
//
//   placed ──► live ──┬─► partially_filled ──► filled
//                     │                     ↘
//                     ├─► amended (live)      cancelled
//                     └─► cancelled
//
// The periodic sweep evaluates every resting order in a fixed precedence:
//   1. Post-only stuck inside the close-to-execution band -> cancel and
//      replace with a crossing-tolerant limit (configurable precedence).
//   2. Timed out -> re-validate the originating signal; keep it alive when
//      the signal still clears the emission bar and the market has not moved
//      against the order, otherwise cancel with an optional market fallback
//      under a per-symbol consecutive budget.
//   3. Drifted enough -> amend (throttled per order).
//   4. Drifted past the cancel threshold without a reprice -> cancel.
//
// A failed market fallback blocks re-entry for the symbol for a cool-down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::journal::TradeJournal;
use crate::okx::{ExchangeApi, OrderRequest};
use crate::orders::RateWindow;
use crate::registry::DataRegistry;
use crate::signals::Signal;
use crate::types::Side;

/// Cached orders younger than this are left alone by the status sweep.
const CACHE_SETTLE_SECS: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    Pending,
    Live,
    PartiallyFilled,
    Filled,
    Cancelled,
}

impl OrderState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled)
    }
}

/// One tracked limit order.
#[derive(Debug, Clone)]
pub struct TrackedOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub size_contracts: f64,
    pub filled_contracts: f64,
    pub price: f64,
    pub post_only: bool,
    pub reduce_only: bool,
    pub state: OrderState,
    pub created_at: DateTime<Utc>,
    pub last_amend_at: Option<DateTime<Utc>>,
    /// Originating signal, used by the timeout re-validation.
    pub signal: Option<Signal>,
}

impl TrackedOrder {
    pub fn remaining_contracts(&self) -> f64 {
        (self.size_contracts - self.filled_contracts).max(0.0)
    }

    fn wait_secs(&self, now: DateTime<Utc>) -> f64 {
        (now - self.created_at).num_milliseconds() as f64 / 1000.0
    }

    fn drift_pct(&self, current: f64) -> f64 {
        if self.price <= 0.0 {
            return 0.0;
        }
        (current - self.price).abs() / self.price * 100.0
    }

    /// Signed move against the fill: positive when the market ran away from
    /// a resting order.
    fn adverse_move_pct(&self, current: f64) -> f64 {
        if self.price <= 0.0 {
            return 0.0;
        }
        let signed = (current - self.price) / self.price * 100.0;
        match self.side {
            Side::Long => signed,
            Side::Short => -signed,
        }
    }
}

/// Market inputs for one sweep decision.
#[derive(Debug, Clone, Copy)]
pub struct MarketView {
    pub last: f64,
    pub best_bid: f64,
    pub best_ask: f64,
}

/// What the sweep decided for one order.
#[derive(Debug, Clone, PartialEq)]
pub enum SweepAction {
    None,
    /// Cancel and replace with a non-post-only limit at the crossing price.
    ReplaceStuckPostOnly { price: f64 },
    Reprice { price: f64 },
    KeepAlive,
    /// Cancel after timeout; `market_fallback` when the replace budget and
    /// config allow a market order for the remaining size.
    CancelTimeout { market_fallback: bool },
    CancelDrift,
}

pub struct OrderCoordinator {
    client: Arc<dyn ExchangeApi>,
    data: Arc<DataRegistry>,
    config: Arc<Config>,
    journal: Arc<TradeJournal>,
    orders: RwLock<HashMap<String, TrackedOrder>>,
    rate_window: RateWindow,
    /// Consecutive market replacements per symbol.
    market_replaces: RwLock<HashMap<String, u32>>,
    /// Re-entry blocks after failed market fallbacks.
    reentry_blocks: RwLock<HashMap<String, DateTime<Utc>>>,
    /// Raised when a market fallback fired and positions must be re-synced.
    sync_requested: AtomicBool,
}

impl OrderCoordinator {
    pub fn new(
        client: Arc<dyn ExchangeApi>,
        data: Arc<DataRegistry>,
        config: Arc<Config>,
        journal: Arc<TradeJournal>,
    ) -> Self {
        Self {
            client,
            data,
            config,
            journal,
            orders: RwLock::new(HashMap::new()),
            rate_window: RateWindow::new(),
            market_replaces: RwLock::new(HashMap::new()),
            reentry_blocks: RwLock::new(HashMap::new()),
            sync_requested: AtomicBool::new(false),
        }
    }

    // -------------------------------------------------------------------------
    // Placement
    // -------------------------------------------------------------------------

    /// Place a tracked limit order.
    pub async fn place_limit(
        &self,
        symbol: &str,
        side: Side,
        size_contracts: f64,
        price: f64,
        post_only: bool,
        signal: Option<Signal>,
    ) -> Result<String> {
        let mut request = OrderRequest::limit(symbol, side, size_contracts, price, post_only);
        request.client_order_id = Some(uuid::Uuid::new_v4().simple().to_string());
        let ack = self.client.place_futures_order(&request).await?;
        if !ack.accepted() {
            anyhow::bail!("order rejected (code {}): {}", ack.code, ack.message);
        }

        let order = TrackedOrder {
            order_id: ack.order_id.clone(),
            symbol: symbol.to_string(),
            side,
            size_contracts,
            filled_contracts: 0.0,
            price,
            post_only,
            reduce_only: false,
            state: OrderState::Live,
            created_at: Utc::now(),
            last_amend_at: None,
            signal,
        };
        info!(
            symbol,
            order_id = %ack.order_id,
            side = %side,
            price,
            size_contracts,
            post_only,
            "limit order placed"
        );
        self.orders.write().insert(ack.order_id.clone(), order);
        Ok(ack.order_id)
    }

    /// Fire a market order (entry fallback or close path).
    pub async fn place_market(
        &self,
        symbol: &str,
        side: Side,
        size_contracts: f64,
        reduce_only: bool,
    ) -> Result<String> {
        let request = OrderRequest::market(symbol, side, size_contracts, reduce_only);
        let ack = self.client.place_futures_order(&request).await?;
        if !ack.accepted() {
            anyhow::bail!("market order rejected (code {}): {}", ack.code, ack.message);
        }
        info!(symbol, order_id = %ack.order_id, side = %side, size_contracts, reduce_only, "market order placed");
        Ok(ack.order_id)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn get_order(&self, order_id: &str) -> Option<TrackedOrder> {
        self.orders.read().get(order_id).cloned()
    }

    pub fn open_orders_for(&self, symbol: &str) -> Vec<TrackedOrder> {
        self.orders
            .read()
            .values()
            .filter(|o| o.symbol == symbol && !o.state.is_terminal())
            .cloned()
            .collect()
    }

    pub fn is_reentry_blocked(&self, symbol: &str, now: DateTime<Utc>) -> bool {
        match self.reentry_blocks.read().get(symbol) {
            Some(until) => *until > now,
            None => false,
        }
    }

    /// Take-and-clear the force-sync request raised by market fallbacks.
    pub fn take_sync_request(&self) -> bool {
        self.sync_requested.swap(false, Ordering::Relaxed)
    }

    /// A limit entry filled normally: reset the consecutive market-replace
    /// budget for the symbol.
    pub fn reset_market_replaces(&self, symbol: &str) {
        self.market_replaces.write().remove(symbol);
    }

    // -------------------------------------------------------------------------
    // Sweep decision (pure)
    // -------------------------------------------------------------------------

    /// Decide what to do with one resting order. `signal_still_valid` is the
    /// lazy re-validation result for the timeout path.
    pub fn sweep_decision(
        &self,
        order: &TrackedOrder,
        market: MarketView,
        now: DateTime<Utc>,
        signal_still_valid: impl FnOnce() -> bool,
    ) -> SweepAction {
        let cfg = &self.config.orders;
        let current = market.last;
        if current <= 0.0 {
            return SweepAction::None;
        }

        let wait = order.wait_secs(now);
        let drift = order.drift_pct(current);
        let close_to_execution = drift < cfg.drift_cancel_threshold_pct;

        // 1. Post-only stuck in the close-to-execution band.
        if close_to_execution
            && order.post_only
            && cfg.post_only_stuck_wins
            && wait > cfg.post_only_stuck_secs
        {
            let price = match order.side {
                Side::Long => market.best_ask * 1.0001,
                Side::Short => market.best_bid * 0.9999,
            };
            return SweepAction::ReplaceStuckPostOnly { price };
        }

        // 2. Timeout path.
        if wait > cfg.max_wait_seconds {
            let adverse = order.adverse_move_pct(current);
            if adverse <= cfg.adverse_move_cancel_pct && signal_still_valid() {
                return SweepAction::KeepAlive;
            }
            let budget_left = self
                .market_replaces
                .read()
                .get(&order.symbol)
                .copied()
                .unwrap_or(0)
                < cfg.market_replace_budget;
            return SweepAction::CancelTimeout {
                market_fallback: cfg.replace_with_market && budget_left,
            };
        }

        // 3. Auto-reprice, throttled per order.
        if drift >= cfg.reprice_threshold_pct {
            let throttled = order
                .last_amend_at
                .is_some_and(|t| (now - t).num_milliseconds() < (cfg.amend_throttle_secs * 1000.0) as i64);
            if !throttled {
                let offset = cfg.post_only_offset_pct / 100.0;
                let price = if order.post_only {
                    match order.side {
                        Side::Long => market.best_bid * (1.0 + offset),
                        Side::Short => market.best_ask * (1.0 - offset),
                    }
                } else {
                    match order.side {
                        Side::Long => market.best_bid,
                        Side::Short => market.best_ask,
                    }
                };
                return SweepAction::Reprice { price };
            }
            return SweepAction::None;
        }

        // 4. Drift cancel.
        if drift > cfg.drift_cancel_threshold_pct && !close_to_execution {
            return SweepAction::CancelDrift;
        }

        SweepAction::None
    }

    // -------------------------------------------------------------------------
    // Periodic sweep
    // -------------------------------------------------------------------------

    /// One pass over every resting order. `revalidate` re-runs the signal
    /// pipeline for (symbol, side) on the timeout path.
    pub async fn monitor_limit_orders<F>(&self, revalidate: F)
    where
        F: Fn(&str, Side) -> Option<Signal>,
    {
        let now = Utc::now();
        let resting: Vec<TrackedOrder> = self
            .orders
            .read()
            .values()
            .filter(|o| matches!(o.state, OrderState::Live | OrderState::PartiallyFilled))
            .cloned()
            .collect();

        for order in resting {
            let market = match self.data.get_ticker(&order.symbol) {
                Some(t) if t.last > 0.0 => MarketView {
                    last: t.last,
                    best_bid: t.best_bid,
                    best_ask: t.best_ask,
                },
                _ => continue,
            };

            let action = self.sweep_decision(&order, market, now, || {
                revalidate(&order.symbol, order.side).is_some()
            });
            if action != SweepAction::None && action != SweepAction::KeepAlive {
                debug!(order_id = %order.order_id, symbol = %order.symbol, ?action, "sweep action");
            }

            match action {
                SweepAction::None | SweepAction::KeepAlive => {}
                SweepAction::ReplaceStuckPostOnly { price } => {
                    self.replace_stuck_post_only(&order, price, now).await;
                }
                SweepAction::Reprice { price } => {
                    self.reprice(&order, price, now).await;
                }
                SweepAction::CancelTimeout { market_fallback } => {
                    self.cancel_with_fallback(&order, market_fallback, now).await;
                }
                SweepAction::CancelDrift => {
                    self.cancel(&order, "drift", now).await;
                }
            }
        }
    }

    async fn cancel(&self, order: &TrackedOrder, why: &str, now: DateTime<Utc>) -> bool {
        self.rate_window.record_and_check(
            &order.symbol,
            now,
            self.config.orders.cancel_rate_warn_threshold,
        );
        match self.client.cancel_order(&order.symbol, &order.order_id).await {
            Ok(()) => {
                self.set_state(&order.order_id, OrderState::Cancelled);
                self.journal.record_event(
                    "order_cancelled",
                    serde_json::json!({
                        "symbol": order.symbol,
                        "order_id": order.order_id,
                        "why": why,
                    }),
                );
                true
            }
            Err(e) => {
                warn!(order_id = %order.order_id, error = %e, "cancel failed");
                false
            }
        }
    }

    async fn reprice(&self, order: &TrackedOrder, price: f64, now: DateTime<Utc>) {
        self.rate_window.record_and_check(
            &order.symbol,
            now,
            self.config.orders.cancel_rate_warn_threshold,
        );
        // Clamp inside the venue's accepted band when available.
        let price = match self.client.get_price_limits(&order.symbol).await {
            Ok(limits) => limits.clamp(order.side, price),
            Err(_) => price,
        };
        match self
            .client
            .amend_order_price(&order.symbol, &order.order_id, price)
            .await
        {
            Ok(()) => {
                let mut orders = self.orders.write();
                if let Some(o) = orders.get_mut(&order.order_id) {
                    o.price = price;
                    o.last_amend_at = Some(now);
                }
                info!(order_id = %order.order_id, price, "order repriced");
            }
            Err(e) => warn!(order_id = %order.order_id, error = %e, "amend failed"),
        }
    }

    async fn replace_stuck_post_only(&self, order: &TrackedOrder, price: f64, now: DateTime<Utc>) {
        if !self.cancel(order, "post_only_stuck", now).await {
            return;
        }
        let remaining = order.remaining_contracts();
        if remaining <= 0.0 {
            return;
        }
        match self
            .place_limit(&order.symbol, order.side, remaining, price, false, order.signal.clone())
            .await
        {
            Ok(new_id) => info!(
                symbol = %order.symbol,
                old = %order.order_id,
                new = %new_id,
                price,
                "stuck post-only replaced with crossing-tolerant limit"
            ),
            Err(e) => warn!(symbol = %order.symbol, error = %e, "post-only replacement failed"),
        }
    }

    async fn cancel_with_fallback(&self, order: &TrackedOrder, market_fallback: bool, now: DateTime<Utc>) {
        if !self.cancel(order, "timeout", now).await {
            return;
        }
        if !market_fallback {
            return;
        }
        let remaining = order.remaining_contracts();
        if remaining <= 0.0 {
            return;
        }

        *self
            .market_replaces
            .write()
            .entry(order.symbol.clone())
            .or_insert(0) += 1;

        match self
            .place_market(&order.symbol, order.side, remaining, false)
            .await
        {
            Ok(_) => {
                // Local view is now stale by construction; force a sync.
                self.sync_requested.store(true, Ordering::Relaxed);
            }
            Err(e) => {
                let minutes = self.config.orders.reentry_block_minutes;
                let until = now + Duration::milliseconds((minutes * 60_000.0) as i64);
                self.reentry_blocks
                    .write()
                    .insert(order.symbol.clone(), until);
                warn!(
                    symbol = %order.symbol,
                    error = %e,
                    block_minutes = minutes,
                    "market replacement failed, blocking re-entry"
                );
            }
        }
    }

    fn set_state(&self, order_id: &str, state: OrderState) {
        let mut orders = self.orders.write();
        if let Some(order) = orders.get_mut(order_id) {
            order.state = state;
        }
    }

    // -------------------------------------------------------------------------
    // Cache status sweep
    // -------------------------------------------------------------------------

    /// Reconcile cached order states against the exchange listing. Orders
    /// older than the settle window transition to `filled` (no longer listed
    /// and a position exists) or `cancelled` (no longer listed, no
    /// position); fresh ones stay pending.
    pub async fn update_orders_cache_status<F>(&self, has_position: F)
    where
        F: Fn(&str) -> bool,
    {
        let now = Utc::now();
        let symbols: Vec<String> = {
            let orders = self.orders.read();
            let mut symbols: Vec<String> = orders
                .values()
                .filter(|o| !o.state.is_terminal())
                .map(|o| o.symbol.clone())
                .collect();
            symbols.sort();
            symbols.dedup();
            symbols
        };

        for symbol in symbols {
            let listed = match self.client.get_active_orders(&symbol).await {
                Ok(active) => active,
                Err(e) => {
                    debug!(symbol, error = %e, "active-orders fetch failed, cache untouched");
                    continue;
                }
            };
            self.apply_exchange_listing(&symbol, &listed, &has_position, now);
        }
    }

    /// Pure half of the cache update, split out for tests.
    pub fn apply_exchange_listing<F>(
        &self,
        symbol: &str,
        listed: &[crate::okx::ActiveOrder],
        has_position: &F,
        now: DateTime<Utc>,
    ) where
        F: Fn(&str) -> bool,
    {
        let mut orders = self.orders.write();
        for order in orders.values_mut().filter(|o| o.symbol == symbol) {
            if order.state.is_terminal() {
                continue;
            }
            if let Some(live) = listed.iter().find(|a| a.order_id == order.order_id) {
                order.filled_contracts = live.filled_size;
                order.state = if live.filled_size > 0.0 {
                    OrderState::PartiallyFilled
                } else {
                    OrderState::Live
                };
                continue;
            }
            // Not listed any more: let fresh orders settle before judging.
            if (now - order.created_at).num_seconds() < CACHE_SETTLE_SECS {
                order.state = OrderState::Pending;
                continue;
            }
            order.state = if has_position(symbol) {
                OrderState::Filled
            } else {
                OrderState::Cancelled
            };
            debug!(
                order_id = %order.order_id,
                symbol,
                state = ?order.state,
                "cached order settled to terminal state"
            );
        }
    }

    /// Apply an order update mirrored from the private WebSocket stream.
    pub fn apply_order_update(&self, order_id: &str, state: &str, filled_contracts: f64) {
        let mut orders = self.orders.write();
        if let Some(order) = orders.get_mut(order_id) {
            order.filled_contracts = filled_contracts;
            order.state = match state {
                "live" => OrderState::Live,
                "partially_filled" => OrderState::PartiallyFilled,
                "filled" => OrderState::Filled,
                "canceled" | "cancelled" => OrderState::Cancelled,
                _ => order.state,
            };
            debug!(order_id, state, filled_contracts, "order state mirrored from WS");
        }
    }

    /// Mark every cached order of a symbol as cancelled (used by the drift
    /// reconciler when the exchange shows no position).
    pub fn mark_symbol_closed(&self, symbol: &str) {
        let mut orders = self.orders.write();
        for order in orders.values_mut().filter(|o| o.symbol == symbol) {
            if !order.state.is_terminal() {
                order.state = OrderState::Cancelled;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::okx::{
        AccountConfig, ActiveOrder, ExchangePosition, InstrumentDetails, MarginInfo, OrderAck,
        PriceLimits,
    };
    use crate::types::Ticker;
    use async_trait::async_trait;

    /// Minimal mock: accepts everything, remembers nothing.
    struct MockExchange;

    #[async_trait]
    impl ExchangeApi for MockExchange {
        async fn get_balance(&self) -> Result<f64> {
            Ok(1000.0)
        }
        async fn get_positions(&self, _symbol: Option<&str>) -> Result<Vec<ExchangePosition>> {
            Ok(Vec::new())
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
                best_bid: 99.9,
                best_ask: 100.1,
                mark: 100.0,
                timestamp_ms: Utc::now().timestamp_millis(),
            })
        }
        async fn get_price_limits(&self, _symbol: &str) -> Result<PriceLimits> {
            Ok(PriceLimits::default())
        }
        async fn get_active_orders(&self, _symbol: &str) -> Result<Vec<ActiveOrder>> {
            Ok(Vec::new())
        }
        async fn cancel_order(&self, _symbol: &str, _order_id: &str) -> Result<()> {
            Ok(())
        }
        async fn amend_order_price(&self, _s: &str, _o: &str, _p: f64) -> Result<()> {
            Ok(())
        }
        async fn place_futures_order(&self, _r: &OrderRequest) -> Result<OrderAck> {
            Ok(OrderAck {
                order_id: uuid::Uuid::new_v4().to_string(),
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

    fn coordinator() -> OrderCoordinator {
        let cfg: Config = serde_yaml::from_str(&crate::config::test_yaml()).unwrap();
        let dir = std::env::temp_dir().join(format!("meridian-orders-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        OrderCoordinator::new(
            Arc::new(MockExchange),
            Arc::new(DataRegistry::new(30.0)),
            Arc::new(cfg),
            Arc::new(TradeJournal::new(dir.join("t.csv"), dir.join("e.jsonl"))),
        )
    }

    fn order(price: f64, post_only: bool, created_at: DateTime<Utc>) -> TrackedOrder {
        TrackedOrder {
            order_id: "ord-1".into(),
            symbol: "BTC-USDT".into(),
            side: Side::Long,
            size_contracts: 100.0,
            filled_contracts: 0.0,
            price,
            post_only,
            reduce_only: false,
            state: OrderState::Live,
            created_at,
            last_amend_at: None,
            signal: None,
        }
    }

    fn market(last: f64) -> MarketView {
        MarketView {
            last,
            best_bid: last - 0.05,
            best_ask: last + 0.05,
        }
    }

    #[test]
    fn timed_out_order_kept_alive_when_signal_still_valid() {
        // Scenario: buy limit at 100.00, max_wait 60 s, price 99.98 at 70 s
        // (drift 0.02 % < 0.1 %), signal re-validates, adverse move small.
        let coord = coordinator();
        let now = Utc::now();
        let order = order(100.0, false, now - Duration::seconds(70));

        let action = coord.sweep_decision(&order, market(99.98), now, || true);
        assert_eq!(action, SweepAction::KeepAlive);
    }

    #[test]
    fn timed_out_order_cancelled_when_signal_gone() {
        let coord = coordinator();
        let now = Utc::now();
        let order = order(100.0, false, now - Duration::seconds(70));

        let action = coord.sweep_decision(&order, market(99.98), now, || false);
        assert_eq!(action, SweepAction::CancelTimeout { market_fallback: true });
    }

    #[test]
    fn timed_out_order_cancelled_on_adverse_move_despite_signal() {
        let coord = coordinator();
        let now = Utc::now();
        let order = order(100.0, false, now - Duration::seconds(70));

        // Market ran 0.7 % above the buy limit: adverse > 0.5 %.
        let action = coord.sweep_decision(&order, market(100.7), now, || true);
        assert!(matches!(action, SweepAction::CancelTimeout { .. }));
    }

    #[test]
    fn market_replace_budget_exhausts() {
        let coord = coordinator();
        let now = Utc::now();
        let order = order(100.0, false, now - Duration::seconds(70));

        // Burn the budget of 2 consecutive replaces.
        coord.market_replaces.write().insert("BTC-USDT".into(), 2);
        let action = coord.sweep_decision(&order, market(99.98), now, || false);
        assert_eq!(action, SweepAction::CancelTimeout { market_fallback: false });

        // A normal fill resets the budget.
        coord.reset_market_replaces("BTC-USDT");
        let action = coord.sweep_decision(&order, market(99.98), now, || false);
        assert_eq!(action, SweepAction::CancelTimeout { market_fallback: true });
    }

    #[test]
    fn stuck_post_only_replaced_inside_execution_band() {
        let coord = coordinator();
        let now = Utc::now();
        // 8 s old, drift 0.02 % < 0.1 %: close to execution but stuck.
        let order = order(100.0, true, now - Duration::seconds(8));

        let action = coord.sweep_decision(&order, market(99.98), now, || true);
        match action {
            SweepAction::ReplaceStuckPostOnly { price } => {
                // Buy replacement crosses at best_ask * 1.0001.
                let expected = (99.98 + 0.05) * 1.0001;
                assert!((price - expected).abs() < 1e-9);
            }
            other => panic!("expected post-only replacement, got {other:?}"),
        }
    }

    #[test]
    fn close_to_execution_non_post_only_left_alone() {
        let coord = coordinator();
        let now = Utc::now();
        let order = order(100.0, false, now - Duration::seconds(30));

        let action = coord.sweep_decision(&order, market(99.98), now, || true);
        assert_eq!(action, SweepAction::None);
    }

    #[test]
    fn drift_triggers_reprice_with_throttle() {
        let coord = coordinator();
        let now = Utc::now();
        // Drift 0.3 % >= 0.2 %, inside max_wait.
        let mut o = order(100.0, true, now - Duration::seconds(10));

        let action = coord.sweep_decision(&o, market(100.3), now, || true);
        match action {
            SweepAction::Reprice { price } => {
                // Post-only repricing joins best bid with a 0.01 % offset.
                let expected = (100.3 - 0.05) * 1.0001;
                assert!((price - expected).abs() < 1e-9);
            }
            other => panic!("expected reprice, got {other:?}"),
        }

        // Amended one second ago: throttled.
        o.last_amend_at = Some(now - Duration::seconds(1));
        let action = coord.sweep_decision(&o, market(100.3), now, || true);
        assert_eq!(action, SweepAction::None);
    }

    #[test]
    fn drift_between_thresholds_cancels() {
        let coord = coordinator();
        let now = Utc::now();
        let o = order(100.0, false, now - Duration::seconds(10));

        // Drift 0.15 %: above the 0.1 % cancel threshold, below the 0.2 %
        // reprice threshold.
        let action = coord.sweep_decision(&o, market(100.15), now, || true);
        assert_eq!(action, SweepAction::CancelDrift);
    }

    #[tokio::test]
    async fn cache_status_settles_unlisted_orders() {
        let coord = coordinator();
        let now = Utc::now();

        let mut old = order(100.0, false, now - Duration::seconds(30));
        old.order_id = "old-filled".into();
        coord.orders.write().insert(old.order_id.clone(), old);

        let mut gone = order(100.0, false, now - Duration::seconds(30));
        gone.order_id = "old-gone".into();
        gone.symbol = "ETH-USDT".into();
        coord.orders.write().insert(gone.order_id.clone(), gone);

        let mut fresh = order(100.0, false, now - Duration::seconds(2));
        fresh.order_id = "fresh".into();
        coord.orders.write().insert(fresh.order_id.clone(), fresh);

        // BTC has a position -> filled; ETH does not -> cancelled.
        let has_position = |symbol: &str| symbol == "BTC-USDT";
        coord.apply_exchange_listing("BTC-USDT", &[], &has_position, now);
        coord.apply_exchange_listing("ETH-USDT", &[], &has_position, now);

        assert_eq!(coord.get_order("old-filled").unwrap().state, OrderState::Filled);
        assert_eq!(coord.get_order("old-gone").unwrap().state, OrderState::Cancelled);
        assert_eq!(coord.get_order("fresh").unwrap().state, OrderState::Pending);
    }

    #[tokio::test]
    async fn listed_partial_fill_updates_state() {
        let coord = coordinator();
        let now = Utc::now();
        let mut o = order(100.0, false, now - Duration::seconds(30));
        o.order_id = "partial".into();
        coord.orders.write().insert(o.order_id.clone(), o);

        let listing = vec![ActiveOrder {
            order_id: "partial".into(),
            inst_id: "BTC-USDT-SWAP".into(),
            side: "buy".into(),
            price: 100.0,
            size: 100.0,
            filled_size: 40.0,
            state: "partially_filled".into(),
            create_time_ms: 0,
        }];
        coord.apply_exchange_listing("BTC-USDT", &listing, &|_| false, now);

        let cached = coord.get_order("partial").unwrap();
        assert_eq!(cached.state, OrderState::PartiallyFilled);
        assert!((cached.remaining_contracts() - 60.0).abs() < 1e-9);
    }

    #[test]
    fn reentry_block_expires() {
        let coord = coordinator();
        let now = Utc::now();
        coord
            .reentry_blocks
            .write()
            .insert("BTC-USDT".into(), now + Duration::minutes(2));

        assert!(coord.is_reentry_blocked("BTC-USDT", now));
        assert!(!coord.is_reentry_blocked("BTC-USDT", now + Duration::minutes(3)));
        assert!(!coord.is_reentry_blocked("ETH-USDT", now));
    }

    #[test]
    fn mark_symbol_closed_cancels_cache() {
        let coord = coordinator();
        let now = Utc::now();
        let o = order(100.0, false, now);
        coord.orders.write().insert(o.order_id.clone(), o);

        coord.mark_symbol_closed("BTC-USDT");
        assert_eq!(coord.get_order("ord-1").unwrap().state, OrderState::Cancelled);
    }
}
