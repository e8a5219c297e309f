// =============================================================================
// Entry Manager — atomic open-a-position flow
// =============================================================================
//
// For a sized signal:
//   1. Re-check no local position and no exchange position (one fresh REST
//      call, never the cache).
//   2. Place the entry limit (mid ± regime offset, clamped to the venue's
//      price band) through the Order Coordinator.
//   3. Wait inside the entry window for the order to leave the book.
//   4. Read the position back; one retry after 0.5 s; fall back to the limit
//      price when the exchange is slow to show it.
//   5. Compose metadata (regime, profile, tp/sl, leverage, min-holding),
//      register, and seed the trailing stop.
//
// Failure containment: a failed placement leaves no registration; a failed
// TSL seed leaves the position registered and flagged degraded — the
// periodic sync re-attempts initialization.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::exit::trailing::{TrailingParams, TrailingSlCoordinator};
use crate::journal::TradeJournal;
use crate::metrics::ConversionMetrics;
use crate::okx::{ExchangeApi, ExchangePosition};
use crate::orders::OrderCoordinator;
use crate::registry::{DataRegistry, Position, PositionMetadata, PositionRegistry};
use crate::risk::SizedPosition;
use crate::signals::Signal;
use crate::types::{Regime, Side, SymbolSpec};

/// Poll cadence while waiting for the entry order to leave the book.
const FILL_POLL_SECS: f64 = 1.0;
/// Single retry delay for the position-visibility read.
const POSITION_RETRY_MS: u64 = 500;

/// What happened to an entry attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryOutcome {
    Opened { entry_price: f64 },
    /// The entry window expired without a fill; the order was cancelled.
    NotFilled,
    Rejected(String),
}

pub struct EntryManager {
    client: Arc<dyn ExchangeApi>,
    config: Arc<Config>,
    registry: Arc<PositionRegistry>,
    data: Arc<DataRegistry>,
    orders: Arc<OrderCoordinator>,
    trailing: Arc<TrailingSlCoordinator>,
    metrics: Arc<ConversionMetrics>,
    journal: Arc<TradeJournal>,
    specs: Arc<HashMap<String, SymbolSpec>>,
}

impl EntryManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<dyn ExchangeApi>,
        config: Arc<Config>,
        registry: Arc<PositionRegistry>,
        data: Arc<DataRegistry>,
        orders: Arc<OrderCoordinator>,
        trailing: Arc<TrailingSlCoordinator>,
        metrics: Arc<ConversionMetrics>,
        journal: Arc<TradeJournal>,
        specs: Arc<HashMap<String, SymbolSpec>>,
    ) -> Self {
        Self {
            client,
            config,
            registry,
            data,
            orders,
            trailing,
            metrics,
            journal,
            specs,
        }
    }

    /// Open a position for an already-sized signal.
    pub async fn open_position(&self, signal: &Signal, sized: SizedPosition) -> EntryOutcome {
        let symbol = &signal.symbol;

        // ── 1. Double-entry checks ───────────────────────────────────────
        if self.registry.has(symbol) {
            return EntryOutcome::Rejected("position_exists_local".into());
        }
        match self.client.get_positions(Some(symbol)).await {
            Ok(positions) => {
                if positions.iter().any(|p| p.size_contracts() > 1e-8) {
                    warn!(symbol, "position already exists on exchange, entry blocked");
                    return EntryOutcome::Rejected("position_exists_exchange".into());
                }
            }
            Err(e) => {
                // Degraded check: proceed, the drift reconciler will catch a
                // race.
                warn!(symbol, error = %e, "exchange position pre-check failed");
            }
        }

        // ── 2. Entry order ───────────────────────────────────────────────
        let (limit_price, order_id) = match self.place_entry_order(signal, sized).await {
            Ok(v) => v,
            Err(e) => {
                warn!(symbol, error = %e, "entry order placement failed");
                return EntryOutcome::Rejected(format!("order_failed: {e}"));
            }
        };

        // ── 3. Wait for the fill inside the entry window ─────────────────
        if !self.wait_for_fill(symbol, &order_id).await {
            if let Err(e) = self.client.cancel_order(symbol, &order_id).await {
                debug!(symbol, order_id = %order_id, error = %e, "entry cancel after window failed");
            }
            info!(symbol, order_id = %order_id, "entry window expired without fill");
            return EntryOutcome::NotFilled;
        }
        self.orders.reset_market_replaces(symbol);

        // ── 4. Read the position back ────────────────────────────────────
        let exchange_pos = self.read_position_with_retry(symbol).await;
        let entry_price = exchange_pos
            .as_ref()
            .map(|p| p.avg_px)
            .filter(|px| *px > 0.0)
            .unwrap_or(limit_price);
        let entry_time = exchange_pos
            .as_ref()
            .and_then(|p| p.open_time_ms())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);

        // ── 5. Metadata ──────────────────────────────────────────────────
        let regime = match self.data.get_regime(symbol) {
            Regime::Unknown => {
                warn!(symbol, "regime unknown at entry, falling back to ranging");
                Regime::Ranging
            }
            r => r,
        };
        let balance = self.data.get_balance();
        let spec = self.specs.get(symbol);
        let margin_used = exchange_pos
            .as_ref()
            .map(|p| p.margin)
            .filter(|m| *m > 0.0)
            .unwrap_or_else(|| sized.usd / self.config.leverage() as f64);

        let mut metadata = PositionMetadata::new(
            symbol,
            entry_time,
            regime,
            balance.profile,
            entry_price,
            signal.side,
            Some(order_id.clone()),
            self.config.leverage(),
            sized.coins,
            margin_used,
        );
        metadata.tp_percent = signal
            .tp_percent
            .or_else(|| self.config.resolve(symbol, regime, |p| p.tp_percent));
        metadata.sl_percent = signal
            .sl_percent
            .or_else(|| self.config.resolve(symbol, regime, |p| p.sl_percent));
        metadata.min_holding_seconds = self
            .config
            .resolve(symbol, regime, |p| p.min_holding_minutes)
            .map(|m| m * 60.0);

        let position = self.build_position(symbol, signal.side, exchange_pos, entry_price, sized, spec, margin_used);

        // ── 6. Register ──────────────────────────────────────────────────
        self.registry.register(symbol, position, metadata.clone());

        // ── 7. Trailing stop ─────────────────────────────────────────────
        let params = TrailingParams::resolve(
            &self.config,
            symbol,
            regime,
            metadata.min_holding_seconds,
        );
        self.trailing
            .init(symbol, entry_price, signal.side, entry_time, regime, params);

        // ── 8. Metrics & journal ─────────────────────────────────────────
        self.metrics.record_executed(symbol, regime);
        self.journal.record_event(
            "position_opened",
            serde_json::json!({
                "symbol": symbol,
                "side": signal.side,
                "entry_price": entry_price,
                "size_coins": sized.coins,
                "regime": regime.as_str(),
                "order_id": order_id,
                "position_id": metadata.position_id,
            }),
        );

        info!(
            symbol,
            side = %signal.side,
            entry_price,
            size_coins = sized.coins,
            regime = %regime,
            tp = ?metadata.tp_percent,
            sl = ?metadata.sl_percent,
            "position opened and registered"
        );
        EntryOutcome::Opened { entry_price }
    }

    // -------------------------------------------------------------------------
    // Steps
    // -------------------------------------------------------------------------

    /// Derive the limit price (mid ± regime offset, clamped to the venue
    /// band) and place the order.
    async fn place_entry_order(&self, signal: &Signal, sized: SizedPosition) -> Result<(f64, String)> {
        let symbol = &signal.symbol;
        let limits = self
            .client
            .get_price_limits(symbol)
            .await
            .context("price limits unavailable for entry")?;

        let mid = if limits.best_bid > 0.0 && limits.best_ask > 0.0 {
            (limits.best_bid + limits.best_ask) / 2.0
        } else {
            signal.price
        };
        let offset = self
            .config
            .resolve(symbol, signal.regime, |p| p.entry_offset_pct)
            .unwrap_or(0.02)
            / 100.0;
        let raw = match signal.side {
            Side::Long => mid * (1.0 - offset),
            Side::Short => mid * (1.0 + offset),
        };
        let price = limits.clamp(signal.side, raw);

        let order_id = self
            .orders
            .place_limit(
                symbol,
                signal.side,
                sized.contracts,
                price,
                self.config.scalping.post_only,
                Some(signal.clone()),
            )
            .await?;
        Ok((price, order_id))
    }

    /// Poll until the entry order leaves the book. `true` means it is no
    /// longer resting (filled or otherwise finished).
    async fn wait_for_fill(&self, symbol: &str, order_id: &str) -> bool {
        let deadline = Utc::now()
            + chrono::Duration::milliseconds(
                (self.config.scalping.entry_window_seconds * 1000.0) as i64,
            );
        loop {
            match self.client.get_active_orders(symbol).await {
                Ok(active) => {
                    if !active.iter().any(|o| o.order_id == order_id) {
                        return true;
                    }
                }
                Err(e) => debug!(symbol, error = %e, "active-orders poll failed"),
            }
            if Utc::now() >= deadline {
                return false;
            }
            tokio::time::sleep(std::time::Duration::from_millis(
                (FILL_POLL_SECS * 1000.0) as u64,
            ))
            .await;
        }
    }

    /// Positions read with a single retry after 0.5 s.
    async fn read_position_with_retry(&self, symbol: &str) -> Option<ExchangePosition> {
        for attempt in 0..2 {
            if attempt > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(POSITION_RETRY_MS)).await;
            }
            match self.client.get_positions(Some(symbol)).await {
                Ok(positions) => {
                    if let Some(pos) = positions.into_iter().find(|p| p.size_contracts() > 1e-8) {
                        return Some(pos);
                    }
                }
                Err(e) => debug!(symbol, attempt, error = %e, "position read failed"),
            }
        }
        warn!(symbol, "position not visible after retry, using limit price");
        None
    }

    #[allow(clippy::too_many_arguments)]
    fn build_position(
        &self,
        symbol: &str,
        side: Side,
        exchange_pos: Option<ExchangePosition>,
        entry_price: f64,
        sized: SizedPosition,
        spec: Option<&SymbolSpec>,
        margin_used: f64,
    ) -> Position {
        let ct_val = spec.map(|s| s.ct_val).unwrap_or(1.0);
        match exchange_pos {
            Some(p) => Position {
                symbol: symbol.to_string(),
                side,
                size_contracts: p.size_contracts(),
                size_coins: p.size_contracts() * ct_val,
                entry_price,
                mark_price: if p.mark_px > 0.0 { p.mark_px } else { entry_price },
                leverage: if p.lever > 0 { p.lever } else { self.config.leverage() },
                unrealized_pnl: p.upl,
                margin: margin_used,
                open_time: p
                    .open_time_ms()
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
                adl_rank: p.adl_rank,
            },
            None => Position {
                symbol: symbol.to_string(),
                side,
                size_contracts: sized.contracts,
                size_coins: sized.coins,
                entry_price,
                mark_price: entry_price,
                leverage: self.config.leverage(),
                unrealized_pnl: 0.0,
                margin: margin_used,
                open_time: None,
                adl_rank: 0,
            },
        }
    }
}

/// Parse an exchange millisecond timestamp into UTC, used by entry and the
/// drift reconciler.
pub fn entry_time_from_ms(ms: Option<i64>) -> DateTime<Utc> {
    ms.and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now)
}
