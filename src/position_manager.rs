// =============================================================================
// Position Manager — close pipeline + defensive per-tick checks
// =============================================================================
//
// Every close path funnels through `close_position`, which is serialized per
// symbol by the registry's closing set: concurrent triggers cannot emit two
// close orders. The defensive `manage_positions` tick re-derives state from
// the exchange (avgPx, markPx, equity, margin) and re-checks the critical
// exits; it intentionally duplicates the Exit Analyzer as defense in depth.
//
// Evaluation order per tick: safety window -> margin safety -> profit
// harvest -> SL (only while the trail is not armed) -> loss cut -> TP with
// commission and slippage buffers -> big-profit trailing -> partial TP.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::exit::trailing::TrailingSlCoordinator;
use crate::exit::{ExitAnalyzer, ExitDecision};
use crate::journal::{TradeJournal, TradeRecord};
use crate::margin::{MarginCalculator, MarginSafetyResult};
use crate::metrics::{PerformanceTracker, SloCounters};
use crate::okx::{ExchangeApi, OrderRequest};
use crate::registry::{DataRegistry, PositionRegistry};
use crate::risk::RiskManager;
use crate::types::{ExitReason, Regime, SymbolSpec};

/// No defensive exit may fire within this window after open.
const SAFETY_WINDOW_SECS: f64 = 10.0;

pub struct PositionManager {
    client: Arc<dyn ExchangeApi>,
    config: Arc<Config>,
    registry: Arc<PositionRegistry>,
    data: Arc<DataRegistry>,
    trailing: Arc<TrailingSlCoordinator>,
    analyzer: Arc<ExitAnalyzer>,
    risk: Arc<RiskManager>,
    margin_calc: MarginCalculator,
    journal: Arc<TradeJournal>,
    slo: Arc<SloCounters>,
    performance: Arc<PerformanceTracker>,
    specs: Arc<HashMap<String, SymbolSpec>>,
}

impl PositionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<dyn ExchangeApi>,
        config: Arc<Config>,
        registry: Arc<PositionRegistry>,
        data: Arc<DataRegistry>,
        trailing: Arc<TrailingSlCoordinator>,
        analyzer: Arc<ExitAnalyzer>,
        risk: Arc<RiskManager>,
        journal: Arc<TradeJournal>,
        slo: Arc<SloCounters>,
        performance: Arc<PerformanceTracker>,
        specs: Arc<HashMap<String, SymbolSpec>>,
    ) -> Self {
        let margin_calc = MarginCalculator::new(
            config.margin.maintenance_margin_ratio.unwrap_or(0.0),
            config.margin.initial_margin_ratio.unwrap_or(0.0),
        );
        Self {
            client,
            config,
            registry,
            data,
            trailing,
            analyzer,
            risk,
            margin_calc,
            journal,
            slo,
            performance,
            specs,
        }
    }

    // -------------------------------------------------------------------------
    // Close pipeline
    // -------------------------------------------------------------------------

    /// Close a position with a reduce-only market order. Serialized per
    /// symbol; a second concurrent trigger is a no-op.
    pub async fn close_position(&self, symbol: &str, reason: ExitReason) -> Result<bool> {
        if !self.registry.begin_close(symbol) {
            debug!(symbol, reason = %reason, "close already in flight or position unknown");
            return Ok(false);
        }

        let result = self.close_inner(symbol, reason).await;
        if let Err(e) = &result {
            self.slo.alert(
                &self.slo.close_pipeline_errors,
                "close_pipeline_errors",
                &format!("{symbol}: {e}"),
            );
            self.registry.end_close(symbol);
        }
        result
    }

    async fn close_inner(&self, symbol: &str, reason: ExitReason) -> Result<bool> {
        let position = match self.registry.get(symbol) {
            Some(p) => p,
            None => {
                self.registry.end_close(symbol);
                return Ok(false);
            }
        };
        let metadata = self.registry.get_metadata(symbol);

        let request = OrderRequest::market(
            symbol,
            position.side.opposite(),
            position.size_contracts,
            true,
        );
        let ack = self.client.place_futures_order(&request).await?;
        if !ack.accepted() {
            anyhow::bail!("close rejected (code {}): {}", ack.code, ack.message);
        }

        let exit_price = self
            .data
            .last_price(symbol)
            .filter(|p| *p > 0.0)
            .unwrap_or(position.mark_price);

        self.journal_close(symbol, &position, metadata.as_ref(), exit_price, reason, 1.0);

        // Tear down every per-position structure.
        self.trailing.remove(symbol);
        self.analyzer.forget(symbol);
        self.risk.limiter.remove_position(symbol);
        self.registry.unregister(symbol);

        info!(symbol, reason = %reason, exit_price, "position closed");
        Ok(true)
    }

    /// Partially close: reduce-only post-only limit at a small favorable
    /// offset, market fallback on rejection. Idempotent through the
    /// `partial_tp_done` flag.
    pub async fn partial_close(&self, symbol: &str, fraction: f64, reason: ExitReason) -> Result<bool> {
        let position = match self.registry.get(symbol) {
            Some(p) => p,
            None => return Ok(false),
        };
        let metadata = self.registry.get_metadata(symbol);
        if metadata.as_ref().is_some_and(|m| m.partial_tp_done) {
            return Ok(false);
        }

        let close_contracts = position.size_contracts * fraction.clamp(0.0, 1.0);
        let min_size = self.specs.get(symbol).map(|s| s.min_size).unwrap_or(0.0);
        if close_contracts < min_size || position.size_contracts - close_contracts < min_size {
            debug!(
                symbol,
                close_contracts,
                min_size,
                "partial close skipped, slice below exchange minimum"
            );
            return Ok(false);
        }

        let current = self
            .data
            .last_price(symbol)
            .filter(|p| *p > 0.0)
            .unwrap_or(position.mark_price);
        let offset_bps = self
            .config
            .resolve(symbol, self.regime_for(symbol), |p| p.partial_tp_limit_offset_bps)
            .unwrap_or(7.0);
        let limit_price = current * (1.0 + position.side.dir() * offset_bps / 10_000.0);

        let mut request = OrderRequest::limit(
            symbol,
            position.side.opposite(),
            close_contracts,
            limit_price,
            true,
        );
        request.reduce_only = true;

        let placed = match self.client.place_futures_order(&request).await {
            Ok(ack) if ack.accepted() => true,
            Ok(ack) => {
                debug!(symbol, code = %ack.code, "post-only partial rejected, falling back to market");
                false
            }
            Err(e) => {
                debug!(symbol, error = %e, "partial limit failed, falling back to market");
                false
            }
        };
        if !placed {
            let market = OrderRequest::market(
                symbol,
                position.side.opposite(),
                close_contracts,
                true,
            );
            let ack = self.client.place_futures_order(&market).await?;
            if !ack.accepted() {
                anyhow::bail!("partial market close rejected (code {})", ack.code);
            }
        }

        // Flag first so a re-entrant tick cannot double-fire, then shrink
        // the registered size.
        self.registry.mark_partial_tp_done(symbol);
        self.registry.update(symbol, |pos, _| {
            pos.size_contracts -= close_contracts;
            pos.size_coins = pos.size_contracts * pos.size_coins
                / (pos.size_contracts + close_contracts).max(f64::EPSILON);
        });

        self.journal_close(symbol, &position, metadata.as_ref(), limit_price, reason, fraction);
        info!(symbol, fraction, close_contracts, "partial close placed");
        Ok(true)
    }

    fn journal_close(
        &self,
        symbol: &str,
        position: &crate::registry::Position,
        metadata: Option<&crate::registry::PositionMetadata>,
        exit_price: f64,
        reason: ExitReason,
        fraction: f64,
    ) {
        let closed_coins = position.size_coins * fraction;
        let gross =
            (exit_price - position.entry_price) * closed_coins * position.side.dir();
        let commission_open =
            position.entry_price * closed_coins * self.config.maker_fee_rate();
        let commission_close = exit_price * closed_coins * self.config.taker_fee_rate();
        let duration = metadata
            .map(|m| m.age_seconds(Utc::now()))
            .unwrap_or(0.0);
        let net_pnl = gross - commission_open - commission_close;
        self.performance.record_close(net_pnl);

        self.journal.record_trade(&TradeRecord {
            timestamp: Utc::now(),
            symbol: symbol.to_string(),
            side: position.side,
            entry_price: position.entry_price,
            exit_price,
            size_coins: closed_coins,
            gross_pnl: gross,
            commission_open,
            commission_close,
            net_pnl,
            duration_sec: duration,
            reason,
            position_id: metadata
                .map(|m| m.position_id.clone())
                .unwrap_or_default(),
        });
        self.journal.record_event(
            "exit_decision",
            serde_json::json!({
                "symbol": symbol,
                "reason": reason.as_str(),
                "fraction": fraction,
                "exit_price": exit_price,
            }),
        );
    }

    fn regime_for(&self, symbol: &str) -> Regime {
        match self.data.get_regime(symbol) {
            Regime::Unknown => Regime::Ranging,
            r => r,
        }
    }

    // -------------------------------------------------------------------------
    // Defensive tick (§ runs from the orchestrator main loop)
    // -------------------------------------------------------------------------

    /// Re-check every position against fresh exchange state. Returns the
    /// symbols closed this tick.
    pub async fn manage_positions(&self) -> Vec<String> {
        let mut closed = Vec::new();
        let now = Utc::now();

        for (symbol, position) in self.registry.get_all() {
            if self.registry.is_closing(&symbol) {
                continue;
            }
            let metadata = match self.registry.get_metadata(&symbol) {
                Some(m) => m,
                None => continue,
            };
            let age = metadata.age_seconds(now);
            if age < SAFETY_WINDOW_SECS {
                continue;
            }

            // Effective state from the exchange, not the cache.
            let margin_info = match self.client.get_margin_info(&symbol).await {
                Ok(mi) => mi,
                Err(e) => {
                    debug!(symbol, error = %e, "margin info unavailable, defensive tick skipped");
                    continue;
                }
            };
            let margin_used = if margin_info.margin > 0.0 {
                margin_info.margin
            } else {
                position.margin
            };
            let upl = margin_info.upl;
            let regime = self.regime_for(&symbol);
            let current = self
                .data
                .last_price(&symbol)
                .filter(|p| *p > 0.0)
                .unwrap_or(position.mark_price);

            // Margin safety with false-trigger protection.
            let safety = self.margin_calc.check_position_safety(
                margin_info.equity,
                margin_used,
                upl,
                age,
                self.config.safety_threshold(regime),
            );
            if let MarginSafetyResult::Unsafe { ratio } = safety {
                if self
                    .margin_calc
                    .emergency_close_allowed(age, upl, margin_used, ratio)
                {
                    warn!(symbol, ratio, "margin unsafe, emergency close");
                    if self
                        .close_position(&symbol, ExitReason::EmergencyLossProtection)
                        .await
                        .unwrap_or(false)
                    {
                        closed.push(symbol);
                    }
                    continue;
                }
                debug!(symbol, ratio, "margin unsafe but inside false-trigger protection");
            }

            let pnl_from_margin = if margin_used > 0.0 {
                upl / margin_used * 100.0
            } else {
                0.0
            };
            let leverage = self.config.leverage() as f64;

            // Profit harvest (per-regime only).
            if let Some(rp) = self.config.adaptive_regime.regimes.get(&regime) {
                if let (Some(threshold), Some(limit)) =
                    (rp.ph_threshold_usd, rp.ph_time_limit_seconds)
                {
                    let min_holding = metadata.min_holding_seconds.unwrap_or(0.0);
                    if upl >= threshold && age < limit && age >= min_holding {
                        if self
                            .close_position(&symbol, ExitReason::ProfitHarvest)
                            .await
                            .unwrap_or(false)
                        {
                            closed.push(symbol);
                        }
                        continue;
                    }
                }
            }

            // SL only while the trailing stop has not armed.
            if let Some(sl) = metadata
                .sl_percent
                .or_else(|| self.config.resolve(&symbol, regime, |p| p.sl_percent))
            {
                if !self.trailing.is_armed(&symbol) && pnl_from_margin <= -sl {
                    if self
                        .close_position(&symbol, ExitReason::Sl)
                        .await
                        .unwrap_or(false)
                    {
                        closed.push(symbol);
                    }
                    continue;
                }
            }

            // Loss cut on the raw price move.
            let loss_cut = self
                .config
                .resolve(&symbol, regime, |p| p.loss_cut_percent)
                .unwrap_or(3.0);
            let price_move_pct =
                (current / position.entry_price - 1.0) * position.side.dir() * 100.0;
            if price_move_pct <= -loss_cut / leverage {
                if self
                    .close_position(&symbol, ExitReason::LossCut)
                    .await
                    .unwrap_or(false)
                {
                    closed.push(symbol);
                }
                continue;
            }

            // TP with commission + slippage buffers.
            if let Some(tp) = metadata
                .extended_tp_percent
                .or(metadata.tp_percent)
                .or_else(|| self.config.resolve(&symbol, regime, |p| p.tp_percent))
            {
                let commission_pct = (self.config.maker_fee_rate()
                    + self.config.taker_fee_rate())
                    * leverage
                    * 100.0;
                let trigger =
                    tp + commission_pct + self.config.exits.slippage_buffer_percent;
                let min_holding = metadata.min_holding_seconds.unwrap_or(0.0);
                if pnl_from_margin >= trigger && age >= min_holding {
                    if self
                        .close_position(&symbol, ExitReason::Tp)
                        .await
                        .unwrap_or(false)
                    {
                        closed.push(symbol);
                    }
                    continue;
                }
            }

            // Big-profit trailing backstop. Shares the analyzer's 5-minute
            // net-PnL high so both paths see one high-water mark.
            let net_pnl_usd = upl
                - (position.entry_price * position.size_coins * self.config.maker_fee_rate()
                    + current * position.size_coins * self.config.taker_fee_rate());
            let big_profit = self.analyzer.check_big_profit(
                &symbol,
                regime,
                self.data.get_indicators(&symbol).adx_14,
                net_pnl_usd,
                age,
                metadata.min_holding_seconds.unwrap_or(0.0),
                now,
            );
            if let Some(ExitDecision::Close { reason }) = big_profit {
                if self
                    .close_position(&symbol, reason)
                    .await
                    .unwrap_or(false)
                {
                    closed.push(symbol);
                }
                continue;
            }

            // Partial TP backstop.
            if !metadata.partial_tp_done {
                if let (Some(trigger), Some(fraction)) = (
                    self.config
                        .resolve(&symbol, regime, |p| p.partial_tp_trigger_percent),
                    self.config
                        .resolve(&symbol, regime, |p| p.partial_tp_fraction),
                ) {
                    if pnl_from_margin >= trigger {
                        let _ = self
                            .partial_close(&symbol, fraction, ExitReason::PartialTp)
                            .await;
                    }
                }
            }
        }

        closed
    }

    /// Close every open position (emergency stop path).
    pub async fn close_all(&self, reason: ExitReason) -> usize {
        let symbols: Vec<String> = self.registry.get_all().into_keys().collect();
        let mut count = 0;
        for symbol in symbols {
            match self.close_position(&symbol, reason).await {
                Ok(true) => count += 1,
                Ok(false) => {}
                Err(e) => warn!(symbol = %symbol, error = %e, "close-all failed for symbol"),
            }
        }
        count
    }
}
