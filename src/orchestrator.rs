// =============================================================================
// Orchestrator — lifecycle and the cooperative main loop
// =============================================================================
//
// One pass per `check_interval`:
//    1. Re-snapshot exchange positions into the registry (metadata-preserving).
//    2. Refresh regimes; journal transitions.
//    3. Generate signals (plus WS-ticked symbols) and run them through the
//       Signal Coordinator.
//    4. Defensive position-manager checks.
//    5. Limit-order sweep (re-pricing, timeout re-validation, fallbacks).
//    6. Order cache status reconciliation.
//    7. Position sync (forced after market fallbacks and closes).
//    8. Performance tracker update.
//    9. Trailing-stop periodic fallback.
//   10. Drawdown check / emergency-stop maintenance, then sleep.
//
// `is_running` is observed between steps; every coordinator contains its own
// errors so a failing step degrades the pass instead of tearing the process
// down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::metrics::{ConversionMetrics, PerformanceTracker, SloCounters};
use crate::okx::ExchangeApi;
use crate::orders::OrderCoordinator;
use crate::position_manager::PositionManager;
use crate::regime::RegimeDetector;
use crate::registry::{DataRegistry, PositionRegistry};
use crate::risk::RiskManager;
use crate::signals::{SignalCoordinator, SignalGenerator};
use crate::sync::PositionSync;
use crate::exit::TrailingSlCoordinator;
use crate::journal::TradeJournal;
use crate::types::ExitReason;

pub struct Orchestrator {
    pub config: Arc<Config>,
    pub client: Arc<dyn ExchangeApi>,
    pub data: Arc<DataRegistry>,
    pub registry: Arc<PositionRegistry>,
    pub risk: Arc<RiskManager>,
    pub generator: Arc<SignalGenerator>,
    pub signal_coordinator: Arc<SignalCoordinator>,
    pub order_coordinator: Arc<OrderCoordinator>,
    pub position_manager: Arc<PositionManager>,
    pub position_sync: Arc<PositionSync>,
    pub trailing: Arc<TrailingSlCoordinator>,
    pub regime_detector: Arc<RegimeDetector>,
    pub metrics: Arc<ConversionMetrics>,
    pub slo: Arc<SloCounters>,
    pub performance: Arc<PerformanceTracker>,
    pub journal: Arc<TradeJournal>,
    pub running: Arc<AtomicBool>,
    /// Symbols ticked by the public WS since the last pass.
    signal_rx: Mutex<mpsc::Receiver<String>>,
    /// Last REST price fallback per symbol, floored by api_request_delay_ms.
    last_rest_fallback: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        client: Arc<dyn ExchangeApi>,
        data: Arc<DataRegistry>,
        registry: Arc<PositionRegistry>,
        risk: Arc<RiskManager>,
        generator: Arc<SignalGenerator>,
        signal_coordinator: Arc<SignalCoordinator>,
        order_coordinator: Arc<OrderCoordinator>,
        position_manager: Arc<PositionManager>,
        position_sync: Arc<PositionSync>,
        trailing: Arc<TrailingSlCoordinator>,
        regime_detector: Arc<RegimeDetector>,
        metrics: Arc<ConversionMetrics>,
        slo: Arc<SloCounters>,
        performance: Arc<PerformanceTracker>,
        journal: Arc<TradeJournal>,
        running: Arc<AtomicBool>,
        signal_rx: mpsc::Receiver<String>,
    ) -> Self {
        Self {
            config,
            client,
            data,
            registry,
            risk,
            generator,
            signal_coordinator,
            order_coordinator,
            position_manager,
            position_sync,
            trailing,
            regime_detector,
            metrics,
            slo,
            performance,
            journal,
            running,
            signal_rx: Mutex::new(signal_rx),
            last_rest_fallback: Mutex::new(HashMap::new()),
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// The main loop. Returns when `running` clears.
    pub async fn run(&self) {
        info!(
            interval_secs = self.config.scalping.check_interval_secs,
            "orchestrator main loop starting"
        );

        while self.is_running() {
            self.run_cycle().await;
            tokio::time::sleep(std::time::Duration::from_millis(
                (self.config.scalping.check_interval_secs * 1000.0) as u64,
            ))
            .await;
        }
        info!("orchestrator main loop stopped");
    }

    /// One pass of the ten steps. Public for tests.
    pub async fn run_cycle(&self) {
        // ── 1. Re-snapshot positions ─────────────────────────────────────
        self.update_state().await;
        if !self.is_running() {
            return;
        }

        // ── 2. Regimes ───────────────────────────────────────────────────
        for (symbol, from, to) in self.regime_detector.update_all(&self.config.symbols) {
            self.journal.record_event(
                "regime_transition",
                serde_json::json!({"symbol": symbol, "from": from.as_str(), "to": to.as_str()}),
            );
        }

        // Stale-ticker watchdog with bounded REST fallback.
        self.check_ticker_staleness().await;
        if !self.is_running() {
            return;
        }

        // ── 3. Signals ───────────────────────────────────────────────────
        let mut signals = self.generator.generate_signals();
        for symbol in self.drain_ticked_symbols() {
            if !signals.iter().any(|s| s.symbol == symbol) {
                if let Some(signal) = self.generator.generate_for(&symbol) {
                    signals.push(signal);
                }
            }
        }
        if !signals.is_empty() {
            debug!(count = signals.len(), "processing candidate signals");
        }
        self.signal_coordinator.process(signals).await;
        if !self.is_running() {
            return;
        }

        // ── 4. Defensive position checks ─────────────────────────────────
        let closed = self.position_manager.manage_positions().await;
        let force_sync_after_close = !closed.is_empty();
        if !self.is_running() {
            return;
        }

        // ── 5. Limit-order sweep ─────────────────────────────────────────
        // Timeout re-validation shares the per-symbol entry lock: a held
        // lock means an entry is mid-flight and the stale order must go.
        self.order_coordinator
            .monitor_limit_orders(|symbol, side| {
                let lock = self.signal_coordinator.symbol_lock(symbol);
                let result = match lock.try_lock() {
                    Ok(_guard) => self.generator.revalidate(symbol, side),
                    Err(_) => None,
                };
                result
            })
            .await;

        // ── 6. Order cache status ────────────────────────────────────────
        let registry = self.registry.clone();
        self.order_coordinator
            .update_orders_cache_status(move |symbol| registry.has(symbol))
            .await;
        if !self.is_running() {
            return;
        }

        // ── 7. Position sync ─────────────────────────────────────────────
        let force = self.order_coordinator.take_sync_request() || force_sync_after_close;
        if let Err(e) = self.position_sync.sync(force).await {
            warn!(error = %e, "position sync errored, continuing");
        }

        // ── 8. Performance ───────────────────────────────────────────────
        let positions: Vec<_> = self.registry.get_all().into_values().collect();
        self.performance
            .update(&positions, self.data.get_balance().equity);

        // ── 9. Trailing-stop periodic fallback ───────────────────────────
        let data = self.data.clone();
        let decisions = self
            .trailing
            .periodic_check(Utc::now(), |symbol| data.last_price(symbol));
        for (symbol, reason) in decisions {
            if let Err(e) = self.position_manager.close_position(&symbol, reason).await {
                warn!(symbol = %symbol, reason = %reason, error = %e, "periodic trailing close failed");
            }
        }

        // ── 10. Drawdown / emergency stop ────────────────────────────────
        self.check_emergency_stop().await;
    }

    // -------------------------------------------------------------------------
    // Steps
    // -------------------------------------------------------------------------

    /// Step 1: refresh registered positions from the exchange while
    /// preserving locally-owned metadata. Drift add/remove is the
    /// reconciler's job, not this snapshot's.
    async fn update_state(&self) {
        if self.registry.count() == 0 {
            return;
        }
        let positions = match self.client.get_positions(None).await {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "position snapshot unavailable this pass");
                return;
            }
        };
        for pos in positions {
            let symbol = pos.symbol();
            if !self.registry.has(&symbol) || pos.size_contracts() < 1e-8 {
                continue;
            }
            self.registry.update(&symbol, |local, _meta| {
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
                if pos.avg_px > 0.0 {
                    local.entry_price = pos.avg_px;
                }
                local.unrealized_pnl = pos.upl;
                if pos.margin > 0.0 {
                    local.margin = pos.margin;
                }
                local.adl_rank = pos.adl_rank;
            });
        }
    }

    fn drain_ticked_symbols(&self) -> Vec<String> {
        let mut rx = self.signal_rx.lock();
        let mut symbols = Vec::new();
        while let Ok(symbol) = rx.try_recv() {
            if !symbols.contains(&symbol) {
                symbols.push(symbol);
            }
        }
        symbols
    }

    /// Stale-ticker watchdog: when a symbol's ticker is older than the
    /// configured threshold, count it and fall back to a REST price read,
    /// floored by `api_request_delay_ms` per symbol.
    async fn check_ticker_staleness(&self) {
        let threshold = self.config.websocket.ws_stale_seconds;
        let delay_ms = self.config.exchange.api_request_delay_ms as i64;
        let now = Utc::now();

        for symbol in &self.config.symbols {
            let stale = match self.data.get_ticker(symbol) {
                Some(t) => (now.timestamp_millis() - t.timestamp_ms) as f64 / 1000.0 > threshold,
                None => true,
            };
            if !stale {
                continue;
            }
            self.slo.alert(
                &self.slo.ws_stale_signal_fallback,
                "ws_stale_signal_fallback",
                symbol,
            );

            let throttled = self
                .last_rest_fallback
                .lock()
                .get(symbol)
                .is_some_and(|t| (now - *t).num_milliseconds() < delay_ms);
            if throttled {
                continue;
            }
            self.last_rest_fallback.lock().insert(symbol.clone(), now);

            match self.client.get_ticker(symbol).await {
                Ok(ticker) => self.data.update_ticker(ticker),
                Err(e) => debug!(symbol, error = %e, "REST ticker fallback failed"),
            }
        }
    }

    /// Step 10: drawdown tracking, emergency-stop trigger and auto-unlock.
    async fn check_emergency_stop(&self) {
        let balance = self.data.get_balance().equity;
        if balance <= 0.0 {
            return;
        }
        let regime = self.data.global_regime();
        let now = Utc::now();

        if self.risk.check_drawdown(balance, regime, now) {
            let count = self
                .position_manager
                .close_all(ExitReason::EmergencyLossProtection)
                .await;
            warn!(
                closed = count,
                balance,
                "emergency stop: all positions closed, new entries blocked"
            );
            self.journal.record_event(
                "emergency_stop",
                serde_json::json!({"balance": balance, "closed": count}),
            );
            if let Err(e) = self.position_sync.sync(true).await {
                debug!(error = %e, "post-emergency sync failed");
            }
        } else if self.risk.try_unlock(balance, regime, now) {
            self.journal.record_event(
                "emergency_stop_cleared",
                serde_json::json!({"balance": balance}),
            );
        }
    }
}
