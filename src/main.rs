// =============================================================================
// Meridian Futures Scalper — Main Entry Point
// =============================================================================
//
// Startup order matters: config validation (exit 1 on any missing key),
// account sanity + leverage + instrument specs (exit 2 on an unreachable or
// misconfigured exchange), candle bootstrap, startup reconciliation, then
// the streaming tasks and the main loop.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod config;
mod entry;
mod error;
mod exit;
mod indicators;
mod journal;
mod margin;
mod market_data;
mod metrics;
mod okx;
mod orchestrator;
mod orders;
mod position_manager;
mod regime;
mod registry;
mod risk;
mod signals;
mod sync;
mod types;
mod ws;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::entry::EntryManager;
use crate::error::EngineError;
use crate::exit::monitor::PositionMonitor;
use crate::exit::{ExitAnalyzer, TrailingSlCoordinator};
use crate::journal::TradeJournal;
use crate::metrics::{ConversionMetrics, PerformanceTracker, SloCounters};
use crate::okx::{ExchangeApi, OkxClient};
use crate::orchestrator::Orchestrator;
use crate::orders::OrderCoordinator;
use crate::position_manager::PositionManager;
use crate::regime::RegimeDetector;
use crate::registry::{DataRegistry, PositionRegistry};
use crate::risk::RiskManager;
use crate::signals::{SignalCoordinator, SignalGenerator};
use crate::sync::PositionSync;
use crate::types::{SymbolSpec, Timeframe};
use crate::ws::{PrivateWsCoordinator, PublicWsCoordinator};

#[tokio::main]
async fn main() {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let code = match run().await {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "engine terminated");
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<(), EngineError> {
    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║          Meridian Futures Scalper — Starting Up          ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // ── 1. Configuration ─────────────────────────────────────────────────
    let config_path = std::env::args().nth(1).ok_or_else(|| {
        EngineError::config("<argv[1]>", "usage: meridian <config.yaml>")
    })?;
    let config = Arc::new(Config::load(&config_path)?);

    // ── 2. Exchange client ───────────────────────────────────────────────
    let api_key = std::env::var("MERIDIAN_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("MERIDIAN_API_SECRET").unwrap_or_default();
    let passphrase = std::env::var("MERIDIAN_PASSPHRASE").unwrap_or_default();
    if api_key.is_empty() || api_secret.is_empty() {
        warn!("MERIDIAN_API_KEY / MERIDIAN_API_SECRET not set — private endpoints will fail");
    }
    let okx = OkxClient::new(
        config.exchange.rest_url.clone(),
        api_key.clone(),
        api_secret.clone(),
        passphrase.clone(),
        config.exchange.request_timeout_secs,
    );
    let client: Arc<dyn ExchangeApi> = Arc::new(okx);

    // ── 3. Account sanity ────────────────────────────────────────────────
    let account = client
        .get_account_config()
        .await
        .map_err(|e| EngineError::ExchangeTransient(format!("account config: {e}")))?;
    if account.pos_mode != "long_short_mode" {
        return Err(EngineError::ExchangeSemantic {
            code: account.pos_mode.clone(),
            message: "account must be in long_short_mode".to_string(),
        });
    }

    let initial_balance = client
        .get_balance()
        .await
        .map_err(|e| EngineError::ExchangeTransient(format!("initial balance: {e}")))?;
    info!(initial_balance, "account verified");

    // ── 4. Leverage + instrument specs ───────────────────────────────────
    let mut specs: HashMap<String, SymbolSpec> = HashMap::new();
    for symbol in &config.symbols {
        if let Err(e) = client.set_leverage(symbol, config.leverage(), None).await {
            warn!(symbol = %symbol, error = %e, "set_leverage failed, continuing with account default");
        }
        let details = client
            .get_instrument_details(symbol)
            .await
            .map_err(|e| EngineError::ExchangeTransient(format!("instrument {symbol}: {e}")))?;
        specs.insert(
            symbol.clone(),
            SymbolSpec {
                symbol: symbol.clone(),
                ct_val: details.ct_val,
                min_size: details.min_size,
                tick_size: details.tick_size,
                lot_size: details.lot_size,
                leverage: config.leverage(),
            },
        );
    }
    let specs = Arc::new(specs);
    info!(count = specs.len(), "instrument specs loaded");

    // ── 5. Core state ────────────────────────────────────────────────────
    let data = Arc::new(DataRegistry::new(config.websocket.ws_stale_seconds));
    let registry = Arc::new(PositionRegistry::new());
    let journal = Arc::new(TradeJournal::new(
        &config.journal.trades_csv,
        &config.journal.events_jsonl,
    ));
    let slo = Arc::new(SloCounters::new());
    let metrics = Arc::new(ConversionMetrics::new());
    let performance = Arc::new(PerformanceTracker::new());
    let trailing = Arc::new(TrailingSlCoordinator::new());
    let analyzer = Arc::new(ExitAnalyzer::new(config.clone()));
    let risk = Arc::new(RiskManager::new(config.clone(), initial_balance));
    data.update_balance(initial_balance, config.profile_for_equity(initial_balance));

    // ── 6. Candle bootstrap ──────────────────────────────────────────────
    for symbol in &config.symbols {
        for tf in Timeframe::ALL {
            match client.get_candles(symbol, tf, tf.max_candles()).await {
                Ok(candles) if !candles.is_empty() => {
                    let count = candles.len();
                    data.initialize_candles(symbol, tf, candles);
                    journal.record_event(
                        "candle_init",
                        serde_json::json!({"symbol": symbol, "timeframe": tf.as_str(), "count": count}),
                    );
                }
                Ok(_) => warn!(symbol = %symbol, timeframe = %tf, "no candles returned at bootstrap"),
                Err(e) => warn!(symbol = %symbol, timeframe = %tf, error = %e, "candle bootstrap failed"),
            }
        }
        data.refresh_indicators(symbol);
    }

    // ── 7. Coordinators ──────────────────────────────────────────────────
    let order_coordinator = Arc::new(OrderCoordinator::new(
        client.clone(),
        data.clone(),
        config.clone(),
        journal.clone(),
    ));
    let position_manager = Arc::new(PositionManager::new(
        client.clone(),
        config.clone(),
        registry.clone(),
        data.clone(),
        trailing.clone(),
        analyzer.clone(),
        risk.clone(),
        journal.clone(),
        slo.clone(),
        performance.clone(),
        specs.clone(),
    ));
    let position_sync = Arc::new(PositionSync::new(
        client.clone(),
        config.clone(),
        registry.clone(),
        data.clone(),
        trailing.clone(),
        risk.clone(),
        order_coordinator.clone(),
        journal.clone(),
        specs.clone(),
    ));
    let entry_manager = Arc::new(EntryManager::new(
        client.clone(),
        config.clone(),
        registry.clone(),
        data.clone(),
        order_coordinator.clone(),
        trailing.clone(),
        metrics.clone(),
        journal.clone(),
        specs.clone(),
    ));
    let generator = Arc::new(SignalGenerator::new(config.clone(), data.clone()));
    let signal_coordinator = Arc::new(SignalCoordinator::new(
        config.clone(),
        registry.clone(),
        data.clone(),
        risk.clone(),
        order_coordinator.clone(),
        entry_manager,
        metrics.clone(),
        slo.clone(),
        specs.clone(),
    ));
    let regime_detector = Arc::new(RegimeDetector::new(data.clone()));

    // ── 8. Startup reconciliation ────────────────────────────────────────
    match position_sync.startup_reconcile().await {
        Ok(report) => info!(
            added = report.drift_added,
            removed = report.drift_removed,
            "startup reconciliation complete"
        ),
        Err(e) => warn!(error = %e, "startup reconciliation failed, continuing"),
    }

    // ── 9. Streaming tasks ───────────────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    let (signal_tx, signal_rx) = tokio::sync::mpsc::channel(1024);

    let public_ws = Arc::new(PublicWsCoordinator::new(
        config.clone(),
        data.clone(),
        registry.clone(),
        trailing.clone(),
        position_manager.clone(),
        slo.clone(),
    ));
    public_ws.set_signal_sender(signal_tx);
    tokio::spawn(public_ws.run(running.clone()));

    let private_ws = Arc::new(PrivateWsCoordinator::new(
        config.clone(),
        api_key,
        api_secret,
        passphrase,
        data.clone(),
        registry.clone(),
        trailing.clone(),
        order_coordinator.clone(),
        slo.clone(),
    ));
    tokio::spawn(private_ws.run(running.clone()));

    let monitor = Arc::new(PositionMonitor::new(
        registry.clone(),
        data.clone(),
        analyzer.clone(),
        position_manager.clone(),
        5.0,
    ));
    tokio::spawn(monitor.run(running.clone()));

    // ── 10. Main loop + graceful shutdown ────────────────────────────────
    let orchestrator = Orchestrator::new(
        config.clone(),
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
        slo.clone(),
        performance,
        journal.clone(),
        running.clone(),
        signal_rx,
    );

    let loop_running = running.clone();
    let main_loop = tokio::spawn(async move { orchestrator.run().await });

    shutdown_signal().await;
    warn!("shutdown signal received — stopping gracefully");
    loop_running.store(false, Ordering::Relaxed);

    // Give the loop one interval to drain.
    let _ = tokio::time::timeout(
        std::time::Duration::from_secs(config.scalping.check_interval_secs as u64 + 2),
        main_loop,
    )
    .await;

    journal.record_event("shutdown", serde_json::json!({"clean": true}));
    info!("Meridian shut down complete.");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
