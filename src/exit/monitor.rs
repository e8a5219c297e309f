// =============================================================================
// Position Monitor — periodic exit analysis over all open positions
// =============================================================================
//
// Wakes on a fixed cadence, runs the Exit Analyzer per position, persists
// any metadata mutations (TP / holding extensions), and transports the
// decision: full closes and partial closes go through the Position Manager's
// serialized pipelines.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::exit::{ExitAnalyzer, ExitDecision};
use crate::position_manager::PositionManager;
use crate::registry::{DataRegistry, PositionRegistry};

pub struct PositionMonitor {
    registry: Arc<PositionRegistry>,
    data: Arc<DataRegistry>,
    analyzer: Arc<ExitAnalyzer>,
    position_manager: Arc<PositionManager>,
    check_interval_secs: f64,
}

impl PositionMonitor {
    pub fn new(
        registry: Arc<PositionRegistry>,
        data: Arc<DataRegistry>,
        analyzer: Arc<ExitAnalyzer>,
        position_manager: Arc<PositionManager>,
        check_interval_secs: f64,
    ) -> Self {
        Self {
            registry,
            data,
            analyzer,
            position_manager,
            check_interval_secs,
        }
    }

    /// Background loop. Spawned once at startup; exits when `running`
    /// clears.
    pub async fn run(self: Arc<Self>, running: Arc<AtomicBool>) {
        info!(
            interval_secs = self.check_interval_secs,
            "position monitor started"
        );
        let mut ticker = interval(Duration::from_millis(
            (self.check_interval_secs * 1000.0) as u64,
        ));
        while running.load(Ordering::Relaxed) {
            ticker.tick().await;
            self.check_all_positions().await;
        }
        info!("position monitor stopped");
    }

    /// One pass over every registered position.
    pub async fn check_all_positions(&self) {
        let symbols: Vec<String> = self.registry.get_all().into_keys().collect();
        if symbols.is_empty() {
            return;
        }
        debug!(count = symbols.len(), "monitor evaluating positions");
        for symbol in symbols {
            self.check_position(&symbol).await;
        }
    }

    /// Analyze one position and act on the decision.
    pub async fn check_position(&self, symbol: &str) -> Option<ExitDecision> {
        if self.registry.is_closing(symbol) {
            return None;
        }
        let position = self.registry.get(symbol)?;
        let mut metadata = self.registry.get_metadata(symbol)?;
        let before_tp = metadata.extended_tp_percent;
        let before_holding = metadata.extended_max_holding_minutes;

        let snapshot = self.data.get_market_data(symbol);
        let decision = self
            .analyzer
            .analyze(&position, &mut metadata, &snapshot, Utc::now());

        // Persist extensions decided during analysis.
        if metadata.extended_tp_percent != before_tp
            || metadata.extended_max_holding_minutes != before_holding
        {
            let tp = metadata.extended_tp_percent;
            let holding = metadata.extended_max_holding_minutes;
            self.registry.update(symbol, |_, meta| {
                meta.extended_tp_percent = tp;
                meta.extended_max_holding_minutes = holding;
            });
        }

        match &decision {
            ExitDecision::Hold => {
                debug!(symbol, "monitor: hold");
            }
            ExitDecision::ExtendTp { new_tp_percent } => {
                info!(symbol, new_tp_percent, "monitor: TP extended");
            }
            ExitDecision::Close { reason } => {
                if let Err(e) = self.position_manager.close_position(symbol, *reason).await {
                    warn!(symbol, reason = %reason, error = %e, "monitor close failed");
                }
            }
            ExitDecision::PartialClose { fraction, reason } => {
                if let Err(e) = self
                    .position_manager
                    .partial_close(symbol, *fraction, *reason)
                    .await
                {
                    warn!(symbol, fraction, error = %e, "monitor partial close failed");
                }
            }
        }

        Some(decision)
    }
}
