// =============================================================================
// Conversion Metrics — the signal funnel
// =============================================================================
//
// Every candidate signal either executes or is filtered with a named reason.
// The funnel feeds the periodic stats log line and the journal.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use crate::types::Regime;

/// Snapshot of the funnel for one symbol.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SymbolFunnel {
    pub generated: u64,
    pub executed: u64,
    pub filtered: HashMap<String, u64>,
}

impl SymbolFunnel {
    pub fn conversion_rate(&self) -> f64 {
        if self.generated == 0 {
            return 0.0;
        }
        self.executed as f64 / self.generated as f64
    }
}

#[derive(Debug, Default)]
pub struct ConversionMetrics {
    funnels: RwLock<HashMap<String, SymbolFunnel>>,
}

impl ConversionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_generated(&self, symbol: &str) {
        self.funnels
            .write()
            .entry(symbol.to_string())
            .or_default()
            .generated += 1;
    }

    /// A signal dropped by gating. `reason` is a stable snake_case tag
    /// (e.g. `concurrent_lock`, `cooldown`, `below_min_size`).
    pub fn record_filtered(&self, symbol: &str, reason: &str) {
        let mut funnels = self.funnels.write();
        let funnel = funnels.entry(symbol.to_string()).or_default();
        *funnel.filtered.entry(reason.to_string()).or_default() += 1;
        debug!(symbol, reason, "signal filtered");
    }

    pub fn record_executed(&self, symbol: &str, regime: Regime) {
        self.funnels
            .write()
            .entry(symbol.to_string())
            .or_default()
            .executed += 1;
        debug!(symbol, regime = %regime, "signal executed");
    }

    pub fn snapshot(&self) -> HashMap<String, SymbolFunnel> {
        self.funnels.read().clone()
    }

    pub fn filtered_count(&self, symbol: &str, reason: &str) -> u64 {
        self.funnels
            .read()
            .get(symbol)
            .and_then(|f| f.filtered.get(reason))
            .copied()
            .unwrap_or(0)
    }
}
