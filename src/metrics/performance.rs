// =============================================================================
// Performance Tracker — per-loop snapshot of open exposure
// =============================================================================
//
// Lightweight running view for the main loop: open position count, total
// unrealized PnL, equity, and realized PnL accumulated from closed trades.

use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use crate::registry::Position;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PerformanceSnapshot {
    pub open_positions: usize,
    pub total_unrealized_pnl: f64,
    pub total_notional: f64,
    pub equity: f64,
    pub realized_pnl: f64,
    pub closed_trades: u64,
    pub winning_trades: u64,
}

impl PerformanceSnapshot {
    pub fn win_rate(&self) -> f64 {
        if self.closed_trades == 0 {
            return 0.0;
        }
        self.winning_trades as f64 / self.closed_trades as f64
    }
}

#[derive(Debug, Default)]
pub struct PerformanceTracker {
    snapshot: RwLock<PerformanceSnapshot>,
}

impl PerformanceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refresh the open-exposure half of the snapshot.
    pub fn update(&self, positions: &[Position], equity: f64) {
        let mut snap = self.snapshot.write();
        snap.open_positions = positions.len();
        snap.total_unrealized_pnl = positions.iter().map(|p| p.unrealized_pnl).sum();
        snap.total_notional = positions
            .iter()
            .map(|p| p.size_coins * p.mark_price)
            .sum();
        snap.equity = equity;
        debug!(
            open = snap.open_positions,
            upl = snap.total_unrealized_pnl,
            notional = snap.total_notional,
            equity,
            "performance updated"
        );
    }

    /// Accumulate a realized trade result.
    pub fn record_close(&self, net_pnl: f64) {
        let mut snap = self.snapshot.write();
        snap.realized_pnl += net_pnl;
        snap.closed_trades += 1;
        if net_pnl > 0.0 {
            snap.winning_trades += 1;
        }
    }

    pub fn snapshot(&self) -> PerformanceSnapshot {
        *self.snapshot.read()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    fn position(symbol: &str, upl: f64) -> Position {
        Position {
            symbol: symbol.to_string(),
            side: Side::Long,
            size_contracts: 100.0,
            size_coins: 1.0,
            entry_price: 100.0,
            mark_price: 100.0 + upl,
            leverage: 5,
            unrealized_pnl: upl,
            margin: 20.0,
            open_time: None,
            adl_rank: 0,
        }
    }

    #[test]
    fn update_aggregates_open_positions() {
        let tracker = PerformanceTracker::new();
        tracker.update(&[position("BTC-USDT", 5.0), position("ETH-USDT", -2.0)], 1000.0);

        let snap = tracker.snapshot();
        assert_eq!(snap.open_positions, 2);
        assert!((snap.total_unrealized_pnl - 3.0).abs() < 1e-9);
        assert!((snap.equity - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn record_close_tracks_win_rate() {
        let tracker = PerformanceTracker::new();
        tracker.record_close(10.0);
        tracker.record_close(-4.0);
        tracker.record_close(2.0);

        let snap = tracker.snapshot();
        assert_eq!(snap.closed_trades, 3);
        assert_eq!(snap.winning_trades, 2);
        assert!((snap.realized_pnl - 8.0).abs() < 1e-9);
        assert!((snap.win_rate() - 2.0 / 3.0).abs() < 1e-9);
    }
}
