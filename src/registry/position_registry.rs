// =============================================================================
// Position Registry — the single source of truth for open positions
// =============================================================================
//
// Holds one record per symbol: the exchange-derived position plus the local
// metadata created at entry. All reads hand out deep copies; mutation goes
// through `register` / `update` / `unregister` only. Registering an existing
// symbol is an update; unregistering a missing symbol is a no-op.
//
// The registry also guards the `closing` set that serializes close pipelines:
// a symbol whose close is in flight cannot be closed a second time.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{BalanceProfile, Regime, Side};

// ---------------------------------------------------------------------------
// Position model
// ---------------------------------------------------------------------------

/// An open position as reported by the exchange, normalised into engine
/// units. Exists iff the exchange reports a non-zero size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    /// Size in contracts, always positive.
    pub size_contracts: f64,
    /// Size in coins: `size_contracts * ct_val`.
    pub size_coins: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub leverage: u32,
    pub unrealized_pnl: f64,
    /// Isolated margin allocated to the position (USDT).
    pub margin: f64,
    /// Exchange-reported open time, when available.
    pub open_time: Option<DateTime<Utc>>,
    /// Auto-deleveraging rank (0-5; higher = more exposed).
    #[serde(default)]
    pub adl_rank: u8,
}

/// One scale-in event. `scaling_history` is append-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingEvent {
    pub at: DateTime<Utc>,
    pub added_coins: f64,
    pub price: f64,
}

/// Locally-owned metadata created when a position is first registered.
/// `entry_time`, `regime`, `balance_profile` and `position_side` are set once
/// at entry and survive exchange updates that omit them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionMetadata {
    pub entry_time: DateTime<Utc>,
    /// Stable id for journal correlation: `SYMBOL:epoch_ms:order_id`.
    pub position_id: String,
    pub regime: Regime,
    pub balance_profile: BalanceProfile,
    pub entry_price: f64,
    pub position_side: Side,
    pub order_id: Option<String>,
    pub tp_percent: Option<f64>,
    pub sl_percent: Option<f64>,
    pub leverage: u32,
    pub size_in_coins: f64,
    pub margin_used: f64,
    pub min_holding_seconds: Option<f64>,
    /// Partial take-profit fires at most once per position.
    #[serde(default)]
    pub partial_tp_done: bool,
    /// Raised TP threshold after strong-trend extensions, if any.
    #[serde(default)]
    pub extended_tp_percent: Option<f64>,
    /// Extended max-holding deadline after a profitable time-exit extension.
    #[serde(default)]
    pub extended_max_holding_minutes: Option<f64>,
    #[serde(default)]
    pub scaling_history: Vec<ScalingEvent>,
    pub created_at: DateTime<Utc>,
}

impl PositionMetadata {
    /// Build metadata at entry time. `entry_time` comes from the exchange's
    /// reported creation time when available, else the registration wall
    /// clock (UTC) — and is never changed afterwards.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: &str,
        entry_time: DateTime<Utc>,
        regime: Regime,
        balance_profile: BalanceProfile,
        entry_price: f64,
        position_side: Side,
        order_id: Option<String>,
        leverage: u32,
        size_in_coins: f64,
        margin_used: f64,
    ) -> Self {
        let position_id = format!(
            "{}:{}:{}",
            symbol,
            entry_time.timestamp_millis(),
            order_id.as_deref().unwrap_or("")
        );
        Self {
            entry_time,
            position_id,
            regime,
            balance_profile,
            entry_price,
            position_side,
            order_id,
            tp_percent: None,
            sl_percent: None,
            leverage,
            size_in_coins,
            margin_used,
            min_holding_seconds: None,
            partial_tp_done: false,
            extended_tp_percent: None,
            extended_max_holding_minutes: None,
            scaling_history: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Position age relative to `now`.
    pub fn age_seconds(&self, now: DateTime<Utc>) -> f64 {
        (now - self.entry_time).num_milliseconds() as f64 / 1000.0
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct Inner {
    positions: HashMap<String, Position>,
    metadata: HashMap<String, PositionMetadata>,
    /// Symbols with a close pipeline in flight.
    closing: HashSet<String>,
}

/// Thread-safe registry. At most one record per symbol.
pub struct PositionRegistry {
    inner: RwLock<Inner>,
}

impl PositionRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                positions: HashMap::new(),
                metadata: HashMap::new(),
                closing: HashSet::new(),
            }),
        }
    }

    /// Register a position. If the symbol already exists this is an update of
    /// the position record; the existing metadata's immutable fields are
    /// kept.
    pub fn register(&self, symbol: &str, position: Position, metadata: PositionMetadata) {
        let mut inner = self.inner.write();
        let existed = inner.positions.contains_key(symbol);
        inner.positions.insert(symbol.to_string(), position);
        if existed {
            debug!(symbol, "register on existing symbol treated as update");
            // entry_time is set exactly once; keep the original metadata.
            inner
                .metadata
                .entry(symbol.to_string())
                .or_insert(metadata);
        } else {
            inner.metadata.insert(symbol.to_string(), metadata);
            debug!(symbol, "position registered");
        }
    }

    /// Mutate a position and its metadata in place. No-op when the symbol is
    /// not registered.
    pub fn update<F>(&self, symbol: &str, mutate: F)
    where
        F: FnOnce(&mut Position, &mut PositionMetadata),
    {
        let mut inner = self.inner.write();
        let Inner {
            positions,
            metadata,
            ..
        } = &mut *inner;
        match (positions.get_mut(symbol), metadata.get_mut(symbol)) {
            (Some(pos), Some(meta)) => mutate(pos, meta),
            _ => warn!(symbol, "update on unregistered symbol ignored"),
        }
    }

    /// Remove a symbol. No-op when absent. Also clears the closing mark.
    pub fn unregister(&self, symbol: &str) {
        let mut inner = self.inner.write();
        inner.positions.remove(symbol);
        inner.metadata.remove(symbol);
        inner.closing.remove(symbol);
        debug!(symbol, "position unregistered");
    }

    pub fn has(&self, symbol: &str) -> bool {
        self.inner.read().positions.contains_key(symbol)
    }

    pub fn get(&self, symbol: &str) -> Option<Position> {
        self.inner.read().positions.get(symbol).cloned()
    }

    pub fn get_metadata(&self, symbol: &str) -> Option<PositionMetadata> {
        self.inner.read().metadata.get(symbol).cloned()
    }

    pub fn get_all(&self) -> HashMap<String, Position> {
        self.inner.read().positions.clone()
    }

    pub fn get_all_metadata(&self) -> HashMap<String, PositionMetadata> {
        self.inner.read().metadata.clone()
    }

    pub fn count(&self) -> usize {
        self.inner.read().positions.len()
    }

    // -------------------------------------------------------------------------
    // Close serialization
    // -------------------------------------------------------------------------

    /// Mark a symbol's close pipeline as started. Returns `false` when a
    /// close is already in flight — the caller must not emit a second close
    /// order.
    pub fn begin_close(&self, symbol: &str) -> bool {
        let mut inner = self.inner.write();
        if !inner.positions.contains_key(symbol) {
            return false;
        }
        inner.closing.insert(symbol.to_string())
    }

    /// Clear the closing mark (close finished or failed).
    pub fn end_close(&self, symbol: &str) {
        self.inner.write().closing.remove(symbol);
    }

    pub fn is_closing(&self, symbol: &str) -> bool {
        self.inner.read().closing.contains(symbol)
    }

    // -------------------------------------------------------------------------
    // Metadata helpers
    // -------------------------------------------------------------------------

    /// Flip `partial_tp_done` to true. Monotone: never reset while the
    /// position lives.
    pub fn mark_partial_tp_done(&self, symbol: &str) {
        self.update(symbol, |_, meta| meta.partial_tp_done = true);
    }

    /// Append a scale-in event, enforcing the profile's addition cap.
    /// Returns `false` when the cap is reached and nothing was recorded.
    pub fn push_scaling_event(&self, symbol: &str, event: ScalingEvent, max_additions: u32) -> bool {
        let mut inner = self.inner.write();
        match inner.metadata.get_mut(symbol) {
            Some(meta) if (meta.scaling_history.len() as u32) < max_additions.min(4) => {
                meta.scaling_history.push(event);
                true
            }
            Some(meta) => {
                warn!(
                    symbol,
                    count = meta.scaling_history.len(),
                    cap = max_additions.min(4),
                    "scale-in rejected, addition cap reached"
                );
                false
            }
            None => false,
        }
    }
}

impl Default for PositionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PositionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("PositionRegistry")
            .field("positions", &inner.positions.len())
            .field("closing", &inner.closing.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_position(symbol: &str, side: Side, size_coins: f64) -> Position {
        Position {
            symbol: symbol.to_string(),
            side,
            size_contracts: size_coins / 0.01,
            size_coins,
            entry_price: 100.0,
            mark_price: 100.0,
            leverage: 5,
            unrealized_pnl: 0.0,
            margin: 200.0,
            open_time: None,
            adl_rank: 0,
        }
    }

    fn sample_metadata(symbol: &str) -> PositionMetadata {
        PositionMetadata::new(
            symbol,
            Utc::now(),
            Regime::Ranging,
            BalanceProfile::Small,
            100.0,
            Side::Long,
            Some("ord-1".into()),
            5,
            1.0,
            200.0,
        )
    }

    #[test]
    fn register_get_unregister_roundtrip() {
        let reg = PositionRegistry::new();
        assert!(!reg.has("BTC-USDT"));

        reg.register(
            "BTC-USDT",
            sample_position("BTC-USDT", Side::Long, 1.0),
            sample_metadata("BTC-USDT"),
        );
        assert!(reg.has("BTC-USDT"));
        assert_eq!(reg.count(), 1);

        let pos = reg.get("BTC-USDT").unwrap();
        assert_eq!(pos.side, Side::Long);
        assert!(reg.get_metadata("BTC-USDT").is_some());

        reg.unregister("BTC-USDT");
        assert!(!reg.has("BTC-USDT"));
        // Unregistering again is a no-op.
        reg.unregister("BTC-USDT");
        assert_eq!(reg.count(), 0);
    }

    #[test]
    fn reads_return_deep_copies() {
        let reg = PositionRegistry::new();
        reg.register(
            "BTC-USDT",
            sample_position("BTC-USDT", Side::Long, 1.0),
            sample_metadata("BTC-USDT"),
        );

        let mut copy = reg.get("BTC-USDT").unwrap();
        copy.mark_price = 999.0;
        // Mutating the copy must not touch the registry.
        assert!((reg.get("BTC-USDT").unwrap().mark_price - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn reregister_preserves_original_entry_time() {
        let reg = PositionRegistry::new();
        let first = sample_metadata("BTC-USDT");
        let original_entry = first.entry_time;
        reg.register(
            "BTC-USDT",
            sample_position("BTC-USDT", Side::Long, 1.0),
            first,
        );

        // Second registration with different metadata: position updates,
        // entry_time stays.
        let mut second = sample_metadata("BTC-USDT");
        second.entry_time = original_entry + chrono::Duration::hours(1);
        reg.register(
            "BTC-USDT",
            sample_position("BTC-USDT", Side::Long, 2.0),
            second,
        );

        assert!((reg.get("BTC-USDT").unwrap().size_coins - 2.0).abs() < f64::EPSILON);
        assert_eq!(reg.get_metadata("BTC-USDT").unwrap().entry_time, original_entry);
    }

    #[test]
    fn update_on_missing_symbol_is_noop() {
        let reg = PositionRegistry::new();
        reg.update("NOPE-USDT", |pos, _| pos.mark_price = 1.0);
        assert!(!reg.has("NOPE-USDT"));
    }

    #[test]
    fn closing_set_serializes_closes() {
        let reg = PositionRegistry::new();
        reg.register(
            "BTC-USDT",
            sample_position("BTC-USDT", Side::Long, 1.0),
            sample_metadata("BTC-USDT"),
        );

        assert!(reg.begin_close("BTC-USDT"));
        // Concurrent second close attempt is refused.
        assert!(!reg.begin_close("BTC-USDT"));
        assert!(reg.is_closing("BTC-USDT"));

        reg.end_close("BTC-USDT");
        assert!(reg.begin_close("BTC-USDT"));
    }

    #[test]
    fn begin_close_refused_for_unknown_symbol() {
        let reg = PositionRegistry::new();
        assert!(!reg.begin_close("GHOST-USDT"));
    }

    #[test]
    fn partial_tp_flag_is_monotone() {
        let reg = PositionRegistry::new();
        reg.register(
            "BTC-USDT",
            sample_position("BTC-USDT", Side::Long, 1.0),
            sample_metadata("BTC-USDT"),
        );
        assert!(!reg.get_metadata("BTC-USDT").unwrap().partial_tp_done);
        reg.mark_partial_tp_done("BTC-USDT");
        assert!(reg.get_metadata("BTC-USDT").unwrap().partial_tp_done);
        reg.mark_partial_tp_done("BTC-USDT");
        assert!(reg.get_metadata("BTC-USDT").unwrap().partial_tp_done);
    }

    #[test]
    fn scaling_history_append_only_with_cap() {
        let reg = PositionRegistry::new();
        reg.register(
            "BTC-USDT",
            sample_position("BTC-USDT", Side::Long, 1.0),
            sample_metadata("BTC-USDT"),
        );

        let event = ScalingEvent {
            at: Utc::now(),
            added_coins: 0.1,
            price: 101.0,
        };
        assert!(reg.push_scaling_event("BTC-USDT", event.clone(), 2));
        assert!(reg.push_scaling_event("BTC-USDT", event.clone(), 2));
        // Cap reached.
        assert!(!reg.push_scaling_event("BTC-USDT", event.clone(), 2));
        assert_eq!(
            reg.get_metadata("BTC-USDT").unwrap().scaling_history.len(),
            2
        );

        // Hard cap of 4 even when a profile claims more.
        for _ in 0..10 {
            reg.push_scaling_event("BTC-USDT", event.clone(), 99);
        }
        assert_eq!(
            reg.get_metadata("BTC-USDT").unwrap().scaling_history.len(),
            4
        );
    }

    #[test]
    fn metadata_json_roundtrip() {
        let meta = sample_metadata("BTC-USDT");
        let json = serde_json::to_string(&meta).unwrap();
        let back: PositionMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back.position_id, meta.position_id);
        assert_eq!(back.entry_time, meta.entry_time);
        assert_eq!(back.regime, meta.regime);
        assert_eq!(back.partial_tp_done, meta.partial_tp_done);
        assert_eq!(back.scaling_history, meta.scaling_history);
    }
}
