// =============================================================================
// Trade Journal — CSV rows per closed position + JSONL event log
// =============================================================================
//
// One CSV row per (full or partial) close with the commission breakdown, and
// a versioned JSONL stream for structural events (candle init, order cancels,
// exit decisions, regime transitions). Both writers append; directories are
// the operator's concern.

use std::fs::OpenOptions;
use std::io::Write as IoWrite;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{ExitReason, Side};

/// Bumped when the JSONL event shape changes.
const EVENT_SCHEMA_VERSION: u32 = 2;

/// One closed (or partially closed) trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    /// Closed size in coins.
    pub size_coins: f64,
    pub gross_pnl: f64,
    pub commission_open: f64,
    pub commission_close: f64,
    pub net_pnl: f64,
    pub duration_sec: f64,
    pub reason: ExitReason,
    pub position_id: String,
}

impl TradeRecord {
    pub fn total_commission(&self) -> f64 {
        self.commission_open + self.commission_close
    }
}

pub struct TradeJournal {
    trades_path: PathBuf,
    events_path: PathBuf,
    write_lock: Mutex<()>,
}

impl TradeJournal {
    pub fn new(trades_path: impl AsRef<Path>, events_path: impl AsRef<Path>) -> Self {
        Self {
            trades_path: trades_path.as_ref().to_path_buf(),
            events_path: events_path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    /// Append one row to the trade CSV. Never fatal: journal failures are
    /// logged and swallowed so they cannot take the engine down.
    pub fn record_trade(&self, record: &TradeRecord) {
        let _guard = self.write_lock.lock();
        if let Err(e) = self.write_trade(record) {
            warn!(error = %e, symbol = %record.symbol, "failed to write trade journal row");
        }
    }

    fn write_trade(&self, record: &TradeRecord) -> anyhow::Result<()> {
        let fresh = !self.trades_path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.trades_path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(fresh)
            .from_writer(file);
        writer.serialize(record)?;
        writer.flush()?;
        debug!(symbol = %record.symbol, reason = %record.reason, net_pnl = record.net_pnl, "trade journaled");
        Ok(())
    }

    /// Append a structured event to the JSONL log.
    pub fn record_event(&self, kind: &str, payload: serde_json::Value) {
        let _guard = self.write_lock.lock();
        let entry = serde_json::json!({
            "schema_version": EVENT_SCHEMA_VERSION,
            "ts": Utc::now().to_rfc3339(),
            "kind": kind,
            "payload": payload,
        });
        if let Err(e) = self.write_event(&entry) {
            warn!(error = %e, kind, "failed to write journal event");
        }
    }

    fn write_event(&self, entry: &serde_json::Value) -> anyhow::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)?;
        writeln!(file, "{entry}")?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn record(symbol: &str, net: f64) -> TradeRecord {
        TradeRecord {
            timestamp: Utc::now(),
            symbol: symbol.to_string(),
            side: Side::Long,
            entry_price: 100.0,
            exit_price: 101.2,
            size_coins: 10.0,
            gross_pnl: 12.0,
            commission_open: 1.0,
            commission_close: 1.012,
            net_pnl: net,
            duration_sec: 320.0,
            reason: ExitReason::Tp,
            position_id: format!("{symbol}:0:ord"),
        }
    }

    #[test]
    fn csv_appends_rows_with_single_header() {
        let dir = std::env::temp_dir().join(format!("meridian-journal-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let trades = dir.join("trades.csv");
        let events = dir.join("events.jsonl");

        let journal = TradeJournal::new(&trades, &events);
        journal.record_trade(&record("BTC-USDT", 9.988));
        journal.record_trade(&record("ETH-USDT", -1.2));

        let content = std::fs::read_to_string(&trades).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3, "header + two rows: {content}");
        assert!(lines[0].contains("net_pnl"));
        assert!(lines[1].contains("BTC-USDT"));
        assert!(lines[1].contains("tp"));
        assert!(lines[2].contains("ETH-USDT"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn events_are_versioned_jsonl() {
        let dir = std::env::temp_dir().join(format!("meridian-events-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let journal = TradeJournal::new(dir.join("t.csv"), dir.join("events.jsonl"));

        journal.record_event("order_cancelled", serde_json::json!({"symbol": "BTC-USDT"}));
        journal.record_event("candle_init", serde_json::json!({"count": 200}));

        let content = std::fs::read_to_string(dir.join("events.jsonl")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let v: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(v["schema_version"], EVENT_SCHEMA_VERSION);
            assert!(v["kind"].is_string());
        }

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn trade_record_roundtrips_through_csv() {
        let rec = record("BTC-USDT", 9.988);
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.serialize(&rec).unwrap();
        let data = String::from_utf8(writer.into_inner().unwrap()).unwrap();

        let mut reader = csv::Reader::from_reader(data.as_bytes());
        let back: TradeRecord = reader.deserialize().next().unwrap().unwrap();
        assert_eq!(back.symbol, rec.symbol);
        assert_eq!(back.reason, rec.reason);
        assert!((back.net_pnl - rec.net_pnl).abs() < 1e-12);
        assert!((back.total_commission() - 2.012).abs() < 1e-12);
    }
}
