// =============================================================================
// Public WebSocket Coordinator — tickers, candles, book summaries
// =============================================================================
//
// One connection for all configured symbols. Per ticker, in arrival order:
//   1. Data Registry ticker update (+ indicator refresh on candle closes).
//   2. Trailing-stop price callback; a trip goes straight into the close
//      pipeline.
//   3. Smart-exit filter for symbols with open positions.
//   4. Signal-check notification to the orchestrator (cooldown-gated there).
//
// Reconnects with exponential backoff (base 5 s, cap 300 s) up to the
// configured attempt cap; all channels are re-subscribed on each reconnect.
// A silent connection (no frame for 2x the heartbeat interval) trips the
// watchdog and forces a reconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::exit::smart::{self, SmartVerdict};
use crate::exit::TrailingSlCoordinator;
use crate::market_data::Candle;
use crate::metrics::SloCounters;
use crate::okx::inst_id;
use crate::position_manager::PositionManager;
use crate::registry::{DataRegistry, PositionRegistry};
use crate::types::{ExitReason, Ticker, Timeframe};

pub struct PublicWsCoordinator {
    config: Arc<Config>,
    data: Arc<DataRegistry>,
    registry: Arc<PositionRegistry>,
    trailing: Arc<TrailingSlCoordinator>,
    position_manager: Arc<PositionManager>,
    slo: Arc<SloCounters>,
    /// Notifies the orchestrator that a symbol ticked (signal checks are
    /// cooldown-gated on the receiving side). Bounded: a full queue drops
    /// the notification, never buffers it.
    signal_tx: RwLock<Option<mpsc::Sender<String>>>,
}

impl PublicWsCoordinator {
    pub fn new(
        config: Arc<Config>,
        data: Arc<DataRegistry>,
        registry: Arc<PositionRegistry>,
        trailing: Arc<TrailingSlCoordinator>,
        position_manager: Arc<PositionManager>,
        slo: Arc<SloCounters>,
    ) -> Self {
        Self {
            config,
            data,
            registry,
            trailing,
            position_manager,
            slo,
            signal_tx: RwLock::new(None),
        }
    }

    pub fn set_signal_sender(&self, tx: mpsc::Sender<String>) {
        *self.signal_tx.write() = Some(tx);
    }

    // -------------------------------------------------------------------------
    // Connection loop
    // -------------------------------------------------------------------------

    /// Reconnecting outer loop. Runs until `running` clears or the attempt
    /// cap is exhausted.
    pub async fn run(self: Arc<Self>, running: Arc<AtomicBool>) {
        let ws = &self.config.websocket;
        let mut attempt: u32 = 0;

        while running.load(Ordering::Relaxed) {
            match self.connect_and_stream(&running).await {
                Ok(()) => {
                    // Clean shutdown or server-side close: reset backoff.
                    attempt = 0;
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= ws.max_reconnect_attempts {
                        error!(
                            attempt,
                            error = %e,
                            "public WS exceeded reconnect attempts, giving up"
                        );
                        return;
                    }
                    let delay = super::backoff_delay_secs(attempt, ws.backoff_base_secs, ws.backoff_cap_secs);
                    warn!(attempt, delay_secs = delay, error = %e, "public WS reconnecting");
                    tokio::time::sleep(std::time::Duration::from_secs(delay)).await;
                }
            }
        }
    }

    async fn connect_and_stream(&self, running: &AtomicBool) -> Result<()> {
        let url = &self.config.exchange.ws_public_url;
        info!(url = %url, "connecting public WebSocket");
        let (stream, _resp) = connect_async(url)
            .await
            .context("public WS connection failed")?;
        let (mut write, mut read) = stream.split();

        // Re-subscribe everything on every (re)connect.
        let frame = subscribe_frame(&self.config.symbols);
        write
            .send(Message::Text(frame))
            .await
            .context("public WS subscribe failed")?;
        info!(symbols = ?self.config.symbols, "public WS subscribed");

        let heartbeat = std::time::Duration::from_secs(self.config.websocket.heartbeat_secs);
        let mut ping_timer = tokio::time::interval(heartbeat);
        let mut last_frame = std::time::Instant::now();

        loop {
            if !running.load(Ordering::Relaxed) {
                return Ok(());
            }
            tokio::select! {
                _ = ping_timer.tick() => {
                    // Watchdog: a connection silent for 2x the heartbeat is
                    // dead even if the socket looks open.
                    if last_frame.elapsed() > heartbeat * 2 {
                        self.slo.alert(
                            &self.slo.ws_stale_watchdog,
                            "ws_stale_watchdog",
                            "public stream silent",
                        );
                        anyhow::bail!("public WS watchdog: no frames for 2x heartbeat");
                    }
                    write
                        .send(Message::Text("ping".to_string()))
                        .await
                        .context("public WS ping failed")?;
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            last_frame = std::time::Instant::now();
                            if text == "pong" {
                                continue;
                            }
                            self.handle_message(&text).await;
                        }
                        Some(Ok(_)) => {
                            last_frame = std::time::Instant::now();
                        }
                        Some(Err(e)) => {
                            return Err(e).context("public WS read error");
                        }
                        None => {
                            warn!("public WS stream ended");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Message handling
    // -------------------------------------------------------------------------

    async fn handle_message(&self, text: &str) {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => {
                self.slo.alert(
                    &self.slo.ws_parse_errors,
                    "ws_parse_errors",
                    "public frame is not JSON",
                );
                return;
            }
        };
        if value.get("event").is_some() {
            // subscribe acks / errors
            debug!(frame = %value, "public WS event");
            return;
        }

        let channel = value["arg"]["channel"].as_str().unwrap_or("");
        match parse_public_frame(channel, &value) {
            Some(PublicFrame::Ticker(ticker)) => self.on_ticker(ticker).await,
            Some(PublicFrame::Candle {
                symbol,
                timeframe,
                candle,
            }) => {
                self.data.append_candle(&symbol, timeframe, candle);
                self.data.refresh_indicators(&symbol);
            }
            Some(PublicFrame::BookSummary {
                symbol,
                best_bid,
                best_ask,
            }) => {
                if let Some(mut ticker) = self.data.get_ticker(&symbol) {
                    ticker.best_bid = best_bid;
                    ticker.best_ask = best_ask;
                    ticker.timestamp_ms = Utc::now().timestamp_millis();
                    self.data.update_ticker(ticker);
                }
            }
            None => {
                if !channel.is_empty() {
                    self.slo.alert(
                        &self.slo.ws_parse_errors,
                        "ws_parse_errors",
                        "unparseable public frame",
                    );
                }
            }
        }
    }

    async fn on_ticker(&self, ticker: Ticker) {
        let symbol = ticker.symbol.clone();
        let price = ticker.last;
        self.data.update_ticker(ticker);

        // Trailing stop reacts to every tick.
        if let Some(reason) = self.trailing.on_price(&symbol, price, Utc::now()) {
            if let Err(e) = self.position_manager.close_position(&symbol, reason).await {
                warn!(symbol = %symbol, reason = %reason, error = %e, "tick-driven close failed");
            }
        }

        // Smart exit for open positions.
        if self.config.exits.smart_exit_enabled {
            if let Some(position) = self.registry.get(&symbol) {
                if !self.registry.is_closing(&symbol) {
                    let indicators = self.data.get_indicators(&symbol);
                    if smart::evaluate(position.side, &indicators) == SmartVerdict::Close {
                        let old_enough = self
                            .registry
                            .get_metadata(&symbol)
                            .map(|m| {
                                let min = m.min_holding_seconds.unwrap_or(0.0);
                                m.age_seconds(Utc::now()) >= min
                            })
                            .unwrap_or(false);
                        if old_enough {
                            if let Err(e) = self
                                .position_manager
                                .close_position(&symbol, ExitReason::SmartIndicatorFilter)
                                .await
                            {
                                warn!(symbol = %symbol, error = %e, "smart exit close failed");
                            }
                        }
                    }
                }
            }
        }

        // Wake the signal pipeline. A full queue just drops the wake-up;
        // the next tick or the loop cadence covers it.
        if let Some(tx) = self.signal_tx.read().as_ref() {
            let _ = tx.try_send(symbol);
        }
    }
}

// =============================================================================
// Frame parsing (pure)
// =============================================================================

#[derive(Debug)]
pub enum PublicFrame {
    Ticker(Ticker),
    Candle {
        symbol: String,
        timeframe: Timeframe,
        candle: Candle,
    },
    BookSummary {
        symbol: String,
        best_bid: f64,
        best_ask: f64,
    },
}

/// Build the combined subscribe frame for all symbols: tickers, candles per
/// configured timeframe, and the level-5 book summary.
pub fn subscribe_frame(symbols: &[String]) -> String {
    let mut args = Vec::new();
    for symbol in symbols {
        let id = inst_id(symbol);
        args.push(serde_json::json!({"channel": "tickers", "instId": id}));
        for tf in Timeframe::ALL {
            args.push(serde_json::json!({
                "channel": format!("candle{}", tf.as_str()),
                "instId": id,
            }));
        }
        args.push(serde_json::json!({"channel": "books5", "instId": id}));
    }
    serde_json::json!({"op": "subscribe", "args": args}).to_string()
}

fn str_f64(value: &serde_json::Value) -> f64 {
    match value {
        serde_json::Value::String(s) => s.parse().unwrap_or(0.0),
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Parse one data frame from the public stream.
pub fn parse_public_frame(channel: &str, value: &serde_json::Value) -> Option<PublicFrame> {
    let inst = value["arg"]["instId"].as_str()?;
    let symbol = crate::okx::symbol_of(inst);
    let row = value["data"].as_array()?.first()?;

    if channel == "tickers" {
        let last = str_f64(&row["last"]);
        if last <= 0.0 {
            return None;
        }
        return Some(PublicFrame::Ticker(Ticker {
            symbol,
            last,
            best_bid: str_f64(&row["bidPx"]),
            best_ask: str_f64(&row["askPx"]),
            mark: last,
            timestamp_ms: row["ts"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(|| Utc::now().timestamp_millis()),
        }));
    }

    if let Some(tf_str) = channel.strip_prefix("candle") {
        let timeframe = Timeframe::from_str_opt(tf_str)?;
        let arr = row.as_array()?;
        if arr.len() < 6 {
            return None;
        }
        let ts_ms: i64 = arr[0].as_str().and_then(|s| s.parse().ok())?;
        return Some(PublicFrame::Candle {
            symbol,
            timeframe,
            candle: Candle {
                timestamp: ts_ms / 1000,
                open: str_f64(&arr[1]),
                high: str_f64(&arr[2]),
                low: str_f64(&arr[3]),
                close: str_f64(&arr[4]),
                volume: str_f64(&arr[5]),
            },
        });
    }

    if channel == "books5" {
        let best_bid = row["bids"]
            .as_array()
            .and_then(|b| b.first())
            .and_then(|lvl| lvl.as_array())
            .map(|lvl| str_f64(&lvl[0]))
            .unwrap_or(0.0);
        let best_ask = row["asks"]
            .as_array()
            .and_then(|a| a.first())
            .and_then(|lvl| lvl.as_array())
            .map(|lvl| str_f64(&lvl[0]))
            .unwrap_or(0.0);
        if best_bid <= 0.0 && best_ask <= 0.0 {
            return None;
        }
        return Some(PublicFrame::BookSummary {
            symbol,
            best_bid,
            best_ask,
        });
    }

    None
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_frame_covers_all_channels() {
        let frame = subscribe_frame(&["BTC-USDT".to_string()]);
        let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["op"], "subscribe");
        let args = v["args"].as_array().unwrap();
        // tickers + 4 candle timeframes + books5
        assert_eq!(args.len(), 6);
        assert!(args.iter().all(|a| a["instId"] == "BTC-USDT-SWAP"));
        assert!(args.iter().any(|a| a["channel"] == "tickers"));
        assert!(args.iter().any(|a| a["channel"] == "candle1m"));
        assert!(args.iter().any(|a| a["channel"] == "candle1H"));
        assert!(args.iter().any(|a| a["channel"] == "books5"));
    }

    #[test]
    fn parses_ticker_frame() {
        let value = serde_json::json!({
            "arg": {"channel": "tickers", "instId": "BTC-USDT-SWAP"},
            "data": [{"last": "50123.4", "bidPx": "50123.0", "askPx": "50123.8", "ts": "1732200000000"}],
        });
        match parse_public_frame("tickers", &value) {
            Some(PublicFrame::Ticker(t)) => {
                assert_eq!(t.symbol, "BTC-USDT");
                assert!((t.last - 50_123.4).abs() < 1e-9);
                assert!((t.best_bid - 50_123.0).abs() < 1e-9);
                assert_eq!(t.timestamp_ms, 1_732_200_000_000);
            }
            other => panic!("expected ticker, got {other:?}"),
        }
    }

    #[test]
    fn parses_candle_frame() {
        let value = serde_json::json!({
            "arg": {"channel": "candle5m", "instId": "ETH-USDT-SWAP"},
            "data": [["1732200000000", "3000.0", "3010.5", "2995.0", "3005.2", "1234.5"]],
        });
        match parse_public_frame("candle5m", &value) {
            Some(PublicFrame::Candle {
                symbol,
                timeframe,
                candle,
            }) => {
                assert_eq!(symbol, "ETH-USDT");
                assert_eq!(timeframe, Timeframe::M5);
                assert_eq!(candle.timestamp, 1_732_200_000);
                assert!((candle.close - 3005.2).abs() < 1e-9);
            }
            other => panic!("expected candle, got {other:?}"),
        }
    }

    #[test]
    fn parses_book_summary() {
        let value = serde_json::json!({
            "arg": {"channel": "books5", "instId": "BTC-USDT-SWAP"},
            "data": [{
                "bids": [["50100.0", "12", "0", "3"]],
                "asks": [["50101.5", "7", "0", "2"]],
            }],
        });
        match parse_public_frame("books5", &value) {
            Some(PublicFrame::BookSummary {
                symbol,
                best_bid,
                best_ask,
            }) => {
                assert_eq!(symbol, "BTC-USDT");
                assert!((best_bid - 50_100.0).abs() < 1e-9);
                assert!((best_ask - 50_101.5).abs() < 1e-9);
            }
            other => panic!("expected book summary, got {other:?}"),
        }
    }

    #[test]
    fn zero_price_ticker_rejected() {
        let value = serde_json::json!({
            "arg": {"channel": "tickers", "instId": "BTC-USDT-SWAP"},
            "data": [{"last": "0", "bidPx": "", "askPx": ""}],
        });
        assert!(parse_public_frame("tickers", &value).is_none());
    }
}
