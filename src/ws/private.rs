// =============================================================================
// Private WebSocket Coordinator — positions, orders, account
// =============================================================================
//
// After HMAC-SHA256 authentication (`sign = Base64(HMAC(secret, timestamp +
// "GET" + "/users/self/verify"))`, unix-second timestamp) the coordinator
// subscribes to the positions, orders, and account channels for SWAP
// instruments and mirrors events into the registries:
//
//   positions — size 0 unregisters (and resets the trailing stop); a known
//               symbol updates in place; an unknown symbol is left for the
//               drift reconciler, which owns registration.
//   orders    — state and fill progress mirrored into the order cache.
//   account   — equity snapshot with the derived balance profile; the
//               `margin + upl` cross-check feeds the pnl_mismatch counter.
//
// Position events are deduplicated by `posId` + update time through a TTL
// cache (5 min, 10 000 entries).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::Engine;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::exit::TrailingSlCoordinator;
use crate::metrics::SloCounters;
use crate::orders::OrderCoordinator;
use crate::registry::{DataRegistry, PositionRegistry};
use crate::ws::TtlCache;

type HmacSha256 = Hmac<Sha256>;

pub struct PrivateWsCoordinator {
    config: Arc<Config>,
    api_key: String,
    secret: String,
    passphrase: String,
    data: Arc<DataRegistry>,
    registry: Arc<PositionRegistry>,
    trailing: Arc<TrailingSlCoordinator>,
    orders: Arc<OrderCoordinator>,
    slo: Arc<SloCounters>,
    dedup: TtlCache,
}

impl PrivateWsCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        api_key: String,
        secret: String,
        passphrase: String,
        data: Arc<DataRegistry>,
        registry: Arc<PositionRegistry>,
        trailing: Arc<TrailingSlCoordinator>,
        orders: Arc<OrderCoordinator>,
        slo: Arc<SloCounters>,
    ) -> Self {
        let dedup = TtlCache::new(
            config.websocket.dedup_ttl_secs,
            config.websocket.dedup_capacity,
        );
        Self {
            config,
            api_key,
            secret,
            passphrase,
            data,
            registry,
            trailing,
            orders,
            slo,
            dedup,
        }
    }

    // -------------------------------------------------------------------------
    // Connection loop
    // -------------------------------------------------------------------------

    pub async fn run(self: Arc<Self>, running: Arc<AtomicBool>) {
        let ws = &self.config.websocket;
        let mut attempt: u32 = 0;

        while running.load(Ordering::Relaxed) {
            match self.connect_and_stream(&running).await {
                Ok(()) => attempt = 0,
                Err(e) => {
                    attempt += 1;
                    if attempt >= ws.max_reconnect_attempts {
                        error!(attempt, error = %e, "private WS exceeded reconnect attempts");
                        return;
                    }
                    let delay = super::backoff_delay_secs(attempt, ws.backoff_base_secs, ws.backoff_cap_secs);
                    warn!(attempt, delay_secs = delay, error = %e, "private WS reconnecting");
                    tokio::time::sleep(std::time::Duration::from_secs(delay)).await;
                }
            }
        }
    }

    async fn connect_and_stream(&self, running: &AtomicBool) -> Result<()> {
        let url = &self.config.exchange.ws_private_url;
        info!(url = %url, "connecting private WebSocket");
        let (stream, _resp) = connect_async(url)
            .await
            .context("private WS connection failed")?;
        let (mut write, mut read) = stream.split();

        // Authenticate, then wait for the login ack before subscribing.
        let login = login_frame(&self.api_key, &self.secret, &self.passphrase, Utc::now().timestamp());
        write
            .send(Message::Text(login))
            .await
            .context("private WS login send failed")?;

        let login_ok = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while let Some(msg) = read.next().await {
                if let Ok(Message::Text(text)) = msg {
                    let v: serde_json::Value = serde_json::from_str(&text).unwrap_or_default();
                    if v["event"] == "login" {
                        return v["code"].as_str() == Some("0");
                    }
                    if v["event"] == "error" {
                        return false;
                    }
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        if !login_ok {
            anyhow::bail!("private WS authentication failed");
        }
        info!("private WS authenticated");

        write
            .send(Message::Text(private_subscribe_frame()))
            .await
            .context("private WS subscribe failed")?;

        let heartbeat = std::time::Duration::from_secs(self.config.websocket.heartbeat_secs);
        let mut ping_timer = tokio::time::interval(heartbeat);
        let mut last_frame = std::time::Instant::now();

        loop {
            if !running.load(Ordering::Relaxed) {
                return Ok(());
            }
            tokio::select! {
                _ = ping_timer.tick() => {
                    if last_frame.elapsed() > heartbeat * 2 {
                        self.slo.alert(
                            &self.slo.ws_stale_watchdog,
                            "ws_stale_watchdog",
                            "private stream silent",
                        );
                        anyhow::bail!("private WS watchdog: no frames for 2x heartbeat");
                    }
                    write
                        .send(Message::Text("ping".to_string()))
                        .await
                        .context("private WS ping failed")?;
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            last_frame = std::time::Instant::now();
                            if text == "pong" {
                                continue;
                            }
                            self.handle_message(&text);
                        }
                        Some(Ok(_)) => last_frame = std::time::Instant::now(),
                        Some(Err(e)) => return Err(e).context("private WS read error"),
                        None => {
                            warn!("private WS stream ended");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Channel handling
    // -------------------------------------------------------------------------

    fn handle_message(&self, text: &str) {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => {
                self.slo.alert(
                    &self.slo.ws_parse_errors,
                    "ws_parse_errors",
                    "private frame is not JSON",
                );
                return;
            }
        };
        if value.get("event").is_some() {
            debug!(frame = %value, "private WS event");
            return;
        }

        match value["arg"]["channel"].as_str().unwrap_or("") {
            "positions" => self.on_positions(&value),
            "orders" => self.on_orders(&value),
            "account" => self.on_account(&value),
            _ => {}
        }
    }

    fn on_positions(&self, value: &serde_json::Value) {
        let rows = match value["data"].as_array() {
            Some(r) => r,
            None => return,
        };
        for row in rows {
            let pos_id = row["posId"].as_str().unwrap_or("");
            let u_time = row["uTime"].as_str().unwrap_or("");
            if !pos_id.is_empty() {
                let dedup_key = format!("{pos_id}:{u_time}");
                if !self.dedup.insert(&dedup_key, Utc::now()) {
                    debug!(pos_id, "duplicate position event dropped");
                    continue;
                }
            }

            let inst = row["instId"].as_str().unwrap_or("");
            if inst.is_empty() {
                continue;
            }
            let symbol = crate::okx::symbol_of(inst);
            let size: f64 = row["pos"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0);

            if size.abs() < 1e-8 {
                if self.registry.has(&symbol) {
                    info!(symbol = %symbol, "position closed on exchange (private WS)");
                    self.registry.unregister(&symbol);
                    self.trailing.remove(&symbol);
                }
                continue;
            }

            if self.registry.has(&symbol) {
                let mark: f64 = row["markPx"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
                let upl: f64 = row["upl"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
                let margin: f64 = row["margin"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
                self.registry.update(&symbol, |pos, _| {
                    let coins_per_contract = if pos.size_contracts > 0.0 {
                        pos.size_coins / pos.size_contracts
                    } else {
                        1.0
                    };
                    pos.size_contracts = size.abs();
                    pos.size_coins = pos.size_contracts * coins_per_contract;
                    if mark > 0.0 {
                        pos.mark_price = mark;
                    }
                    pos.unrealized_pnl = upl;
                    if margin > 0.0 {
                        pos.margin = margin;
                    }
                });
            } else {
                // Registration needs metadata the stream does not carry; the
                // drift reconciler owns that path.
                debug!(symbol = %symbol, "unknown position on private WS, left for sync");
            }
        }
    }

    fn on_orders(&self, value: &serde_json::Value) {
        let rows = match value["data"].as_array() {
            Some(r) => r,
            None => return,
        };
        for row in rows {
            let order_id = row["ordId"].as_str().unwrap_or("");
            if order_id.is_empty() {
                continue;
            }
            let state = row["state"].as_str().unwrap_or("");
            let filled: f64 = row["accFillSz"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0);
            self.orders.apply_order_update(order_id, state, filled);
        }
    }

    fn on_account(&self, value: &serde_json::Value) {
        let rows = match value["data"].as_array() {
            Some(r) => r,
            None => return,
        };
        for row in rows {
            let details = row["details"].as_array();
            let usdt = details
                .and_then(|d| d.iter().find(|x| x["ccy"].as_str() == Some("USDT")));
            let Some(usdt) = usdt else { continue };

            let eq: f64 = usdt["eq"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
            if eq <= 0.0 {
                continue;
            }

            // Canonical equity is `eq`; the margin+upl recomputation is a
            // cross-check only.
            let margin: f64 = usdt["frozenBal"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
            let avail: f64 = usdt["availBal"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
            let upl: f64 = usdt["upl"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
            let recomputed = avail + margin + upl;
            if recomputed > 0.0 && ((recomputed - eq) / eq).abs() > 0.01 {
                self.slo.alert(
                    &self.slo.pnl_mismatch,
                    "pnl_mismatch",
                    &format!("eq={eq:.2} recomputed={recomputed:.2}"),
                );
            }

            let profile = self.config.profile_for_equity(eq);
            self.data.update_balance(eq, profile);
            if margin > 0.0 {
                self.data.update_margin(margin, (eq - margin).max(0.0), eq);
            }
            debug!(equity = eq, profile = %profile, "account snapshot mirrored");
        }
    }
}

// =============================================================================
// Frames (pure)
// =============================================================================

/// OKX login frame: `sign = Base64(HMAC_SHA256(secret, ts + "GET" +
/// "/users/self/verify"))` with a unix-second timestamp.
pub fn login_frame(api_key: &str, secret: &str, passphrase: &str, unix_secs: i64) -> String {
    let timestamp = unix_secs.to_string();
    let payload = format!("{timestamp}GET/users/self/verify");
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(payload.as_bytes());
    let sign = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

    serde_json::json!({
        "op": "login",
        "args": [{
            "apiKey": api_key,
            "passphrase": passphrase,
            "timestamp": timestamp,
            "sign": sign,
        }],
    })
    .to_string()
}

/// Subscribe to positions, orders, and account for SWAP instruments.
pub fn private_subscribe_frame() -> String {
    serde_json::json!({
        "op": "subscribe",
        "args": [
            {"channel": "positions", "instType": "SWAP"},
            {"channel": "orders", "instType": "SWAP"},
            {"channel": "account"},
        ],
    })
    .to_string()
}
