// =============================================================================
// OKX REST API Client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: the secret key and passphrase are never logged or serialized.
// Signature: Base64(HMAC_SHA256(secret, timestamp + method + path + body))
// with an ISO-8601 millisecond timestamp, sent alongside OK-ACCESS-KEY and
// OK-ACCESS-PASSPHRASE headers.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::market_data::Candle;
use crate::okx::api::{
    AccountConfig, ActiveOrder, ExchangeApi, ExchangePosition, InstrumentDetails, MarginInfo,
    OrderAck, OrderRequest, PriceLimits,
};
use crate::okx::inst_id;
use crate::types::{Side, Ticker, Timeframe};

type HmacSha256 = Hmac<Sha256>;

/// OKX REST client with request signing.
#[derive(Clone)]
pub struct OkxClient {
    api_key: String,
    secret: String,
    passphrase: String,
    base_url: String,
    client: reqwest::Client,
}

impl OkxClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        secret: impl Into<String>,
        passphrase: impl Into<String>,
        timeout_secs: u64,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            passphrase: passphrase.into(),
            base_url: base_url.into(),
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Base64 HMAC-SHA256 of `timestamp + method + path + body`.
    fn sign(&self, timestamp: &str, method: &str, path: &str, body: &str) -> String {
        let payload = format!("{timestamp}{method}{path}{body}");
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(payload.as_bytes());
        base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
    }

    fn iso_timestamp() -> String {
        chrono::Utc::now()
            .format("%Y-%m-%dT%H:%M:%S%.3fZ")
            .to_string()
    }

    /// Signed GET returning the `data` array from the OKX envelope.
    async fn signed_get(&self, path: &str) -> Result<serde_json::Value> {
        let ts = Self::iso_timestamp();
        let sig = self.sign(&ts, "GET", path, "");
        let url = format!("{}{}", self.base_url, path);

        let resp = self
            .client
            .get(&url)
            .header("OK-ACCESS-KEY", &self.api_key)
            .header("OK-ACCESS-SIGN", sig)
            .header("OK-ACCESS-TIMESTAMP", ts)
            .header("OK-ACCESS-PASSPHRASE", &self.passphrase)
            .send()
            .await
            .with_context(|| format!("GET {path} request failed"))?;

        Self::unwrap_envelope(path, resp).await
    }

    /// Signed POST with a JSON body, returning the `data` array.
    async fn signed_post(&self, path: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let ts = Self::iso_timestamp();
        let body_str = body.to_string();
        let sig = self.sign(&ts, "POST", path, &body_str);
        let url = format!("{}{}", self.base_url, path);

        let resp = self
            .client
            .post(&url)
            .header("OK-ACCESS-KEY", &self.api_key)
            .header("OK-ACCESS-SIGN", sig)
            .header("OK-ACCESS-TIMESTAMP", ts)
            .header("OK-ACCESS-PASSPHRASE", &self.passphrase)
            .header("Content-Type", "application/json")
            .body(body_str)
            .send()
            .await
            .with_context(|| format!("POST {path} request failed"))?;

        Self::unwrap_envelope(path, resp).await
    }

    /// Public (unsigned) GET.
    async fn public_get(&self, path: &str) -> Result<serde_json::Value> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {path} request failed"))?;
        Self::unwrap_envelope(path, resp).await
    }

    /// Check HTTP status plus the `code` field of the OKX response envelope
    /// and return the `data` payload.
    async fn unwrap_envelope(path: &str, resp: reqwest::Response) -> Result<serde_json::Value> {
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {path} response"))?;

        if !status.is_success() {
            anyhow::bail!("{path} returned HTTP {status}: {body}");
        }

        let code = body["code"].as_str().unwrap_or("");
        if code != "0" {
            anyhow::bail!(
                "{path} rejected (code {code}): {}",
                body["msg"].as_str().unwrap_or("")
            );
        }

        Ok(body["data"].clone())
    }

    // -------------------------------------------------------------------------
    // Parsing helpers
    // -------------------------------------------------------------------------

    /// OKX sends numbers as strings; empty strings mean "missing".
    fn field_f64(value: &serde_json::Value, key: &str) -> f64 {
        match &value[key] {
            serde_json::Value::String(s) if !s.is_empty() => s.parse().unwrap_or(0.0),
            serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0),
            _ => 0.0,
        }
    }

    fn field_i64(value: &serde_json::Value, key: &str) -> Option<i64> {
        match &value[key] {
            serde_json::Value::String(s) if !s.is_empty() => s.parse().ok(),
            serde_json::Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    fn parse_position(value: &serde_json::Value) -> ExchangePosition {
        ExchangePosition {
            inst_id: value["instId"].as_str().unwrap_or("").to_string(),
            pos: Self::field_f64(value, "pos"),
            pos_side: value["posSide"].as_str().unwrap_or("").to_string(),
            avg_px: Self::field_f64(value, "avgPx"),
            mark_px: Self::field_f64(value, "markPx"),
            margin: Self::field_f64(value, "margin"),
            upl: Self::field_f64(value, "upl"),
            lever: Self::field_f64(value, "lever") as u32,
            c_time: Self::field_i64(value, "cTime"),
            u_time: Self::field_i64(value, "uTime"),
            adl_rank: Self::field_f64(value, "adl") as u8,
        }
    }
}

#[async_trait]
impl ExchangeApi for OkxClient {
    #[instrument(skip(self), name = "okx::get_balance")]
    async fn get_balance(&self) -> Result<f64> {
        let data = self.signed_get("/api/v5/account/balance?ccy=USDT").await?;

        // data[0].details[] holds per-currency equity; fall back to totalEq.
        let first = data.get(0).context("balance response missing data[0]")?;
        let from_details = first["details"]
            .as_array()
            .and_then(|arr| arr.iter().find(|d| d["ccy"].as_str() == Some("USDT")))
            .map(|d| Self::field_f64(d, "eq"));

        let equity = match from_details {
            Some(eq) if eq > 0.0 => eq,
            _ => Self::field_f64(first, "totalEq"),
        };

        debug!(equity, "balance retrieved");
        Ok(equity)
    }

    #[instrument(skip(self), name = "okx::get_positions")]
    async fn get_positions(&self, symbol: Option<&str>) -> Result<Vec<ExchangePosition>> {
        let path = match symbol {
            Some(s) => format!("/api/v5/account/positions?instType=SWAP&instId={}", inst_id(s)),
            None => "/api/v5/account/positions?instType=SWAP".to_string(),
        };
        let data = self.signed_get(&path).await?;

        let positions: Vec<ExchangePosition> = data
            .as_array()
            .map(|arr| arr.iter().map(Self::parse_position).collect())
            .unwrap_or_default();

        debug!(count = positions.len(), "positions retrieved");
        Ok(positions)
    }

    #[instrument(skip(self), name = "okx::get_instrument_details")]
    async fn get_instrument_details(&self, symbol: &str) -> Result<InstrumentDetails> {
        let path = format!(
            "/api/v5/public/instruments?instType=SWAP&instId={}",
            inst_id(symbol)
        );
        let data = self.public_get(&path).await?;
        let inst = data.get(0).context("instrument not found")?;

        Ok(InstrumentDetails {
            inst_id: inst["instId"].as_str().unwrap_or("").to_string(),
            ct_val: Self::field_f64(inst, "ctVal"),
            min_size: Self::field_f64(inst, "minSz"),
            tick_size: Self::field_f64(inst, "tickSz"),
            lot_size: Self::field_f64(inst, "lotSz"),
        })
    }

    #[instrument(skip(self), name = "okx::get_ticker")]
    async fn get_ticker(&self, symbol: &str) -> Result<Ticker> {
        let path = format!("/api/v5/market/ticker?instId={}", inst_id(symbol));
        let data = self.public_get(&path).await?;
        let t = data.get(0).context("ticker response missing data[0]")?;

        Ok(Ticker {
            symbol: symbol.to_string(),
            last: Self::field_f64(t, "last"),
            best_bid: Self::field_f64(t, "bidPx"),
            best_ask: Self::field_f64(t, "askPx"),
            mark: Self::field_f64(t, "last"),
            timestamp_ms: Self::field_i64(t, "ts")
                .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
        })
    }

    #[instrument(skip(self), name = "okx::get_price_limits")]
    async fn get_price_limits(&self, symbol: &str) -> Result<PriceLimits> {
        let limit_path = format!("/api/v5/public/price-limit?instId={}", inst_id(symbol));
        let limit_data = self.public_get(&limit_path).await?;
        let limits = limit_data.get(0).context("price-limit missing data[0]")?;

        let ticker = self.get_ticker(symbol).await?;

        Ok(PriceLimits {
            last: ticker.last,
            best_bid: ticker.best_bid,
            best_ask: ticker.best_ask,
            max_buy_price: Self::field_f64(limits, "buyLmt"),
            min_sell_price: Self::field_f64(limits, "sellLmt"),
        })
    }

    #[instrument(skip(self), name = "okx::get_active_orders")]
    async fn get_active_orders(&self, symbol: &str) -> Result<Vec<ActiveOrder>> {
        let path = format!("/api/v5/trade/orders-pending?instId={}", inst_id(symbol));
        let data = self.signed_get(&path).await?;

        let orders = data
            .as_array()
            .map(|arr| {
                arr.iter()
                    .map(|o| ActiveOrder {
                        order_id: o["ordId"].as_str().unwrap_or("").to_string(),
                        inst_id: o["instId"].as_str().unwrap_or("").to_string(),
                        side: o["side"].as_str().unwrap_or("").to_string(),
                        price: Self::field_f64(o, "px"),
                        size: Self::field_f64(o, "sz"),
                        filled_size: Self::field_f64(o, "accFillSz"),
                        state: o["state"].as_str().unwrap_or("live").to_string(),
                        create_time_ms: Self::field_i64(o, "cTime").unwrap_or(0),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(orders)
    }

    #[instrument(skip(self), name = "okx::cancel_order")]
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()> {
        let body = serde_json::json!({
            "instId": inst_id(symbol),
            "ordId": order_id,
        });
        self.signed_post("/api/v5/trade/cancel-order", body).await?;
        debug!(symbol, order_id, "order cancelled");
        Ok(())
    }

    #[instrument(skip(self), name = "okx::amend_order_price")]
    async fn amend_order_price(&self, symbol: &str, order_id: &str, price: f64) -> Result<()> {
        let body = serde_json::json!({
            "instId": inst_id(symbol),
            "ordId": order_id,
            "newPx": format!("{price}"),
        });
        self.signed_post("/api/v5/trade/amend-order", body).await?;
        debug!(symbol, order_id, price, "order amended");
        Ok(())
    }

    #[instrument(skip(self, request), name = "okx::place_futures_order")]
    async fn place_futures_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        let ord_type = if request.post_only && request.order_type == "limit" {
            "post_only"
        } else {
            request.order_type.as_str()
        };

        let mut body = serde_json::json!({
            "instId": inst_id(&request.symbol),
            "tdMode": "isolated",
            "side": request.side.order_side(),
            "posSide": request.side.to_string(),
            "ordType": ord_type,
            "sz": format!("{}", request.size_contracts),
        });
        if let Some(price) = request.price {
            body["px"] = serde_json::json!(format!("{price}"));
        }
        if request.reduce_only {
            body["reduceOnly"] = serde_json::json!(true);
        }
        if let Some(coid) = &request.client_order_id {
            body["clOrdId"] = serde_json::json!(coid);
        }

        debug!(
            symbol = %request.symbol,
            side = %request.side,
            ord_type,
            size = request.size_contracts,
            price = ?request.price,
            reduce_only = request.reduce_only,
            "placing order"
        );

        // Placement rejections are semantic, not transport errors: surface
        // the per-order code so callers can fall back (e.g. post-only would
        // take -> market).
        match self.signed_post("/api/v5/trade/order", body).await {
            Ok(data) => {
                let entry = data.get(0).cloned().unwrap_or_default();
                Ok(OrderAck {
                    order_id: entry["ordId"].as_str().unwrap_or("").to_string(),
                    code: entry["sCode"].as_str().unwrap_or("0").to_string(),
                    message: entry["sMsg"].as_str().unwrap_or("").to_string(),
                })
            }
            Err(e) => {
                warn!(symbol = %request.symbol, error = %e, "order placement failed");
                Err(e)
            }
        }
    }

    #[instrument(skip(self), name = "okx::set_leverage")]
    async fn set_leverage(&self, symbol: &str, leverage: u32, pos_side: Option<Side>) -> Result<()> {
        let mut body = serde_json::json!({
            "instId": inst_id(symbol),
            "lever": format!("{leverage}"),
            "mgnMode": "isolated",
        });
        if let Some(side) = pos_side {
            body["posSide"] = serde_json::json!(side.to_string());
        }
        self.signed_post("/api/v5/account/set-leverage", body)
            .await?;
        debug!(symbol, leverage, "leverage set");
        Ok(())
    }

    #[instrument(skip(self), name = "okx::get_account_config")]
    async fn get_account_config(&self) -> Result<AccountConfig> {
        let data = self.signed_get("/api/v5/account/config").await?;
        let cfg = data.get(0).context("account config missing data[0]")?;
        Ok(AccountConfig {
            pos_mode: cfg["posMode"].as_str().unwrap_or("").to_string(),
        })
    }

    #[instrument(skip(self), name = "okx::get_margin_info")]
    async fn get_margin_info(&self, symbol: &str) -> Result<MarginInfo> {
        let positions = self.get_positions(Some(symbol)).await?;
        let equity = self.get_balance().await?;

        let (margin, upl) = positions
            .iter()
            .find(|p| p.symbol() == symbol)
            .map(|p| (p.margin, p.upl))
            .unwrap_or((0.0, 0.0));

        Ok(MarginInfo {
            equity,
            margin,
            upl,
        })
    }

    #[instrument(skip(self), name = "okx::get_candles")]
    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let path = format!(
            "/api/v5/market/candles?instId={}&bar={}&limit={}",
            inst_id(symbol),
            timeframe.as_str(),
            limit
        );
        let data = self.public_get(&path).await?;
        let raw = data.as_array().context("candles response is not an array")?;

        // Rows: [ts_ms, o, h, l, c, vol, ...], newest first.
        let mut candles = Vec::with_capacity(raw.len());
        for row in raw {
            let arr = match row.as_array() {
                Some(a) if a.len() >= 6 => a,
                _ => {
                    warn!("skipping malformed candle row");
                    continue;
                }
            };
            let ts_ms: i64 = arr[0]
                .as_str()
                .and_then(|s| s.parse().ok())
                .or_else(|| arr[0].as_i64())
                .unwrap_or(0);
            let get = |i: usize| -> f64 {
                arr[i]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .or_else(|| arr[i].as_f64())
                    .unwrap_or(0.0)
            };
            candles.push(Candle {
                timestamp: ts_ms / 1000,
                open: get(1),
                high: get(2),
                low: get(3),
                close: get(4),
                volume: get(5),
            });
        }

        candles.sort_by_key(|c| c.timestamp);
        debug!(symbol, timeframe = %timeframe, count = candles.len(), "candles fetched");
        Ok(candles)
    }
}

impl std::fmt::Debug for OkxClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OkxClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("passphrase", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> OkxClient {
        OkxClient::new("https://example.test", "key", "secret", "pass", 10)
    }

    #[test]
    fn signature_is_deterministic_base64() {
        let c = client();
        let a = c.sign("2024-01-01T00:00:00.000Z", "GET", "/api/v5/account/balance", "");
        let b = c.sign("2024-01-01T00:00:00.000Z", "GET", "/api/v5/account/balance", "");
        assert_eq!(a, b);
        assert!(base64::engine::general_purpose::STANDARD.decode(&a).is_ok());
        // Different timestamp changes the signature.
        let d = c.sign("2024-01-01T00:00:01.000Z", "GET", "/api/v5/account/balance", "");
        assert_ne!(a, d);
    }

    #[test]
    fn field_parsers_handle_strings_numbers_and_empties() {
        let v = serde_json::json!({
            "pos": "1.5",
            "lever": 5,
            "avgPx": "",
            "cTime": "1732200000000",
        });
        assert_eq!(OkxClient::field_f64(&v, "pos"), 1.5);
        assert_eq!(OkxClient::field_f64(&v, "lever"), 5.0);
        assert_eq!(OkxClient::field_f64(&v, "avgPx"), 0.0);
        assert_eq!(OkxClient::field_f64(&v, "missing"), 0.0);
        assert_eq!(OkxClient::field_i64(&v, "cTime"), Some(1_732_200_000_000));
        assert_eq!(OkxClient::field_i64(&v, "avgPx"), None);
    }

    #[test]
    fn parse_position_normalises_fields() {
        let v = serde_json::json!({
            "instId": "BTC-USDT-SWAP",
            "pos": "-2",
            "posSide": "short",
            "avgPx": "50000.5",
            "markPx": "50100",
            "margin": "200",
            "upl": "-10.5",
            "lever": "5",
            "cTime": "1732200000000",
            "adl": "2",
        });
        let p = OkxClient::parse_position(&v);
        assert_eq!(p.symbol(), "BTC-USDT");
        assert_eq!(p.side(), Side::Short);
        assert_eq!(p.size_contracts(), 2.0);
        assert_eq!(p.lever, 5);
        assert_eq!(p.adl_rank, 2);
        assert_eq!(p.open_time_ms(), Some(1_732_200_000_000));
    }
}
