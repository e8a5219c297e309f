// =============================================================================
// Exchange API — the typed surface the engine consumes
// =============================================================================
//
// Coordinators receive `Arc<dyn ExchangeApi>` by constructor injection, so
// tests can substitute a mock without touching the network.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{Side, Ticker};

/// A position as reported by the exchange. Numeric fields arrive as strings
/// on the wire and are parsed at ingress; missing/empty values become zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub inst_id: String,
    /// Signed size in contracts.
    pub pos: f64,
    pub pos_side: String,
    pub avg_px: f64,
    pub mark_px: f64,
    pub margin: f64,
    pub upl: f64,
    pub lever: u32,
    /// Creation / update time in unix milliseconds, when reported.
    pub c_time: Option<i64>,
    pub u_time: Option<i64>,
    pub adl_rank: u8,
}

impl ExchangePosition {
    pub fn symbol(&self) -> String {
        super::symbol_of(&self.inst_id)
    }

    pub fn size_contracts(&self) -> f64 {
        self.pos.abs()
    }

    pub fn side(&self) -> Side {
        Side::from_pos_side(&self.pos_side, self.pos)
    }

    /// Exchange open time, preferring `cTime` over `uTime`.
    pub fn open_time_ms(&self) -> Option<i64> {
        self.c_time.or(self.u_time)
    }
}

/// Per-instrument contract parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentDetails {
    pub inst_id: String,
    pub ct_val: f64,
    pub min_size: f64,
    pub tick_size: f64,
    pub lot_size: f64,
}

/// Current price band the exchange will accept orders inside.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriceLimits {
    pub last: f64,
    pub best_bid: f64,
    pub best_ask: f64,
    pub max_buy_price: f64,
    pub min_sell_price: f64,
}

impl PriceLimits {
    /// Clamp a candidate limit price inside the accepted band for `side`.
    pub fn clamp(&self, side: Side, price: f64) -> f64 {
        match side {
            Side::Long if self.max_buy_price > 0.0 => price.min(self.max_buy_price),
            Side::Short if self.min_sell_price > 0.0 => price.max(self.min_sell_price),
            _ => price,
        }
    }
}

/// A non-terminal order as listed by the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveOrder {
    pub order_id: String,
    pub inst_id: String,
    pub side: String,
    pub price: f64,
    pub size: f64,
    pub filled_size: f64,
    /// Exchange state string: "live" or "partially_filled".
    pub state: String,
    pub create_time_ms: i64,
}

/// Everything needed to place one futures order.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    /// Size in contracts.
    pub size_contracts: f64,
    /// "limit" or "market".
    pub order_type: String,
    pub price: Option<f64>,
    pub reduce_only: bool,
    pub post_only: bool,
    pub client_order_id: Option<String>,
}

impl OrderRequest {
    pub fn market(symbol: &str, side: Side, size_contracts: f64, reduce_only: bool) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            size_contracts,
            order_type: "market".to_string(),
            price: None,
            reduce_only,
            post_only: false,
            client_order_id: None,
        }
    }

    pub fn limit(symbol: &str, side: Side, size_contracts: f64, price: f64, post_only: bool) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            size_contracts,
            order_type: "limit".to_string(),
            price: Some(price),
            reduce_only: false,
            post_only,
            client_order_id: None,
        }
    }
}

/// Placement acknowledgement. `code == "0"` means accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub code: String,
    pub message: String,
}

impl OrderAck {
    pub fn accepted(&self) -> bool {
        self.code == "0"
    }
}

/// Account-level configuration relevant at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// "long_short_mode" or "net_mode".
    pub pos_mode: String,
}

/// Per-symbol margin detail.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarginInfo {
    pub equity: f64,
    pub margin: f64,
    pub upl: f64,
}

/// The REST operations the engine requires (spec of the external venue).
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// Total account equity in USDT.
    async fn get_balance(&self) -> Result<f64>;

    /// Open swap positions, optionally filtered by symbol.
    async fn get_positions(&self, symbol: Option<&str>) -> Result<Vec<ExchangePosition>>;

    async fn get_instrument_details(&self, symbol: &str) -> Result<InstrumentDetails>;

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker>;

    async fn get_price_limits(&self, symbol: &str) -> Result<PriceLimits>;

    async fn get_active_orders(&self, symbol: &str) -> Result<Vec<ActiveOrder>>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()>;

    async fn amend_order_price(&self, symbol: &str, order_id: &str, price: f64) -> Result<()>;

    async fn place_futures_order(&self, request: &OrderRequest) -> Result<OrderAck>;

    async fn set_leverage(&self, symbol: &str, leverage: u32, pos_side: Option<Side>) -> Result<()>;

    async fn get_account_config(&self) -> Result<AccountConfig>;

    async fn get_margin_info(&self, symbol: &str) -> Result<MarginInfo>;

    /// REST candle backfill used to seed the buffers at startup.
    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: crate::types::Timeframe,
        limit: usize,
    ) -> Result<Vec<crate::market_data::Candle>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_position_side_and_time() {
        let pos = ExchangePosition {
            inst_id: "BTC-USDT-SWAP".into(),
            pos: -3.0,
            pos_side: String::new(),
            c_time: None,
            u_time: Some(1_732_200_000_000),
            ..Default::default()
        };
        assert_eq!(pos.symbol(), "BTC-USDT");
        assert_eq!(pos.side(), Side::Short);
        assert_eq!(pos.size_contracts(), 3.0);
        assert_eq!(pos.open_time_ms(), Some(1_732_200_000_000));
    }

    #[test]
    fn price_limits_clamp_by_side() {
        let limits = PriceLimits {
            last: 100.0,
            best_bid: 99.9,
            best_ask: 100.1,
            max_buy_price: 105.0,
            min_sell_price: 95.0,
        };
        assert_eq!(limits.clamp(Side::Long, 110.0), 105.0);
        assert_eq!(limits.clamp(Side::Long, 101.0), 101.0);
        assert_eq!(limits.clamp(Side::Short, 90.0), 95.0);
    }

    #[test]
    fn order_ack_code_zero_is_success() {
        let ok = OrderAck {
            order_id: "1".into(),
            code: "0".into(),
            message: String::new(),
        };
        let rejected = OrderAck {
            order_id: String::new(),
            code: "51008".into(),
            message: "insufficient margin".into(),
        };
        assert!(ok.accepted());
        assert!(!rejected.accepted());
    }
}
