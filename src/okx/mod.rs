// =============================================================================
// OKX Exchange Module
// =============================================================================
//
// `api` defines the typed interface the engine consumes (and the DTOs the
// private WebSocket mirrors); `client` is the signed REST implementation.

pub mod api;
pub mod client;

pub use api::{
    AccountConfig, ActiveOrder, ExchangeApi, ExchangePosition, InstrumentDetails, MarginInfo,
    OrderAck, OrderRequest, PriceLimits,
};
pub use client::OkxClient;

/// Instrument id for a symbol's perpetual swap ("BTC-USDT" -> "BTC-USDT-SWAP").
pub fn inst_id(symbol: &str) -> String {
    format!("{symbol}-SWAP")
}

/// Strip the swap suffix from an instrument id.
pub fn symbol_of(inst_id: &str) -> String {
    inst_id.trim_end_matches("-SWAP").to_string()
}
