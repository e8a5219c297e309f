// =============================================================================
// Market Data Module
// =============================================================================
//
// Candle ring buffers per (symbol, timeframe). Tickers, regime, balance and
// margin snapshots live in the Data Registry which wraps this module.

pub mod candle_buffer;

pub use candle_buffer::{Candle, CandleBuffer, CandleKey};
