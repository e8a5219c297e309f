// =============================================================================
// Smart Indicator Exit Filter
// =============================================================================
//
// Tick-driven reversal detection on RSI and MACD. Three outcomes:
//   - `Close`   — indicators show a reversal against the position;
//   - `Block`   — indicators show trend continuation; the caller must hold
//                 and suppress weaker exit reasons this tick;
//   - `Neutral` — no opinion, other exit logic proceeds.
//
// For a long: RSI > 70 or a bearish MACD closes; RSI < 50 blocks.
// For a short: RSI < 30 or a bullish MACD closes; RSI > 50 blocks.

use crate::indicators::IndicatorSnapshot;
use crate::types::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmartVerdict {
    Close,
    Block,
    Neutral,
}

pub fn evaluate(side: Side, indicators: &IndicatorSnapshot) -> SmartVerdict {
    // RSI has the first word.
    if let Some(rsi) = indicators.rsi_14 {
        match side {
            Side::Long => {
                if rsi > 70.0 {
                    return SmartVerdict::Close;
                }
                if rsi < 50.0 {
                    return SmartVerdict::Block;
                }
            }
            Side::Short => {
                if rsi < 30.0 {
                    return SmartVerdict::Close;
                }
                if rsi > 50.0 {
                    return SmartVerdict::Block;
                }
            }
        }
    }

    // MACD crossover against the position.
    if let (Some(macd), Some(signal)) = (indicators.macd_line, indicators.macd_signal) {
        let against = match side {
            Side::Long => macd < signal,
            Side::Short => macd > signal,
        };
        if against {
            return SmartVerdict::Close;
        }
        return SmartVerdict::Block;
    }

    SmartVerdict::Neutral
}
