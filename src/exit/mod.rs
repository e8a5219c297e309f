// =============================================================================
// Exit Management Module
// =============================================================================
//
// Three cooperating layers, evaluated from fastest to slowest:
//   - `trailing`: per-symbol trailing stop, updated on every tick;
//   - `smart`: indicator-based exit filter, also tick-driven;
//   - `analyzer` + `monitor`: the periodic exit analysis (profit harvest,
//     adaptive TP, big-profit trailing, partial TP, time exits).

pub mod analyzer;
pub mod monitor;
pub mod smart;
pub mod trailing;

pub use analyzer::{ExitAnalyzer, ExitDecision};
pub use trailing::{TrailingSlCoordinator, TrailingStop};
