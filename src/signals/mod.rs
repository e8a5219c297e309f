// =============================================================================
// Signals Module
// =============================================================================
//
// `generator` turns market data into candidate signals; `coordinator` gates
// them (locks, cooldowns, emergency stop, sizing) before the Entry Manager
// opens anything.

pub mod coordinator;
pub mod generator;

pub use coordinator::SignalCoordinator;
pub use generator::{Signal, SignalGenerator};
