// =============================================================================
// WebSocket Coordinators
// =============================================================================
//
// `public` streams tickers, candles, and book summaries; `private` streams
// positions, orders, and account updates after HMAC authentication. Both
// reconnect with exponential backoff and re-subscribe on every reconnect.

pub mod private;
pub mod public;
pub mod ttl_cache;

pub use private::PrivateWsCoordinator;
pub use public::PublicWsCoordinator;
pub use ttl_cache::TtlCache;

/// Exponential backoff delay for reconnect attempt `attempt` (0-based):
/// `base * 2^attempt`, capped.
pub fn backoff_delay_secs(attempt: u32, base_secs: u64, cap_secs: u64) -> u64 {
    base_secs
        .saturating_mul(1u64 << attempt.min(16))
        .min(cap_secs)
}
