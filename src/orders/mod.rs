// =============================================================================
// Orders Module
// =============================================================================
//
// Limit-order lifecycle: placement, re-pricing, timeout re-validation,
// market fallback, and the cancel/amend rate heuristic.

pub mod coordinator;
pub mod rate_window;

pub use coordinator::{OrderCoordinator, OrderState, TrackedOrder};
pub use rate_window::RateWindow;
