// =============================================================================
// Registries — single sources of truth
// =============================================================================
//
// The Position Registry owns the authoritative in-memory view of positions
// and their metadata; the Data Registry owns every market and account
// observable. Everything else holds references and reads copies.

pub mod data_registry;
pub mod position_registry;

pub use data_registry::{DataRegistry, MarketSnapshot};
pub use position_registry::{Position, PositionMetadata, PositionRegistry, ScalingEvent};
