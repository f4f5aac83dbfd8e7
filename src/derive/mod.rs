//! Derivation layer: trader metrics, weight, leverage, position-state
//! reconstruction, and order-to-event mapping (§4.4-§4.8, C5-C9).

pub mod events;
pub mod leverage;
pub mod metrics;
pub mod payload;
pub mod pipeline;
pub mod reconstruct;
pub mod weight;

pub use events::order_to_event;
pub use leverage::{estimate_leverage, LeverageEstimate, LeverageMethod};
pub use metrics::{TraderMetrics, TraderMetricsInput};
pub use payload::{parse_live_positions, parse_order, parse_orders, parse_roi_series};
pub use pipeline::{run_derivation_pass, run_derivation_sweep};
pub use reconstruct::{reconstruct_from_events, reconstruct_from_orders};
pub use weight::compute_trader_weight;
