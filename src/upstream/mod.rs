//! Upstream exchange client (§4.1, C1/C2).

pub mod client;
pub mod filter;

pub use client::{fetch_trader_payload, UpstreamClient, UpstreamPayload};
pub use filter::{filter_active_positions, PositionAudit};
