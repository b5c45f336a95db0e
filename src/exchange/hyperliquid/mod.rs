//! Production adapter for a Hyperliquid-style venue.

mod client;
mod types;

pub use client::HyperliquidGateway;
pub use types::*;
