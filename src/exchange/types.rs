//! Venue-agnostic types shared by the gateway contract and its consumers.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which half of a delta-neutral pair an order targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderLeg {
    Spot,
    Perp,
}

impl fmt::Display for OrderLeg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderLeg::Spot => write!(f, "spot"),
            OrderLeg::Perp => write!(f, "perp"),
        }
    }
}

/// Terminal state of an immediate-or-cancel order placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderOutcome {
    /// Filled (fully or partially) at `avg_price`.
    Filled,
    /// Resting on the book; should not happen for IOC but venues surprise.
    Open,
    /// Rejected or errored.
    Failed,
}

/// Result of a `place_order` call.
#[derive(Debug, Clone)]
pub struct OrderReport {
    pub status: OrderOutcome,
    pub filled_size: Decimal,
    pub avg_price: Decimal,
    pub error: Option<String>,
}

impl OrderReport {
    pub fn filled(filled_size: Decimal, avg_price: Decimal) -> Self {
        Self {
            status: OrderOutcome::Filled,
            filled_size,
            avg_price,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: OrderOutcome::Failed,
            filled_size: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            error: Some(error.into()),
        }
    }
}

/// Status of an order looked up after the fact (e.g. post-timeout).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatusKind {
    Filled,
    Open,
    /// Terminal with no fill: cancelled or rejected by the venue.
    Canceled,
    /// The venue could not account for the order; reconciliation will.
    Unknown,
}

/// Result of a `query_order_status` call.
#[derive(Debug, Clone)]
pub struct OrderStatusReport {
    pub status: OrderStatusKind,
    pub filled_size: Decimal,
}

/// Best bid/ask for both legs of a coin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceQuote {
    pub spot_bid: Decimal,
    pub spot_ask: Decimal,
    pub perp_bid: Decimal,
    pub perp_ask: Decimal,
}

/// USDC balances across the spot wallet and perp margin account.
#[derive(Debug, Clone, Copy, Default)]
pub struct Balances {
    pub spot_usdc: Decimal,
    pub perp_margin: Decimal,
}

/// Direction of a perp position as reported by the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionSide {
    Long,
    Short,
}

/// A perp position as reported by the venue.
#[derive(Debug, Clone)]
pub struct VenuePosition {
    /// Absolute size in base units.
    pub size: Decimal,
    pub side: PositionSide,
    pub entry_price: Decimal,
    pub liquidation_price: Decimal,
    pub unrealized_pnl: Decimal,
}

/// A merged best-bid/offer observation for one coin, pushed by the feed.
#[derive(Debug, Clone, Copy)]
pub struct PriceTick {
    pub spot_bid: Decimal,
    pub spot_ask: Decimal,
    pub perp_bid: Decimal,
    pub perp_ask: Decimal,
    /// Venue timestamp, milliseconds since epoch.
    pub time_ms: i64,
}

/// A `PriceTick` tagged with its coin.
#[derive(Debug, Clone)]
pub struct CoinTick {
    pub coin: String,
    pub tick: PriceTick,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_order_report_constructors() {
        let ok = OrderReport::filled(dec!(10), dec!(25.5));
        assert_eq!(ok.status, OrderOutcome::Filled);
        assert_eq!(ok.filled_size, dec!(10));
        assert!(ok.error.is_none());

        let bad = OrderReport::failed("venue rejected");
        assert_eq!(bad.status, OrderOutcome::Failed);
        assert_eq!(bad.filled_size, Decimal::ZERO);
        assert_eq!(bad.error.as_deref(), Some("venue rejected"));
    }

    #[test]
    fn test_leg_display() {
        assert_eq!(OrderLeg::Spot.to_string(), "spot");
        assert_eq!(OrderLeg::Perp.to_string(), "perp");
    }
}
