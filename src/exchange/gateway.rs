//! The venue gateway contract consumed by the engine core.
//!
//! The production adapter wraps the venue REST API; tests supply the
//! deterministic [`crate::exchange::MockGateway`]. Everything the core
//! knows about the venue goes through this trait.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;

use super::types::{
    Balances, OrderLeg, OrderReport, OrderStatusReport, PriceQuote, VenuePosition,
};

/// Capability surface of the exchange.
///
/// All order placement is immediate-or-cancel: `place_order` returns within
/// bounded time and the report reflects whether the order filled, stayed
/// open, or failed. Sizes are expected pre-rounded to [`Self::size_decimals`].
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Place an IOC limit order on one leg. `cloid` is the caller-supplied
    /// client order id used for later status queries and cancellation.
    async fn place_order(
        &self,
        coin: &str,
        leg: OrderLeg,
        is_buy: bool,
        size: Decimal,
        price: Decimal,
        cloid: &str,
    ) -> anyhow::Result<OrderReport>;

    /// Cancel an order by client order id. Returns whether the venue
    /// acknowledged the cancel.
    async fn cancel_order(&self, coin: &str, cloid: &str) -> anyhow::Result<bool>;

    /// Look up an order after the fact, e.g. when placement timed out.
    async fn query_order_status(
        &self,
        coin: &str,
        cloid: &str,
    ) -> anyhow::Result<OrderStatusReport>;

    /// Best bid/ask for both legs of a coin.
    async fn get_prices(&self, coin: &str) -> anyhow::Result<PriceQuote>;

    /// USDC balances for the spot wallet and perp margin account.
    async fn get_balances(&self) -> anyhow::Result<Balances>;

    /// All open perp positions, keyed by coin.
    async fn get_positions(&self) -> anyhow::Result<HashMap<String, VenuePosition>>;

    /// Current hourly funding rate. Positive means longs pay shorts; the
    /// engine shorts the perp, so positive is income.
    async fn get_funding_rate(&self, coin: &str) -> anyhow::Result<Decimal>;

    /// 24-hour notional volume, the scanner's liquidity proxy.
    async fn get_volume_24h(&self, coin: &str) -> anyhow::Result<Decimal>;

    /// Resolve a coin name to its venue-internal spot symbol (e.g. `"@107"`).
    /// Must be called at startup; symbols are never hard-coded. Errors if
    /// the coin has no spot listing.
    async fn resolve_spot_symbol(&self, coin: &str) -> anyhow::Result<String>;

    /// Per-coin size decimals from venue meta, fetched once and cached.
    async fn size_decimals(&self, coin: &str) -> anyhow::Result<u32>;
}
