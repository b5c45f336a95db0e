//! Deterministic scripted gateway for tests and paper runs.
//!
//! Behavior is programmed per leg: each placed order consumes the next
//! scripted [`OrderBehavior`] for its leg, defaulting to a full fill at the
//! limit price. Every call is recorded so tests can assert on exactly what
//! the engine sent to the venue.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::gateway::ExchangeGateway;
use super::types::{
    Balances, OrderLeg, OrderOutcome, OrderReport, OrderStatusKind, OrderStatusReport, PriceQuote,
    VenuePosition,
};

/// Scripted response for one `place_order` call.
#[derive(Debug, Clone)]
pub enum OrderBehavior {
    /// Fill the full requested size at the limit price.
    Fill,
    /// Fill a specific size at a specific price.
    FillAt { size: Decimal, price: Decimal },
    /// Report a venue rejection.
    Fail(String),
    /// Rest on the book instead of filling.
    Open,
    /// Sleep past any caller timeout, then fill.
    Hang(Duration),
    /// Return a transport-level error.
    Error(String),
}

/// Record of one `place_order` call.
#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub coin: String,
    pub leg: OrderLeg,
    pub is_buy: bool,
    pub size: Decimal,
    pub price: Decimal,
    pub cloid: String,
}

#[derive(Default)]
struct Scripts {
    spot: VecDeque<OrderBehavior>,
    perp: VecDeque<OrderBehavior>,
    status: VecDeque<OrderStatusReport>,
}

/// Scripted in-memory gateway.
#[derive(Default)]
pub struct MockGateway {
    prices: Mutex<HashMap<String, PriceQuote>>,
    funding: Mutex<HashMap<String, Decimal>>,
    volume: Mutex<HashMap<String, Decimal>>,
    balances: Mutex<Balances>,
    positions: Mutex<HashMap<String, VenuePosition>>,
    spot_symbols: Mutex<HashMap<String, String>>,
    sz_decimals: Mutex<HashMap<String, u32>>,
    scripts: Mutex<Scripts>,
    placed: Mutex<Vec<PlacedOrder>>,
    cancelled: Mutex<Vec<String>>,
    funding_calls: AtomicU64,
    fail_balances: Mutex<Option<String>>,
    fail_positions: Mutex<Option<String>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_prices(&self, coin: &str, quote: PriceQuote) {
        self.prices.lock().unwrap().insert(coin.to_string(), quote);
    }

    pub fn set_funding_rate(&self, coin: &str, rate: Decimal) {
        self.funding.lock().unwrap().insert(coin.to_string(), rate);
    }

    pub fn set_volume_24h(&self, coin: &str, volume: Decimal) {
        self.volume.lock().unwrap().insert(coin.to_string(), volume);
    }

    pub fn set_balances(&self, balances: Balances) {
        *self.balances.lock().unwrap() = balances;
    }

    pub fn set_position(&self, coin: &str, position: VenuePosition) {
        self.positions
            .lock()
            .unwrap()
            .insert(coin.to_string(), position);
    }

    pub fn set_spot_symbol(&self, coin: &str, symbol: &str) {
        self.spot_symbols
            .lock()
            .unwrap()
            .insert(coin.to_string(), symbol.to_string());
    }

    pub fn set_size_decimals(&self, coin: &str, decimals: u32) {
        self.sz_decimals
            .lock()
            .unwrap()
            .insert(coin.to_string(), decimals);
    }

    /// Make the next balance fetch fail (reconciliation tests).
    pub fn fail_next_balances(&self, error: &str) {
        *self.fail_balances.lock().unwrap() = Some(error.to_string());
    }

    /// Make the next position fetch fail.
    pub fn fail_next_positions(&self, error: &str) {
        *self.fail_positions.lock().unwrap() = Some(error.to_string());
    }

    /// Queue the next behavior for a leg's `place_order`.
    pub fn script_order(&self, leg: OrderLeg, behavior: OrderBehavior) {
        let mut scripts = self.scripts.lock().unwrap();
        match leg {
            OrderLeg::Spot => scripts.spot.push_back(behavior),
            OrderLeg::Perp => scripts.perp.push_back(behavior),
        }
    }

    /// Queue the next `query_order_status` response.
    pub fn script_status(&self, report: OrderStatusReport) {
        self.scripts.lock().unwrap().status.push_back(report);
    }

    pub fn placed_orders(&self) -> Vec<PlacedOrder> {
        self.placed.lock().unwrap().clone()
    }

    pub fn cancelled_orders(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }

    pub fn funding_call_count(&self) -> u64 {
        self.funding_calls.load(Ordering::SeqCst)
    }

    fn next_behavior(&self, leg: OrderLeg) -> OrderBehavior {
        let mut scripts = self.scripts.lock().unwrap();
        let queue = match leg {
            OrderLeg::Spot => &mut scripts.spot,
            OrderLeg::Perp => &mut scripts.perp,
        };
        queue.pop_front().unwrap_or(OrderBehavior::Fill)
    }
}

#[async_trait]
impl ExchangeGateway for MockGateway {
    async fn place_order(
        &self,
        coin: &str,
        leg: OrderLeg,
        is_buy: bool,
        size: Decimal,
        price: Decimal,
        cloid: &str,
    ) -> anyhow::Result<OrderReport> {
        self.placed.lock().unwrap().push(PlacedOrder {
            coin: coin.to_string(),
            leg,
            is_buy,
            size,
            price,
            cloid: cloid.to_string(),
        });

        match self.next_behavior(leg) {
            OrderBehavior::Fill => Ok(OrderReport::filled(size, price)),
            OrderBehavior::FillAt { size, price } => Ok(OrderReport::filled(size, price)),
            OrderBehavior::Fail(reason) => Ok(OrderReport::failed(reason)),
            OrderBehavior::Open => Ok(OrderReport {
                status: OrderOutcome::Open,
                filled_size: Decimal::ZERO,
                avg_price: Decimal::ZERO,
                error: None,
            }),
            OrderBehavior::Hang(delay) => {
                tokio::time::sleep(delay).await;
                Ok(OrderReport::filled(size, price))
            }
            OrderBehavior::Error(message) => Err(anyhow::anyhow!(message)),
        }
    }

    async fn cancel_order(&self, _coin: &str, cloid: &str) -> anyhow::Result<bool> {
        self.cancelled.lock().unwrap().push(cloid.to_string());
        Ok(true)
    }

    async fn query_order_status(
        &self,
        _coin: &str,
        _cloid: &str,
    ) -> anyhow::Result<OrderStatusReport> {
        let report = self.scripts.lock().unwrap().status.pop_front();
        Ok(report.unwrap_or(OrderStatusReport {
            status: OrderStatusKind::Unknown,
            filled_size: Decimal::ZERO,
        }))
    }

    async fn get_prices(&self, coin: &str) -> anyhow::Result<PriceQuote> {
        self.prices
            .lock()
            .unwrap()
            .get(coin)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("No prices for {coin}"))
    }

    async fn get_balances(&self) -> anyhow::Result<Balances> {
        if let Some(error) = self.fail_balances.lock().unwrap().take() {
            anyhow::bail!(error);
        }
        Ok(*self.balances.lock().unwrap())
    }

    async fn get_positions(&self) -> anyhow::Result<HashMap<String, VenuePosition>> {
        if let Some(error) = self.fail_positions.lock().unwrap().take() {
            anyhow::bail!(error);
        }
        Ok(self.positions.lock().unwrap().clone())
    }

    async fn get_funding_rate(&self, coin: &str) -> anyhow::Result<Decimal> {
        self.funding_calls.fetch_add(1, Ordering::SeqCst);
        self.funding
            .lock()
            .unwrap()
            .get(coin)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("No funding rate for {coin}"))
    }

    async fn get_volume_24h(&self, coin: &str) -> anyhow::Result<Decimal> {
        self.volume
            .lock()
            .unwrap()
            .get(coin)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("No volume for {coin}"))
    }

    async fn resolve_spot_symbol(&self, coin: &str) -> anyhow::Result<String> {
        self.spot_symbols
            .lock()
            .unwrap()
            .get(coin)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("{coin} has no spot listing"))
    }

    async fn size_decimals(&self, coin: &str) -> anyhow::Result<u32> {
        Ok(self
            .sz_decimals
            .lock()
            .unwrap()
            .get(coin)
            .copied()
            .unwrap_or(2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_default_behavior_fills_at_limit() {
        let gateway = MockGateway::new();
        let report = gateway
            .place_order("HYPE", OrderLeg::Spot, true, dec!(10), dec!(10.1), "c1")
            .await
            .unwrap();
        assert_eq!(report.status, OrderOutcome::Filled);
        assert_eq!(report.filled_size, dec!(10));
        assert_eq!(report.avg_price, dec!(10.1));
        assert_eq!(gateway.placed_orders().len(), 1);
    }

    #[tokio::test]
    async fn test_scripts_consumed_per_leg() {
        let gateway = MockGateway::new();
        gateway.script_order(OrderLeg::Spot, OrderBehavior::Fail("no liquidity".into()));

        let spot = gateway
            .place_order("HYPE", OrderLeg::Spot, true, dec!(1), dec!(10), "c1")
            .await
            .unwrap();
        let perp = gateway
            .place_order("HYPE", OrderLeg::Perp, false, dec!(1), dec!(10), "c2")
            .await
            .unwrap();

        assert_eq!(spot.status, OrderOutcome::Failed);
        assert_eq!(perp.status, OrderOutcome::Filled);
    }
}
