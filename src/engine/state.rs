//! In-memory engine state: positions, pending orders, margin health.
//!
//! One `EngineState` is built at startup and handed to every component
//! behind an `Arc<RwLock<_>>`. It is never persisted; every process start
//! rebuilds it from the exchange (see [`crate::engine::reconcile`]).
//! Writers are the execution guard, the margin monitor, and the reconciler.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::exchange::types::{OrderLeg, PriceQuote};

/// Shared handle to the engine state.
pub type SharedState = Arc<RwLock<EngineState>>;

/// An open delta-neutral position: long spot paired with an equal short perp.
#[derive(Debug, Clone)]
pub struct Position {
    pub coin: String,
    /// Long spot size in base units.
    pub spot_size: Decimal,
    /// Short perp size in base units (stored positive).
    pub perp_size: Decimal,
    /// `None` when the position was rebuilt from the venue and the true
    /// spot entry is lost; PnL derived from it is lower-confidence.
    pub entry_price_spot: Option<Decimal>,
    pub entry_price_perp: Decimal,
    pub entry_time: DateTime<Utc>,
}

impl Position {
    /// Notional exposure of the position. Falls back to the perp entry
    /// price when the spot entry is unknown.
    pub fn size_usd(&self) -> Decimal {
        self.spot_size * self.entry_price_spot.unwrap_or(self.entry_price_perp)
    }

    /// Delta-neutrality check. The legs are sized for equal notional, so
    /// their base-unit sizes legitimately differ by the spot-perp basis;
    /// anything beyond one size unit or 1% of the position is drift.
    pub fn is_balanced(&self, sz_decimals: u32) -> bool {
        let epsilon = Decimal::new(1, sz_decimals);
        let diff = (self.spot_size - self.perp_size).abs();
        if diff <= epsilon {
            return true;
        }
        let larger = self.spot_size.max(self.perp_size);
        larger > Decimal::ZERO && diff / larger <= dec!(0.01)
    }
}

/// An in-flight order, tracked so timeouts cannot orphan it.
#[derive(Debug, Clone)]
pub struct PendingOrder {
    pub cloid: String,
    pub coin: String,
    pub leg: OrderLeg,
    pub is_buy: bool,
    pub size: Decimal,
    pub price: Decimal,
    pub created_at: DateTime<Utc>,
}

impl PendingOrder {
    pub fn new(
        cloid: impl Into<String>,
        coin: impl Into<String>,
        leg: OrderLeg,
        is_buy: bool,
        size: Decimal,
        price: Decimal,
    ) -> Self {
        Self {
            cloid: cloid.into(),
            coin: coin.into(),
            leg,
            is_buy,
            size,
            price,
            created_at: Utc::now(),
        }
    }
}

/// Point-in-time summary for logs and the dashboard feed.
#[derive(Debug, Clone, Serialize)]
pub struct StateSummary {
    pub positions: usize,
    pub pending_orders: usize,
    pub total_exposure_usd: Decimal,
    pub margin_ratio: Decimal,
    pub available_buffer_usd: Decimal,
}

/// Process-wide in-memory state.
#[derive(Debug)]
pub struct EngineState {
    positions: HashMap<String, Position>,
    pending_orders: HashMap<String, PendingOrder>,

    // Safety metrics, updated on every tick.
    pub margin_ratio: Decimal,
    pub last_price_update: Option<DateTime<Utc>>,
    /// Latest quote per coin, refreshed by the feed consumer so that
    /// close paths can price off live books.
    pub last_quotes: HashMap<String, PriceQuote>,

    // Capital tracking.
    pub total_exposure_usd: Decimal,
    pub spot_balance_usdc: Decimal,
    pub perp_margin_usdc: Decimal,
    pub available_buffer_usd: Decimal,
}

impl Default for EngineState {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineState {
    pub fn new() -> Self {
        Self {
            positions: HashMap::new(),
            pending_orders: HashMap::new(),
            margin_ratio: Decimal::ONE,
            last_price_update: None,
            last_quotes: HashMap::new(),
            total_exposure_usd: Decimal::ZERO,
            spot_balance_usdc: Decimal::ZERO,
            perp_margin_usdc: Decimal::ZERO,
            available_buffer_usd: Decimal::ZERO,
        }
    }

    /// Build the shared handle passed to components.
    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Wipe everything back to the initial state (reconciliation start).
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn has_position(&self, coin: &str) -> bool {
        self.positions.contains_key(coin)
    }

    pub fn position(&self, coin: &str) -> Option<&Position> {
        self.positions.get(coin)
    }

    pub fn positions(&self) -> &HashMap<String, Position> {
        &self.positions
    }

    pub fn add_position(&mut self, position: Position) {
        info!(coin = %position.coin, spot_size = %position.spot_size, "Added position");
        self.positions.insert(position.coin.clone(), position);
        self.update_exposure();
    }

    pub fn remove_position(&mut self, coin: &str) {
        if self.positions.remove(coin).is_some() {
            info!(%coin, "Removed position");
            self.update_exposure();
        }
    }

    /// Shrink a position after a partial close.
    pub fn update_position_size(&mut self, coin: &str, new_spot: Decimal, new_perp: Decimal) {
        if let Some(pos) = self.positions.get_mut(coin) {
            pos.spot_size = new_spot;
            pos.perp_size = new_perp;
            self.update_exposure();
        }
    }

    pub fn add_pending_order(&mut self, order: PendingOrder) {
        self.pending_orders.insert(order.cloid.clone(), order);
    }

    pub fn remove_pending_order(&mut self, cloid: &str) {
        self.pending_orders.remove(cloid);
    }

    pub fn pending_orders(&self) -> &HashMap<String, PendingOrder> {
        &self.pending_orders
    }

    pub fn summary(&self) -> StateSummary {
        StateSummary {
            positions: self.positions.len(),
            pending_orders: self.pending_orders.len(),
            total_exposure_usd: self.total_exposure_usd,
            margin_ratio: self.margin_ratio,
            available_buffer_usd: self.available_buffer_usd,
        }
    }

    fn update_exposure(&mut self) {
        self.total_exposure_usd = self.positions.values().map(Position::size_usd).sum();
    }
}
