//! Atomic dual-leg execution with a margin-safety priority lock.
//!
//! Guarantees that a delta-neutral entry either fills both legs or leaves
//! no position behind: a legged fill is unwound with aggressive slippage
//! before the call returns. The margin monitor's rebalance path preempts
//! any future strategy entry without interrupting one already in flight.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::state::{PendingOrder, Position, SharedState};
use crate::exchange::gateway::ExchangeGateway;
use crate::exchange::types::{OrderLeg, OrderOutcome, OrderStatusKind};
use crate::persistence::EventLog;
use crate::utils::decimal::{round_px, round_size};

/// Outcome of a dual-leg execution attempt.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub success: bool,
    pub spot_cloid: String,
    pub perp_cloid: String,
    pub spot_filled: Decimal,
    pub perp_filled: Decimal,
    pub error: Option<String>,
}

impl ExecutionResult {
    fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            spot_cloid: String::new(),
            perp_cloid: String::new(),
            spot_filled: Decimal::ZERO,
            perp_filled: Decimal::ZERO,
            error: Some(error.into()),
        }
    }
}

/// Two-primitive priority lock: a mutex serializes executions, the gate
/// holds future strategy callers back while a safety call is pending. The
/// pass reopens the gate on drop so an erroring safety path cannot wedge
/// the strategy shut.
struct PriorityGate {
    open: watch::Sender<bool>,
}

struct GatePass<'a>(&'a PriorityGate);

impl PriorityGate {
    fn new() -> Self {
        let (open, _) = watch::channel(true);
        Self { open }
    }

    fn close(&self) -> GatePass<'_> {
        self.open.send_replace(false);
        GatePass(self)
    }

    async fn wait_open(&self) {
        let mut rx = self.open.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Drop for GatePass<'_> {
    fn drop(&mut self) {
        self.0.open.send_replace(true);
    }
}

/// Configuration for the execution guard.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub dry_run: bool,
    pub order_timeout: std::time::Duration,
    /// Entry limit buffer: buy spot this much above ask, sell perp below bid.
    pub slippage_buffer: Decimal,
    /// Buffer for unwinding a legged fill and for partial closes.
    pub unwind_slippage: Decimal,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            dry_run: true,
            order_timeout: std::time::Duration::from_secs(5),
            slippage_buffer: dec!(0.01),
            unwind_slippage: dec!(0.02),
        }
    }
}

/// Everything one dual-leg entry attempt needs, precomputed.
struct EntryLegs<'a> {
    spot_size: Decimal,
    spot_limit: Decimal,
    spot_cloid: &'a str,
    perp_size: Decimal,
    perp_limit: Decimal,
    perp_cloid: &'a str,
    spot_price: Decimal,
    perp_price: Decimal,
    sz_decimals: u32,
}

/// Atomic two-leg executor shared by the strategy and the margin monitor.
pub struct ExecutionGuard {
    gateway: Arc<dyn ExchangeGateway>,
    state: SharedState,
    events: EventLog,
    config: GuardConfig,
    lock: Mutex<()>,
    gate: PriorityGate,
}

impl ExecutionGuard {
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        state: SharedState,
        events: EventLog,
        config: GuardConfig,
    ) -> Self {
        if config.dry_run {
            warn!("Execution guard in DRY RUN mode - no real orders");
        }
        Self {
            gateway,
            state,
            events,
            config,
            lock: Mutex::new(()),
            gate: PriorityGate::new(),
        }
    }

    /// Strategy entry point. Waits while a safety rebalance is pending,
    /// then executes both legs under the execution lock.
    pub async fn execute_delta_neutral(
        &self,
        coin: &str,
        size_usd: Decimal,
        spot_price: Decimal,
        perp_price: Decimal,
    ) -> ExecutionResult {
        if self.config.dry_run {
            info!(%coin, %size_usd, "DRY RUN: would execute delta-neutral entry");
            return ExecutionResult {
                success: true,
                spot_cloid: "dry-run".into(),
                perp_cloid: "dry-run".into(),
                spot_filled: size_usd / spot_price,
                perp_filled: size_usd / perp_price,
                error: None,
            };
        }

        self.gate.wait_open().await;
        let _guard = self.lock.lock().await;
        self.parallel_execute(coin, size_usd, spot_price, perp_price)
            .await
    }

    /// Margin-monitor entry point: close `percentage` of a position.
    /// Takes priority over future strategy entries.
    pub async fn safety_rebalance(&self, coin: &str, percentage: Decimal) -> bool {
        let _pass = self.gate.close();
        let _guard = self.lock.lock().await;
        self.close_partial(coin, percentage).await
    }

    /// Close an entire position. Equivalent to a 100% safety rebalance.
    pub async fn emergency_close(&self, coin: &str) -> bool {
        self.safety_rebalance(coin, Decimal::ONE).await
    }

    async fn parallel_execute(
        &self,
        coin: &str,
        size_usd: Decimal,
        spot_price: Decimal,
        perp_price: Decimal,
    ) -> ExecutionResult {
        let spot_cloid = new_cloid();
        let perp_cloid = new_cloid();

        let sz_decimals = self.size_decimals_or_default(coin).await;
        let spot_size = round_size(size_usd / spot_price, sz_decimals);
        let perp_size = round_size(size_usd / perp_price, sz_decimals);

        // Buffered limits: buy spot a little high, sell perp a little low,
        // so the IOC orders cross the book.
        let b = self.config.slippage_buffer;
        let spot_limit = round_px(spot_price * (Decimal::ONE + b));
        let perp_limit = round_px(perp_price * (Decimal::ONE - b));

        {
            let mut state = self.state.write().await;
            state.add_pending_order(PendingOrder::new(
                spot_cloid.clone(),
                coin,
                OrderLeg::Spot,
                true,
                spot_size,
                spot_limit,
            ));
            state.add_pending_order(PendingOrder::new(
                perp_cloid.clone(),
                coin,
                OrderLeg::Perp,
                false,
                perp_size,
                perp_limit,
            ));
        }

        info!(
            %coin,
            %spot_size,
            %spot_limit,
            %perp_size,
            %perp_limit,
            "Executing delta-neutral entry"
        );

        let legs = EntryLegs {
            spot_size,
            spot_limit,
            spot_cloid: &spot_cloid,
            perp_size,
            perp_limit,
            perp_cloid: &perp_cloid,
            spot_price,
            perp_price,
            sz_decimals,
        };
        let result = self.run_entry_legs(coin, legs).await;

        let mut state = self.state.write().await;
        state.remove_pending_order(&spot_cloid);
        state.remove_pending_order(&perp_cloid);

        result
    }

    async fn run_entry_legs(&self, coin: &str, legs: EntryLegs<'_>) -> ExecutionResult {
        let (spot, perp) = tokio::join!(
            self.place_with_timeout(
                coin,
                OrderLeg::Spot,
                true,
                legs.spot_size,
                legs.spot_limit,
                legs.spot_cloid
            ),
            self.place_with_timeout(
                coin,
                OrderLeg::Perp,
                false,
                legs.perp_size,
                legs.perp_limit,
                legs.perp_cloid
            ),
        );

        let (spot_ok, spot_filled) = spot;
        let (perp_ok, perp_filled) = perp;

        if spot_ok && perp_ok {
            info!(%coin, %spot_filled, %perp_filled, "Delta-neutral entry filled");
            let position = Position {
                coin: coin.to_string(),
                spot_size: spot_filled,
                perp_size: perp_filled,
                entry_price_spot: Some(legs.spot_price),
                entry_price_perp: legs.perp_price,
                entry_time: chrono::Utc::now(),
            };

            // The legs are placed for equal notional; unequal fills mean
            // residual directional exposure. No algorithmic self-repair,
            // just a loud flag for a priority exit.
            if !position.is_balanced(legs.sz_decimals) {
                error!(
                    %coin,
                    %spot_filled,
                    %perp_filled,
                    "Delta-neutrality violated after entry, position needs priority exit"
                );
                self.events.log_critical(
                    "delta_neutrality",
                    &format!("{coin} legs unbalanced: spot {spot_filled} vs perp {perp_filled}"),
                );
            }

            self.state.write().await.add_position(position);
            return ExecutionResult {
                success: true,
                spot_cloid: legs.spot_cloid.to_string(),
                perp_cloid: legs.perp_cloid.to_string(),
                spot_filled,
                perp_filled,
                error: None,
            };
        }

        if !spot_ok && !perp_ok {
            warn!(%coin, "Both entry legs failed");
            return ExecutionResult::failure("Both legs failed");
        }

        // Legged trade: one side filled, the other did not. Unwind the
        // filled side before reporting failure.
        error!(%coin, spot_ok, perp_ok, "Legged entry, unwinding filled side");
        if spot_ok {
            self.emergency_unwind(coin, OrderLeg::Spot, spot_filled, legs.spot_price)
                .await;
        } else {
            self.emergency_unwind(coin, OrderLeg::Perp, perp_filled, legs.perp_price)
                .await;
        }

        ExecutionResult::failure("Legged trade - filled side unwound")
    }

    /// Place one leg with a timeout, recovering ghost orders afterwards.
    /// Failure reports, transport errors, and timeouts all collapse into
    /// `(false, 0)` so the caller's unwind logic runs uniformly.
    async fn place_with_timeout(
        &self,
        coin: &str,
        leg: OrderLeg,
        is_buy: bool,
        size: Decimal,
        price: Decimal,
        cloid: &str,
    ) -> (bool, Decimal) {
        let placed = timeout(
            self.config.order_timeout,
            self.gateway.place_order(coin, leg, is_buy, size, price, cloid),
        )
        .await;

        match placed {
            Ok(Ok(report)) => match report.status {
                OrderOutcome::Filled => (true, report.filled_size),
                OrderOutcome::Open => {
                    // IOC orders should never rest; cancel and count the
                    // leg as failed.
                    warn!(%coin, %leg, %cloid, "IOC order left resting, cancelling");
                    if let Err(e) = self.gateway.cancel_order(coin, cloid).await {
                        error!(%coin, %cloid, error = %e, "Cancel of resting order failed");
                    }
                    (false, Decimal::ZERO)
                }
                OrderOutcome::Failed => {
                    warn!(
                        %coin,
                        %leg,
                        error = report.error.as_deref().unwrap_or("unknown"),
                        "Order rejected"
                    );
                    (false, Decimal::ZERO)
                }
            },
            Ok(Err(e)) => {
                error!(%coin, %leg, %cloid, error = %e, "Order error");
                (false, Decimal::ZERO)
            }
            Err(_) => {
                warn!(%coin, %leg, %cloid, "Order timed out, checking status");
                self.handle_timeout(coin, cloid).await
            }
        }
    }

    /// A placement timed out; ask the venue what actually happened.
    async fn handle_timeout(&self, coin: &str, cloid: &str) -> (bool, Decimal) {
        match self.gateway.query_order_status(coin, cloid).await {
            Ok(status) => match status.status {
                OrderStatusKind::Filled => {
                    info!(%coin, %cloid, filled = %status.filled_size, "Recovered ghost order: filled");
                    (true, status.filled_size)
                }
                OrderStatusKind::Open => {
                    info!(%coin, %cloid, "Cancelling zombie order");
                    if let Err(e) = self.gateway.cancel_order(coin, cloid).await {
                        error!(%coin, %cloid, error = %e, "Zombie cancel failed");
                    }
                    (false, Decimal::ZERO)
                }
                OrderStatusKind::Canceled => {
                    debug!(%coin, %cloid, "Order cancelled with no fill");
                    (false, Decimal::ZERO)
                }
                OrderStatusKind::Unknown => {
                    error!(%coin, %cloid, "Order status unknown after timeout");
                    self.events
                        .log_critical("order_status", &format!("{coin} order {cloid} unverifiable"));
                    (false, Decimal::ZERO)
                }
            },
            Err(e) => {
                error!(%coin, %cloid, error = %e, "Could not verify order after timeout");
                self.events
                    .log_critical("order_status", &format!("{coin} order {cloid}: {e}"));
                (false, Decimal::ZERO)
            }
        }
    }

    /// Reverse a filled leg after the other side failed.
    async fn emergency_unwind(&self, coin: &str, leg: OrderLeg, size: Decimal, price: Decimal) {
        let slip = self.config.unwind_slippage;
        // Spot was bought: sell it below the entry. Perp was shorted: buy
        // it back above.
        let (is_buy, unwind_price) = match leg {
            OrderLeg::Spot => (false, round_px(price * (Decimal::ONE - slip))),
            OrderLeg::Perp => (true, round_px(price * (Decimal::ONE + slip))),
        };

        warn!(%coin, %leg, %size, %unwind_price, "Unwinding legged fill");

        let placed = timeout(
            self.config.order_timeout,
            self.gateway
                .place_order(coin, leg, is_buy, size, unwind_price, &new_cloid()),
        )
        .await;

        match placed {
            Ok(Ok(report)) if report.status == OrderOutcome::Filled => {
                info!(%coin, %leg, filled = %report.filled_size, "Unwind filled");
                self.events.log(
                    "unwind",
                    serde_json::json!({
                        "coin": coin,
                        "leg": leg.to_string(),
                        "size": size,
                        "price": unwind_price,
                    }),
                );
            }
            other => {
                // Exchange truth wins at the next reconciliation.
                error!(%coin, %leg, ?other, "Unwind failed, state left untouched");
                self.events
                    .log_critical("unwind", &format!("{coin} {leg} unwind of {size} failed"));
            }
        }
    }

    /// Close a fraction of a position, both legs concurrently at
    /// aggressive limits. A full close removes the position from state;
    /// a partial one shrinks it.
    async fn close_partial(&self, coin: &str, percentage: Decimal) -> bool {
        if self.config.dry_run {
            info!(%coin, pct = %(percentage * dec!(100)), "DRY RUN: would close position fraction");
            return true;
        }

        let (pos, margin_ratio) = {
            let state = self.state.read().await;
            match state.position(coin) {
                Some(p) => (p.clone(), state.margin_ratio),
                None => {
                    debug!(%coin, "No position to close");
                    return true;
                }
            }
        };
        let sz_decimals = self.size_decimals_or_default(coin).await;

        let close_spot = round_size(pos.spot_size * percentage, sz_decimals);
        let close_perp = round_size(pos.perp_size * percentage, sz_decimals);

        info!(
            %coin,
            pct = %(percentage * dec!(100)),
            %close_spot,
            %close_perp,
            "Closing position fraction"
        );

        // Price off the live book; fall back to entry prices if the fetch
        // fails, closing matters more than the level.
        let (spot_ref, perp_ref) = match self.gateway.get_prices(coin).await {
            Ok(q) => (q.spot_bid, q.perp_ask),
            Err(e) => {
                warn!(%coin, error = %e, "Price fetch failed, closing at entry-based limits");
                (
                    pos.entry_price_spot.unwrap_or(pos.entry_price_perp),
                    pos.entry_price_perp,
                )
            }
        };

        let slip = self.config.unwind_slippage;
        let spot_limit = round_px(spot_ref * (Decimal::ONE - slip));
        let perp_limit = round_px(perp_ref * (Decimal::ONE + slip));

        let spot_cloid = new_cloid();
        let perp_cloid = new_cloid();
        let (spot, perp) = tokio::join!(
            self.place_with_timeout(
                coin,
                OrderLeg::Spot,
                false,
                close_spot,
                spot_limit,
                &spot_cloid
            ),
            self.place_with_timeout(
                coin,
                OrderLeg::Perp,
                true,
                close_perp,
                perp_limit,
                &perp_cloid
            ),
        );

        let (spot_ok, _) = spot;
        let (perp_ok, _) = perp;

        // State reflects the intent; a failed leg is caught by the next
        // reconciliation.
        {
            let mut state = self.state.write().await;
            if percentage >= Decimal::ONE {
                state.remove_position(coin);
            } else {
                state.update_position_size(
                    coin,
                    pos.spot_size - close_spot,
                    pos.perp_size - close_perp,
                );
            }
        }

        self.events.log_rebalance(coin, percentage, margin_ratio);

        if !(spot_ok && perp_ok) {
            error!(%coin, spot_ok, perp_ok, "Close leg failed, reconciliation will restore truth");
        }
        spot_ok && perp_ok
    }

    async fn size_decimals_or_default(&self, coin: &str) -> u32 {
        match self.gateway.size_decimals(coin).await {
            Ok(d) => d,
            Err(e) => {
                warn!(%coin, error = %e, "Size decimals unavailable, defaulting to 2");
                2
            }
        }
    }
}

fn new_cloid() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state::EngineState;
    use crate::exchange::mock::{MockGateway, OrderBehavior};
    use crate::exchange::types::{OrderStatusReport, PriceQuote};
    use std::time::Duration;

    fn live_config() -> GuardConfig {
        GuardConfig {
            dry_run: false,
            ..GuardConfig::default()
        }
    }

    fn quote(spot_bid: Decimal, spot_ask: Decimal, perp_bid: Decimal, perp_ask: Decimal) -> PriceQuote {
        PriceQuote {
            spot_bid,
            spot_ask,
            perp_bid,
            perp_ask,
        }
    }

    fn guard_with(gateway: Arc<MockGateway>, state: SharedState) -> ExecutionGuard {
        ExecutionGuard::new(gateway, state, EventLog::new(), live_config())
    }

    #[tokio::test]
    async fn test_happy_path_adds_position_and_clears_pending() {
        let gateway = Arc::new(MockGateway::new());
        gateway.set_size_decimals("HYPE", 2);
        let state = EngineState::shared();
        let guard = guard_with(gateway.clone(), state.clone());

        let result = guard
            .execute_delta_neutral("HYPE", dec!(100), dec!(10.00), dec!(10.05))
            .await;

        assert!(result.success);
        assert_eq!(result.spot_filled, dec!(10.00));
        assert_eq!(result.perp_filled, dec!(9.95));

        let state = state.read().await;
        let pos = state.position("HYPE").expect("position added");
        assert_eq!(pos.spot_size, dec!(10.00));
        assert_eq!(pos.perp_size, dec!(9.95));
        assert!(pos.is_balanced(1));
        assert_eq!(state.pending_orders().len(), 0);

        // Limits carried the 1% buffer.
        let placed = gateway.placed_orders();
        assert_eq!(placed.len(), 2);
        let spot = placed.iter().find(|o| o.leg == OrderLeg::Spot).unwrap();
        let perp = placed.iter().find(|o| o.leg == OrderLeg::Perp).unwrap();
        assert_eq!(spot.price, dec!(10.10000));
        assert!(spot.is_buy);
        assert_eq!(perp.price, dec!(9.94950));
        assert!(!perp.is_buy);
    }

    #[tokio::test]
    async fn test_both_legs_failed_leaves_state_unchanged() {
        let gateway = Arc::new(MockGateway::new());
        gateway.script_order(OrderLeg::Spot, OrderBehavior::Fail("rejected".into()));
        gateway.script_order(OrderLeg::Perp, OrderBehavior::Fail("rejected".into()));
        let state = EngineState::shared();
        let guard = guard_with(gateway.clone(), state.clone());

        let result = guard
            .execute_delta_neutral("HYPE", dec!(100), dec!(10), dec!(10.05))
            .await;

        assert!(!result.success);
        let state = state.read().await;
        assert!(!state.has_position("HYPE"));
        assert!(state.pending_orders().is_empty());
        assert_eq!(gateway.placed_orders().len(), 2);
    }

    #[tokio::test]
    async fn test_spot_fill_perp_fail_unwinds_spot() {
        let gateway = Arc::new(MockGateway::new());
        gateway.script_order(OrderLeg::Perp, OrderBehavior::Fail("no margin".into()));
        let state = EngineState::shared();
        let guard = guard_with(gateway.clone(), state.clone());

        let result = guard
            .execute_delta_neutral("HYPE", dec!(100), dec!(10.00), dec!(10.05))
            .await;

        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("unwound"));
        assert!(!state.read().await.has_position("HYPE"));

        // Third order is the unwind: a spot sell at 2% below the quoted price.
        let placed = gateway.placed_orders();
        assert_eq!(placed.len(), 3);
        let unwind = &placed[2];
        assert_eq!(unwind.leg, OrderLeg::Spot);
        assert!(!unwind.is_buy);
        assert_eq!(unwind.size, dec!(10.00));
        assert_eq!(unwind.price, dec!(9.80000));
    }

    #[tokio::test]
    async fn test_perp_fill_spot_fail_unwinds_perp() {
        let gateway = Arc::new(MockGateway::new());
        gateway.script_order(OrderLeg::Spot, OrderBehavior::Fail("rejected".into()));
        let state = EngineState::shared();
        let guard = guard_with(gateway.clone(), state.clone());

        let result = guard
            .execute_delta_neutral("HYPE", dec!(100), dec!(10.00), dec!(10.00))
            .await;

        assert!(!result.success);
        let placed = gateway.placed_orders();
        // Spot fail, perp fill, then a perp buy-back at 2% above.
        assert_eq!(placed.len(), 3);
        let unwind = &placed[2];
        assert_eq!(unwind.leg, OrderLeg::Perp);
        assert!(unwind.is_buy);
        assert_eq!(unwind.price, dec!(10.20000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_recovers_ghost_fill() {
        let gateway = Arc::new(MockGateway::new());
        // Spot hangs past the 5s order timeout; the status query then
        // reports it actually filled.
        gateway.script_order(OrderLeg::Spot, OrderBehavior::Hang(Duration::from_secs(30)));
        gateway.script_status(OrderStatusReport {
            status: OrderStatusKind::Filled,
            filled_size: dec!(10.00),
        });
        let state = EngineState::shared();
        let guard = guard_with(gateway.clone(), state.clone());

        let result = guard
            .execute_delta_neutral("HYPE", dec!(100), dec!(10.00), dec!(10.00))
            .await;

        assert!(result.success);
        assert_eq!(result.spot_filled, dec!(10.00));
        assert!(state.read().await.has_position("HYPE"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels_zombie_order() {
        let gateway = Arc::new(MockGateway::new());
        gateway.script_order(OrderLeg::Perp, OrderBehavior::Hang(Duration::from_secs(30)));
        gateway.script_status(OrderStatusReport {
            status: OrderStatusKind::Open,
            filled_size: Decimal::ZERO,
        });
        let state = EngineState::shared();
        let guard = guard_with(gateway.clone(), state.clone());

        let result = guard
            .execute_delta_neutral("HYPE", dec!(100), dec!(10.00), dec!(10.00))
            .await;

        // Perp leg failed after the cancel, so the spot fill was unwound.
        assert!(!result.success);
        assert_eq!(gateway.cancelled_orders().len(), 1);
        assert!(!state.read().await.has_position("HYPE"));
    }

    #[tokio::test]
    async fn test_partial_close_shrinks_position() {
        let gateway = Arc::new(MockGateway::new());
        gateway.set_prices("HYPE", quote(dec!(10.00), dec!(10.02), dec!(10.03), dec!(10.05)));
        let state = EngineState::shared();
        state.write().await.add_position(Position {
            coin: "HYPE".into(),
            spot_size: dec!(10),
            perp_size: dec!(10),
            entry_price_spot: Some(dec!(10)),
            entry_price_perp: dec!(10.05),
            entry_time: chrono::Utc::now(),
        });
        let guard = guard_with(gateway.clone(), state.clone());

        assert!(guard.safety_rebalance("HYPE", dec!(0.25)).await);

        let state = state.read().await;
        let pos = state.position("HYPE").unwrap();
        assert_eq!(pos.spot_size, dec!(7.5));
        assert_eq!(pos.perp_size, dec!(7.5));

        // Spot sells 2% below bid, perp buys back 2% above ask.
        let placed = gateway.placed_orders();
        let spot = placed.iter().find(|o| o.leg == OrderLeg::Spot).unwrap();
        let perp = placed.iter().find(|o| o.leg == OrderLeg::Perp).unwrap();
        assert_eq!(spot.price, dec!(9.80000));
        assert_eq!(perp.price, dec!(10.25100));
    }

    #[tokio::test]
    async fn test_full_close_removes_position_and_is_idempotent() {
        let gateway = Arc::new(MockGateway::new());
        gateway.set_prices("HYPE", quote(dec!(10), dec!(10), dec!(10), dec!(10)));
        let state = EngineState::shared();
        state.write().await.add_position(Position {
            coin: "HYPE".into(),
            spot_size: dec!(10),
            perp_size: dec!(10),
            entry_price_spot: Some(dec!(10)),
            entry_price_perp: dec!(10),
            entry_time: chrono::Utc::now(),
        });
        let guard = guard_with(gateway.clone(), state.clone());

        assert!(guard.safety_rebalance("HYPE", Decimal::ONE).await);
        assert!(!state.read().await.has_position("HYPE"));
        let orders_after_first = gateway.placed_orders().len();

        // Second full close: success, no further orders.
        assert!(guard.safety_rebalance("HYPE", Decimal::ONE).await);
        assert_eq!(gateway.placed_orders().len(), orders_after_first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_safety_call_completes_before_strategy_starts() {
        let gateway = Arc::new(MockGateway::new());
        gateway.set_prices("HYPE", quote(dec!(10), dec!(10), dec!(10), dec!(10)));
        // The safety close's spot leg takes a while; the strategy entry
        // issued meanwhile must not reach the gateway until it finishes.
        gateway.script_order(OrderLeg::Spot, OrderBehavior::Hang(Duration::from_secs(2)));
        let state = EngineState::shared();
        state.write().await.add_position(Position {
            coin: "HYPE".into(),
            spot_size: dec!(10),
            perp_size: dec!(10),
            entry_price_spot: Some(dec!(10)),
            entry_price_perp: dec!(10),
            entry_time: chrono::Utc::now(),
        });
        let guard = Arc::new(guard_with(gateway.clone(), state.clone()));

        let safety = {
            let guard = guard.clone();
            tokio::spawn(async move { guard.safety_rebalance("HYPE", Decimal::ONE).await })
        };
        tokio::task::yield_now().await;

        let strategy = {
            let guard = guard.clone();
            tokio::spawn(async move {
                guard
                    .execute_delta_neutral("SOL", dec!(100), dec!(100), dec!(100))
                    .await
            })
        };

        assert!(safety.await.unwrap());
        assert!(strategy.await.unwrap().success);

        // Close legs (HYPE) strictly precede the entry legs (SOL).
        let placed = gateway.placed_orders();
        assert_eq!(placed.len(), 4);
        assert!(placed[0].coin == "HYPE" && placed[1].coin == "HYPE");
        assert!(placed[2].coin == "SOL" && placed[3].coin == "SOL");
    }

    #[test]
    fn test_gate_blocks_until_pass_dropped() {
        let gate = PriorityGate::new();
        let pass = gate.close();

        let mut waiting = tokio_test::task::spawn(gate.wait_open());
        assert!(waiting.poll().is_pending());

        // Dropping the pass reopens the gate and wakes the waiter.
        drop(pass);
        assert!(waiting.is_woken());
        assert!(waiting.poll().is_ready());
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() {
        let gateway = Arc::new(MockGateway::new());
        let state = EngineState::shared();
        let guard = ExecutionGuard::new(
            gateway.clone(),
            state.clone(),
            EventLog::new(),
            GuardConfig::default(),
        );

        let result = guard
            .execute_delta_neutral("HYPE", dec!(100), dec!(10), dec!(10))
            .await;

        assert!(result.success);
        assert_eq!(result.spot_cloid, "dry-run");
        assert!(gateway.placed_orders().is_empty());
        assert!(!state.read().await.has_position("HYPE"));
    }
}
