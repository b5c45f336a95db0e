//! Dead man's switch: force-close every position with aggressive slippage.
//!
//! Reached on manual trigger (`--verify-panic`) or when the watchdog's
//! reconnect rung fails. Closing is best-effort per position rather than
//! atomic; the goal is to shed open risk, not to exit cleanly.

use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::engine::state::SharedState;
use crate::exchange::gateway::ExchangeGateway;
use crate::exchange::types::{OrderLeg, OrderOutcome};
use crate::persistence::EventLog;
use crate::utils::decimal::round_px;

/// Emergency closer for the whole book.
pub struct PanicSwitch {
    gateway: Arc<dyn ExchangeGateway>,
    state: SharedState,
    events: EventLog,
    /// Accept fills this far through the book to get out fast.
    panic_slippage: Decimal,
    per_leg_timeout: Duration,
}

impl PanicSwitch {
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        state: SharedState,
        events: EventLog,
        panic_slippage: Decimal,
        per_leg_timeout: Duration,
    ) -> Self {
        Self {
            gateway,
            state,
            events,
            panic_slippage,
            per_leg_timeout,
        }
    }

    /// Market-dump every position. Returns `true` iff every position
    /// closed completely.
    pub async fn emergency_close_all(&self) -> bool {
        error!("PANIC SWITCH ACTIVATED");

        let positions: Vec<_> = {
            let state = self.state.read().await;
            state.positions().values().cloned().collect()
        };

        if positions.is_empty() {
            info!("No positions to close");
            return true;
        }

        let mut all_closed = true;

        for pos in positions {
            warn!(
                coin = %pos.coin,
                spot = %pos.spot_size,
                perp = %pos.perp_size,
                "Emergency closing position"
            );

            // Price off the live book if we can, entry prices otherwise.
            let (spot_ref, perp_ref) = match self.gateway.get_prices(&pos.coin).await {
                Ok(q) => (q.spot_bid, q.perp_ask),
                Err(e) => {
                    warn!(coin = %pos.coin, error = %e, "Price fetch failed, using entry prices");
                    (
                        pos.entry_price_spot.unwrap_or(pos.entry_price_perp),
                        pos.entry_price_perp,
                    )
                }
            };

            let spot_limit = round_px(spot_ref * (Decimal::ONE - self.panic_slippage));
            let perp_limit = round_px(perp_ref * (Decimal::ONE + self.panic_slippage));

            let (spot_ok, perp_ok) = tokio::join!(
                self.close_leg(&pos.coin, OrderLeg::Spot, false, pos.spot_size, spot_limit),
                self.close_leg(&pos.coin, OrderLeg::Perp, true, pos.perp_size, perp_limit),
            );

            if spot_ok && perp_ok {
                self.state.write().await.remove_position(&pos.coin);
                self.events.log_panic_close(&pos.coin, true);
                info!(coin = %pos.coin, "Closed");
            } else {
                // Keep going; every other position still needs closing.
                error!(coin = %pos.coin, spot_ok, perp_ok, "Failed to fully close");
                self.events.log_panic_close(&pos.coin, false);
                all_closed = false;
            }
        }

        all_closed
    }

    async fn close_leg(
        &self,
        coin: &str,
        leg: OrderLeg,
        is_buy: bool,
        size: Decimal,
        price: Decimal,
    ) -> bool {
        let cloid = uuid::Uuid::new_v4().simple().to_string();
        match timeout(
            self.per_leg_timeout,
            self.gateway.place_order(coin, leg, is_buy, size, price, &cloid),
        )
        .await
        {
            Ok(Ok(report)) if report.status == OrderOutcome::Filled => true,
            Ok(Ok(report)) => {
                error!(
                    %coin,
                    %leg,
                    status = ?report.status,
                    error = report.error.as_deref().unwrap_or(""),
                    "Panic close leg not filled"
                );
                false
            }
            Ok(Err(e)) => {
                error!(%coin, %leg, error = %e, "Panic close leg errored");
                false
            }
            Err(_) => {
                error!(%coin, %leg, "Panic close leg timed out");
                false
            }
        }
    }
}
