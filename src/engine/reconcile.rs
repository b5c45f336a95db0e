//! Startup reconciliation: rebuild in-memory state from the venue.
//!
//! The engine deliberately persists no position state. Whatever the venue
//! reports is the truth; anything else is discarded. A failure here is
//! fatal, the engine refuses to start against an unknown book.

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::engine::state::{Position, SharedState};
use crate::exchange::gateway::ExchangeGateway;
use crate::exchange::types::PositionSide;

/// Fatal startup failure; the process exits instead of trading blind.
#[derive(Debug, Error)]
#[error("exchange reconciliation failed: {0}")]
pub struct ReconcileError(#[from] anyhow::Error);

/// Reset state and rebuild it from venue balances and positions.
///
/// Every short perp becomes a delta-neutral [`Position`] with matching leg
/// sizes. The true spot entry price is unrecoverable, so it is recorded as
/// unknown rather than estimated; downstream PnL for reconciled positions
/// is treated as lower-confidence.
pub async fn reconcile(
    gateway: &Arc<dyn ExchangeGateway>,
    state: &SharedState,
) -> Result<(), ReconcileError> {
    info!("Reconciling state from exchange");

    let balances = gateway.get_balances().await?;
    let venue_positions = gateway.get_positions().await?;

    let mut state = state.write().await;
    state.reset();

    for (coin, vp) in venue_positions {
        if vp.side != PositionSide::Short || vp.size == Decimal::ZERO {
            // Longs are not ours: the strategy only ever shorts the perp.
            warn!(%coin, side = ?vp.side, size = %vp.size, "Ignoring non-short venue position");
            continue;
        }

        info!(%coin, size = %vp.size, entry = %vp.entry_price, "Rebuilding position from venue");
        state.add_position(Position {
            coin: coin.clone(),
            spot_size: vp.size,
            perp_size: vp.size,
            entry_price_spot: None,
            entry_price_perp: vp.entry_price,
            entry_time: Utc::now(),
        });
    }

    state.spot_balance_usdc = balances.spot_usdc;
    state.perp_margin_usdc = balances.perp_margin;
    state.available_buffer_usd =
        (balances.perp_margin - dec!(0.5) * state.total_exposure_usd).max(Decimal::ZERO);

    info!(
        positions = state.positions().len(),
        exposure = %state.total_exposure_usd,
        buffer = %state.available_buffer_usd,
        "Reconciliation complete"
    );
    Ok(())
}
