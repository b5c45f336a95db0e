//! Strategy orchestrator: scan, size, execute, log, collect.
//!
//! Two cooperative loops: the scan loop hunts for viable funding and opens
//! at most one position per pass through the execution guard; the funding
//! loop books expected funding income hourly and exits positions whose
//! funding has stayed negative past tolerance.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::engine::guard::ExecutionGuard;
use crate::engine::monitor::MarginMonitor;
use crate::engine::state::SharedState;
use crate::exchange::gateway::ExchangeGateway;
use crate::persistence::EventLog;
use crate::strategy::scanner::FundingScanner;

/// Sizing caps and loop cadence.
#[derive(Debug, Clone)]
pub struct HarvesterConfig {
    pub max_position_per_coin_usd: Decimal,
    pub max_total_exposure_usd: Decimal,
    /// Entries below this are not worth the fees.
    pub min_order_usd: Decimal,
    /// Spot balance must cover the entry with this buffer.
    pub spot_balance_buffer: Decimal,
    /// Perp margin must cover this fraction of the entry.
    pub perp_margin_fraction: Decimal,
    pub scan_interval: Duration,
    pub funding_check_interval: Duration,
}

impl Default for HarvesterConfig {
    fn default() -> Self {
        Self {
            max_position_per_coin_usd: dec!(500),
            max_total_exposure_usd: dec!(2000),
            min_order_usd: dec!(5),
            spot_balance_buffer: dec!(1.02),
            perp_margin_fraction: dec!(0.20),
            scan_interval: Duration::from_secs(300),
            funding_check_interval: Duration::from_secs(3600),
        }
    }
}

/// Delta-neutral funding rate harvester.
pub struct FundingHarvester {
    guard: Arc<ExecutionGuard>,
    scanner: Arc<FundingScanner>,
    monitor: Arc<MarginMonitor>,
    gateway: Arc<dyn ExchangeGateway>,
    state: SharedState,
    events: EventLog,
    config: HarvesterConfig,
}

impl FundingHarvester {
    pub fn new(
        guard: Arc<ExecutionGuard>,
        scanner: Arc<FundingScanner>,
        monitor: Arc<MarginMonitor>,
        gateway: Arc<dyn ExchangeGateway>,
        state: SharedState,
        events: EventLog,
        config: HarvesterConfig,
    ) -> Self {
        Self {
            guard,
            scanner,
            monitor,
            gateway,
            state,
            events,
            config,
        }
    }

    /// Run both loops until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!("Funding harvester started");
        let scan = tokio::spawn(self.clone().scan_loop(shutdown.clone()));
        let funding = tokio::spawn(self.clone().funding_loop(shutdown));
        let _ = tokio::join!(scan, funding);
        info!("Funding harvester stopped");
    }

    async fn scan_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            self.scan_and_enter().await;
            tokio::select! {
                _ = tokio::time::sleep(self.config.scan_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn funding_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.funding_check_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
            self.funding_pass().await;
        }
    }

    /// One pass of the scan-and-enter loop. Enters at most one position.
    pub async fn scan_and_enter(&self) {
        let exposure = self.state.read().await.total_exposure_usd;
        if exposure >= self.config.max_total_exposure_usd {
            debug!(%exposure, "Max exposure reached, skipping scan");
            return;
        }

        let opportunities = self.scanner.scan(false).await;
        let viable: Vec<_> = opportunities.into_iter().filter(|o| o.viable).collect();
        if viable.is_empty() {
            debug!("No viable opportunities");
            return;
        }

        for opp in viable {
            if self.state.read().await.has_position(&opp.coin) {
                continue;
            }

            let remaining = self.config.max_total_exposure_usd - exposure;
            let size_usd = self.config.max_position_per_coin_usd.min(remaining);
            if size_usd < self.config.min_order_usd {
                debug!(coin = %opp.coin, %size_usd, "Below minimum order size");
                continue;
            }

            let prices = match self.gateway.get_prices(&opp.coin).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(coin = %opp.coin, error = %e, "Price fetch failed");
                    continue;
                }
            };
            if prices.spot_ask == Decimal::ZERO || prices.perp_bid == Decimal::ZERO {
                warn!(coin = %opp.coin, "Invalid prices");
                continue;
            }

            let balances = match self.gateway.get_balances().await {
                Ok(b) => b,
                Err(e) => {
                    warn!(error = %e, "Balance fetch failed");
                    continue;
                }
            };
            let required_spot = size_usd * self.config.spot_balance_buffer;
            let required_margin = size_usd * self.config.perp_margin_fraction;
            if balances.spot_usdc < required_spot {
                warn!(
                    coin = %opp.coin,
                    spot_usdc = %balances.spot_usdc,
                    %required_spot,
                    "Insufficient spot USDC"
                );
                continue;
            }
            if balances.perp_margin < required_margin {
                warn!(
                    coin = %opp.coin,
                    perp_margin = %balances.perp_margin,
                    %required_margin,
                    "Insufficient perp margin"
                );
                continue;
            }

            info!(
                coin = %opp.coin,
                %size_usd,
                apr_pct = %(opp.funding_apr * dec!(100)),
                "Entering position"
            );

            let result = self
                .guard
                .execute_delta_neutral(&opp.coin, size_usd, prices.spot_ask, prices.perp_bid)
                .await;

            if result.success {
                info!(coin = %opp.coin, "Position opened");
                self.events.log_position_open(
                    &opp.coin,
                    result.spot_filled,
                    size_usd,
                    prices.spot_ask,
                    prices.perp_bid,
                );
                self.events.log_trade(
                    &opp.coin,
                    "buy",
                    "spot",
                    result.spot_filled,
                    prices.spot_ask,
                    &result.spot_cloid,
                );
                self.events.log_trade(
                    &opp.coin,
                    "sell",
                    "perp",
                    result.perp_filled,
                    prices.perp_bid,
                    &result.perp_cloid,
                );
            } else {
                warn!(
                    coin = %opp.coin,
                    error = result.error.as_deref().unwrap_or("unknown"),
                    "Entry failed"
                );
            }

            // One entry attempt per iteration; the next scan reassesses.
            break;
        }
    }

    /// One pass of the funding loop: book income, exit sour positions.
    pub async fn funding_pass(&self) {
        let positions: Vec<_> = {
            let state = self.state.read().await;
            state.positions().values().cloned().collect()
        };

        for pos in positions {
            let rate = match self.gateway.get_funding_rate(&pos.coin).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(coin = %pos.coin, error = %e, "Funding rate fetch failed");
                    continue;
                }
            };

            if rate > Decimal::ZERO {
                let payment = pos.perp_size * rate * pos.entry_price_perp;
                info!(
                    coin = %pos.coin,
                    %payment,
                    rate_pct = %(rate * dec!(100)),
                    "Funding received"
                );
                self.events
                    .log_funding(&pos.coin, payment, rate, pos.perp_size);
                continue;
            }

            warn!(coin = %pos.coin, %rate, "Funding non-positive");
            if self.monitor.check_funding_direction(rate) {
                error!(coin = %pos.coin, "Funding negative past tolerance, exiting position");
                if self.guard.emergency_close(&pos.coin).await {
                    self.events.log_position_close(&pos.coin, "negative funding");
                } else {
                    error!(coin = %pos.coin, "Negative-funding exit failed");
                }
            }
        }
    }
}
