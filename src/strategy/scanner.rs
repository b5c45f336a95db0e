//! Funding opportunity scanner with break-even validation.
//!
//! Polls funding rates and liquidity over the configured coin universe and
//! validates each candidate against the fee structure: an opportunity is
//! only viable if the accrued funding pays back the round-trip cost fast
//! enough. Results are cached with a short TTL; readers get snapshots.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::exchange::gateway::ExchangeGateway;

/// Scanner thresholds and fee assumptions.
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Minimum annualized funding rate to consider (0.20 = 20%).
    pub min_apr: Decimal,
    /// Minimum 24h volume in USD.
    pub min_liquidity_usd: Decimal,
    /// Maximum days acceptable to break even on fees.
    pub max_breakeven_days: Decimal,
    /// Minimum net APY (percent) after fees.
    pub min_net_apy_pct: Decimal,
    pub fee_spot_taker: Decimal,
    pub fee_perp_taker: Decimal,
    pub slippage_estimate: Decimal,
    /// Fraction of deployed capital that actually sits in the
    /// funding-earning perp leg (rest is margin buffer and spot).
    pub capital_efficiency: Decimal,
    pub cache_ttl: Duration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            min_apr: dec!(0.20),
            min_liquidity_usd: dec!(1_000_000),
            max_breakeven_days: dec!(5),
            min_net_apy_pct: dec!(15),
            fee_spot_taker: dec!(0.0004),
            fee_perp_taker: dec!(0.0003),
            slippage_estimate: dec!(0.001),
            capital_efficiency: dec!(0.40),
            cache_ttl: Duration::from_secs(60),
        }
    }
}

impl ScannerConfig {
    /// Round-trip fee cost: both legs in and out, with slippage both ways.
    pub fn roundtrip_cost(&self) -> Decimal {
        let one_way = self.fee_spot_taker + self.fee_perp_taker + self.slippage_estimate * dec!(2);
        one_way * dec!(2)
    }
}

/// A scanned and validated funding opportunity.
#[derive(Debug, Clone)]
pub struct FundingOpportunity {
    pub coin: String,
    pub funding_rate_hourly: Decimal,
    pub funding_apr: Decimal,
    pub liquidity_usd: Decimal,
    pub days_to_breakeven: Decimal,
    pub net_apy: Decimal,
    pub viable: bool,
    pub reason: String,
}

struct ScanCache {
    at: Instant,
    opportunities: Vec<FundingOpportunity>,
}

/// Scans the coin universe for harvestable funding.
pub struct FundingScanner {
    gateway: Arc<dyn ExchangeGateway>,
    coins: Vec<String>,
    config: ScannerConfig,
    cache: Mutex<Option<ScanCache>>,
}

impl FundingScanner {
    pub fn new(gateway: Arc<dyn ExchangeGateway>, coins: Vec<String>, config: ScannerConfig) -> Self {
        Self {
            gateway,
            coins,
            config,
            cache: Mutex::new(None),
        }
    }

    /// Scan for opportunities, serving from cache within the TTL.
    /// Returns a snapshot sorted viable-first, then by net APY.
    pub async fn scan(&self, force: bool) -> Vec<FundingOpportunity> {
        {
            let cache = self.cache.lock().await;
            if let Some(cached) = cache.as_ref() {
                if !force && cached.at.elapsed() < self.config.cache_ttl {
                    return cached.opportunities.clone();
                }
            }
        }

        debug!(coins = self.coins.len(), "Scanning for funding opportunities");
        let mut opportunities = Vec::new();

        for coin in &self.coins {
            // One bad coin must not kill the scan.
            let rate = match self.gateway.get_funding_rate(coin).await {
                Ok(rate) => rate,
                Err(e) => {
                    warn!(%coin, error = %e, "Funding rate fetch failed, skipping");
                    continue;
                }
            };

            // Shorts pay when funding is negative; nothing to harvest.
            if rate <= Decimal::ZERO {
                continue;
            }

            let apr = rate * dec!(24) * dec!(365);
            if apr < self.config.min_apr {
                continue;
            }

            let liquidity = match self.gateway.get_volume_24h(coin).await {
                Ok(volume) => volume,
                Err(e) => {
                    warn!(%coin, error = %e, "Volume fetch failed, skipping");
                    continue;
                }
            };

            if liquidity < self.config.min_liquidity_usd {
                opportunities.push(FundingOpportunity {
                    coin: coin.clone(),
                    funding_rate_hourly: rate,
                    funding_apr: apr,
                    liquidity_usd: liquidity,
                    days_to_breakeven: dec!(999),
                    net_apy: Decimal::ZERO,
                    viable: false,
                    reason: format!("Low liquidity: ${liquidity:.0}"),
                });
                continue;
            }

            opportunities.push(self.validate(coin, rate, apr, liquidity));
        }

        // Viable first, then richest net APY.
        opportunities.sort_by(|a, b| {
            b.viable
                .cmp(&a.viable)
                .then_with(|| b.net_apy.cmp(&a.net_apy))
        });

        let viable = opportunities.iter().filter(|o| o.viable).count();
        info!(
            viable,
            scanned = opportunities.len(),
            "Funding scan complete"
        );
        for opp in opportunities.iter().filter(|o| o.viable).take(5) {
            info!(
                coin = %opp.coin,
                apr_pct = %(opp.funding_apr * dec!(100)),
                net_apy = %opp.net_apy,
                breakeven_days = %opp.days_to_breakeven,
                "Viable opportunity"
            );
        }

        let mut cache = self.cache.lock().await;
        *cache = Some(ScanCache {
            at: Instant::now(),
            opportunities: opportunities.clone(),
        });
        opportunities
    }

    /// The single best opportunity right now, if any is viable.
    pub async fn best_opportunity(&self) -> Option<FundingOpportunity> {
        self.scan(false).await.into_iter().find(|o| o.viable)
    }

    /// Break-even validation: only `capital_efficiency` of deployed capital
    /// earns funding, so income accrues slower than the headline rate.
    fn validate(
        &self,
        coin: &str,
        hourly_rate: Decimal,
        apr: Decimal,
        liquidity: Decimal,
    ) -> FundingOpportunity {
        let roundtrip = self.config.roundtrip_cost();
        let daily_income = hourly_rate * dec!(24) * self.config.capital_efficiency;

        if daily_income <= Decimal::ZERO {
            return FundingOpportunity {
                coin: coin.to_string(),
                funding_rate_hourly: hourly_rate,
                funding_apr: apr,
                liquidity_usd: liquidity,
                days_to_breakeven: dec!(999),
                net_apy: Decimal::ZERO,
                viable: false,
                reason: "Zero income".into(),
            };
        }

        let days_to_breakeven = (roundtrip / daily_income).round_dp(1);
        let net_apy = ((daily_income * dec!(365) - roundtrip) * dec!(100)).round_dp(1);

        let viable = days_to_breakeven < self.config.max_breakeven_days
            && net_apy > self.config.min_net_apy_pct;

        let reason = if viable {
            String::new()
        } else if days_to_breakeven >= self.config.max_breakeven_days {
            format!("Break-even too slow: {days_to_breakeven} days")
        } else {
            format!("Net APY too low: {net_apy}%")
        };

        FundingOpportunity {
            coin: coin.to_string(),
            funding_rate_hourly: hourly_rate,
            funding_apr: apr,
            liquidity_usd: liquidity,
            days_to_breakeven,
            net_apy,
            viable,
            reason,
        }
    }
}
