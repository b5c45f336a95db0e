//! Tick-driven margin safety and the websocket watchdog.
//!
//! Every price tick recomputes the margin ratio and stamps the feed
//! heartbeat. When the ratio crosses a threshold a single background
//! rebalance is spawned through the execution guard's priority path. The
//! watchdog escalates a stale feed through reconnect, panic-close, and a
//! loud process exit so the engine can never hold open risk blind.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::engine::guard::ExecutionGuard;
use crate::engine::panic::PanicSwitch;
use crate::engine::state::SharedState;
use crate::exchange::types::{PriceQuote, PriceTick};
use crate::exchange::websocket::FeedControl;
use crate::utils::decimal::safe_div;

/// Margin monitor thresholds and watchdog timing.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Below this ratio, close 25% of every position.
    pub danger_threshold: Decimal,
    /// Below this ratio, close 50% of every position.
    pub critical_threshold: Decimal,
    /// How long funding may stay negative before the position should exit.
    pub negative_funding_tolerance: Duration,
    pub watchdog_check: Duration,
    pub watchdog_stale: Duration,
    pub reconnect_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            danger_threshold: dec!(0.15),
            critical_threshold: dec!(0.10),
            negative_funding_tolerance: Duration::from_secs(2 * 3600),
            watchdog_check: Duration::from_secs(5),
            watchdog_stale: Duration::from_secs(10),
            reconnect_timeout: Duration::from_secs(10),
        }
    }
}

/// Outcome of a single watchdog inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogStatus {
    Healthy,
    Reconnected,
    PanicClosed,
    Dead,
}

/// Terminal outcome of the watchdog loop, mapped to exit codes by main.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogExit {
    /// Panic-close succeeded; exiting clean (code 0).
    CleanClose,
    /// Every rung failed; exit loud (code 1) for the supervisor.
    Fatal,
}

/// Websocket-driven margin safety.
pub struct MarginMonitor {
    state: SharedState,
    guard: Arc<ExecutionGuard>,
    panic: Arc<PanicSwitch>,
    feed: Arc<dyn FeedControl>,
    config: MonitorConfig,
    /// Single-flight latch: only one rebalance task may be in flight, no
    /// matter how many ticks arrive under the threshold meanwhile.
    is_rebalancing: Arc<AtomicBool>,
    last_heartbeat: StdMutex<Instant>,
    negative_funding_since: StdMutex<Option<Instant>>,
}

impl MarginMonitor {
    pub fn new(
        state: SharedState,
        guard: Arc<ExecutionGuard>,
        panic: Arc<PanicSwitch>,
        feed: Arc<dyn FeedControl>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            state,
            guard,
            panic,
            feed,
            config,
            is_rebalancing: Arc::new(AtomicBool::new(false)),
            last_heartbeat: StdMutex::new(Instant::now()),
            negative_funding_since: StdMutex::new(None),
        }
    }

    /// Handle one price tick. The feed consumer awaits this before taking
    /// the next tick, so each handler completes in order.
    pub async fn on_price_update(&self, coin: &str, tick: PriceTick) {
        self.touch_heartbeat();

        let margin = {
            let mut state = self.state.write().await;
            state.last_quotes.insert(
                coin.to_string(),
                PriceQuote {
                    spot_bid: tick.spot_bid,
                    spot_ask: tick.spot_ask,
                    perp_bid: tick.perp_bid,
                    perp_ask: tick.perp_ask,
                },
            );

            let margin = Self::margin_ratio(&state, coin, tick.perp_bid);
            state.margin_ratio = margin;
            state.last_price_update = Some(chrono::Utc::now());
            margin
        };

        // Spam guard: one rebalance at a time.
        if self.is_rebalancing.load(Ordering::SeqCst) {
            return;
        }

        if self.state.read().await.positions().is_empty() {
            return;
        }

        if margin < self.config.critical_threshold {
            error!(%margin, "CRITICAL margin, closing 50%");
            self.spawn_rebalance(dec!(0.50));
        } else if margin < self.config.danger_threshold {
            warn!(%margin, "Low margin, closing 25%");
            self.spawn_rebalance(dec!(0.25));
        }
    }

    /// equity / live position value; 1.0 with no positions. The tick's
    /// perp bid values its own coin, the last seen quote (or the entry
    /// price) values the rest.
    fn margin_ratio(
        state: &crate::engine::state::EngineState,
        tick_coin: &str,
        tick_perp_bid: Decimal,
    ) -> Decimal {
        if state.positions().is_empty() {
            return Decimal::ONE;
        }

        let mut total_value = Decimal::ZERO;
        for (coin, pos) in state.positions() {
            let price = if coin == tick_coin && tick_perp_bid > Decimal::ZERO {
                tick_perp_bid
            } else {
                state
                    .last_quotes
                    .get(coin)
                    .map(|q| q.perp_bid)
                    .filter(|p| *p > Decimal::ZERO)
                    .unwrap_or(pos.entry_price_perp)
            };
            total_value += pos.perp_size * price;
        }

        if total_value == Decimal::ZERO {
            return Decimal::ONE;
        }
        safe_div(state.perp_margin_usdc, total_value)
    }

    fn spawn_rebalance(&self, percentage: Decimal) {
        if self
            .is_rebalancing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let guard = self.guard.clone();
        let state = self.state.clone();
        let flag = self.is_rebalancing.clone();
        tokio::spawn(async move {
            // Clears the latch even if the task is cancelled mid-close.
            let _clear = ClearFlag(flag);
            let coins: Vec<String> = {
                let state = state.read().await;
                state.positions().keys().cloned().collect()
            };
            for coin in coins {
                if !guard.safety_rebalance(&coin, percentage).await {
                    error!(%coin, "Safety rebalance failed");
                }
            }
        });
    }

    /// Strategy-side check: has funding been negative long enough that the
    /// position should exit? Non-negative funding resets the timer.
    pub fn check_funding_direction(&self, funding_rate: Decimal) -> bool {
        let mut since = self
            .negative_funding_since
            .lock()
            .expect("funding timer poisoned");

        if funding_rate >= Decimal::ZERO {
            *since = None;
            return false;
        }

        let started = *since.get_or_insert_with(|| {
            warn!(rate = %funding_rate, "Funding went negative");
            Instant::now()
        });

        if started.elapsed() >= self.config.negative_funding_tolerance {
            error!(
                hours = started.elapsed().as_secs_f64() / 3600.0,
                "Funding negative past tolerance, should exit"
            );
            return true;
        }
        false
    }

    fn touch_heartbeat(&self) {
        *self.last_heartbeat.lock().expect("heartbeat poisoned") = Instant::now();
    }

    fn heartbeat_age(&self) -> Duration {
        self.last_heartbeat
            .lock()
            .expect("heartbeat poisoned")
            .elapsed()
    }

    /// One watchdog inspection: reconnect, then panic, then die.
    pub async fn watchdog_check_once(&self) -> WatchdogStatus {
        let stale = self.heartbeat_age();
        if stale <= self.config.watchdog_stale {
            return WatchdogStatus::Healthy;
        }

        warn!(stale_secs = stale.as_secs(), "Feed stale, attempting reconnect");
        match timeout(self.config.reconnect_timeout, self.feed.reconnect()).await {
            Ok(Ok(true)) => {
                self.touch_heartbeat();
                info!("Feed reconnected");
                return WatchdogStatus::Reconnected;
            }
            Ok(Ok(false)) => warn!("Reconnect refused"),
            Ok(Err(e)) => warn!(error = %e, "Reconnect failed"),
            Err(_) => warn!("Reconnect timed out"),
        }

        error!("Reconnect failed, panic closing all positions");
        if self.panic.emergency_close_all().await {
            info!("Positions closed safely");
            return WatchdogStatus::PanicClosed;
        }

        error!("Panic close failed, dying for supervisor restart");
        WatchdogStatus::Dead
    }

    /// Background watchdog loop; returns only on a terminal rung.
    pub async fn watchdog_run(self: Arc<Self>) -> WatchdogExit {
        debug!("Watchdog started");
        loop {
            tokio::time::sleep(self.config.watchdog_check).await;
            match self.watchdog_check_once().await {
                WatchdogStatus::Healthy | WatchdogStatus::Reconnected => continue,
                WatchdogStatus::PanicClosed => return WatchdogExit::CleanClose,
                WatchdogStatus::Dead => return WatchdogExit::Fatal,
            }
        }
    }
}

struct ClearFlag(Arc<AtomicBool>);

impl Drop for ClearFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::guard::GuardConfig;
    use crate::engine::state::{EngineState, Position};
    use crate::exchange::mock::{MockGateway, OrderBehavior};
    use crate::exchange::types::{OrderLeg, PriceQuote};
    use crate::persistence::EventLog;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::AtomicU32;

    struct ScriptedFeed {
        reconnect_ok: bool,
        calls: AtomicU32,
    }

    #[async_trait]
    impl FeedControl for ScriptedFeed {
        async fn reconnect(&self) -> anyhow::Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.reconnect_ok {
                Ok(true)
            } else {
                anyhow::bail!("connection refused")
            }
        }
    }

    fn tick(perp_bid: Decimal) -> PriceTick {
        PriceTick {
            spot_bid: perp_bid,
            spot_ask: perp_bid,
            perp_bid,
            perp_ask: perp_bid,
            time_ms: 0,
        }
    }

    struct Harness {
        state: SharedState,
        gateway: Arc<MockGateway>,
        monitor: Arc<MarginMonitor>,
    }

    fn harness(config: MonitorConfig, reconnect_ok: bool) -> Harness {
        let gateway = Arc::new(MockGateway::new());
        let state = EngineState::shared();
        let guard = Arc::new(ExecutionGuard::new(
            gateway.clone(),
            state.clone(),
            EventLog::new(),
            GuardConfig {
                dry_run: false,
                ..GuardConfig::default()
            },
        ));
        let panic = Arc::new(PanicSwitch::new(
            gateway.clone(),
            state.clone(),
            EventLog::new(),
            dec!(0.05),
            Duration::from_secs(10),
        ));
        let feed = Arc::new(ScriptedFeed {
            reconnect_ok,
            calls: AtomicU32::new(0),
        });
        let monitor = Arc::new(MarginMonitor::new(
            state.clone(),
            guard,
            panic,
            feed,
            config,
        ));
        Harness {
            state,
            gateway,
            monitor,
        }
    }

    async fn seed_position(state: &SharedState, coin: &str, size: Decimal, price: Decimal) {
        state.write().await.add_position(Position {
            coin: coin.to_string(),
            spot_size: size,
            perp_size: size,
            entry_price_spot: Some(price),
            entry_price_perp: price,
            entry_time: Utc::now(),
        });
    }

    async fn wait_rebalance_done(monitor: &MarginMonitor) {
        for _ in 0..1000 {
            if !monitor.is_rebalancing.load(Ordering::SeqCst) {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("rebalance never completed");
    }

    #[tokio::test]
    async fn test_no_positions_means_ratio_one() {
        let h = harness(MonitorConfig::default(), true);
        h.monitor.on_price_update("HYPE", tick(dec!(10))).await;

        let state = h.state.read().await;
        assert_eq!(state.margin_ratio, Decimal::ONE);
        assert!(state.last_price_update.is_some());
    }

    #[tokio::test]
    async fn test_danger_tick_closes_quarter_once() {
        let h = harness(MonitorConfig::default(), true);
        seed_position(&h.state, "HYPE", dec!(10), dec!(10)).await;
        h.gateway.set_prices(
            "HYPE",
            PriceQuote {
                spot_bid: dec!(10),
                spot_ask: dec!(10),
                perp_bid: dec!(10),
                perp_ask: dec!(10),
            },
        );
        // equity 12 / value 100 = 0.12: danger band.
        h.state.write().await.perp_margin_usdc = dec!(12);

        h.monitor.on_price_update("HYPE", tick(dec!(10))).await;
        assert_eq!(h.state.read().await.margin_ratio, dec!(0.12));

        // A second tick in the same band must not stack another rebalance.
        h.monitor.on_price_update("HYPE", tick(dec!(10))).await;

        wait_rebalance_done(&h.monitor).await;
        let state = h.state.read().await;
        let pos = state.position("HYPE").unwrap();
        assert_eq!(pos.spot_size, dec!(7.5));
        assert_eq!(pos.perp_size, dec!(7.5));
        // Exactly one close pair reached the gateway.
        assert_eq!(h.gateway.placed_orders().len(), 2);
    }

    #[tokio::test]
    async fn test_critical_tick_closes_half() {
        let h = harness(MonitorConfig::default(), true);
        seed_position(&h.state, "HYPE", dec!(10), dec!(10)).await;
        h.gateway.set_prices(
            "HYPE",
            PriceQuote {
                spot_bid: dec!(10),
                spot_ask: dec!(10),
                perp_bid: dec!(10),
                perp_ask: dec!(10),
            },
        );
        h.state.write().await.perp_margin_usdc = dec!(8);

        h.monitor.on_price_update("HYPE", tick(dec!(10))).await;
        wait_rebalance_done(&h.monitor).await;

        let state = h.state.read().await;
        let pos = state.position("HYPE").unwrap();
        assert_eq!(pos.spot_size, dec!(5.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_storm_spawns_single_rebalance() {
        let h = harness(MonitorConfig::default(), true);
        seed_position(&h.state, "HYPE", dec!(10), dec!(10)).await;
        h.gateway.set_prices(
            "HYPE",
            PriceQuote {
                spot_bid: dec!(10),
                spot_ask: dec!(10),
                perp_bid: dec!(10),
                perp_ask: dec!(10),
            },
        );
        h.state.write().await.perp_margin_usdc = dec!(12);
        // Slow down the close so the storm lands mid-rebalance.
        h.gateway
            .script_order(OrderLeg::Spot, OrderBehavior::Hang(Duration::from_secs(1)));

        for _ in 0..20 {
            h.monitor.on_price_update("HYPE", tick(dec!(10))).await;
            tokio::task::yield_now().await;
        }

        wait_rebalance_done(&h.monitor).await;
        assert_eq!(h.gateway.placed_orders().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_funding_tolerance() {
        let h = harness(
            MonitorConfig {
                negative_funding_tolerance: Duration::from_secs(3600),
                ..MonitorConfig::default()
            },
            true,
        );

        assert!(!h.monitor.check_funding_direction(dec!(-0.0001)));
        tokio::time::advance(Duration::from_secs(1800)).await;
        assert!(!h.monitor.check_funding_direction(dec!(-0.0001)));
        tokio::time::advance(Duration::from_secs(1801)).await;
        assert!(h.monitor.check_funding_direction(dec!(-0.0001)));

        // Positive funding resets the timer.
        assert!(!h.monitor.check_funding_direction(dec!(0.0001)));
        assert!(!h.monitor.check_funding_direction(dec!(-0.0001)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_healthy_when_fresh() {
        let h = harness(MonitorConfig::default(), true);
        h.monitor.touch_heartbeat();
        assert_eq!(h.monitor.watchdog_check_once().await, WatchdogStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_reconnect_success_refreshes_heartbeat() {
        let h = harness(MonitorConfig::default(), true);
        tokio::time::advance(Duration::from_secs(12)).await;

        assert_eq!(
            h.monitor.watchdog_check_once().await,
            WatchdogStatus::Reconnected
        );
        assert!(h.monitor.heartbeat_age() < Duration::from_secs(1));
        // Follow-up check is healthy again.
        assert_eq!(h.monitor.watchdog_check_once().await, WatchdogStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_reconnect_fail_panic_closes() {
        let h = harness(MonitorConfig::default(), false);
        seed_position(&h.state, "HYPE", dec!(10), dec!(10)).await;
        h.gateway.set_prices(
            "HYPE",
            PriceQuote {
                spot_bid: dec!(10),
                spot_ask: dec!(10),
                perp_bid: dec!(10),
                perp_ask: dec!(10),
            },
        );
        tokio::time::advance(Duration::from_secs(20)).await;

        assert_eq!(
            h.monitor.watchdog_check_once().await,
            WatchdogStatus::PanicClosed
        );
        assert!(h.state.read().await.positions().is_empty());

        // Panic legs went out at 5% through the book.
        let placed = h.gateway.placed_orders();
        let spot = placed.iter().find(|o| o.leg == OrderLeg::Spot).unwrap();
        let perp = placed.iter().find(|o| o.leg == OrderLeg::Perp).unwrap();
        assert_eq!(spot.price, dec!(9.50000));
        assert_eq!(perp.price, dec!(10.50000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_terminal_when_panic_fails() {
        let h = harness(MonitorConfig::default(), false);
        seed_position(&h.state, "HYPE", dec!(10), dec!(10)).await;
        h.gateway.set_prices(
            "HYPE",
            PriceQuote {
                spot_bid: dec!(10),
                spot_ask: dec!(10),
                perp_bid: dec!(10),
                perp_ask: dec!(10),
            },
        );
        h.gateway
            .script_order(OrderLeg::Spot, OrderBehavior::Fail("halted".into()));
        tokio::time::advance(Duration::from_secs(20)).await;

        assert_eq!(h.monitor.watchdog_check_once().await, WatchdogStatus::Dead);
        assert!(h.state.read().await.has_position("HYPE"));
    }
}
