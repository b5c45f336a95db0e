//! Funding Harvester - Main Entry Point
//!
//! Wires the engine together: gateway + meta resolution, reconciliation,
//! event consumer, price feed, margin monitor + watchdog, and the
//! harvesting loops. Exit codes: 0 clean shutdown (including a successful
//! watchdog panic-close), 1 fatal error or terminal watchdog rung, 2
//! misconfiguration or missing credentials.

use anyhow::{Context, Result};
use clap::Parser;
use funding_harvester::config::Config;
use funding_harvester::engine::{
    reconcile, EngineState, ExecutionGuard, MarginMonitor, PanicSwitch, SharedState, WatchdogExit,
};
use funding_harvester::exchange::{
    ExchangeGateway, FeedSubscription, HyperliquidGateway, PriceFeed,
};
use funding_harvester::persistence::{run_consumer, EventLog, EventStore};
use funding_harvester::strategy::{FundingHarvester, FundingScanner};
use rust_decimal::Decimal;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

const EVENT_DB_PATH: &str = "funding_harvester.db";
const PANIC_CONFIRM_PHRASE: &str = "CLOSE ALL";

/// Delta-neutral funding rate harvester.
#[derive(Parser)]
#[command(name = "funding-harvester")]
#[command(version, about = "Delta-neutral funding rate harvesting engine")]
struct Cli {
    /// Enable real order execution. Default is dry-run: the scanner runs
    /// and the execution path logs intent without submitting.
    #[arg(long)]
    live: bool,

    /// Override max position size per coin (USD); total cap becomes 4x.
    #[arg(long)]
    size: Option<Decimal>,

    /// Reconcile, print open positions, and force-close everything after
    /// an interactive confirmation.
    #[arg(long)]
    verify_panic: bool,

    /// Elevate log verbosity.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.debug);

    let mut config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {e}");
            return ExitCode::from(2);
        }
    };

    if cli.live {
        warn!("LIVE TRADING MODE - real orders will be placed");
        config.execution.dry_run = false;
    } else {
        info!("Dry-run mode - orders are logged, not submitted");
    }

    if let Some(size) = cli.size {
        config.override_position_size(size);
        if let Err(e) = config.validate() {
            error!("Configuration error: {e}");
            return ExitCode::from(2);
        }
        info!(%size, "Position size override active (total cap rescaled to 4x)");
    }

    if config.venue.wallet_address.is_empty() {
        error!("Missing venue.wallet_address (set FARM__VENUE__WALLET_ADDRESS)");
        return ExitCode::from(2);
    }
    if !config.execution.dry_run && config.venue.api_secret.is_empty() {
        error!("Live mode requires venue.api_secret (set FARM__VENUE__API_SECRET)");
        return ExitCode::from(2);
    }

    match run(config, cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("Fatal: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(config: Config, cli: Cli) -> Result<ExitCode> {
    info!(
        "Funding Harvester v{} starting ({} coins)",
        env!("CARGO_PKG_VERSION"),
        config.scanner.coins.len()
    );

    // Gateway and venue meta. Symbols are resolved dynamically; a coin
    // with no spot listing aborts startup.
    let gateway = HyperliquidGateway::new(
        &config.venue.api_url,
        &config.venue.wallet_address,
        &config.venue.api_secret,
    )?;
    gateway.load_meta().await.context("Failed to load venue meta")?;
    let gateway: Arc<dyn ExchangeGateway> = Arc::new(gateway);

    let mut subscriptions = Vec::new();
    for coin in &config.scanner.coins {
        let spot_symbol = gateway
            .resolve_spot_symbol(coin)
            .await
            .with_context(|| format!("{coin} cannot be spot-hedged"))?;
        info!(%coin, %spot_symbol, "Resolved spot symbol");
        subscriptions.push(FeedSubscription {
            coin: coin.clone(),
            spot_symbol,
        });
    }

    // Cold-path event pipeline.
    let events = EventLog::new();
    let store = EventStore::open(EVENT_DB_PATH)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer = tokio::spawn(run_consumer(events.clone(), store, shutdown_rx.clone()));

    // Rebuild state from the venue before anything trades.
    let state = EngineState::shared();
    reconcile(&gateway, &state).await?;
    {
        let snapshot = state.read().await.summary();
        info!(
            positions = snapshot.positions,
            exposure = %snapshot.total_exposure_usd,
            buffer = %snapshot.available_buffer_usd,
            "State reconciled from exchange"
        );
    }

    let guard = Arc::new(ExecutionGuard::new(
        gateway.clone(),
        state.clone(),
        events.clone(),
        config.guard_config(),
    ));
    let panic_switch = Arc::new(PanicSwitch::new(
        gateway.clone(),
        state.clone(),
        events.clone(),
        config.execution.panic_slippage,
        Duration::from_secs(config.execution.panic_timeout_secs),
    ));

    if cli.verify_panic {
        let code = verify_panic(&state, &panic_switch).await?;
        shutdown_tx.send(true).ok();
        consumer.await.ok();
        return Ok(code);
    }

    // Live feed; ticks drive the margin monitor.
    let (tick_tx, mut tick_rx) = mpsc::channel(256);
    let feed = Arc::new(PriceFeed::new(
        config.venue.ws_url.clone(),
        subscriptions,
        tick_tx,
    ));
    feed.connect().await.context("Failed to connect price feed")?;

    let monitor = Arc::new(MarginMonitor::new(
        state.clone(),
        guard.clone(),
        panic_switch.clone(),
        feed.clone(),
        config.monitor_config(),
    ));

    // Each tick handler runs to completion before the next tick is taken.
    let tick_task = {
        let monitor = monitor.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe_tick = tick_rx.recv() => match maybe_tick {
                        Some(coin_tick) => {
                            monitor
                                .on_price_update(&coin_tick.coin, coin_tick.tick)
                                .await;
                        }
                        None => break,
                    },
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    };

    let scanner = Arc::new(FundingScanner::new(
        gateway.clone(),
        config.scanner.coins.clone(),
        config.scanner_config(),
    ));
    let harvester = Arc::new(FundingHarvester::new(
        guard.clone(),
        scanner,
        monitor.clone(),
        gateway.clone(),
        state.clone(),
        events.clone(),
        config.harvester_config(),
    ));
    let harvester_task = tokio::spawn(harvester.run(shutdown_rx.clone()));

    let watchdog = tokio::spawn(monitor.clone().watchdog_run());

    info!("Engine running");
    let exit_code = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            let open = state.read().await.positions().len();
            if open > 0 {
                warn!(
                    positions = open,
                    "Positions stay open on the venue; reconciliation rebuilds them on restart"
                );
            }
            ExitCode::SUCCESS
        }
        outcome = watchdog => match outcome {
            Ok(WatchdogExit::CleanClose) => {
                info!("Watchdog panic-close succeeded, exiting clean");
                ExitCode::SUCCESS
            }
            Ok(WatchdogExit::Fatal) => {
                error!("Watchdog exhausted all recovery rungs");
                ExitCode::from(1)
            }
            Err(e) => {
                error!("Watchdog task failed: {e}");
                ExitCode::from(1)
            }
        },
    };

    // Stop the loops and drain the event queue before exit.
    shutdown_tx.send(true).ok();
    harvester_task.await.ok();
    tick_task.await.ok();
    consumer.await.ok();

    Ok(exit_code)
}

/// `--verify-panic`: show what reconciliation found and force-close it
/// after the operator types the confirmation phrase.
async fn verify_panic(state: &SharedState, panic_switch: &Arc<PanicSwitch>) -> Result<ExitCode> {
    let positions: Vec<_> = {
        let state = state.read().await;
        state.positions().values().cloned().collect()
    };

    if positions.is_empty() {
        info!("No open positions; nothing to close");
        return Ok(ExitCode::SUCCESS);
    }

    println!("Open positions:");
    for pos in &positions {
        println!(
            "  {:<8} spot {:>12} perp {:>12} entry(perp) {:>10} (~${:.2})",
            pos.coin,
            pos.spot_size,
            pos.perp_size,
            pos.entry_price_perp,
            pos.size_usd(),
        );
    }
    println!("Type '{PANIC_CONFIRM_PHRASE}' to force-close everything:");

    let line = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).map(|_| line)
    })
    .await
    .context("stdin reader failed")??;

    if line.trim() != PANIC_CONFIRM_PHRASE {
        info!("Confirmation mismatch, aborting");
        return Ok(ExitCode::SUCCESS);
    }

    if panic_switch.emergency_close_all().await {
        info!("All positions closed");
        Ok(ExitCode::SUCCESS)
    } else {
        error!("Some positions could not be closed; check the venue");
        Ok(ExitCode::from(1))
    }
}

fn init_logging(debug: bool) -> tracing_appender::non_blocking::WorkerGuard {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let file_appender = tracing_appender::rolling::daily("logs", "funding-harvester.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(file_writer.and(std::io::stdout))
        .init();

    guard
}
