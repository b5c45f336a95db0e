//! Configuration: layered file + environment loading with validation.
//!
//! Sources, later wins: `config.{toml,yaml,json}` in the working directory,
//! then environment variables prefixed `FARM` with `__` separating levels
//! (e.g. `FARM__VENUE__API_SECRET`). Secrets only ever come from the
//! environment. Every knob has a default so a dry run starts with no
//! config at all.

use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use crate::engine::guard::GuardConfig;
use crate::engine::monitor::MonitorConfig;
use crate::strategy::harvester::HarvesterConfig;
use crate::strategy::scanner::ScannerConfig;

/// Startup misconfiguration; the process exits with code 2.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub venue: VenueSettings,
    #[serde(default)]
    pub scanner: ScannerSettings,
    #[serde(default)]
    pub sizing: SizingSettings,
    #[serde(default)]
    pub risk: RiskSettings,
    #[serde(default)]
    pub execution: ExecutionSettings,
    #[serde(default)]
    pub schedule: ScheduleSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VenueSettings {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    /// Account address on the venue.
    #[serde(default)]
    pub wallet_address: String,
    /// API secret for signing exchange requests. Environment only.
    #[serde(default)]
    pub api_secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScannerSettings {
    /// Minimum annualized funding rate for scan acceptance.
    #[serde(default = "default_min_funding_apr")]
    pub min_funding_apr: Decimal,
    /// Minimum 24h volume to enter.
    #[serde(default = "default_min_liquidity_usd")]
    pub min_liquidity_usd: Decimal,
    /// Fee-payback ceiling in days.
    #[serde(default = "default_max_breakeven_days")]
    pub max_breakeven_days: Decimal,
    /// Coin universe to scan.
    #[serde(default = "default_coins")]
    pub coins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SizingSettings {
    #[serde(default = "default_max_position_per_coin")]
    pub max_position_per_coin_usd: Decimal,
    #[serde(default = "default_max_total_exposure")]
    pub max_total_exposure_usd: Decimal,
    #[serde(default = "default_min_order_usd")]
    pub min_order_usd: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskSettings {
    /// Margin ratio that triggers a 25% reduction.
    #[serde(default = "default_margin_danger")]
    pub margin_danger_threshold: Decimal,
    /// Margin ratio that triggers a 50% reduction.
    #[serde(default = "default_margin_critical")]
    pub margin_critical_threshold: Decimal,
    #[serde(default = "default_negative_funding_tolerance_hours")]
    pub negative_funding_tolerance_hours: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionSettings {
    #[serde(default = "default_order_timeout_secs")]
    pub order_timeout_secs: u64,
    #[serde(default = "default_panic_timeout_secs")]
    pub panic_timeout_secs: u64,
    #[serde(default = "default_slippage_buffer")]
    pub slippage_buffer: Decimal,
    #[serde(default = "default_unwind_slippage")]
    pub unwind_slippage: Decimal,
    #[serde(default = "default_panic_slippage")]
    pub panic_slippage: Decimal,
    /// Dry-run is the default; `--live` turns it off.
    #[serde(default = "default_dry_run")]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleSettings {
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
    #[serde(default = "default_funding_check_interval_secs")]
    pub funding_check_interval_secs: u64,
    #[serde(default = "default_watchdog_check_secs")]
    pub watchdog_check_secs: u64,
    #[serde(default = "default_watchdog_stale_secs")]
    pub watchdog_stale_secs: u64,
}

// Default value functions

fn default_api_url() -> String {
    "https://api.hyperliquid.xyz".to_string()
}

fn default_ws_url() -> String {
    "wss://api.hyperliquid.xyz/ws".to_string()
}

fn default_min_funding_apr() -> Decimal {
    Decimal::new(20, 2) // 0.20
}

fn default_min_liquidity_usd() -> Decimal {
    Decimal::new(1_000_000, 0)
}

fn default_max_breakeven_days() -> Decimal {
    Decimal::new(5, 0)
}

fn default_coins() -> Vec<String> {
    vec!["HYPE".to_string()]
}

fn default_max_position_per_coin() -> Decimal {
    Decimal::new(500, 0)
}

fn default_max_total_exposure() -> Decimal {
    Decimal::new(2000, 0)
}

fn default_min_order_usd() -> Decimal {
    Decimal::new(5, 0)
}

fn default_margin_danger() -> Decimal {
    Decimal::new(15, 2) // 0.15
}

fn default_margin_critical() -> Decimal {
    Decimal::new(10, 2) // 0.10
}

fn default_negative_funding_tolerance_hours() -> u64 {
    2
}

fn default_order_timeout_secs() -> u64 {
    5
}

fn default_panic_timeout_secs() -> u64 {
    10
}

fn default_slippage_buffer() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

fn default_unwind_slippage() -> Decimal {
    Decimal::new(2, 2) // 0.02
}

fn default_panic_slippage() -> Decimal {
    Decimal::new(5, 2) // 0.05
}

fn default_dry_run() -> bool {
    true
}

fn default_scan_interval_secs() -> u64 {
    300
}

fn default_funding_check_interval_secs() -> u64 {
    3600
}

fn default_watchdog_check_secs() -> u64 {
    5
}

fn default_watchdog_stale_secs() -> u64 {
    10
}

impl Default for VenueSettings {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            ws_url: default_ws_url(),
            wallet_address: String::new(),
            api_secret: String::new(),
        }
    }
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            min_funding_apr: default_min_funding_apr(),
            min_liquidity_usd: default_min_liquidity_usd(),
            max_breakeven_days: default_max_breakeven_days(),
            coins: default_coins(),
        }
    }
}

impl Default for SizingSettings {
    fn default() -> Self {
        Self {
            max_position_per_coin_usd: default_max_position_per_coin(),
            max_total_exposure_usd: default_max_total_exposure(),
            min_order_usd: default_min_order_usd(),
        }
    }
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            margin_danger_threshold: default_margin_danger(),
            margin_critical_threshold: default_margin_critical(),
            negative_funding_tolerance_hours: default_negative_funding_tolerance_hours(),
        }
    }
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            order_timeout_secs: default_order_timeout_secs(),
            panic_timeout_secs: default_panic_timeout_secs(),
            slippage_buffer: default_slippage_buffer(),
            unwind_slippage: default_unwind_slippage(),
            panic_slippage: default_panic_slippage(),
            dry_run: default_dry_run(),
        }
    }
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            scan_interval_secs: default_scan_interval_secs(),
            funding_check_interval_secs: default_funding_check_interval_secs(),
            watchdog_check_secs: default_watchdog_check_secs(),
            watchdog_stale_secs: default_watchdog_stale_secs(),
        }
    }
}

impl Config {
    /// Load configuration from files and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("FARM"))
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ratio = |name: &str, value: Decimal| -> Result<(), ConfigError> {
            if value <= Decimal::ZERO || value >= Decimal::ONE {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be between 0 and 1, got {value}"
                )));
            }
            Ok(())
        };

        ratio("margin_danger_threshold", self.risk.margin_danger_threshold)?;
        ratio(
            "margin_critical_threshold",
            self.risk.margin_critical_threshold,
        )?;
        if self.risk.margin_critical_threshold >= self.risk.margin_danger_threshold {
            return Err(ConfigError::Invalid(
                "margin_critical_threshold must be below margin_danger_threshold".into(),
            ));
        }

        ratio("slippage_buffer", self.execution.slippage_buffer)?;
        ratio("unwind_slippage", self.execution.unwind_slippage)?;
        ratio("panic_slippage", self.execution.panic_slippage)?;

        if self.sizing.max_position_per_coin_usd <= Decimal::ZERO
            || self.sizing.max_total_exposure_usd <= Decimal::ZERO
        {
            return Err(ConfigError::Invalid("sizing caps must be positive".into()));
        }
        if self.sizing.max_position_per_coin_usd > self.sizing.max_total_exposure_usd {
            return Err(ConfigError::Invalid(
                "max_position_per_coin_usd cannot exceed max_total_exposure_usd".into(),
            ));
        }

        if self.scanner.coins.is_empty() {
            return Err(ConfigError::Invalid("scanner.coins must not be empty".into()));
        }
        if self.execution.order_timeout_secs == 0 || self.execution.panic_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be positive".into()));
        }

        Ok(())
    }

    /// Apply the `--size` override: replace the per-coin cap and rescale
    /// the total cap to four times it.
    pub fn override_position_size(&mut self, size_usd: Decimal) {
        self.sizing.max_position_per_coin_usd = size_usd;
        self.sizing.max_total_exposure_usd = size_usd * Decimal::new(4, 0);
    }

    pub fn guard_config(&self) -> GuardConfig {
        GuardConfig {
            dry_run: self.execution.dry_run,
            order_timeout: Duration::from_secs(self.execution.order_timeout_secs),
            slippage_buffer: self.execution.slippage_buffer,
            unwind_slippage: self.execution.unwind_slippage,
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            danger_threshold: self.risk.margin_danger_threshold,
            critical_threshold: self.risk.margin_critical_threshold,
            negative_funding_tolerance: Duration::from_secs(
                self.risk.negative_funding_tolerance_hours * 3600,
            ),
            watchdog_check: Duration::from_secs(self.schedule.watchdog_check_secs),
            watchdog_stale: Duration::from_secs(self.schedule.watchdog_stale_secs),
            reconnect_timeout: Duration::from_secs(self.execution.panic_timeout_secs),
        }
    }

    pub fn scanner_config(&self) -> ScannerConfig {
        ScannerConfig {
            min_apr: self.scanner.min_funding_apr,
            min_liquidity_usd: self.scanner.min_liquidity_usd,
            max_breakeven_days: self.scanner.max_breakeven_days,
            ..ScannerConfig::default()
        }
    }

    pub fn harvester_config(&self) -> HarvesterConfig {
        HarvesterConfig {
            max_position_per_coin_usd: self.sizing.max_position_per_coin_usd,
            max_total_exposure_usd: self.sizing.max_total_exposure_usd,
            min_order_usd: self.sizing.min_order_usd,
            scan_interval: Duration::from_secs(self.schedule.scan_interval_secs),
            funding_check_interval: Duration::from_secs(
                self.schedule.funding_check_interval_secs,
            ),
            ..HarvesterConfig::default()
        }
    }
}
