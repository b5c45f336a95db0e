//! # Funding Harvester
//!
//! A delta-neutral funding rate harvesting engine for perpetual-futures
//! venues: long spot + short perp cancels price exposure while the short
//! leg collects the hourly funding payment that longs pay shorts.
//!
//! ## Architecture
//!
//! - `config`: Configuration loading and validation
//! - `exchange`: Venue gateway contract, production adapter, price feed, mock
//! - `engine`: Core safety machinery (state, execution guard, margin monitor,
//!   panic switch, reconciler)
//! - `strategy`: Opportunity scanning and the harvesting orchestrator
//! - `persistence`: Cold-path event log (bounded queue + SQLite store)
//! - `utils`: Shared decimal arithmetic helpers

pub mod config;
pub mod engine;
pub mod exchange;
pub mod persistence;
pub mod strategy;
pub mod utils;

pub use config::Config;
