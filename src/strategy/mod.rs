//! Trading strategy: opportunity scanning and the harvesting orchestrator.

pub mod harvester;
pub mod scanner;

pub use harvester::{FundingHarvester, HarvesterConfig};
pub use scanner::{FundingOpportunity, FundingScanner, ScannerConfig};
