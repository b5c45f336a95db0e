//! Exchange integration: the gateway contract, the production adapter,
//! the live price feed, and a scripted mock for tests and paper runs.

pub mod gateway;
pub mod hyperliquid;
pub mod mock;
pub mod types;
pub mod websocket;

pub use gateway::ExchangeGateway;
pub use hyperliquid::HyperliquidGateway;
pub use mock::MockGateway;
pub use types::*;
pub use websocket::{FeedControl, FeedSubscription, PriceFeed};
