//! Core trading engine: state, safety machinery, and reconciliation.
//!
//! The safety invariants live here: never end in a one-sided position
//! (guard), never miss a liquidation warning (monitor), never trust stale
//! local state on startup (reconciler), always have a way out (panic).

pub mod guard;
pub mod monitor;
pub mod panic;
pub mod reconcile;
pub mod state;

pub use guard::{ExecutionGuard, ExecutionResult, GuardConfig};
pub use monitor::{MarginMonitor, MonitorConfig, WatchdogExit, WatchdogStatus};
pub use panic::PanicSwitch;
pub use reconcile::{reconcile, ReconcileError};
pub use state::{EngineState, PendingOrder, Position, SharedState, StateSummary};
