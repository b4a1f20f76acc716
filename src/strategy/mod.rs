//! Strategy module
//!
//! The iron condor position lifecycle.
//!
//! ## Architecture
//!
//! - `risk` - sizing, portfolio cap, reservations, circuit breaker
//! - `executor` - one leg at an aggressive limit price with bounded retries
//! - `builder` - four legs in protective order, rollback, close
//! - `monitor` - exit rules over the Open set
//! - `reconciliation` - restart recovery against exchange positions
//! - `engine` - everything above behind a single cycle lock

pub mod builder;
pub mod engine;
pub mod executor;
pub mod monitor;
pub mod reconciliation;
pub mod risk;

pub use builder::{AbortReport, CloseResult, OpenResult, PositionBuilder};
pub use engine::{CondorEngine, Cycle, EngineSnapshot, OpenOutcome};
pub use executor::{LegExecutor, LegOrder, LegOutcome, RetryPolicy};
pub use monitor::{should_close, ClosedEvent, ExitMonitor, PortfolioSummary};
pub use reconciliation::{OrphanExposure, ReconciliationReport};
pub use risk::{compute_position_size, RiskLedger};
