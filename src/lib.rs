pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod persistence;
pub mod services;
pub mod strategy;
pub mod supervisor;

pub use config::AppConfig;
pub use domain::{CondorStructure, Position, PositionState};
pub use error::{CondorError, Result, RiskError};
pub use exchange::{ExchangeGateway, PaperExchange};
pub use persistence::StateStore;
pub use services::{JsonInboxSource, Scheduler, StructureSource};
pub use strategy::{ClosedEvent, CondorEngine, OpenOutcome, PortfolioSummary};
pub use supervisor::{Alert, AlertLevel, AlertManager};
