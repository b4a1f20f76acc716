use rust_decimal::Decimal;
use thiserror::Error;

/// Main error type for the condor engine
#[derive(Error, Debug)]
pub enum CondorError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Exchange error: {0}")]
    Exchange(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Market data errors
    #[error("Quote unavailable for instrument: {instrument}")]
    QuoteUnavailable { instrument: String },

    // Order execution errors
    #[error("Order rejected: {0}")]
    OrderRejected(String),

    #[error("Order error: {0}")]
    Order(#[from] OrderError),

    // Trade admission errors
    #[error("Invalid trade: {0}")]
    InvalidTrade(String),

    #[error("Invalid size: {0}")]
    InvalidSize(String),

    #[error("Risk limit exceeded: {0}")]
    RiskLimitExceeded(String),

    // Lifecycle errors
    #[error("Position {position_id} aborted at leg {leg_index}: {reason}")]
    PositionAborted {
        position_id: String,
        leg_index: usize,
        reason: String,
    },

    #[error(
        "MANUAL INTERVENTION REQUIRED: position {position_id} left open exposure on {}",
        .instruments.join(", ")
    )]
    CompensatingCloseFailure {
        position_id: String,
        instruments: Vec<String>,
    },

    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Position not found: {0}")]
    PositionNotFound(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // Authentication errors
    #[error("Authentication error: {0}")]
    Auth(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for CondorError
pub type Result<T> = std::result::Result<T, CondorError>;

impl CondorError {
    /// Errors that leave exchange exposure the engine no longer tracks.
    pub fn requires_manual_intervention(&self) -> bool {
        matches!(self, CondorError::CompensatingCloseFailure { .. })
    }
}

/// Specific error types for order execution
#[derive(Error, Debug, Clone)]
pub enum OrderError {
    #[error("Order not found: {order_id}")]
    NotFound { order_id: String },
}

/// Specific error types for trade admission
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RiskError {
    #[error("Invalid trade: {0}")]
    InvalidTrade(String),

    #[error("Invalid size: {0}")]
    InvalidSize(String),

    #[error("Portfolio risk exceeded: committed ${committed} + candidate ${candidate} > cap ${cap}")]
    PortfolioRiskExceeded {
        committed: Decimal,
        candidate: Decimal,
        cap: Decimal,
    },

    #[error("Requested quantity {requested} exceeds sized quantity {allowed}")]
    QuantityAboveSize { requested: Decimal, allowed: Decimal },

    #[error("Equity unavailable: {0}")]
    EquityUnavailable(String),

    #[error("Trading halted: {reason}")]
    TradingHalted { reason: String },
}

impl RiskError {
    /// Structural and sizing problems map to `InvalidTrade`/`InvalidSize`,
    /// everything else is a risk-limit rejection.
    pub fn is_invalid_trade(&self) -> bool {
        matches!(self, RiskError::InvalidTrade(_) | RiskError::InvalidSize(_))
    }
}

impl From<RiskError> for CondorError {
    fn from(err: RiskError) -> Self {
        match err {
            RiskError::InvalidTrade(msg) => CondorError::InvalidTrade(msg),
            RiskError::InvalidSize(msg) => CondorError::InvalidSize(msg),
            other => CondorError::RiskLimitExceeded(other.to_string()),
        }
    }
}
