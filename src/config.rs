use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::ExitRules;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub exchange: ExchangeConfig,
    pub risk: RiskConfig,
    pub execution: ExecutionConfig,
    pub exit: ExitConfig,
    pub schedule: ScheduleConfig,
    pub state: StateConfig,
    pub logging: LoggingConfig,
    /// Route orders to the in-memory paper exchange
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Paper,
    Deribit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeEnvironment {
    Test,
    Prod,
}

/// How option premiums and balances are denominated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Settlement {
    /// Premiums and equity in the underlying coin, converted with the index price
    Inverse,
    /// Premiums and equity already in quote currency
    Linear,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub kind: ExchangeKind,
    pub environment: ExchangeEnvironment,
    /// Overrides the host derived from `environment`
    pub base_url: Option<String>,
    pub settlement: Settlement,
    /// Currencies whose balances count towards equity
    pub currencies: Vec<String>,
    pub request_timeout_ms: u64,
    /// Simulated balances per currency for paper trading; unset
    /// currencies fall back to the live account
    pub paper_equity: HashMap<String, Decimal>,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            kind: ExchangeKind::Paper,
            environment: ExchangeEnvironment::Test,
            base_url: None,
            settlement: Settlement::Inverse,
            currencies: vec!["BTC".to_string(), "ETH".to_string()],
            request_timeout_ms: 10_000,
            paper_equity: HashMap::new(),
        }
    }
}

impl ExchangeConfig {
    pub fn base_url(&self) -> String {
        match (&self.base_url, self.environment) {
            (Some(url), _) => url.trim_end_matches('/').to_string(),
            (None, ExchangeEnvironment::Test) => "https://test.deribit.com".to_string(),
            (None, ExchangeEnvironment::Prod) => "https://www.deribit.com".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Fraction of equity risked per condor
    pub risk_per_trade: Decimal,
    /// Cap on total committed max loss as a fraction of equity
    pub max_portfolio_risk: Decimal,
    /// Minimum tradable contract increment
    pub contract_increment: Decimal,
    pub min_contract_size: Decimal,
    pub max_contract_size: Decimal,
    /// Consecutive aborted builds before new trades are halted
    pub max_consecutive_aborts: u32,
    /// Reject new trades while any position awaits manual intervention
    pub halt_on_manual_intervention: bool,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_per_trade: dec!(0.01),
            max_portfolio_risk: dec!(0.03),
            contract_increment: dec!(0.001),
            min_contract_size: dec!(0.01),
            max_contract_size: dec!(10),
            max_consecutive_aborts: 3,
            halt_on_manual_intervention: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Attempts per leg when opening or closing
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// How long one attempt waits for a fill before cancelling
    pub fill_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Offset past the opposite quote for aggressive limit prices
    pub slippage: Decimal,
    pub price_tick: Decimal,
    /// Attempts per leg when rolling back a failed build
    pub rollback_max_attempts: u32,
    pub rollback_fill_timeout_ms: u64,
    /// Pause between consecutive leg submissions
    pub leg_delay_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
            fill_timeout_ms: 5000,
            poll_interval_ms: 500,
            slippage: dec!(0.10),
            price_tick: dec!(0.0001),
            rollback_max_attempts: 2,
            rollback_fill_timeout_ms: 3000,
            leg_delay_ms: 500,
        }
    }
}

impl ExecutionConfig {
    pub fn leg_delay(&self) -> Duration {
        Duration::from_millis(self.leg_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitConfig {
    pub tp_ratio: Decimal,
    pub sl_multiple: Decimal,
    pub close_before_expiry_hours: i64,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            tp_ratio: dec!(0.55),
            sl_multiple: dec!(1.2),
            close_before_expiry_hours: 24,
        }
    }
}

impl ExitConfig {
    /// Rules snapshot attached to a position at build time
    pub fn rules(&self) -> ExitRules {
        ExitRules {
            tp_ratio: self.tp_ratio,
            sl_multiple: self.sl_multiple,
            close_buffer_secs: self.close_before_expiry_hours * 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub open_interval_secs: u64,
    pub monitor_interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            open_interval_secs: 3600,
            monitor_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// JSON snapshot of open and flagged positions
    pub positions_file: Option<PathBuf>,
    /// Directory the strategy builder drops candidate structures into
    pub inbox_dir: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            positions_file: Some(PathBuf::from("data/positions.json")),
            inbox_dir: PathBuf::from("data/inbox"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Enable JSON formatted logs
    pub json: bool,
    /// Daily rotating log files go here when set
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            dir: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("CONDOR_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (CONDOR_RISK__RISK_PER_TRADE, etc.)
            .add_source(
                Environment::with_prefix("CONDOR")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let fraction = |v: Decimal| v > Decimal::ZERO && v < Decimal::ONE;

        // Risk
        if !fraction(self.risk.risk_per_trade) {
            errors.push("risk.risk_per_trade must be between 0 and 1".to_string());
        }
        if !fraction(self.risk.max_portfolio_risk) {
            errors.push("risk.max_portfolio_risk must be between 0 and 1".to_string());
        }
        if self.risk.max_portfolio_risk < self.risk.risk_per_trade {
            errors.push("risk.max_portfolio_risk must be at least risk.risk_per_trade".to_string());
        }
        if self.risk.contract_increment <= Decimal::ZERO {
            errors.push("risk.contract_increment must be positive".to_string());
        }
        if self.risk.min_contract_size <= Decimal::ZERO {
            errors.push("risk.min_contract_size must be positive".to_string());
        }
        if self.risk.max_contract_size < self.risk.min_contract_size {
            errors.push("risk.max_contract_size must be at least risk.min_contract_size".to_string());
        }

        // Execution
        if self.execution.max_retries == 0 {
            errors.push("execution.max_retries must be at least 1".to_string());
        }
        if self.execution.rollback_max_attempts == 0 {
            errors.push("execution.rollback_max_attempts must be at least 1".to_string());
        }
        if self.execution.fill_timeout_ms == 0 || self.execution.rollback_fill_timeout_ms == 0 {
            errors.push("execution fill timeouts must be positive".to_string());
        }
        if self.execution.poll_interval_ms == 0 {
            errors.push("execution.poll_interval_ms must be positive".to_string());
        }
        if self.execution.slippage < Decimal::ZERO || self.execution.slippage >= Decimal::ONE {
            errors.push("execution.slippage must be in [0, 1)".to_string());
        }
        if self.execution.price_tick <= Decimal::ZERO {
            errors.push("execution.price_tick must be positive".to_string());
        }

        // Exit
        if self.exit.tp_ratio <= Decimal::ZERO {
            errors.push("exit.tp_ratio must be positive".to_string());
        }
        if self.exit.sl_multiple <= Decimal::ZERO {
            errors.push("exit.sl_multiple must be positive".to_string());
        }
        if self.exit.close_before_expiry_hours < 0 {
            errors.push("exit.close_before_expiry_hours must not be negative".to_string());
        }

        // Schedule
        if self.schedule.open_interval_secs == 0 || self.schedule.monitor_interval_secs == 0 {
            errors.push("schedule intervals must be positive".to_string());
        }
        if self.schedule.monitor_interval_secs > self.schedule.open_interval_secs {
            errors.push(
                "schedule.monitor_interval_secs should not exceed schedule.open_interval_secs"
                    .to_string(),
            );
        }

        if self.exchange.currencies.is_empty() {
            errors.push("exchange.currencies must name at least one currency".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.exit.rules().close_buffer_secs, 86_400);
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let mut config = AppConfig::default();
        config.risk.risk_per_trade = dec!(0.05);
        config.risk.max_portfolio_risk = dec!(0.03);
        config.exit.tp_ratio = Decimal::ZERO;
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.contains("max_portfolio_risk")));
        assert!(errors.iter().any(|e| e.contains("tp_ratio")));
    }

    #[test]
    fn test_load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("default.toml")).unwrap();
        writeln!(
            file,
            r#"
dry_run = true

[risk]
risk_per_trade = "0.02"
max_portfolio_risk = "0.06"

[exit]
tp_ratio = "0.5"
"#
        )
        .unwrap();

        let config = AppConfig::load_from(dir.path()).unwrap();
        assert!(config.dry_run);
        assert_eq!(config.risk.risk_per_trade, dec!(0.02));
        assert_eq!(config.exit.tp_ratio, dec!(0.5));
        // untouched sections keep their defaults
        assert_eq!(config.execution.max_retries, 3);
    }

    #[test]
    fn test_base_url_by_environment() {
        let mut exchange = ExchangeConfig::default();
        assert_eq!(exchange.base_url(), "https://test.deribit.com");
        exchange.environment = ExchangeEnvironment::Prod;
        assert_eq!(exchange.base_url(), "https://www.deribit.com");
        exchange.base_url = Some("http://localhost:9000/".to_string());
        assert_eq!(exchange.base_url(), "http://localhost:9000");
    }
}
