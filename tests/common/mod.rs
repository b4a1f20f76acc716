#![allow(dead_code)]

use chrono::{Duration, Utc};
use condor::config::{AppConfig, ExecutionConfig, Settlement};
use condor::domain::{CondorStructure, LegSpec, OptionType, OrderSide, Quote};
use condor::{AlertManager, CondorEngine, PaperExchange};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::path::PathBuf;
use std::sync::Arc;

pub const LONG_PUT: &str = "BTC-IT-40000-P";
pub const SHORT_PUT: &str = "BTC-IT-45000-P";
pub const SHORT_CALL: &str = "BTC-IT-75000-C";
pub const LONG_CALL: &str = "BTC-IT-80000-C";

/// Linear settlement, fast timers, no state file unless given one
pub fn config(positions_file: Option<PathBuf>) -> AppConfig {
    let mut config = AppConfig::default();
    config.exchange.settlement = Settlement::Linear;
    config.exchange.currencies = vec!["BTC".to_string()];
    config.execution = ExecutionConfig {
        max_retries: 3,
        retry_delay_ms: 1,
        fill_timeout_ms: 20,
        poll_interval_ms: 2,
        slippage: dec!(0),
        price_tick: dec!(0.0001),
        rollback_max_attempts: 2,
        rollback_fill_timeout_ms: 20,
        leg_delay_ms: 0,
    };
    config.state.positions_file = positions_file;
    config
}

fn leg(instrument: &str, option_type: OptionType, strike: Decimal, side: OrderSide) -> LegSpec {
    LegSpec {
        instrument_id: instrument.to_string(),
        option_type,
        strike,
        side,
        mark_price: None,
    }
}

/// One contract, credit 200, max loss 500
pub fn structure(expires_in: Duration) -> CondorStructure {
    CondorStructure {
        currency: "BTC".to_string(),
        expiration: Utc::now() + expires_in,
        legs: vec![
            leg(LONG_PUT, OptionType::Put, dec!(40000), OrderSide::Buy),
            leg(SHORT_PUT, OptionType::Put, dec!(45000), OrderSide::Sell),
            leg(SHORT_CALL, OptionType::Call, dec!(75000), OrderSide::Sell),
            leg(LONG_CALL, OptionType::Call, dec!(80000), OrderSide::Buy),
        ],
        credit_per_unit: dec!(200),
        max_loss_per_unit: dec!(500),
        max_profit_per_unit: None,
        quantity: Some(dec!(1)),
    }
}

/// Books that fill the four legs for a net 200 credit per contract
pub fn paper() -> PaperExchange {
    let paper = PaperExchange::new();
    paper.set_equity("BTC", dec!(100000));
    paper.set_quote(Quote::new(LONG_PUT, Some(dec!(45)), Some(dec!(50))));
    paper.set_quote(Quote::new(SHORT_PUT, Some(dec!(150)), Some(dec!(155))));
    paper.set_quote(Quote::new(SHORT_CALL, Some(dec!(150)), Some(dec!(155))));
    paper.set_quote(Quote::new(LONG_CALL, Some(dec!(45)), Some(dec!(50))));
    paper
}

pub fn set_all_quotes(paper: &PaperExchange, bid: Decimal, ask: Decimal) {
    for instrument in [LONG_PUT, SHORT_PUT, SHORT_CALL, LONG_CALL] {
        paper.set_quote(Quote::new(instrument, Some(bid), Some(ask)));
    }
}

pub fn engine(config: AppConfig, paper: &PaperExchange) -> Arc<CondorEngine> {
    Arc::new(CondorEngine::new(
        config,
        Arc::new(paper.clone()),
        Arc::new(AlertManager::with_defaults()),
    ))
}
