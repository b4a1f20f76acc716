use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{RiskConfig, Settlement};
use crate::domain::{CondorStructure, ValidatedTrade};
use crate::error::RiskError;
use crate::exchange::ExchangeGateway;

/// Tracks committed risk and admits new condors against the portfolio cap.
///
/// Not internally synchronised: the engine holds it behind its single
/// cycle lock, so every read and write of committed risk happens there.
#[derive(Debug)]
pub struct RiskLedger {
    config: RiskConfig,
    /// Max loss reserved per position id
    reservations: HashMap<String, Decimal>,
    /// Positions awaiting an operator's confirmation that they are flat
    manual_holds: HashSet<String>,
    consecutive_aborts: u32,
    halt_reason: Option<String>,
    last_equity: Option<Decimal>,
    /// Structures expiring within this window would be force-closed by the
    /// exit monitor straight away
    close_buffer: Duration,
}

/// Size a condor from equity: `(equity * risk_fraction) / max_loss_per_unit`,
/// floored to `increment` and capped at `max`.
pub fn compute_position_size(
    max_loss_per_unit: Decimal,
    risk_fraction: Decimal,
    equity: Decimal,
    increment: Decimal,
    min: Decimal,
    max: Decimal,
) -> Result<Decimal, RiskError> {
    if max_loss_per_unit <= Decimal::ZERO {
        return Err(RiskError::InvalidSize(format!(
            "max loss per unit must be positive, got {}",
            max_loss_per_unit
        )));
    }
    if increment <= Decimal::ZERO {
        return Err(RiskError::InvalidSize("contract increment must be positive".to_string()));
    }

    let raw = equity * risk_fraction / max_loss_per_unit;
    let quantized = ((raw / increment).floor() * increment).normalize();
    let size = quantized.min(max);

    if size < min {
        return Err(RiskError::InvalidSize(format!(
            "size {} below exchange minimum {} (equity {}, max loss per unit {})",
            size, min, equity, max_loss_per_unit
        )));
    }
    Ok(size)
}

/// Total equity in quote currency across `currencies`, read once.
///
/// Inverse settlement converts each coin balance with its index price.
pub async fn equity_snapshot(
    gateway: &dyn ExchangeGateway,
    currencies: &[String],
    settlement: Settlement,
) -> Result<Decimal, RiskError> {
    let mut total = Decimal::ZERO;
    for currency in currencies {
        let balance = gateway
            .get_account_equity(currency)
            .await
            .map_err(|e| RiskError::EquityUnavailable(format!("{}: {}", currency, e)))?;
        let value = match settlement {
            Settlement::Linear => balance,
            Settlement::Inverse => {
                if balance.is_zero() {
                    Decimal::ZERO
                } else {
                    let index = gateway
                        .get_index_price(currency)
                        .await
                        .map_err(|e| RiskError::EquityUnavailable(format!("{} index: {}", currency, e)))?;
                    balance * index
                }
            }
        };
        total += value;
    }
    Ok(total)
}

impl RiskLedger {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            reservations: HashMap::new(),
            manual_holds: HashSet::new(),
            consecutive_aborts: 0,
            halt_reason: None,
            last_equity: None,
            close_buffer: Duration::zero(),
        }
    }

    /// Refuse structures that expire inside `buffer`
    pub fn with_close_buffer(mut self, buffer: Duration) -> Self {
        self.close_buffer = buffer.max(Duration::zero());
        self
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Sum of reserved max loss, including positions stuck awaiting intervention
    pub fn committed_risk(&self) -> Decimal {
        self.reservations.values().copied().sum()
    }

    pub fn reserved_for(&self, position_id: &str) -> Option<Decimal> {
        self.reservations.get(position_id).copied()
    }

    /// Equity seen by the most recent sizing decision (display only)
    pub fn last_equity(&self) -> Option<Decimal> {
        self.last_equity
    }

    pub fn cap(&self, equity: Decimal) -> Decimal {
        equity * self.config.max_portfolio_risk
    }

    pub fn size_for(&self, max_loss_per_unit: Decimal, equity: Decimal) -> Result<Decimal, RiskError> {
        compute_position_size(
            max_loss_per_unit,
            self.config.risk_per_trade,
            equity,
            self.config.contract_increment,
            self.config.min_contract_size,
            self.config.max_contract_size,
        )
    }

    pub fn can_open_new_position(&self, candidate_max_loss: Decimal, equity: Decimal) -> bool {
        self.committed_risk() + candidate_max_loss <= self.cap(equity)
    }

    /// Reason new trades are refused, if any
    pub fn halt_reason(&self) -> Option<String> {
        if let Some(reason) = &self.halt_reason {
            return Some(reason.clone());
        }
        if self.config.halt_on_manual_intervention && !self.manual_holds.is_empty() {
            let mut ids: Vec<&str> = self.manual_holds.iter().map(String::as_str).collect();
            ids.sort_unstable();
            return Some(format!(
                "awaiting manual intervention on {}",
                ids.join(", ")
            ));
        }
        None
    }

    /// Read equity once, then validate against that single figure
    pub async fn validate_trade(
        &mut self,
        structure: &CondorStructure,
        gateway: &dyn ExchangeGateway,
        currencies: &[String],
        settlement: Settlement,
    ) -> Result<ValidatedTrade, RiskError> {
        if let Some(reason) = self.halt_reason() {
            return Err(RiskError::TradingHalted { reason });
        }
        // Structural problems never need the exchange.
        structure.check_shape()?;
        self.check_expiry(structure, Utc::now())?;
        let equity = equity_snapshot(gateway, currencies, settlement).await?;
        self.last_equity = Some(equity);
        self.validate_with_equity(structure, equity)
    }

    /// Full admission check for one structure at a given equity
    pub fn validate_with_equity(
        &self,
        structure: &CondorStructure,
        equity: Decimal,
    ) -> Result<ValidatedTrade, RiskError> {
        if let Some(reason) = self.halt_reason() {
            return Err(RiskError::TradingHalted { reason });
        }
        let legs = structure.check_shape()?;
        self.check_expiry(structure, Utc::now())?;

        let sized = self.size_for(structure.max_loss_per_unit, equity)?;
        let quantity = match structure.quantity {
            Some(requested) if requested > sized => {
                return Err(RiskError::QuantityAboveSize {
                    requested,
                    allowed: sized,
                })
            }
            Some(requested) if requested < self.config.min_contract_size => {
                return Err(RiskError::InvalidSize(format!(
                    "requested quantity {} below exchange minimum {}",
                    requested, self.config.min_contract_size
                )))
            }
            Some(requested) => requested,
            None => sized,
        };

        let max_loss = structure.max_loss_per_unit * quantity;
        if !self.can_open_new_position(max_loss, equity) {
            return Err(RiskError::PortfolioRiskExceeded {
                committed: self.committed_risk(),
                candidate: max_loss,
                cap: self.cap(equity),
            });
        }

        let expected_credit = structure.credit_per_unit * quantity;
        let max_profit = structure.max_profit_per_unit.unwrap_or(structure.credit_per_unit) * quantity;

        Ok(ValidatedTrade::new(
            Uuid::new_v4().to_string(),
            structure.currency.to_uppercase(),
            structure.expiration,
            legs,
            quantity,
            max_loss,
            expected_credit,
            max_profit,
            equity,
        ))
    }

    fn check_expiry(&self, structure: &CondorStructure, now: DateTime<Utc>) -> Result<(), RiskError> {
        let remaining = structure.expiration - now;
        if remaining <= Duration::zero() {
            return Err(RiskError::InvalidTrade(format!(
                "expired at {}",
                structure.expiration.format("%Y-%m-%d %H:%M UTC")
            )));
        }
        if remaining <= self.close_buffer {
            return Err(RiskError::InvalidTrade(format!(
                "expires in {}h, inside the {}h close buffer",
                remaining.num_hours(),
                self.close_buffer.num_hours()
            )));
        }
        Ok(())
    }

    /// Reserve a validated trade's max loss before any order is sent
    pub fn reserve(&mut self, trade: &ValidatedTrade) -> Result<(), RiskError> {
        if self.reservations.contains_key(trade.id()) {
            return Err(RiskError::InvalidTrade(format!(
                "position {} already holds a reservation",
                trade.id()
            )));
        }
        if !self.can_open_new_position(trade.max_loss(), trade.equity()) {
            return Err(RiskError::PortfolioRiskExceeded {
                committed: self.committed_risk(),
                candidate: trade.max_loss(),
                cap: self.cap(trade.equity()),
            });
        }
        self.reservations.insert(trade.id().to_string(), trade.max_loss());
        info!(
            position_id = trade.id(),
            max_loss = %trade.max_loss(),
            committed = %self.committed_risk(),
            "risk reserved"
        );
        Ok(())
    }

    /// Re-reserve risk for a position recovered after a restart.
    /// Existing exposure is restored even if it now exceeds the cap.
    pub fn restore(&mut self, position_id: &str, max_loss: Decimal) {
        self.reservations.insert(position_id.to_string(), max_loss);
    }

    /// Release a reservation; `None` if there was nothing to release
    pub fn release(&mut self, position_id: &str) -> Option<Decimal> {
        let released = self.reservations.remove(position_id);
        match released {
            Some(amount) => info!(
                position_id,
                released = %amount,
                committed = %self.committed_risk(),
                "risk released"
            ),
            None => warn!(position_id, "release without reservation"),
        }
        released
    }

    pub fn hold_for_intervention(&mut self, position_id: &str) {
        self.manual_holds.insert(position_id.to_string());
    }

    /// Clear a manual hold and release its reservation
    pub fn confirm_flat(&mut self, position_id: &str) -> Option<Decimal> {
        if !self.manual_holds.remove(position_id) {
            return None;
        }
        Some(self.release(position_id).unwrap_or(Decimal::ZERO))
    }

    pub fn manual_holds(&self) -> usize {
        self.manual_holds.len()
    }

    pub fn record_open_success(&mut self) {
        self.consecutive_aborts = 0;
    }

    /// Count an aborted build; returns true if this trips the breaker
    pub fn record_abort(&mut self, reason: &str) -> bool {
        self.consecutive_aborts += 1;
        warn!(
            consecutive = self.consecutive_aborts,
            max = self.config.max_consecutive_aborts,
            reason,
            "position build aborted"
        );
        if self.halt_reason.is_none()
            && self.config.max_consecutive_aborts > 0
            && self.consecutive_aborts >= self.config.max_consecutive_aborts
        {
            let reason = format!("{} consecutive aborted builds", self.consecutive_aborts);
            error!(reason = %reason, "CIRCUIT BREAKER TRIGGERED");
            self.halt_reason = Some(reason);
            return true;
        }
        false
    }

    pub fn consecutive_aborts(&self) -> u32 {
        self.consecutive_aborts
    }

    pub fn reset_circuit_breaker(&mut self) {
        self.consecutive_aborts = 0;
        self.halt_reason = None;
        info!("circuit breaker reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::structure::fixtures::condor;
    use crate::error::CondorError;
    use crate::exchange::MockExchangeGateway;
    use rust_decimal_macros::dec;

    fn test_config() -> RiskConfig {
        RiskConfig {
            risk_per_trade: dec!(0.01),
            max_portfolio_risk: dec!(0.03),
            contract_increment: dec!(0.001),
            min_contract_size: dec!(0.01),
            max_contract_size: dec!(10),
            max_consecutive_aborts: 2,
            halt_on_manual_intervention: true,
        }
    }

    fn size(max_loss_per_unit: Decimal, equity: Decimal) -> Result<Decimal, RiskError> {
        RiskLedger::new(test_config()).size_for(max_loss_per_unit, equity)
    }

    #[test]
    fn test_sizing_quantizes_down() {
        // 0.01 * 10000 / 5880 = 0.0170068...
        assert_eq!(size(dec!(5880), dec!(10000)).unwrap(), dec!(0.017));
    }

    #[test]
    fn test_sizing_rejects_bad_inputs() {
        assert!(matches!(size(dec!(0), dec!(10000)), Err(RiskError::InvalidSize(_))));
        assert!(matches!(size(dec!(-5), dec!(10000)), Err(RiskError::InvalidSize(_))));
        // 0.01 * 1000 / 5880 = 0.0017 < 0.01 minimum
        assert!(matches!(size(dec!(5880), dec!(1000)), Err(RiskError::InvalidSize(_))));
    }

    #[test]
    fn test_sizing_is_capped() {
        assert_eq!(size(dec!(1), dec!(10_000_000)).unwrap(), dec!(10));
    }

    #[test]
    fn test_validate_sizes_and_caps_portfolio() {
        let mut ledger = RiskLedger::new(test_config());
        let structure = condor(); // max loss 4880 per unit

        // 0.01 * 100000 / 4880 = 0.2049 -> 0.204, max loss 995.52; cap 3000
        let trade = ledger.validate_with_equity(&structure, dec!(100000)).unwrap();
        assert_eq!(trade.quantity(), dec!(0.204));
        assert_eq!(trade.max_loss(), dec!(995.520));
        ledger.reserve(&trade).unwrap();
        assert!(ledger.committed_risk() <= ledger.cap(dec!(100000)));

        let second = ledger.validate_with_equity(&structure, dec!(100000)).unwrap();
        ledger.reserve(&second).unwrap();
        let third = ledger.validate_with_equity(&structure, dec!(100000)).unwrap();
        ledger.reserve(&third).unwrap();

        // 3 * 995.52 = 2986.56; a fourth would breach 3000
        let err = ledger.validate_with_equity(&structure, dec!(100000)).unwrap_err();
        assert!(matches!(err, RiskError::PortfolioRiskExceeded { .. }));
        assert!(ledger.committed_risk() <= ledger.cap(dec!(100000)));
    }

    #[test]
    fn test_explicit_quantity_must_fit_size() {
        let ledger = RiskLedger::new(test_config());
        let mut structure = condor();
        structure.quantity = Some(dec!(0.5));
        let err = ledger.validate_with_equity(&structure, dec!(100000)).unwrap_err();
        assert!(matches!(err, RiskError::QuantityAboveSize { .. }));

        structure.quantity = Some(dec!(0.1));
        let trade = ledger.validate_with_equity(&structure, dec!(100000)).unwrap();
        assert_eq!(trade.quantity(), dec!(0.1));
    }

    #[test]
    fn test_expiry_inside_close_buffer_rejected() {
        let ledger = RiskLedger::new(test_config()).with_close_buffer(Duration::hours(24));

        let mut expired = condor();
        expired.expiration = Utc::now() - Duration::minutes(5);
        let err = ledger.validate_with_equity(&expired, dec!(100000)).unwrap_err();
        assert!(err.is_invalid_trade());

        let mut near = condor();
        near.expiration = Utc::now() + Duration::hours(20);
        let err = ledger.validate_with_equity(&near, dec!(100000)).unwrap_err();
        assert!(err.is_invalid_trade());
        assert!(err.to_string().contains("close buffer"));

        // ten days out is fine
        assert!(ledger.validate_with_equity(&condor(), dec!(100000)).is_ok());
        // without a buffer only expired structures are refused
        let plain = RiskLedger::new(test_config());
        assert!(plain.validate_with_equity(&near, dec!(100000)).is_ok());
        assert!(plain.validate_with_equity(&expired, dec!(100000)).is_err());
    }

    #[tokio::test]
    async fn test_expired_structure_never_touches_exchange() {
        let gateway = MockExchangeGateway::new();
        let mut structure = condor();
        structure.expiration = Utc::now() - Duration::hours(1);

        let mut ledger = RiskLedger::new(test_config());
        let err = ledger
            .validate_trade(&structure, &gateway, &["BTC".to_string()], Settlement::Linear)
            .await
            .unwrap_err();
        assert!(err.is_invalid_trade());
    }

    #[test]
    fn test_reserve_release_pairing() {
        let mut ledger = RiskLedger::new(test_config());
        let trade = ledger.validate_with_equity(&condor(), dec!(100000)).unwrap();
        ledger.reserve(&trade).unwrap();
        assert!(ledger.reserve(&trade).is_err());
        assert_eq!(ledger.release(trade.id()), Some(trade.max_loss()));
        assert_eq!(ledger.release(trade.id()), None);
        assert_eq!(ledger.committed_risk(), Decimal::ZERO);
    }

    #[test]
    fn test_circuit_breaker_on_consecutive_aborts() {
        let mut ledger = RiskLedger::new(test_config());
        assert!(!ledger.record_abort("leg 2 unfilled"));
        assert!(ledger.record_abort("leg 2 unfilled"));

        let err = ledger.validate_with_equity(&condor(), dec!(100000)).unwrap_err();
        assert!(matches!(err, RiskError::TradingHalted { .. }));

        ledger.reset_circuit_breaker();
        assert!(ledger.validate_with_equity(&condor(), dec!(100000)).is_ok());
    }

    #[test]
    fn test_manual_hold_keeps_risk_and_halts() {
        let mut ledger = RiskLedger::new(test_config());
        let trade = ledger.validate_with_equity(&condor(), dec!(100000)).unwrap();
        ledger.reserve(&trade).unwrap();
        ledger.hold_for_intervention(trade.id());

        assert_eq!(ledger.committed_risk(), trade.max_loss());
        assert!(matches!(
            ledger.validate_with_equity(&condor(), dec!(100000)),
            Err(RiskError::TradingHalted { .. })
        ));

        assert_eq!(ledger.confirm_flat(trade.id()), Some(trade.max_loss()));
        assert_eq!(ledger.committed_risk(), Decimal::ZERO);
        assert_eq!(ledger.confirm_flat(trade.id()), None);
    }

    #[tokio::test]
    async fn test_equity_read_exactly_once_per_decision() {
        let mut gateway = MockExchangeGateway::new();
        gateway
            .expect_get_account_equity()
            .times(1)
            .returning(|_| Ok(dec!(2)));
        gateway
            .expect_get_index_price()
            .times(1)
            .returning(|_| Ok(dec!(50000)));

        let mut ledger = RiskLedger::new(test_config());
        let trade = ledger
            .validate_trade(&condor(), &gateway, &["BTC".to_string()], Settlement::Inverse)
            .await
            .unwrap();

        // 2 BTC * 50000 = 100000
        assert_eq!(trade.equity(), dec!(100000));
        assert_eq!(ledger.last_equity(), Some(dec!(100000)));
    }

    #[tokio::test]
    async fn test_equity_unavailable_rejects() {
        let mut gateway = MockExchangeGateway::new();
        gateway
            .expect_get_account_equity()
            .returning(|_| Err(CondorError::Exchange("timeout".to_string())));

        let mut ledger = RiskLedger::new(test_config());
        let err = ledger
            .validate_trade(&condor(), &gateway, &["BTC".to_string()], Settlement::Linear)
            .await
            .unwrap_err();
        assert!(matches!(err, RiskError::EquityUnavailable(_)));
    }

    #[tokio::test]
    async fn test_invalid_structure_never_touches_exchange() {
        let gateway = MockExchangeGateway::new();
        let mut structure = condor();
        structure.legs.truncate(3);

        let mut ledger = RiskLedger::new(test_config());
        let err = ledger
            .validate_trade(&structure, &gateway, &["BTC".to_string()], Settlement::Linear)
            .await
            .unwrap_err();
        assert!(err.is_invalid_trade());
    }
}
