use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::structure::{role_index, LegRole, ValidatedTrade};
use super::{LegState, OptionType, OrderSide, PositionState};
use crate::error::{CondorError, Result};

/// Why a position was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CloseReason {
    TakeProfit,
    StopLoss,
    ExpiryBuffer,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::TakeProfit => "TAKE_PROFIT",
            CloseReason::StopLoss => "STOP_LOSS",
            CloseReason::ExpiryBuffer => "EXPIRY_BUFFER",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Exit thresholds frozen onto a position when it is built
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExitRules {
    /// Take profit once P&L reaches this fraction of the entry credit
    pub tp_ratio: Decimal,
    /// Stop out once the loss reaches this multiple of the entry credit
    pub sl_multiple: Decimal,
    pub close_buffer_secs: i64,
}

impl ExitRules {
    pub fn close_buffer(&self) -> Duration {
        Duration::seconds(self.close_buffer_secs)
    }
}

/// One option leg owned by a position
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Leg {
    pub role: LegRole,
    pub instrument_id: String,
    pub option_type: OptionType,
    pub strike: Decimal,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub limit_price: Option<Decimal>,
    pub order_id: Option<String>,
    pub state: LegState,
    /// Quantity the opening orders actually traded
    #[serde(default)]
    pub filled_quantity: Decimal,
    /// Volume-weighted over every order that traded
    pub fill_price: Option<Decimal>,
    pub close_price: Option<Decimal>,
}

impl Leg {
    /// Move to `next`, refusing transitions the leg lifecycle forbids
    pub fn advance(&mut self, next: LegState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(CondorError::InvalidStateTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }

    pub fn is_filled(&self) -> bool {
        self.state == LegState::Filled
    }

    /// Quantity an unwind has to close. Failed legs are left to the operator.
    pub fn unwind_quantity(&self) -> Decimal {
        match self.state {
            LegState::Filled => self.quantity,
            LegState::PartiallyFilled => self.filled_quantity,
            _ => Decimal::ZERO,
        }
    }
}

/// Iron condor position
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub currency: String,
    pub expiration: DateTime<Utc>,
    /// Sorted by strike: long put, short put, short call, long call
    pub legs: [Leg; 4],
    pub quantity: Decimal,
    /// Net premium received, in quote currency. Fixed once the position opens.
    pub entry_credit: Decimal,
    pub max_loss: Decimal,
    pub max_profit: Decimal,
    pub exit_rules: ExitRules,
    pub state: PositionState,
    pub created_at: DateTime<Utc>,
    pub opened_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_reason: Option<CloseReason>,
    pub realized_pnl: Option<Decimal>,
    /// Instruments left with exchange exposure after a failed flatten
    #[serde(default)]
    pub stuck_instruments: Vec<String>,
}

impl Position {
    pub fn from_trade(trade: &ValidatedTrade, exit_rules: ExitRules) -> Self {
        let legs = trade.legs().clone().map(|spec| Leg {
            role: spec.role(),
            instrument_id: spec.instrument_id,
            option_type: spec.option_type,
            strike: spec.strike,
            side: spec.side,
            quantity: trade.quantity(),
            limit_price: None,
            order_id: None,
            state: LegState::Pending,
            filled_quantity: Decimal::ZERO,
            fill_price: None,
            close_price: None,
        });

        Self {
            id: trade.id().to_string(),
            currency: trade.currency().to_string(),
            expiration: trade.expiration(),
            legs,
            quantity: trade.quantity(),
            entry_credit: Decimal::ZERO,
            max_loss: trade.max_loss(),
            max_profit: trade.max_profit(),
            exit_rules,
            state: PositionState::Building,
            created_at: Utc::now(),
            opened_at: None,
            closed_at: None,
            close_reason: None,
            realized_pnl: None,
            stuck_instruments: Vec::new(),
        }
    }

    pub fn leg(&self, role: LegRole) -> &Leg {
        &self.legs[role_index(role)]
    }

    pub fn leg_mut(&mut self, role: LegRole) -> &mut Leg {
        &mut self.legs[role_index(role)]
    }

    pub fn all_legs_filled(&self) -> bool {
        self.legs.iter().all(Leg::is_filled)
    }

    /// Legs holding fills, in the order they should be flattened: shorts first
    pub fn filled_roles_for_unwind(&self) -> Vec<LegRole> {
        LegRole::OPEN_ORDER
            .iter()
            .rev()
            .copied()
            .filter(|role| self.leg(*role).unwind_quantity() > Decimal::ZERO)
            .collect()
    }

    /// Signed premium per contract from fill prices, in exchange price units
    pub fn fill_premium_per_unit(&self) -> Option<Decimal> {
        self.legs.iter().try_fold(Decimal::ZERO, |acc, leg| {
            leg.fill_price.map(|p| acc + leg.side.premium_sign() * p)
        })
    }

    pub fn transition(&mut self, next: PositionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(CondorError::InvalidStateTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }

    /// Building -> Open. Only legal once every leg is filled.
    pub fn mark_open(&mut self, entry_credit: Decimal, now: DateTime<Utc>) -> Result<()> {
        if !self.all_legs_filled() {
            let unfilled: Vec<&str> = self
                .legs
                .iter()
                .filter(|l| !l.is_filled())
                .map(|l| l.role.as_str())
                .collect();
            return Err(CondorError::Validation(format!(
                "position {} cannot open with unfilled legs: {}",
                self.id,
                unfilled.join(", ")
            )));
        }
        self.transition(PositionState::Open)?;
        self.entry_credit = entry_credit;
        self.opened_at = Some(now);
        Ok(())
    }

    pub fn is_flagged(&self) -> bool {
        !self.stuck_instruments.is_empty()
    }

    pub fn time_to_expiry(&self, now: DateTime<Utc>) -> Duration {
        self.expiration - now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::structure::fixtures::condor;
    use rust_decimal_macros::dec;

    fn rules() -> ExitRules {
        ExitRules {
            tp_ratio: dec!(0.55),
            sl_multiple: dec!(1.2),
            close_buffer_secs: 24 * 3600,
        }
    }

    fn building() -> Position {
        let s = condor();
        let legs = s.check_shape().unwrap();
        let trade = ValidatedTrade::new(
            "pos-1".to_string(),
            s.currency.clone(),
            s.expiration,
            legs,
            dec!(0.1),
            dec!(488),
            dec!(12),
            dec!(12),
            dec!(10000),
        );
        Position::from_trade(&trade, rules())
    }

    #[test]
    fn test_new_position_is_building_with_pending_legs() {
        let p = building();
        assert_eq!(p.state, PositionState::Building);
        assert!(p.legs.iter().all(|l| l.state == LegState::Pending));
        assert_eq!(p.leg(LegRole::ShortCall).strike, dec!(75000));
        assert_eq!(p.entry_credit, Decimal::ZERO);
    }

    #[test]
    fn test_cannot_open_with_unfilled_leg() {
        let mut p = building();
        for role in [LegRole::LongPut, LegRole::LongCall, LegRole::ShortPut] {
            let leg = p.leg_mut(role);
            leg.advance(LegState::Submitted).unwrap();
            leg.advance(LegState::Filled).unwrap();
        }
        assert!(p.mark_open(dec!(200), Utc::now()).is_err());
        assert_eq!(p.state, PositionState::Building);
    }

    #[test]
    fn test_open_once_all_filled() {
        let mut p = building();
        for leg in p.legs.iter_mut() {
            leg.advance(LegState::Submitted).unwrap();
            leg.advance(LegState::Filled).unwrap();
            leg.fill_price = Some(dec!(0.01));
        }
        p.mark_open(dec!(200), Utc::now()).unwrap();
        assert_eq!(p.state, PositionState::Open);
        assert_eq!(p.entry_credit, dec!(200));
        assert!(p.opened_at.is_some());
    }

    #[test]
    fn test_close_reasons_are_the_automatic_exits() {
        let stored: CloseReason = serde_json::from_str("\"StopLoss\"").unwrap();
        assert_eq!(stored, CloseReason::StopLoss);
        assert!(serde_json::from_str::<CloseReason>("\"Manual\"").is_err());
    }

    #[test]
    fn test_unwind_order_is_shorts_first() {
        let mut p = building();
        for role in [LegRole::LongPut, LegRole::LongCall, LegRole::ShortPut] {
            p.leg_mut(role).state = LegState::Filled;
        }
        assert_eq!(
            p.filled_roles_for_unwind(),
            vec![LegRole::ShortPut, LegRole::LongCall, LegRole::LongPut]
        );
    }

    #[test]
    fn test_partial_leg_unwinds_only_what_traded() {
        let mut p = building();
        p.leg_mut(LegRole::LongPut).state = LegState::Filled;
        let short_put = p.leg_mut(LegRole::ShortPut);
        short_put.advance(LegState::Submitted).unwrap();
        short_put.advance(LegState::PartiallyFilled).unwrap();
        short_put.filled_quantity = dec!(0.04);
        // the unresolved leg belongs to the operator, not the unwind
        p.leg_mut(LegRole::LongCall).state = LegState::Failed;

        assert_eq!(
            p.filled_roles_for_unwind(),
            vec![LegRole::ShortPut, LegRole::LongPut]
        );
        assert_eq!(p.leg(LegRole::ShortPut).unwind_quantity(), dec!(0.04));
        assert_eq!(p.leg(LegRole::LongPut).unwind_quantity(), dec!(0.1));
    }

    #[test]
    fn test_fill_premium_signs() {
        let mut p = building();
        p.leg_mut(LegRole::LongPut).fill_price = Some(dec!(0.005));
        p.leg_mut(LegRole::ShortPut).fill_price = Some(dec!(0.012));
        p.leg_mut(LegRole::ShortCall).fill_price = Some(dec!(0.010));
        assert_eq!(p.fill_premium_per_unit(), None);
        p.leg_mut(LegRole::LongCall).fill_price = Some(dec!(0.004));
        assert_eq!(p.fill_premium_per_unit(), Some(dec!(0.013)));
    }
}
