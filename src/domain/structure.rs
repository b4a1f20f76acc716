use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{OptionType, OrderSide};
use crate::error::RiskError;

/// Role of a leg inside an iron condor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegRole {
    LongPut,
    ShortPut,
    ShortCall,
    LongCall,
}

impl LegRole {
    /// Strike order, lowest first
    pub const BY_STRIKE: [LegRole; 4] = [
        LegRole::LongPut,
        LegRole::ShortPut,
        LegRole::ShortCall,
        LegRole::LongCall,
    ];

    /// Execution order when opening: wings before shorts
    pub const OPEN_ORDER: [LegRole; 4] = [
        LegRole::LongPut,
        LegRole::LongCall,
        LegRole::ShortPut,
        LegRole::ShortCall,
    ];

    pub fn from_parts(option_type: OptionType, side: OrderSide) -> Self {
        match (option_type, side) {
            (OptionType::Put, OrderSide::Buy) => LegRole::LongPut,
            (OptionType::Put, OrderSide::Sell) => LegRole::ShortPut,
            (OptionType::Call, OrderSide::Sell) => LegRole::ShortCall,
            (OptionType::Call, OrderSide::Buy) => LegRole::LongCall,
        }
    }

    pub fn is_short(&self) -> bool {
        matches!(self, LegRole::ShortPut | LegRole::ShortCall)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LegRole::LongPut => "long_put",
            LegRole::ShortPut => "short_put",
            LegRole::ShortCall => "short_call",
            LegRole::LongCall => "long_call",
        }
    }
}

impl fmt::Display for LegRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One leg as proposed by the strategy builder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegSpec {
    pub instrument_id: String,
    pub option_type: OptionType,
    pub strike: Decimal,
    pub side: OrderSide,
    /// Mark price seen by the builder, used only as a pricing fallback
    #[serde(default)]
    pub mark_price: Option<Decimal>,
}

impl LegSpec {
    pub fn role(&self) -> LegRole {
        LegRole::from_parts(self.option_type, self.side)
    }
}

/// Candidate condor handed over by the strategy builder.
///
/// Per-unit figures are in quote currency for one contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CondorStructure {
    pub currency: String,
    pub expiration: DateTime<Utc>,
    pub legs: Vec<LegSpec>,
    pub credit_per_unit: Decimal,
    pub max_loss_per_unit: Decimal,
    #[serde(default)]
    pub max_profit_per_unit: Option<Decimal>,
    /// Explicit contract count; sized from equity when absent
    #[serde(default)]
    pub quantity: Option<Decimal>,
}

impl CondorStructure {
    /// Structural sanity: four legs, one per role, every instrument listed
    /// under the structure's currency, strikes strictly increasing put wing <
    /// short put < short call < call wing, and a net credit with bounded loss.
    ///
    /// Returns the legs sorted by strike on success.
    pub fn check_shape(&self) -> Result<[LegSpec; 4], RiskError> {
        if self.currency.trim().is_empty() {
            return Err(RiskError::InvalidTrade("currency is empty".to_string()));
        }
        if self.legs.len() != 4 {
            return Err(RiskError::InvalidTrade(format!(
                "expected 4 legs, got {}",
                self.legs.len()
            )));
        }

        let prefix = format!("{}-", self.currency.trim().to_uppercase());
        let mut slots: [Option<&LegSpec>; 4] = [None; 4];
        for leg in &self.legs {
            if leg.instrument_id.trim().is_empty() {
                return Err(RiskError::InvalidTrade("leg with empty instrument".to_string()));
            }
            if !leg.instrument_id.to_uppercase().starts_with(&prefix) {
                return Err(RiskError::InvalidTrade(format!(
                    "instrument {} is not a {} option",
                    leg.instrument_id,
                    self.currency.trim().to_uppercase()
                )));
            }
            if leg.strike <= Decimal::ZERO {
                return Err(RiskError::InvalidTrade(format!(
                    "non-positive strike on {}",
                    leg.instrument_id
                )));
            }
            let slot = role_index(leg.role());
            if slots[slot].is_some() {
                return Err(RiskError::InvalidTrade(format!("duplicate {} leg", leg.role())));
            }
            slots[slot] = Some(leg);
        }

        let mut sorted = Vec::with_capacity(4);
        for (role, slot) in LegRole::BY_STRIKE.iter().zip(slots) {
            match slot {
                Some(leg) => sorted.push(leg.clone()),
                None => return Err(RiskError::InvalidTrade(format!("missing {} leg", role))),
            }
        }

        if !sorted.windows(2).all(|w| w[0].strike < w[1].strike) {
            return Err(RiskError::InvalidTrade(format!(
                "strikes not strictly increasing: {}",
                sorted
                    .iter()
                    .map(|l| l.strike.to_string())
                    .collect::<Vec<_>>()
                    .join(" / ")
            )));
        }

        for (i, a) in sorted.iter().enumerate() {
            if sorted[i + 1..].iter().any(|b| b.instrument_id == a.instrument_id) {
                return Err(RiskError::InvalidTrade(format!(
                    "instrument {} used twice",
                    a.instrument_id
                )));
            }
        }

        if self.credit_per_unit <= Decimal::ZERO {
            return Err(RiskError::InvalidTrade(format!(
                "credit must be positive, got {}",
                self.credit_per_unit
            )));
        }
        if self.max_loss_per_unit <= Decimal::ZERO {
            return Err(RiskError::InvalidSize(format!(
                "max loss per unit must be positive, got {}",
                self.max_loss_per_unit
            )));
        }
        if let Some(qty) = self.quantity {
            if qty <= Decimal::ZERO {
                return Err(RiskError::InvalidSize(format!("quantity must be positive, got {}", qty)));
            }
        }

        sorted
            .try_into()
            .map_err(|_| RiskError::InvalidTrade("leg count changed".to_string()))
    }
}

pub(crate) fn role_index(role: LegRole) -> usize {
    match role {
        LegRole::LongPut => 0,
        LegRole::ShortPut => 1,
        LegRole::ShortCall => 2,
        LegRole::LongCall => 3,
    }
}

/// A structure that passed risk validation, with its size fixed.
///
/// Only the risk ledger can produce one; downstream code trusts it as is.
#[derive(Debug, Clone)]
pub struct ValidatedTrade {
    id: String,
    currency: String,
    expiration: DateTime<Utc>,
    legs: [LegSpec; 4],
    quantity: Decimal,
    max_loss: Decimal,
    expected_credit: Decimal,
    max_profit: Decimal,
    equity: Decimal,
}

impl ValidatedTrade {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: String,
        currency: String,
        expiration: DateTime<Utc>,
        legs: [LegSpec; 4],
        quantity: Decimal,
        max_loss: Decimal,
        expected_credit: Decimal,
        max_profit: Decimal,
        equity: Decimal,
    ) -> Self {
        Self {
            id,
            currency,
            expiration,
            legs,
            quantity,
            max_loss,
            expected_credit,
            max_profit,
            equity,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn expiration(&self) -> DateTime<Utc> {
        self.expiration
    }

    /// Legs sorted by strike
    pub fn legs(&self) -> &[LegSpec; 4] {
        &self.legs
    }

    pub fn leg(&self, role: LegRole) -> &LegSpec {
        &self.legs[role_index(role)]
    }

    pub fn quantity(&self) -> Decimal {
        self.quantity
    }

    /// Total max loss reserved against the portfolio cap
    pub fn max_loss(&self) -> Decimal {
        self.max_loss
    }

    pub fn expected_credit(&self) -> Decimal {
        self.expected_credit
    }

    pub fn max_profit(&self) -> Decimal {
        self.max_profit
    }

    /// Equity snapshot the size was computed from
    pub fn equity(&self) -> Decimal {
        self.equity
    }
}
