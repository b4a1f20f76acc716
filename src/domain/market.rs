use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Option contract type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionType {
    Call,
    Put,
}

impl OptionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptionType::Call => "call",
            OptionType::Put => "put",
        }
    }
}

impl std::fmt::Display for OptionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Top-of-book snapshot for one instrument
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub instrument: String,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub mark: Option<Decimal>,
    pub last: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

impl Quote {
    pub fn new(instrument: impl Into<String>, bid: Option<Decimal>, ask: Option<Decimal>) -> Self {
        Self {
            instrument: instrument.into(),
            bid: positive(bid),
            ask: positive(ask),
            mark: None,
            last: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_mark(mut self, mark: Decimal) -> Self {
        self.mark = positive(Some(mark));
        self
    }

    pub fn with_last(mut self, last: Decimal) -> Self {
        self.last = positive(Some(last));
        self
    }

    /// Mid price when both sides are quoted, otherwise mark, otherwise last
    pub fn mid(&self) -> Option<Decimal> {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::TWO),
            _ => self.mark.or(self.last),
        }
    }

    /// Spread in basis points of the mid (None if one side is missing)
    pub fn spread_bps(&self) -> Option<Decimal> {
        let (bid, ask) = (self.bid?, self.ask?);
        let mid = (bid + ask) / Decimal::TWO;
        if mid.is_zero() {
            return None;
        }
        Some((ask - bid) / mid * Decimal::from(10_000))
    }
}

/// Empty books come back as zero prices from some venues.
fn positive(price: Option<Decimal>) -> Option<Decimal> {
    price.filter(|p| *p > Decimal::ZERO)
}

/// A position held on the exchange, as reported by the venue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub instrument: String,
    /// Signed size: positive long, negative short
    pub size: Decimal,
    pub average_price: Option<Decimal>,
}
