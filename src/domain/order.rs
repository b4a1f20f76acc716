use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Side of the order that flattens a fill on this side
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    /// Cash-flow sign of a fill: selling receives premium, buying pays it
    pub fn premium_sign(&self) -> Decimal {
        match self {
            OrderSide::Buy => Decimal::NEGATIVE_ONE,
            OrderSide::Sell => Decimal::ONE,
        }
    }

    /// Position sign of a fill: buying adds to a long
    pub fn position_sign(&self) -> Decimal {
        -self.premium_sign()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Limit order request (what we want the exchange to do)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub instrument: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    /// Free-form tag the exchange echoes back (position id + purpose)
    pub label: String,
}

impl OrderRequest {
    pub fn limit(
        instrument: impl Into<String>,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
        label: impl Into<String>,
    ) -> Self {
        Self {
            instrument: instrument.into(),
            side,
            quantity,
            price: Some(price),
            label: label.into(),
        }
    }
}

/// Exchange-side order state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderState {
    Open,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderState::Open)
    }
}

/// Result of polling an order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub order_id: String,
    pub state: OrderState,
    pub filled_quantity: Decimal,
    pub average_price: Option<Decimal>,
}

/// Result of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelOutcome {
    Cancelled,
    AlreadyFilled,
    NotFound,
}
