use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::domain::{CancelOutcome, ExchangePosition, OrderRequest, OrderSnapshot, Quote};
use crate::error::Result;

/// Everything the lifecycle engine needs from a venue.
///
/// Calls either return or fail; the engine bounds its own retries.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    fn name(&self) -> &'static str;

    /// Submit an order, returning the exchange order id.
    /// A venue-side refusal is `CondorError::OrderRejected`.
    async fn place_order(&self, request: &OrderRequest) -> Result<String>;

    async fn cancel_order(&self, order_id: &str) -> Result<CancelOutcome>;

    async fn poll_order(&self, order_id: &str) -> Result<OrderSnapshot>;

    async fn get_best_quote(&self, instrument: &str) -> Result<Quote>;

    /// Account equity in the currency's own settlement units
    async fn get_account_equity(&self, currency: &str) -> Result<Decimal>;

    /// Index price of the underlying in quote currency
    async fn get_index_price(&self, currency: &str) -> Result<Decimal>;

    /// Open option positions for a currency
    async fn get_positions(&self, currency: &str) -> Result<Vec<ExchangePosition>>;
}
