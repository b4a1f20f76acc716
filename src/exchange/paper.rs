//! In-memory exchange for dry runs and tests.
//!
//! Orders never leave the process. Each instrument can be given a queue of
//! scripted fill behaviours; once the queue is empty the default applies.
//! Market data not set locally is read from an optional upstream gateway.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use super::ExchangeGateway;
use crate::domain::{
    CancelOutcome, ExchangePosition, OrderRequest, OrderSide, OrderSnapshot, OrderState, Quote,
};
use crate::error::{CondorError, Result};

/// How the next order on an instrument behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillBehavior {
    /// Filled on the first poll
    Immediate,
    /// Stays open for this many polls, then fills
    AfterPolls(u32),
    /// Rests until cancelled
    Never,
    /// Rests, but a cancel finds it already filled
    FillOnCancel,
    /// Trades this quantity on the first poll and rests the remainder
    Partial(Decimal),
    /// Rests, and every cancel request errors
    Uncancellable,
    /// Rests, and every status poll errors; cancels still work
    Unpollable,
    /// Refused at submission
    Reject,
    /// Submission fails with a transport error
    GatewayError,
}

#[derive(Debug, Clone)]
struct PaperOrder {
    request: OrderRequest,
    state: OrderState,
    behavior: FillBehavior,
    polls: u32,
    filled: Decimal,
    fill_price: Option<Decimal>,
}

#[derive(Default)]
struct Book {
    quotes: HashMap<String, Quote>,
    equity: HashMap<String, Decimal>,
    index: HashMap<String, Decimal>,
    scripts: HashMap<String, VecDeque<FillBehavior>>,
    orders: HashMap<String, PaperOrder>,
    positions: HashMap<String, Decimal>,
    placed: Vec<OrderRequest>,
    equity_reads: usize,
    unreachable: bool,
}

/// Simulated venue that fills aggressive limit orders against its quotes
#[derive(Clone)]
pub struct PaperExchange {
    book: Arc<Mutex<Book>>,
    default_behavior: FillBehavior,
    market_data: Option<Arc<dyn ExchangeGateway>>,
}

impl Default for PaperExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperExchange {
    pub fn new() -> Self {
        Self {
            book: Arc::new(Mutex::new(Book::default())),
            default_behavior: FillBehavior::Immediate,
            market_data: None,
        }
    }

    /// Read quotes, index prices and equity from `feed` when not set locally
    pub fn with_market_data(mut self, feed: Arc<dyn ExchangeGateway>) -> Self {
        self.market_data = Some(feed);
        self
    }

    pub fn with_default_behavior(mut self, behavior: FillBehavior) -> Self {
        self.default_behavior = behavior;
        self
    }

    fn book(&self) -> MutexGuard<'_, Book> {
        // A panic while holding the lock leaves plain data behind; keep using it.
        self.book.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_quote(&self, quote: Quote) {
        self.book().quotes.insert(quote.instrument.clone(), quote);
    }

    pub fn set_equity(&self, currency: &str, equity: Decimal) {
        self.book().equity.insert(currency.to_uppercase(), equity);
    }

    pub fn set_index_price(&self, currency: &str, price: Decimal) {
        self.book().index.insert(currency.to_uppercase(), price);
    }

    /// Queue behaviours for the next orders on `instrument`
    pub fn script(&self, instrument: &str, behaviors: impl IntoIterator<Item = FillBehavior>) {
        self.book()
            .scripts
            .entry(instrument.to_string())
            .or_default()
            .extend(behaviors);
    }

    /// Make every call fail as if the network were down
    pub fn set_unreachable(&self, unreachable: bool) {
        self.book().unreachable = unreachable;
    }

    /// Seed a position, e.g. to simulate holdings found after a restart
    pub fn set_position(&self, instrument: &str, size: Decimal) {
        self.book().positions.insert(instrument.to_string(), size);
    }

    /// Every order request accepted or refused so far, in submission order
    pub fn placed_orders(&self) -> Vec<OrderRequest> {
        self.book().placed.clone()
    }

    pub fn position(&self, instrument: &str) -> Decimal {
        self.book()
            .positions
            .get(instrument)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    pub fn equity_reads(&self) -> usize {
        self.book().equity_reads
    }

    fn check_reachable(&self) -> Result<()> {
        if self.book().unreachable {
            return Err(CondorError::Exchange("paper exchange unreachable".to_string()));
        }
        Ok(())
    }

    /// Price a marketable limit order would trade at
    fn execution_price(quote: Option<&Quote>, request: &OrderRequest) -> Option<Decimal> {
        let limit = request.price?;
        let touch = quote.and_then(|q| match request.side {
            OrderSide::Buy => q.ask,
            OrderSide::Sell => q.bid,
        });
        Some(match (request.side, touch) {
            (OrderSide::Buy, Some(ask)) => ask.min(limit),
            (OrderSide::Sell, Some(bid)) => bid.max(limit),
            (_, None) => limit,
        })
    }

    fn fill(book: &mut Book, order_id: &str) {
        Self::trade(book, order_id, None);
    }

    /// Trade `quantity` (everything left when `None`) against the book
    fn trade(book: &mut Book, order_id: &str, quantity: Option<Decimal>) {
        let Some(order) = book.orders.get_mut(order_id) else {
            return;
        };
        if order.state != OrderState::Open {
            return;
        }
        let left = order.request.quantity - order.filled;
        let quantity = quantity.unwrap_or(left).min(left);
        if quantity <= Decimal::ZERO {
            return;
        }
        let price = Self::execution_price(book.quotes.get(&order.request.instrument), &order.request);
        order.filled += quantity;
        order.fill_price = price;
        if order.filled >= order.request.quantity {
            order.state = OrderState::Filled;
        }
        let delta = order.request.side.position_sign() * quantity;
        let instrument = order.request.instrument.clone();
        let size = book.positions.entry(instrument.clone()).or_insert(Decimal::ZERO);
        *size += delta;
        debug!(order_id, %instrument, %quantity, ?price, "paper fill");
    }

    fn snapshot(order_id: &str, order: &PaperOrder) -> OrderSnapshot {
        OrderSnapshot {
            order_id: order_id.to_string(),
            state: order.state,
            filled_quantity: order.filled,
            average_price: order.fill_price,
        }
    }
}

#[async_trait]
impl ExchangeGateway for PaperExchange {
    fn name(&self) -> &'static str {
        "paper"
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<String> {
        self.check_reachable()?;
        let mut book = self.book();
        book.placed.push(request.clone());

        let behavior = book
            .scripts
            .get_mut(&request.instrument)
            .and_then(VecDeque::pop_front)
            .unwrap_or(self.default_behavior);

        match behavior {
            FillBehavior::Reject => {
                return Err(CondorError::OrderRejected(format!(
                    "paper exchange rejected {} {}",
                    request.side, request.instrument
                )))
            }
            FillBehavior::GatewayError => {
                return Err(CondorError::Exchange(format!(
                    "connection reset while submitting {}",
                    request.instrument
                )))
            }
            _ => {}
        }

        let order_id = format!("paper-{}", Uuid::new_v4());
        book.orders.insert(
            order_id.clone(),
            PaperOrder {
                request: request.clone(),
                state: OrderState::Open,
                behavior,
                polls: 0,
                filled: Decimal::ZERO,
                fill_price: None,
            },
        );
        info!(
            %order_id,
            instrument = %request.instrument,
            side = %request.side,
            quantity = %request.quantity,
            price = ?request.price,
            "paper order accepted"
        );
        Ok(order_id)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<CancelOutcome> {
        self.check_reachable()?;
        let mut book = self.book();
        let Some(order) = book.orders.get(order_id) else {
            return Ok(CancelOutcome::NotFound);
        };
        match (order.state, order.behavior) {
            (OrderState::Filled, _) => Ok(CancelOutcome::AlreadyFilled),
            (OrderState::Open, FillBehavior::FillOnCancel) => {
                Self::fill(&mut book, order_id);
                Ok(CancelOutcome::AlreadyFilled)
            }
            (OrderState::Open, FillBehavior::Uncancellable) => Err(CondorError::Exchange(format!(
                "cancel of {} timed out upstream",
                order_id
            ))),
            (OrderState::Open, _) => {
                if let Some(order) = book.orders.get_mut(order_id) {
                    order.state = OrderState::Cancelled;
                }
                Ok(CancelOutcome::Cancelled)
            }
            _ => Ok(CancelOutcome::NotFound),
        }
    }

    async fn poll_order(&self, order_id: &str) -> Result<OrderSnapshot> {
        self.check_reachable()?;
        let mut book = self.book();
        let Some(order) = book.orders.get_mut(order_id) else {
            return Err(crate::error::OrderError::NotFound {
                order_id: order_id.to_string(),
            }
            .into());
        };

        if order.behavior == FillBehavior::Unpollable {
            return Err(CondorError::Exchange(format!(
                "status of {} unavailable",
                order_id
            )));
        }

        if order.state == OrderState::Open {
            order.polls += 1;
            let (polls, behavior) = (order.polls, order.behavior);
            match behavior {
                FillBehavior::Immediate => Self::fill(&mut book, order_id),
                FillBehavior::AfterPolls(n) if polls > n => Self::fill(&mut book, order_id),
                FillBehavior::Partial(quantity) if polls == 1 => {
                    Self::trade(&mut book, order_id, Some(quantity))
                }
                _ => {}
            }
        }

        let order = book
            .orders
            .get(order_id)
            .ok_or_else(|| CondorError::Internal(format!("order {} vanished", order_id)))?;
        Ok(Self::snapshot(order_id, order))
    }

    async fn get_best_quote(&self, instrument: &str) -> Result<Quote> {
        self.check_reachable()?;
        let local = self.book().quotes.get(instrument).cloned();
        match (local, &self.market_data) {
            (Some(quote), _) => Ok(quote),
            (None, Some(feed)) => feed.get_best_quote(instrument).await,
            (None, None) => Err(CondorError::QuoteUnavailable {
                instrument: instrument.to_string(),
            }),
        }
    }

    async fn get_account_equity(&self, currency: &str) -> Result<Decimal> {
        self.check_reachable()?;
        let local = {
            let mut book = self.book();
            book.equity_reads += 1;
            book.equity.get(&currency.to_uppercase()).copied()
        };
        match (local, &self.market_data) {
            (Some(equity), _) => Ok(equity),
            (None, Some(feed)) => feed.get_account_equity(currency).await,
            (None, None) => Err(CondorError::Exchange(format!(
                "no paper balance for {}",
                currency
            ))),
        }
    }

    async fn get_index_price(&self, currency: &str) -> Result<Decimal> {
        self.check_reachable()?;
        let local = self.book().index.get(&currency.to_uppercase()).copied();
        match (local, &self.market_data) {
            (Some(price), _) => Ok(price),
            (None, Some(feed)) => feed.get_index_price(currency).await,
            (None, None) => Err(CondorError::Exchange(format!(
                "no paper index price for {}",
                currency
            ))),
        }
    }

    async fn get_positions(&self, currency: &str) -> Result<Vec<ExchangePosition>> {
        self.check_reachable()?;
        let prefix = format!("{}-", currency.to_uppercase());
        let mut positions: Vec<ExchangePosition> = self
            .book()
            .positions
            .iter()
            .filter(|(instrument, size)| instrument.starts_with(&prefix) && !size.is_zero())
            .map(|(instrument, size)| ExchangePosition {
                instrument: instrument.clone(),
                size: *size,
                average_price: None,
            })
            .collect();
        positions.sort_by(|a, b| a.instrument.cmp(&b.instrument));
        Ok(positions)
    }
}
