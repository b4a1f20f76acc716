//! Single-leg execution.
//!
//! [`LegMachine`] is the bounded-retry state machine: it consumes exchange
//! events and tells the caller what to do next, with no clock or I/O of its
//! own. [`LegExecutor`] drives it against a gateway with real timeouts.

use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::config::ExecutionConfig;
use crate::domain::{CancelOutcome, LegState, OrderRequest, OrderSide, OrderSnapshot, OrderState, Quote};
use crate::error::CondorError;
use crate::exchange::ExchangeGateway;

/// Attempt budget and timing for one leg
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub fill_timeout: Duration,
    pub poll_interval: Duration,
}

impl RetryPolicy {
    /// Budget for opening legs and scheduled closes
    pub fn open(config: &ExecutionConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            fill_timeout: Duration::from_millis(config.fill_timeout_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }

    /// Short fixed window for compensating closes after a failed build
    pub fn rollback(config: &ExecutionConfig) -> Self {
        Self {
            max_attempts: config.rollback_max_attempts.max(1),
            retry_delay: Duration::from_millis(config.poll_interval_ms),
            fill_timeout: Duration::from_millis(config.rollback_fill_timeout_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }

    /// Wall time spent on one leg when every attempt times out
    pub fn worst_case(&self) -> Duration {
        (self.fill_timeout + self.retry_delay) * self.max_attempts
    }
}

/// Terminal result of executing one leg
#[derive(Debug, Clone, PartialEq)]
pub enum LegOutcome {
    /// The whole quantity traded; `fill_price` is volume-weighted
    Filled {
        order_id: String,
        fill_price: Decimal,
        attempts: u32,
    },
    /// Budget exhausted with only part of the quantity traded. Every order
    /// sent for the leg is confirmed dead.
    Partial {
        filled_quantity: Decimal,
        average_price: Decimal,
        attempts: u32,
        reason: String,
    },
    /// Nothing traded and nothing is left resting
    Unfilled {
        attempts: u32,
        reason: String,
    },
    /// An order could not be confirmed dead and may still trade
    Unresolved {
        order_id: String,
        filled_quantity: Decimal,
        attempts: u32,
        reason: String,
    },
}

impl LegOutcome {
    pub fn is_filled(&self) -> bool {
        matches!(self, LegOutcome::Filled { .. })
    }

    /// Quantity known to have traded out of `ordered`
    pub fn filled_quantity(&self, ordered: Decimal) -> Decimal {
        match self {
            LegOutcome::Filled { .. } => ordered,
            LegOutcome::Partial { filled_quantity, .. } | LegOutcome::Unresolved { filled_quantity, .. } => {
                *filled_quantity
            }
            LegOutcome::Unfilled { .. } => Decimal::ZERO,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            LegOutcome::Filled { .. } => None,
            LegOutcome::Partial { reason, .. }
            | LegOutcome::Unfilled { reason, .. }
            | LegOutcome::Unresolved { reason, .. } => Some(reason),
        }
    }
}

/// What happened on the exchange side
#[derive(Debug, Clone)]
pub enum LegEvent {
    Submitted { order_id: String, price: Decimal },
    SubmitFailed { reason: String },
    Polled(OrderSnapshot),
    PollFailed { reason: String },
    FillTimedOut,
    CancelResult(CancelOutcome),
    CancelFailed { reason: String },
}

/// What the driver should do next
#[derive(Debug, Clone, PartialEq)]
pub enum LegAction {
    /// Price and send a new order for `quantity`; `backoff` asks for the
    /// retry delay first
    Submit {
        attempt: u32,
        quantity: Decimal,
        backoff: bool,
    },
    /// Poll the live order until it fills or the attempt times out
    Poll { order_id: String },
    Cancel { order_id: String },
    /// One final poll after a cancel to learn the order's real state
    Confirm { order_id: String },
    Finish(LegOutcome),
}

/// Cancels and confirming polls spent on one order before giving up on it
pub const MAX_RESOLVE_TRIES: u32 = 3;

/// The order currently on the exchange
#[derive(Debug, Clone)]
struct LiveOrder {
    id: String,
    price: Decimal,
    quantity: Decimal,
    /// Last filled quantity the exchange reported
    seen_filled: Decimal,
}

#[derive(Debug, Clone)]
enum Phase {
    Idle,
    Working(LiveOrder),
    Cancelling(LiveOrder),
    Confirming {
        order: LiveOrder,
        cancel: Option<CancelOutcome>,
    },
    Done,
}

/// Pending -> Submitted -> Filled | PartiallyFilled | Unfilled | Failed,
/// with a bounded attempt count.
///
/// Fills are counted per order once the order is dead, so a retry only
/// sends what is still missing. An order that stays live through every
/// cancel, or whose state cannot be read, ends the leg as `Unresolved`
/// rather than risk a second live order.
#[derive(Debug, Clone)]
pub struct LegMachine {
    max_attempts: u32,
    attempt: u32,
    target: Decimal,
    filled: Decimal,
    notional: Decimal,
    resolve_tries: u32,
    state: LegState,
    phase: Phase,
    last_reason: Option<String>,
}

impl LegMachine {
    pub fn new(max_attempts: u32, quantity: Decimal) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            attempt: 0,
            target: quantity,
            filled: Decimal::ZERO,
            notional: Decimal::ZERO,
            resolve_tries: 0,
            state: LegState::Pending,
            phase: Phase::Idle,
            last_reason: None,
        }
    }

    pub fn state(&self) -> LegState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn filled(&self) -> Decimal {
        self.filled
    }

    pub fn remaining(&self) -> Decimal {
        (self.target - self.filled).max(Decimal::ZERO)
    }

    pub fn start(&mut self) -> LegAction {
        self.attempt = 1;
        LegAction::Submit {
            attempt: 1,
            quantity: self.target,
            backoff: false,
        }
    }

    pub fn on_event(&mut self, event: LegEvent) -> LegAction {
        let phase = std::mem::replace(&mut self.phase, Phase::Idle);

        match (phase, event) {
            (Phase::Idle, LegEvent::Submitted { order_id, price }) => {
                self.state = LegState::Submitted;
                self.resolve_tries = 0;
                self.phase = Phase::Working(LiveOrder {
                    id: order_id.clone(),
                    price,
                    quantity: self.remaining(),
                    seen_filled: Decimal::ZERO,
                });
                LegAction::Poll { order_id }
            }
            (Phase::Idle, LegEvent::SubmitFailed { reason }) => self.attempt_failed(reason),

            (Phase::Working(mut order), LegEvent::Polled(snapshot)) => match snapshot.state {
                OrderState::Filled => {
                    self.credit(&order, order.quantity, snapshot.average_price);
                    self.order_dead(order.id, String::new())
                }
                OrderState::Open => {
                    order.seen_filled = snapshot.filled_quantity;
                    let order_id = order.id.clone();
                    self.phase = Phase::Working(order);
                    LegAction::Poll { order_id }
                }
                OrderState::Cancelled | OrderState::Rejected => {
                    self.credit(&order, snapshot.filled_quantity, snapshot.average_price);
                    let reason = format!("order {} {:?} by exchange", order.id, snapshot.state);
                    self.order_dead(order.id, reason)
                }
            },
            (Phase::Working(order), LegEvent::PollFailed { reason }) => {
                // Keep polling until the attempt's timeout fires.
                self.last_reason = Some(reason);
                let order_id = order.id.clone();
                self.phase = Phase::Working(order);
                LegAction::Poll { order_id }
            }
            (Phase::Working(order), LegEvent::FillTimedOut) => {
                let order_id = order.id.clone();
                self.phase = Phase::Cancelling(order);
                LegAction::Cancel { order_id }
            }

            (Phase::Cancelling(order), LegEvent::CancelResult(outcome)) => {
                let order_id = order.id.clone();
                self.phase = Phase::Confirming {
                    order,
                    cancel: Some(outcome),
                };
                LegAction::Confirm { order_id }
            }
            (Phase::Cancelling(order), LegEvent::CancelFailed { reason }) => {
                self.last_reason = Some(reason);
                let order_id = order.id.clone();
                self.phase = Phase::Confirming { order, cancel: None };
                LegAction::Confirm { order_id }
            }

            (Phase::Confirming { mut order, cancel }, LegEvent::Polled(snapshot)) => match snapshot.state {
                OrderState::Filled => {
                    self.credit(&order, order.quantity, snapshot.average_price);
                    self.order_dead(order.id, String::new())
                }
                OrderState::Cancelled | OrderState::Rejected => {
                    self.credit(&order, snapshot.filled_quantity, snapshot.average_price);
                    let reason = format!("order {} not filled within timeout", order.id);
                    self.order_dead(order.id, reason)
                }
                OrderState::Open if cancel == Some(CancelOutcome::AlreadyFilled) => {
                    // The poll lags the cancel reply.
                    self.credit(&order, order.quantity, None);
                    self.order_dead(order.id, String::new())
                }
                OrderState::Open => {
                    order.seen_filled = snapshot.filled_quantity;
                    let reason = format!("order {} still live after cancel", order.id);
                    self.retry_resolve(order, None, reason)
                }
            },
            (Phase::Confirming { order, cancel }, LegEvent::PollFailed { reason }) => {
                if cancel == Some(CancelOutcome::AlreadyFilled) {
                    self.credit(&order, order.quantity, None);
                    self.order_dead(order.id, String::new())
                } else {
                    let reason = format!("order {} state unknown after cancel: {}", order.id, reason);
                    self.retry_resolve(order, cancel, reason)
                }
            }

            (Phase::Done, _) => {
                self.phase = Phase::Done;
                LegAction::Finish(self.outcome_unfilled("leg already finished".to_string()))
            }
            (phase, event) => {
                // Out-of-order event: keep the phase, ask the driver to re-sync.
                warn!(?event, "unexpected leg event");
                let action = match &phase {
                    Phase::Working(order) => LegAction::Poll {
                        order_id: order.id.clone(),
                    },
                    Phase::Cancelling(order) => LegAction::Cancel {
                        order_id: order.id.clone(),
                    },
                    Phase::Confirming { order, .. } => LegAction::Confirm {
                        order_id: order.id.clone(),
                    },
                    Phase::Idle | Phase::Done => LegAction::Submit {
                        attempt: self.attempt,
                        quantity: self.remaining(),
                        backoff: false,
                    },
                };
                self.phase = phase;
                action
            }
        }
    }

    /// Count what a dead order traded
    fn credit(&mut self, order: &LiveOrder, quantity: Decimal, average_price: Option<Decimal>) {
        let quantity = quantity.min(order.quantity);
        if quantity > Decimal::ZERO {
            self.filled += quantity;
            self.notional += quantity * average_price.unwrap_or(order.price);
        }
    }

    fn average_price(&self) -> Decimal {
        if self.filled.is_zero() {
            return Decimal::ZERO;
        }
        (self.notional / self.filled).normalize()
    }

    /// The order is confirmed dead: done if nothing is missing, else retry
    fn order_dead(&mut self, order_id: String, reason: String) -> LegAction {
        if self.remaining().is_zero() {
            self.state = LegState::Filled;
            self.phase = Phase::Done;
            return LegAction::Finish(LegOutcome::Filled {
                order_id,
                fill_price: self.average_price(),
                attempts: self.attempt,
            });
        }
        self.attempt_failed(reason)
    }

    /// Cancel again, or confirm again if the last cancel went through.
    /// Never moves on to a new order while this one may be live.
    fn retry_resolve(&mut self, order: LiveOrder, cancel: Option<CancelOutcome>, reason: String) -> LegAction {
        self.last_reason = Some(reason.clone());
        self.resolve_tries += 1;
        if self.resolve_tries >= MAX_RESOLVE_TRIES {
            self.state = LegState::Failed;
            self.phase = Phase::Done;
            return LegAction::Finish(LegOutcome::Unresolved {
                order_id: order.id.clone(),
                filled_quantity: self.filled + order.seen_filled,
                attempts: self.attempt,
                reason,
            });
        }
        let order_id = order.id.clone();
        match cancel {
            Some(CancelOutcome::Cancelled) => {
                self.phase = Phase::Confirming { order, cancel };
                LegAction::Confirm { order_id }
            }
            _ => {
                self.phase = Phase::Cancelling(order);
                LegAction::Cancel { order_id }
            }
        }
    }

    fn attempt_failed(&mut self, reason: String) -> LegAction {
        self.last_reason = Some(reason.clone());
        if self.attempt >= self.max_attempts {
            self.phase = Phase::Done;
            if self.filled > Decimal::ZERO {
                self.state = LegState::PartiallyFilled;
                return LegAction::Finish(LegOutcome::Partial {
                    filled_quantity: self.filled,
                    average_price: self.average_price(),
                    attempts: self.attempt,
                    reason,
                });
            }
            self.state = LegState::Unfilled;
            return LegAction::Finish(self.outcome_unfilled(reason));
        }
        self.attempt += 1;
        self.phase = Phase::Idle;
        LegAction::Submit {
            attempt: self.attempt,
            quantity: self.remaining(),
            backoff: true,
        }
    }

    fn outcome_unfilled(&self, reason: String) -> LegOutcome {
        LegOutcome::Unfilled {
            attempts: self.attempt,
            reason: self.last_reason.clone().unwrap_or(reason),
        }
    }
}

/// Round a price onto the tick grid: up for buys, down for sells
pub fn round_to_tick(price: Decimal, tick: Decimal, side: OrderSide) -> Decimal {
    if tick <= Decimal::ZERO {
        return price;
    }
    let steps = price / tick;
    let steps = match side {
        OrderSide::Buy => steps.ceil(),
        OrderSide::Sell => steps.floor(),
    };
    (steps * tick).normalize()
}

/// Aggressive limit price from the opposite side of the book.
///
/// Buy: ask * (1 + slippage). Sell: bid * (1 - slippage). Falls back to
/// the mark, then to `hint`, when the opposite side is empty.
pub fn aggressive_price(
    side: OrderSide,
    quote: Option<&Quote>,
    hint: Option<Decimal>,
    slippage: Decimal,
    tick: Decimal,
) -> Option<Decimal> {
    let reference = quote
        .and_then(|q| match side {
            OrderSide::Buy => q.ask,
            OrderSide::Sell => q.bid,
        })
        .or_else(|| quote.and_then(|q| q.mark))
        .or(hint)
        .filter(|p| *p > Decimal::ZERO)?;

    let raw = match side {
        OrderSide::Buy => reference * (Decimal::ONE + slippage),
        OrderSide::Sell => reference * (Decimal::ONE - slippage),
    };
    let price = round_to_tick(raw, tick, side);
    // Selling can round to zero on deep OTM strikes; one tick is the floor.
    Some(if price <= Decimal::ZERO { tick } else { price })
}

/// One leg to execute
#[derive(Debug, Clone)]
pub struct LegOrder {
    pub instrument: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub label: String,
    /// Fallback reference price when the book is empty
    pub price_hint: Option<Decimal>,
}

/// Drives a [`LegMachine`] against the exchange
pub struct LegExecutor {
    gateway: Arc<dyn ExchangeGateway>,
    slippage: Decimal,
    tick: Decimal,
}

impl LegExecutor {
    pub fn new(gateway: Arc<dyn ExchangeGateway>, config: &ExecutionConfig) -> Self {
        Self {
            gateway,
            slippage: config.slippage,
            tick: config.price_tick,
        }
    }

    /// Execute one leg. Never fails: the outcome says how much traded and
    /// whether anything may still be resting.
    pub async fn execute_leg(&self, order: &LegOrder, policy: &RetryPolicy) -> LegOutcome {
        let mut machine = LegMachine::new(policy.max_attempts, order.quantity);
        let mut action = machine.start();
        let mut deadline = Instant::now() + policy.fill_timeout;
        let mut polled_once = false;

        loop {
            action = match action {
                LegAction::Finish(outcome) => {
                    match &outcome {
                        LegOutcome::Filled {
                            order_id,
                            fill_price,
                            attempts,
                        } => info!(
                            instrument = %order.instrument,
                            side = %order.side,
                            %order_id,
                            fill_price = %fill_price,
                            attempts,
                            "leg filled"
                        ),
                        LegOutcome::Partial {
                            filled_quantity,
                            average_price,
                            attempts,
                            reason,
                        } => warn!(
                            instrument = %order.instrument,
                            side = %order.side,
                            quantity = %order.quantity,
                            filled = %filled_quantity,
                            average_price = %average_price,
                            attempts,
                            reason = %reason,
                            "leg partially filled"
                        ),
                        LegOutcome::Unfilled { attempts, reason } => warn!(
                            instrument = %order.instrument,
                            side = %order.side,
                            attempts,
                            reason = %reason,
                            "leg unfilled"
                        ),
                        LegOutcome::Unresolved {
                            order_id,
                            filled_quantity,
                            reason,
                            ..
                        } => error!(
                            instrument = %order.instrument,
                            side = %order.side,
                            %order_id,
                            filled = %filled_quantity,
                            reason = %reason,
                            "leg order could not be confirmed dead"
                        ),
                    }
                    return outcome;
                }
                LegAction::Submit {
                    attempt,
                    quantity,
                    backoff,
                } => {
                    if backoff {
                        sleep(policy.retry_delay).await;
                    }
                    let event = self.submit(order, quantity, attempt).await;
                    deadline = Instant::now() + policy.fill_timeout;
                    polled_once = false;
                    machine.on_event(event)
                }
                LegAction::Poll { order_id } => {
                    let now = Instant::now();
                    if now >= deadline {
                        machine.on_event(LegEvent::FillTimedOut)
                    } else {
                        if polled_once {
                            sleep(policy.poll_interval.min(deadline - now)).await;
                        }
                        polled_once = true;
                        let event = self.poll(&order_id, deadline.saturating_duration_since(Instant::now())).await;
                        if let LegEvent::Polled(snapshot) = &event {
                            debug!(
                                %order_id,
                                attempt = machine.attempt(),
                                state = ?snapshot.state,
                                filled = %snapshot.filled_quantity,
                                "leg poll"
                            );
                        }
                        machine.on_event(event)
                    }
                }
                LegAction::Cancel { order_id } => {
                    warn!(%order_id, attempt = machine.attempt(), "leg timed out, cancelling");
                    let event = match timeout(policy.fill_timeout, self.gateway.cancel_order(&order_id)).await {
                        Ok(Ok(outcome)) => LegEvent::CancelResult(outcome),
                        Ok(Err(e)) => LegEvent::CancelFailed { reason: e.to_string() },
                        Err(_) => LegEvent::CancelFailed {
                            reason: "cancel timed out".to_string(),
                        },
                    };
                    if let LegEvent::CancelFailed { reason } = &event {
                        warn!(%order_id, reason = %reason, "cancel failed");
                    }
                    machine.on_event(event)
                }
                LegAction::Confirm { order_id } => {
                    let event = self.poll(&order_id, policy.fill_timeout).await;
                    if let LegEvent::Polled(snapshot) = &event {
                        info!(
                            %order_id,
                            attempt = machine.attempt(),
                            state = ?snapshot.state,
                            filled = %snapshot.filled_quantity,
                            "leg final state after cancel"
                        );
                    }
                    machine.on_event(event)
                }
            };
        }
    }

    async fn submit(&self, order: &LegOrder, quantity: Decimal, attempt: u32) -> LegEvent {
        let quote = match self.gateway.get_best_quote(&order.instrument).await {
            Ok(quote) => Some(quote),
            Err(e) => {
                debug!(instrument = %order.instrument, error = %e, "quote unavailable, using hint");
                None
            }
        };
        let Some(price) = aggressive_price(order.side, quote.as_ref(), order.price_hint, self.slippage, self.tick)
        else {
            return LegEvent::SubmitFailed {
                reason: CondorError::QuoteUnavailable {
                    instrument: order.instrument.clone(),
                }
                .to_string(),
            };
        };

        let request = OrderRequest::limit(&order.instrument, order.side, quantity, price, &order.label);
        match self.gateway.place_order(&request).await {
            Ok(order_id) => {
                info!(
                    instrument = %order.instrument,
                    side = %order.side,
                    %quantity,
                    %price,
                    %order_id,
                    attempt,
                    "leg order submitted"
                );
                LegEvent::Submitted { order_id, price }
            }
            Err(e) => {
                warn!(instrument = %order.instrument, attempt, error = %e, "leg submission failed");
                LegEvent::SubmitFailed { reason: e.to_string() }
            }
        }
    }

    async fn poll(&self, order_id: &str, budget: Duration) -> LegEvent {
        match timeout(budget, self.gateway.poll_order(order_id)).await {
            Ok(Ok(snapshot)) => LegEvent::Polled(snapshot),
            Ok(Err(e)) => LegEvent::PollFailed { reason: e.to_string() },
            Err(_) => LegEvent::PollFailed {
                reason: "poll timed out".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{FillBehavior, PaperExchange};
    use rust_decimal_macros::dec;

    fn snapshot(state: OrderState, price: Option<Decimal>) -> OrderSnapshot {
        OrderSnapshot {
            order_id: "o1".to_string(),
            state,
            filled_quantity: Decimal::ZERO,
            average_price: price,
        }
    }

    fn submitted(id: &str) -> LegEvent {
        LegEvent::Submitted {
            order_id: id.to_string(),
            price: dec!(0.012),
        }
    }

    #[test]
    fn test_machine_fills_on_first_attempt() {
        let mut m = LegMachine::new(3, dec!(0.1));
        assert_eq!(
            m.start(),
            LegAction::Submit {
                attempt: 1,
                quantity: dec!(0.1),
                backoff: false
            }
        );
        assert_eq!(m.on_event(submitted("o1")), LegAction::Poll { order_id: "o1".to_string() });
        assert_eq!(m.state(), LegState::Submitted);
        assert_eq!(
            m.on_event(LegEvent::Polled(snapshot(OrderState::Open, None))),
            LegAction::Poll { order_id: "o1".to_string() }
        );
        let action = m.on_event(LegEvent::Polled(snapshot(OrderState::Filled, Some(dec!(0.0115)))));
        assert_eq!(
            action,
            LegAction::Finish(LegOutcome::Filled {
                order_id: "o1".to_string(),
                fill_price: dec!(0.0115),
                attempts: 1
            })
        );
        assert_eq!(m.state(), LegState::Filled);
    }

    #[test]
    fn test_machine_exhausts_retry_budget() {
        let mut m = LegMachine::new(3, dec!(0.1));
        m.start();
        for attempt in 1..=3 {
            let id = format!("o{attempt}");
            m.on_event(submitted(&id));
            assert_eq!(m.on_event(LegEvent::FillTimedOut), LegAction::Cancel { order_id: id.clone() });
            assert_eq!(
                m.on_event(LegEvent::CancelResult(CancelOutcome::Cancelled)),
                LegAction::Confirm { order_id: id.clone() }
            );
            let next = m.on_event(LegEvent::Polled(snapshot(OrderState::Cancelled, None)));
            if attempt < 3 {
                assert_eq!(
                    next,
                    LegAction::Submit {
                        attempt: attempt + 1,
                        quantity: dec!(0.1),
                        backoff: true
                    }
                );
            } else {
                assert!(matches!(next, LegAction::Finish(LegOutcome::Unfilled { attempts: 3, .. })));
            }
        }
        assert_eq!(m.state(), LegState::Unfilled);
    }

    #[test]
    fn test_fill_racing_cancel_counts_as_filled() {
        let mut m = LegMachine::new(1, dec!(0.1));
        m.start();
        m.on_event(submitted("o1"));
        m.on_event(LegEvent::FillTimedOut);
        m.on_event(LegEvent::CancelResult(CancelOutcome::AlreadyFilled));
        let action = m.on_event(LegEvent::PollFailed {
            reason: "network".to_string(),
        });
        assert!(matches!(
            action,
            LegAction::Finish(LegOutcome::Filled { fill_price, .. }) if fill_price == dec!(0.012)
        ));
    }

    #[test]
    fn test_gateway_errors_consume_attempts() {
        let mut m = LegMachine::new(2, dec!(0.1));
        m.start();
        let next = m.on_event(LegEvent::SubmitFailed {
            reason: "connection reset".to_string(),
        });
        assert_eq!(
            next,
            LegAction::Submit {
                attempt: 2,
                quantity: dec!(0.1),
                backoff: true
            }
        );
        let last = m.on_event(LegEvent::SubmitFailed {
            reason: "connection reset".to_string(),
        });
        assert_eq!(
            last,
            LegAction::Finish(LegOutcome::Unfilled {
                attempts: 2,
                reason: "connection reset".to_string()
            })
        );
    }

    fn traded(id: &str, state: OrderState, filled: Decimal, price: Decimal) -> LegEvent {
        LegEvent::Polled(OrderSnapshot {
            order_id: id.to_string(),
            state,
            filled_quantity: filled,
            average_price: Some(price),
        })
    }

    /// Time out and cancel the live order, ending at the confirming poll
    fn time_out(m: &mut LegMachine, id: &str) {
        assert_eq!(m.on_event(LegEvent::FillTimedOut), LegAction::Cancel { order_id: id.to_string() });
        assert_eq!(
            m.on_event(LegEvent::CancelResult(CancelOutcome::Cancelled)),
            LegAction::Confirm { order_id: id.to_string() }
        );
    }

    #[test]
    fn test_retry_sends_only_the_remainder() {
        let mut m = LegMachine::new(2, dec!(0.1));
        m.start();
        m.on_event(submitted("o1"));
        time_out(&mut m, "o1");
        let next = m.on_event(traded("o1", OrderState::Cancelled, dec!(0.05), dec!(0.010)));
        assert_eq!(
            next,
            LegAction::Submit {
                attempt: 2,
                quantity: dec!(0.05),
                backoff: true
            }
        );
        assert_eq!(m.filled(), dec!(0.05));

        m.on_event(submitted("o2"));
        let done = m.on_event(traded("o2", OrderState::Filled, dec!(0.05), dec!(0.012)));
        assert_eq!(
            done,
            LegAction::Finish(LegOutcome::Filled {
                order_id: "o2".to_string(),
                fill_price: dec!(0.011),
                attempts: 2
            })
        );
        assert_eq!(m.state(), LegState::Filled);
    }

    #[test]
    fn test_partial_fill_survives_an_exhausted_budget() {
        let mut m = LegMachine::new(2, dec!(0.1));
        m.start();
        m.on_event(submitted("o1"));
        time_out(&mut m, "o1");
        m.on_event(traded("o1", OrderState::Cancelled, dec!(0.03), dec!(0.010)));
        m.on_event(submitted("o2"));
        time_out(&mut m, "o2");
        let done = m.on_event(traded("o2", OrderState::Cancelled, dec!(0.02), dec!(0.015)));

        match done {
            LegAction::Finish(LegOutcome::Partial {
                filled_quantity,
                average_price,
                attempts,
                ..
            }) => {
                assert_eq!(filled_quantity, dec!(0.05));
                // (0.03 * 0.010 + 0.02 * 0.015) / 0.05
                assert_eq!(average_price, dec!(0.012));
                assert_eq!(attempts, 2);
            }
            other => panic!("expected partial, got {other:?}"),
        }
        assert_eq!(m.state(), LegState::PartiallyFilled);
    }

    #[test]
    fn test_live_order_is_cancelled_again_never_replaced() {
        let mut m = LegMachine::new(3, dec!(0.1));
        m.start();
        m.on_event(submitted("o1"));
        m.on_event(LegEvent::FillTimedOut);

        for _ in 1..MAX_RESOLVE_TRIES {
            assert_eq!(
                m.on_event(LegEvent::CancelFailed {
                    reason: "timeout".to_string()
                }),
                LegAction::Confirm { order_id: "o1".to_string() }
            );
            assert_eq!(
                m.on_event(traded("o1", OrderState::Open, dec!(0.02), dec!(0.012))),
                LegAction::Cancel { order_id: "o1".to_string() }
            );
        }
        m.on_event(LegEvent::CancelFailed {
            reason: "timeout".to_string(),
        });
        let done = m.on_event(traded("o1", OrderState::Open, dec!(0.02), dec!(0.012)));

        assert!(matches!(
            done,
            LegAction::Finish(LegOutcome::Unresolved { ref order_id, filled_quantity, attempts: 1, .. })
                if order_id == "o1" && filled_quantity == dec!(0.02)
        ));
        assert_eq!(m.state(), LegState::Failed);
    }

    #[test]
    fn test_unreadable_order_after_cancel_is_unresolved() {
        let mut m = LegMachine::new(3, dec!(0.1));
        m.start();
        m.on_event(submitted("o1"));
        time_out(&mut m, "o1");

        let lost = || LegEvent::PollFailed {
            reason: "503".to_string(),
        };
        for _ in 1..MAX_RESOLVE_TRIES {
            assert_eq!(m.on_event(lost()), LegAction::Confirm { order_id: "o1".to_string() });
        }
        assert!(matches!(
            m.on_event(lost()),
            LegAction::Finish(LegOutcome::Unresolved { .. })
        ));
    }

    #[test]
    fn test_aggressive_price_rounding() {
        let quote = Quote::new("X", Some(dec!(0.0100)), Some(dec!(0.0123)));
        // 0.0123 * 1.1 = 0.01353 -> up to 0.0136
        assert_eq!(
            aggressive_price(OrderSide::Buy, Some(&quote), None, dec!(0.1), dec!(0.0001)),
            Some(dec!(0.0136))
        );
        // 0.0100 * 0.9 = 0.009 exactly
        assert_eq!(
            aggressive_price(OrderSide::Sell, Some(&quote), None, dec!(0.1), dec!(0.0001)),
            Some(dec!(0.009))
        );
    }

    #[test]
    fn test_aggressive_price_fallbacks() {
        let marked = Quote::new("X", None, None).with_mark(dec!(0.02));
        assert_eq!(
            aggressive_price(OrderSide::Buy, Some(&marked), None, dec!(0), dec!(0.0001)),
            Some(dec!(0.02))
        );
        assert_eq!(
            aggressive_price(OrderSide::Sell, None, Some(dec!(0.005)), dec!(0.1), dec!(0.0001)),
            Some(dec!(0.0045))
        );
        assert_eq!(aggressive_price(OrderSide::Sell, None, None, dec!(0.1), dec!(0.0001)), None);
        // tiny bid rounds to zero, floored at one tick
        let thin = Quote::new("X", Some(dec!(0.0001)), None);
        assert_eq!(
            aggressive_price(OrderSide::Sell, Some(&thin), None, dec!(0.5), dec!(0.0001)),
            Some(dec!(0.0001))
        );
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            retry_delay: Duration::from_millis(1),
            fill_timeout: Duration::from_millis(30),
            poll_interval: Duration::from_millis(5),
        }
    }

    fn leg(side: OrderSide) -> LegOrder {
        LegOrder {
            instrument: "BTC-X-P".to_string(),
            side,
            quantity: dec!(0.1),
            label: "test".to_string(),
            price_hint: None,
        }
    }

    #[tokio::test]
    async fn test_executor_retries_then_fills() {
        let paper = Arc::new(PaperExchange::new());
        paper.set_quote(Quote::new("BTC-X-P", Some(dec!(0.010)), Some(dec!(0.012))));
        paper.script("BTC-X-P", [FillBehavior::Never, FillBehavior::Reject, FillBehavior::Immediate]);

        let executor = LegExecutor::new(paper.clone(), &ExecutionConfig::default());
        let outcome = executor.execute_leg(&leg(OrderSide::Buy), &fast_policy(3)).await;

        match outcome {
            LegOutcome::Filled { fill_price, attempts, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(fill_price, dec!(0.012));
            }
            other => panic!("expected fill, got {:?}", other),
        }
        assert_eq!(paper.placed_orders().len(), 3);
        assert_eq!(paper.position("BTC-X-P"), dec!(0.1));
    }

    #[tokio::test]
    async fn test_executor_reports_unfilled_without_error() {
        let paper = Arc::new(PaperExchange::new().with_default_behavior(FillBehavior::Never));
        paper.set_quote(Quote::new("BTC-X-P", Some(dec!(0.010)), Some(dec!(0.012))));

        let executor = LegExecutor::new(paper.clone(), &ExecutionConfig::default());
        let outcome = executor.execute_leg(&leg(OrderSide::Sell), &fast_policy(2)).await;

        assert!(matches!(outcome, LegOutcome::Unfilled { attempts: 2, .. }));
        assert_eq!(paper.position("BTC-X-P"), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_executor_without_any_price_is_unfilled() {
        let paper = Arc::new(PaperExchange::new());
        let executor = LegExecutor::new(paper.clone(), &ExecutionConfig::default());
        let outcome = executor.execute_leg(&leg(OrderSide::Buy), &fast_policy(2)).await;
        assert!(matches!(outcome, LegOutcome::Unfilled { attempts: 2, .. }));
        assert!(paper.placed_orders().is_empty());
    }

    #[tokio::test]
    async fn test_executor_completes_a_partial_fill() {
        let paper = Arc::new(PaperExchange::new());
        paper.set_quote(Quote::new("BTC-X-P", Some(dec!(0.010)), Some(dec!(0.012))));
        paper.script("BTC-X-P", [FillBehavior::Partial(dec!(0.05)), FillBehavior::Immediate]);

        let executor = LegExecutor::new(paper.clone(), &ExecutionConfig::default());
        let outcome = executor.execute_leg(&leg(OrderSide::Buy), &fast_policy(2)).await;

        assert!(matches!(outcome, LegOutcome::Filled { attempts: 2, .. }), "{outcome:?}");
        let quantities: Vec<Decimal> = paper.placed_orders().iter().map(|o| o.quantity).collect();
        assert_eq!(quantities, vec![dec!(0.1), dec!(0.05)]);
        assert_eq!(paper.position("BTC-X-P"), dec!(0.1));
    }

    #[tokio::test]
    async fn test_executor_reports_partial_exposure() {
        let paper = Arc::new(PaperExchange::new());
        paper.set_quote(Quote::new("BTC-X-P", Some(dec!(0.010)), Some(dec!(0.012))));
        paper.script("BTC-X-P", [FillBehavior::Partial(dec!(0.05)), FillBehavior::Never]);

        let executor = LegExecutor::new(paper.clone(), &ExecutionConfig::default());
        let outcome = executor.execute_leg(&leg(OrderSide::Sell), &fast_policy(2)).await;

        assert_eq!(outcome.filled_quantity(dec!(0.1)), dec!(0.05));
        assert!(matches!(outcome, LegOutcome::Partial { attempts: 2, .. }), "{outcome:?}");
        assert_eq!(paper.position("BTC-X-P"), dec!(-0.05));
    }

    #[tokio::test]
    async fn test_executor_leaves_one_uncancellable_order() {
        let paper = Arc::new(PaperExchange::new().with_default_behavior(FillBehavior::Uncancellable));
        paper.set_quote(Quote::new("BTC-X-P", Some(dec!(0.010)), Some(dec!(0.012))));

        let executor = LegExecutor::new(paper.clone(), &ExecutionConfig::default());
        let outcome = executor.execute_leg(&leg(OrderSide::Buy), &fast_policy(3)).await;

        assert!(matches!(outcome, LegOutcome::Unresolved { .. }), "{outcome:?}");
        assert_eq!(paper.placed_orders().len(), 1);
    }

    #[tokio::test]
    async fn test_executor_flags_an_unreadable_order() {
        let paper = Arc::new(PaperExchange::new().with_default_behavior(FillBehavior::Unpollable));
        paper.set_quote(Quote::new("BTC-X-P", Some(dec!(0.010)), Some(dec!(0.012))));

        let executor = LegExecutor::new(paper.clone(), &ExecutionConfig::default());
        let outcome = executor.execute_leg(&leg(OrderSide::Buy), &fast_policy(3)).await;

        assert!(matches!(outcome, LegOutcome::Unresolved { .. }), "{outcome:?}");
        assert_eq!(paper.placed_orders().len(), 1);
    }

    #[test]
    fn test_policies_from_config() {
        let config = ExecutionConfig::default();
        let open = RetryPolicy::open(&config);
        let rollback = RetryPolicy::rollback(&config);
        assert_eq!(open.max_attempts, 3);
        assert_eq!(rollback.max_attempts, 2);
        assert!(rollback.worst_case() < open.worst_case());
    }
}
