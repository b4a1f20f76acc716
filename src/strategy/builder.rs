use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

use super::executor::{LegExecutor, LegOrder, LegOutcome, RetryPolicy};
use crate::config::{ExecutionConfig, Settlement};
use crate::domain::{
    CloseReason, ExitRules, Leg, LegRole, LegState, Position, PositionState, ValidatedTrade,
};
use crate::error::{CondorError, Result};
use crate::exchange::ExchangeGateway;

/// Quote-currency value of one unit of exchange premium
pub async fn valuation_multiplier(
    gateway: &dyn ExchangeGateway,
    settlement: Settlement,
    currency: &str,
) -> Result<Decimal> {
    match settlement {
        Settlement::Linear => Ok(Decimal::ONE),
        Settlement::Inverse => gateway.get_index_price(currency).await,
    }
}

fn advance_leg(position: &mut Position, role: LegRole, next: LegState) {
    if let Err(e) = position.leg_mut(role).advance(next) {
        warn!(position_id = %position.id, %role, error = %e, "unexpected leg state");
    }
}

/// A build that did not reach Open
#[derive(Debug, Clone)]
pub struct AbortReport {
    pub position: Position,
    /// Index into the open execution order
    pub failing_leg_index: usize,
    pub failing_role: LegRole,
    pub reason: String,
    /// Instruments the rollback could not flatten
    pub stuck_instruments: Vec<String>,
}

impl AbortReport {
    pub fn rollback_failed(&self) -> bool {
        !self.stuck_instruments.is_empty()
    }

    pub fn to_error(&self) -> CondorError {
        if self.rollback_failed() {
            CondorError::CompensatingCloseFailure {
                position_id: self.position.id.clone(),
                instruments: self.stuck_instruments.clone(),
            }
        } else {
            CondorError::PositionAborted {
                position_id: self.position.id.clone(),
                leg_index: self.failing_leg_index,
                reason: self.reason.clone(),
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum OpenResult {
    Opened(Position),
    Aborted(AbortReport),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CloseResult {
    Closed,
    /// Some legs could not be flattened; the position stays in Closing
    PartialCloseFailure { stuck_instruments: Vec<String> },
}

/// Opens condors leg by leg and unwinds them
pub struct PositionBuilder {
    gateway: Arc<dyn ExchangeGateway>,
    executor: LegExecutor,
    open_policy: RetryPolicy,
    rollback_policy: RetryPolicy,
    leg_delay: Duration,
    settlement: Settlement,
}

impl PositionBuilder {
    pub fn new(gateway: Arc<dyn ExchangeGateway>, config: &ExecutionConfig, settlement: Settlement) -> Self {
        Self {
            executor: LegExecutor::new(gateway.clone(), config),
            gateway,
            open_policy: RetryPolicy::open(config),
            rollback_policy: RetryPolicy::rollback(config),
            leg_delay: config.leg_delay(),
            settlement,
        }
    }

    fn label(position_id: &str, role: LegRole, purpose: &str) -> String {
        let short: String = position_id.chars().take(8).collect();
        format!("condor-{}-{}-{}", short, role.as_str(), purpose)
    }

    fn closing_order(position_id: &str, leg: &Leg, purpose: &str) -> LegOrder {
        LegOrder {
            instrument: leg.instrument_id.clone(),
            side: leg.side.opposite(),
            quantity: leg.unwind_quantity(),
            label: Self::label(position_id, leg.role, purpose),
            price_hint: leg.fill_price,
        }
    }

    /// Execute the four legs in open order. Runs to Open or Aborted;
    /// a failed leg triggers rollback of every leg holding fills first.
    pub async fn open(&self, trade: &ValidatedTrade, exit_rules: ExitRules) -> OpenResult {
        let mut position = Position::from_trade(trade, exit_rules);
        info!(
            position_id = %position.id,
            currency = %position.currency,
            quantity = %position.quantity,
            max_loss = %position.max_loss,
            "building condor"
        );

        for (index, role) in LegRole::OPEN_ORDER.iter().copied().enumerate() {
            if index > 0 && !self.leg_delay.is_zero() {
                sleep(self.leg_delay).await;
            }

            let order = {
                let leg = position.leg(role);
                LegOrder {
                    instrument: leg.instrument_id.clone(),
                    side: leg.side,
                    quantity: leg.quantity,
                    label: Self::label(&position.id, role, "open"),
                    price_hint: trade.leg(role).mark_price,
                }
            };

            advance_leg(&mut position, role, LegState::Submitted);
            let outcome = self.executor.execute_leg(&order, &self.open_policy).await;
            if outcome.is_filled() {
                Self::record_open_fill(&mut position, role, outcome);
                continue;
            }

            let (attempts, reason) = match &outcome {
                LegOutcome::Partial { attempts, reason, .. }
                | LegOutcome::Unfilled { attempts, reason }
                | LegOutcome::Unresolved { attempts, reason, .. } => (*attempts, reason.clone()),
                LegOutcome::Filled { attempts, .. } => (*attempts, String::new()),
            };
            warn!(
                position_id = %position.id,
                failing_leg = index,
                %role,
                attempts,
                filled = %outcome.filled_quantity(order.quantity),
                reason = %reason,
                "leg not filled, rolling back"
            );
            // An order that may still trade is the operator's, not the rollback's.
            let mut stuck = Vec::new();
            if matches!(outcome, LegOutcome::Unresolved { .. }) {
                stuck.push(order.instrument.clone());
            }
            Self::record_open_fill(&mut position, role, outcome);
            stuck.extend(self.rollback(&mut position).await);

            position.stuck_instruments = stuck.clone();
            if let Err(e) = position.transition(PositionState::Aborted) {
                error!(position_id = %position.id, error = %e, "abort transition refused");
            }
            position.closed_at = Some(Utc::now());
            return OpenResult::Aborted(AbortReport {
                position,
                failing_leg_index: index,
                failing_role: role,
                reason,
                stuck_instruments: stuck,
            });
        }

        let entry_credit = self.entry_credit(&position, trade).await;
        if let Err(e) = position.mark_open(entry_credit, Utc::now()) {
            // Unreachable with all four legs filled; keep the exposure visible.
            error!(position_id = %position.id, error = %e, "could not mark position open");
        }
        if entry_credit <= Decimal::ZERO {
            // The stop-loss threshold sits at or above zero P&L now, so the
            // next monitoring cycle closes the position. An entry that
            // collected nothing is meant to be exited straight away.
            warn!(position_id = %position.id, %entry_credit, "condor opened for a net debit");
        }
        info!(
            position_id = %position.id,
            %entry_credit,
            expected_credit = %trade.expected_credit(),
            "condor open"
        );
        OpenResult::Opened(position)
    }

    /// Write an opening leg's result onto the position
    fn record_open_fill(position: &mut Position, role: LegRole, outcome: LegOutcome) {
        let quantity = position.leg(role).quantity;
        let filled_quantity = outcome.filled_quantity(quantity);
        let next = match outcome {
            LegOutcome::Filled {
                order_id, fill_price, ..
            } => {
                let leg = position.leg_mut(role);
                leg.order_id = Some(order_id);
                leg.fill_price = Some(fill_price);
                LegState::Filled
            }
            LegOutcome::Partial { average_price, .. } => {
                position.leg_mut(role).fill_price = Some(average_price);
                LegState::PartiallyFilled
            }
            LegOutcome::Unfilled { .. } => LegState::Unfilled,
            LegOutcome::Unresolved { order_id, .. } => {
                position.leg_mut(role).order_id = Some(order_id);
                LegState::Failed
            }
        };
        position.leg_mut(role).filled_quantity = filled_quantity;
        advance_leg(position, role, next);
    }

    /// Entry credit in quote currency from signed fill prices
    async fn entry_credit(&self, position: &Position, trade: &ValidatedTrade) -> Decimal {
        let Some(per_unit) = position.fill_premium_per_unit() else {
            return trade.expected_credit();
        };
        match valuation_multiplier(self.gateway.as_ref(), self.settlement, &position.currency).await {
            Ok(multiplier) => per_unit * position.quantity * multiplier,
            Err(e) => {
                warn!(
                    position_id = %position.id,
                    error = %e,
                    "index price unavailable at entry, using expected credit"
                );
                trade.expected_credit()
            }
        }
    }

    /// Flatten every leg holding fills, shorts first, on the short rollback
    /// budget. Always visits every leg. Returns the instruments left with
    /// exposure.
    async fn rollback(&self, position: &mut Position) -> Vec<String> {
        let mut stuck = Vec::new();
        for role in position.filled_roles_for_unwind() {
            if let Some(instrument) = self.flatten(position, role, &self.rollback_policy, "rollback").await {
                stuck.push(instrument);
            }
        }
        stuck
    }

    /// Close one leg's fills. Returns the instrument when anything is left
    /// open, with the leg moved to Failed.
    async fn flatten(
        &self,
        position: &mut Position,
        role: LegRole,
        policy: &RetryPolicy,
        purpose: &'static str,
    ) -> Option<String> {
        let position_id = position.id.clone();
        let order = Self::closing_order(&position_id, position.leg(role), purpose);
        let outcome = self.executor.execute_leg(&order, policy).await;
        if let LegOutcome::Filled { fill_price, .. } = outcome {
            position.leg_mut(role).close_price = Some(fill_price);
            info!(position_id = %position_id, %role, %fill_price, purpose, "leg flattened");
            return None;
        }

        advance_leg(position, role, LegState::Failed);
        error!(
            position_id = %position_id,
            %role,
            instrument = %order.instrument,
            purpose,
            quantity = %order.quantity,
            closed = %outcome.filled_quantity(order.quantity),
            reason = outcome.reason().unwrap_or_default(),
            "FLATTEN FAILED - manual intervention required"
        );
        Some(order.instrument)
    }

    /// Issue four closing orders, shorts first, each on the open retry budget
    pub async fn close(&self, position: &mut Position, reason: CloseReason) -> Result<CloseResult> {
        position.transition(PositionState::Closing)?;
        position.close_reason = Some(reason);
        info!(position_id = %position.id, %reason, "closing condor");

        let mut stuck = Vec::new();
        for role in LegRole::OPEN_ORDER.iter().rev().copied() {
            if !position.leg(role).is_filled() {
                continue;
            }
            if let Some(instrument) = self.flatten(position, role, &self.open_policy, "close").await {
                stuck.push(instrument);
            }
        }

        if !stuck.is_empty() {
            position.stuck_instruments = stuck.clone();
            return Ok(CloseResult::PartialCloseFailure {
                stuck_instruments: stuck,
            });
        }

        position.realized_pnl = self.realized_pnl(position).await;
        position.transition(PositionState::Closed)?;
        position.closed_at = Some(Utc::now());
        info!(
            position_id = %position.id,
            %reason,
            realized_pnl = ?position.realized_pnl,
            "condor closed"
        );
        Ok(CloseResult::Closed)
    }

    async fn realized_pnl(&self, position: &Position) -> Option<Decimal> {
        let mut exit_value = Decimal::ZERO;
        for leg in &position.legs {
            exit_value += leg.side.position_sign() * leg.close_price?;
        }
        let multiplier = valuation_multiplier(self.gateway.as_ref(), self.settlement, &position.currency)
            .await
            .ok()?;
        Some(position.entry_credit + exit_value * position.quantity * multiplier)
    }
}
