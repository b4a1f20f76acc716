use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};

use super::builder::{valuation_multiplier, CloseResult, PositionBuilder};
use super::risk::RiskLedger;
use crate::config::Settlement;
use crate::domain::{CloseReason, Position, PositionState};
use crate::error::{CondorError, Result};
use crate::exchange::ExchangeGateway;

/// A position the monitor closed
#[derive(Debug, Clone, Serialize)]
pub struct ClosedEvent {
    pub position_id: String,
    pub reason: CloseReason,
    pub entry_credit: Decimal,
    pub pnl_at_trigger: Option<Decimal>,
    pub realized_pnl: Option<Decimal>,
    pub closed_at: DateTime<Utc>,
}

/// Everything one monitoring cycle did
#[derive(Debug, Default)]
pub struct CycleReport {
    pub closed: Vec<ClosedEvent>,
    /// Positions whose close left exposure behind, now awaiting intervention
    pub stuck: Vec<Position>,
    /// Per-position failures that did not stop the cycle
    pub errors: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PortfolioSummary {
    pub open_count: usize,
    pub total_committed_risk: Decimal,
    pub aggregate_pnl: Decimal,
    /// Open positions that could not be marked this time
    pub unpriced: usize,
    pub flagged_count: usize,
    pub equity: Option<Decimal>,
}

/// Evaluate exit rules in fixed priority: expiry, stop loss, take profit.
///
/// Expiry needs no price. Without a P&L nothing else can trigger.
pub fn should_close(position: &Position, pnl: Option<Decimal>, now: DateTime<Utc>) -> Option<CloseReason> {
    let rules = &position.exit_rules;
    if position.time_to_expiry(now) <= rules.close_buffer() {
        return Some(CloseReason::ExpiryBuffer);
    }
    let pnl = pnl?;
    if pnl <= -(rules.sl_multiple * position.entry_credit) {
        return Some(CloseReason::StopLoss);
    }
    if pnl >= rules.tp_ratio * position.entry_credit {
        return Some(CloseReason::TakeProfit);
    }
    None
}

/// Entry credit plus the signed value of the legs at `marks` (strike order).
///
/// Long legs count positively, short legs negatively.
pub fn pnl_from_marks(position: &Position, marks: &[Decimal; 4], multiplier: Decimal) -> Decimal {
    let legs_value: Decimal = position
        .legs
        .iter()
        .zip(marks.iter())
        .map(|(leg, mark)| leg.side.position_sign() * *mark)
        .sum();
    position.entry_credit + legs_value * position.quantity * multiplier
}

/// Owns the Open set. Only fully filled Open positions ever enter it.
#[derive(Debug, Default)]
pub struct ExitMonitor {
    open: BTreeMap<String, Position>,
}

impl ExitMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, position: Position) -> Result<()> {
        if position.state != PositionState::Open || !position.all_legs_filled() {
            return Err(CondorError::Validation(format!(
                "position {} is {} and cannot be monitored",
                position.id, position.state
            )));
        }
        info!(position_id = %position.id, "position registered with exit monitor");
        self.open.insert(position.id.clone(), position);
        Ok(())
    }

    pub fn remove(&mut self, position_id: &str) -> Option<Position> {
        self.open.remove(position_id)
    }

    /// Empty the Open set, handing its positions back
    pub fn drain(&mut self) -> Vec<Position> {
        std::mem::take(&mut self.open).into_values().collect()
    }

    pub fn get(&self, position_id: &str) -> Option<&Position> {
        self.open.get(position_id)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.open.values()
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    /// Mark-to-market P&L in quote currency from current leg mids
    pub async fn pnl(
        &self,
        gateway: &dyn ExchangeGateway,
        settlement: Settlement,
        position: &Position,
    ) -> Result<Decimal> {
        let mut marks = [Decimal::ZERO; 4];
        for (mark, leg) in marks.iter_mut().zip(position.legs.iter()) {
            let quote = gateway.get_best_quote(&leg.instrument_id).await?;
            *mark = quote.mid().ok_or_else(|| CondorError::QuoteUnavailable {
                instrument: leg.instrument_id.clone(),
            })?;
        }
        let multiplier = valuation_multiplier(gateway, settlement, &position.currency).await?;
        Ok(pnl_from_marks(position, &marks, multiplier))
    }

    /// Evaluate every Open position once and close those that trigger.
    ///
    /// A failure on one position is recorded and the cycle moves on.
    pub async fn run_cycle(
        &mut self,
        gateway: &dyn ExchangeGateway,
        settlement: Settlement,
        builder: &PositionBuilder,
        ledger: &mut RiskLedger,
        now: DateTime<Utc>,
    ) -> CycleReport {
        let mut report = CycleReport::default();
        let ids: Vec<String> = self.open.keys().cloned().collect();

        for id in ids {
            let Some(position) = self.open.get(&id) else {
                continue;
            };

            let pnl = match self.pnl(gateway, settlement, position).await {
                Ok(pnl) => Some(pnl),
                Err(e) => {
                    warn!(position_id = %id, error = %e, "could not mark position");
                    report.errors.push((id.clone(), e.to_string()));
                    None
                }
            };

            let Some(reason) = should_close(position, pnl, now) else {
                debug!(position_id = %id, pnl = ?pnl, "hold");
                continue;
            };
            info!(position_id = %id, %reason, pnl = ?pnl, "exit triggered");

            let Some(mut position) = self.open.remove(&id) else {
                continue;
            };
            match builder.close(&mut position, reason).await {
                Ok(CloseResult::Closed) => {
                    ledger.release(&position.id);
                    report.closed.push(ClosedEvent {
                        position_id: position.id.clone(),
                        reason,
                        entry_credit: position.entry_credit,
                        pnl_at_trigger: pnl,
                        realized_pnl: position.realized_pnl,
                        closed_at: position.closed_at.unwrap_or(now),
                    });
                }
                Ok(CloseResult::PartialCloseFailure { stuck_instruments }) => {
                    error!(
                        position_id = %position.id,
                        instruments = %stuck_instruments.join(", "),
                        "close left exposure; risk stays reserved until confirmed flat"
                    );
                    ledger.hold_for_intervention(&position.id);
                    report.stuck.push(position);
                }
                Err(e) => {
                    // Never got to send orders; keep watching it.
                    error!(position_id = %id, error = %e, "close refused");
                    report.errors.push((id.clone(), e.to_string()));
                    if position.state == PositionState::Open {
                        self.open.insert(id, position);
                    }
                }
            }
        }

        report
    }

    /// Read-only aggregation over the Open set
    pub async fn portfolio_summary(
        &self,
        gateway: &dyn ExchangeGateway,
        settlement: Settlement,
        ledger: &RiskLedger,
        flagged_count: usize,
    ) -> PortfolioSummary {
        let mut summary = PortfolioSummary {
            open_count: self.open.len(),
            total_committed_risk: ledger.committed_risk(),
            flagged_count,
            equity: ledger.last_equity(),
            ..Default::default()
        };
        for position in self.open.values() {
            match self.pnl(gateway, settlement, position).await {
                Ok(pnl) => summary.aggregate_pnl += pnl,
                Err(_) => summary.unpriced += 1,
            }
        }
        summary
    }
}
