//! Startup reconciliation against exchange positions.
//!
//! Tracked positions claim exchange size leg by leg. A position whose four
//! legs are all present goes back to the Open set, one with none present
//! was flattened elsewhere and is dropped, anything in between is flagged.
//! Size no tracked position claims is reported as orphaned exposure.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;
use tracing::{error, info, warn};

use crate::domain::{ExchangePosition, LegState, Position, PositionState};
use crate::error::Result;
use crate::exchange::ExchangeGateway;

/// Exchange size no tracked position accounts for
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrphanExposure {
    pub instrument: String,
    pub size: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub timestamp: DateTime<Utc>,
    /// Positions back in the Open set
    pub restored: Vec<String>,
    /// Positions with no exchange exposure left
    pub dropped: Vec<String>,
    /// Positions newly flagged because only some legs are still held
    pub flagged: Vec<String>,
    /// Previously flagged positions now confirmed flat
    pub cleared: Vec<String>,
    /// Previously flagged positions still holding exposure
    pub still_stuck: Vec<String>,
    pub orphans: Vec<OrphanExposure>,
    pub duration_ms: u64,
}

/// What the engine should hold after reconciling
#[derive(Debug, Default)]
pub struct ReconciliationPlan {
    pub open: Vec<Position>,
    pub flagged: Vec<Position>,
    /// Positions whose reservations can be released
    pub released: Vec<Position>,
    pub orphans: Vec<OrphanExposure>,
    restored: Vec<String>,
    newly_flagged: Vec<String>,
    cleared: Vec<String>,
    still_stuck: Vec<String>,
}

impl ReconciliationPlan {
    pub fn report(&self, started: Instant) -> ReconciliationReport {
        let dropped = self
            .released
            .iter()
            .map(|p| p.id.clone())
            .filter(|id| !self.cleared.contains(id))
            .collect();
        ReconciliationReport {
            timestamp: Utc::now(),
            restored: self.restored.clone(),
            dropped,
            flagged: self.newly_flagged.clone(),
            cleared: self.cleared.clone(),
            still_stuck: self.still_stuck.clone(),
            orphans: self.orphans.clone(),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Signed size per instrument still unclaimed
struct Allocation {
    available: BTreeMap<String, Decimal>,
}

impl Allocation {
    fn new(exchange: &[ExchangePosition]) -> Self {
        let mut available = BTreeMap::new();
        for p in exchange {
            *available.entry(p.instrument.clone()).or_insert(Decimal::ZERO) += p.size;
        }
        Self { available }
    }

    /// Claim up to `wanted` (signed) from an instrument; returns true if the
    /// instrument carries any exposure in that direction.
    fn claim(&mut self, instrument: &str, wanted: Decimal) -> bool {
        let Some(held) = self.available.get_mut(instrument) else {
            return false;
        };
        if held.is_zero() || held.is_sign_negative() != wanted.is_sign_negative() {
            return false;
        }
        let take = if held.abs() < wanted.abs() { *held } else { wanted };
        *held -= take;
        true
    }

    fn orphans(self) -> Vec<OrphanExposure> {
        self.available
            .into_iter()
            .filter(|(_, size)| !size.is_zero())
            .map(|(instrument, size)| OrphanExposure { instrument, size })
            .collect()
    }
}

/// Pure matching of tracked positions against exchange holdings.
///
/// Open positions claim first, then flagged ones, each in id order.
pub fn plan(
    open: Vec<Position>,
    flagged: Vec<Position>,
    exchange: &[ExchangePosition],
) -> ReconciliationPlan {
    let mut allocation = Allocation::new(exchange);
    let mut plan = ReconciliationPlan::default();

    let mut open = open;
    open.sort_by(|a, b| a.id.cmp(&b.id));
    for mut position in open {
        let quantity = position.quantity;
        let present: Vec<bool> = position
            .legs
            .iter()
            .map(|leg| allocation.claim(&leg.instrument_id, leg.side.position_sign() * quantity))
            .collect();

        if present.iter().all(|p| *p) {
            plan.restored.push(position.id.clone());
            plan.open.push(position);
        } else if present.iter().all(|p| !*p) {
            plan.released.push(position);
        } else {
            let mut stuck = Vec::new();
            let position_id = position.id.clone();
            for (leg, held) in position.legs.iter_mut().zip(present) {
                if held {
                    if let Err(e) = leg.advance(LegState::Failed) {
                        warn!(position_id = %position_id, role = %leg.role, error = %e, "unexpected leg state");
                    }
                    stuck.push(leg.instrument_id.clone());
                }
            }
            if position.state == PositionState::Open {
                position.state = PositionState::Closing;
            }
            position.stuck_instruments = stuck;
            plan.newly_flagged.push(position.id.clone());
            plan.flagged.push(position);
        }
    }

    let mut flagged = flagged;
    flagged.sort_by(|a, b| a.id.cmp(&b.id));
    for mut position in flagged {
        let quantity = position.quantity;
        let stuck: BTreeSet<String> = position.stuck_instruments.iter().cloned().collect();
        let still_held: Vec<String> = position
            .legs
            .iter()
            .filter(|leg| stuck.contains(&leg.instrument_id))
            .filter(|leg| allocation.claim(&leg.instrument_id, leg.side.position_sign() * quantity))
            .map(|leg| leg.instrument_id.clone())
            .collect();

        if still_held.is_empty() {
            position.stuck_instruments.clear();
            plan.cleared.push(position.id.clone());
            plan.released.push(position);
        } else {
            position.stuck_instruments = still_held;
            plan.still_stuck.push(position.id.clone());
            plan.flagged.push(position);
        }
    }

    plan.orphans = allocation.orphans();
    plan
}

/// Exchange option positions across `currencies`
pub async fn fetch_exchange_positions(
    gateway: &dyn ExchangeGateway,
    currencies: &BTreeSet<String>,
) -> Result<Vec<ExchangePosition>> {
    let mut all = Vec::new();
    for currency in currencies {
        let positions = gateway.get_positions(currency).await?;
        info!(currency = %currency, count = positions.len(), "exchange positions fetched");
        all.extend(positions);
    }
    Ok(all)
}

pub fn log_report(report: &ReconciliationReport) {
    info!(
        restored = report.restored.len(),
        dropped = report.dropped.len(),
        flagged = report.flagged.len(),
        cleared = report.cleared.len(),
        still_stuck = report.still_stuck.len(),
        orphans = report.orphans.len(),
        duration_ms = report.duration_ms,
        "reconciliation completed"
    );
    for id in &report.dropped {
        warn!(position_id = %id, "position no longer on exchange, dropped");
    }
    for orphan in &report.orphans {
        error!(
            instrument = %orphan.instrument,
            size = %orphan.size,
            "CRITICAL: exchange exposure not tracked by any position"
        );
    }
}
