use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use super::builder::{OpenResult, PositionBuilder};
use super::monitor::{ClosedEvent, ExitMonitor, PortfolioSummary};
use super::reconciliation::{self, ReconciliationReport};
use super::risk::RiskLedger;
use crate::config::AppConfig;
use crate::domain::{CondorStructure, Position};
use crate::error::{CondorError, Result, RiskError};
use crate::exchange::ExchangeGateway;
use crate::persistence::StateStore;
use crate::supervisor::{Alert, AlertLevel, AlertManager};

/// Result of one `try_open` call that did not hit a fatal condition
#[derive(Debug, Clone)]
pub enum OpenOutcome {
    /// All four legs filled, position is in the Open set
    Opened(Position),
    /// Refused before any order was placed
    Rejected(RiskError),
    /// A leg stayed unfilled and every filled leg was flattened again
    Aborted {
        position_id: String,
        failing_leg_index: usize,
        reason: String,
    },
}

impl OpenOutcome {
    pub fn is_opened(&self) -> bool {
        matches!(self, OpenOutcome::Opened(_))
    }
}

/// Point-in-time view of what the engine holds
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub open: Vec<Position>,
    pub flagged: Vec<Position>,
    pub committed_risk: Decimal,
    pub halt_reason: Option<String>,
}

/// Everything mutated by open and monitor cycles. Only reachable through
/// the engine's single lock.
struct EngineState {
    ledger: RiskLedger,
    monitor: ExitMonitor,
    /// Positions awaiting manual intervention, keyed by id
    flagged: BTreeMap<String, Position>,
}

/// The position lifecycle engine: risk ledger, builder and exit monitor
/// behind one mutual-exclusion region.
pub struct CondorEngine {
    config: AppConfig,
    gateway: Arc<dyn ExchangeGateway>,
    builder: PositionBuilder,
    alerts: Arc<AlertManager>,
    store: Option<StateStore>,
    state: Mutex<EngineState>,
}

impl CondorEngine {
    pub fn new(config: AppConfig, gateway: Arc<dyn ExchangeGateway>, alerts: Arc<AlertManager>) -> Self {
        let builder = PositionBuilder::new(gateway.clone(), &config.execution, config.exchange.settlement);
        let store = config.state.positions_file.clone().map(StateStore::new);
        let state = EngineState {
            ledger: RiskLedger::new(config.risk.clone()).with_close_buffer(config.exit.rules().close_buffer()),
            monitor: ExitMonitor::new(),
            flagged: BTreeMap::new(),
        };
        Self {
            config,
            gateway,
            builder,
            alerts,
            store,
            state: Mutex::new(state),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn alerts(&self) -> &Arc<AlertManager> {
        &self.alerts
    }

    /// Begin a cycle unless one is already running
    pub fn try_begin_cycle(&self) -> Option<Cycle<'_>> {
        self.state.try_lock().ok().map(|state| Cycle { engine: self, state })
    }

    /// Wait for any running cycle, then begin one
    pub async fn begin_cycle(&self) -> Cycle<'_> {
        Cycle {
            engine: self,
            state: self.state.lock().await,
        }
    }

    pub async fn try_open(&self, structure: &CondorStructure) -> Result<OpenOutcome> {
        self.begin_cycle().await.open(structure).await
    }

    pub async fn run_monitoring_cycle(&self, now: DateTime<Utc>) -> Vec<ClosedEvent> {
        self.begin_cycle().await.monitor(now).await
    }

    pub async fn portfolio_summary(&self) -> PortfolioSummary {
        self.begin_cycle().await.summary().await
    }

    pub async fn snapshot(&self) -> EngineSnapshot {
        let state = self.state.lock().await;
        EngineSnapshot {
            open: state.monitor.positions().cloned().collect(),
            flagged: state.flagged.values().cloned().collect(),
            committed_risk: state.ledger.committed_risk(),
            halt_reason: state.ledger.halt_reason(),
        }
    }

    /// Operator confirmation that a flagged position is flat on the exchange.
    /// Returns the released risk.
    pub async fn confirm_flat(&self, position_id: &str) -> Result<Decimal> {
        let mut cycle = self.begin_cycle().await;
        let state = &mut *cycle.state;
        if state.flagged.remove(position_id).is_none() {
            return Err(CondorError::PositionNotFound(position_id.to_string()));
        }
        let released = state.ledger.confirm_flat(position_id).unwrap_or(Decimal::ZERO);
        info!(position_id, %released, "position confirmed flat by operator");
        cycle.persist().await;
        self.alerts
            .alert(
                Alert::new(
                    AlertLevel::Info,
                    "lifecycle",
                    "Confirmed flat",
                    &format!("released {} of reserved risk", released),
                )
                .for_position(position_id),
            )
            .await;
        Ok(released)
    }

    /// Load the persisted snapshot into memory as-is, without asking the
    /// exchange. Returns how many positions were loaded.
    pub async fn load_persisted(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let persisted = store.load().await?;
        let count = persisted.open.len() + persisted.flagged.len();

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        for position in persisted.open {
            state.ledger.restore(&position.id, position.max_loss);
            let id = position.id.clone();
            if let Err(e) = state.monitor.register(position) {
                warn!(position_id = %id, error = %e, "persisted position not monitorable");
            }
        }
        for position in persisted.flagged {
            state.ledger.restore(&position.id, position.max_loss);
            state.ledger.hold_for_intervention(&position.id);
            state.flagged.insert(position.id.clone(), position);
        }
        info!(path = %store.path().display(), count, "persisted positions loaded");
        Ok(count)
    }

    pub async fn reset_circuit_breaker(&self) {
        self.state.lock().await.ledger.reset_circuit_breaker();
    }

    pub async fn reconcile(&self) -> Result<ReconciliationReport> {
        self.begin_cycle().await.reconcile().await
    }
}

/// Exclusive access to the engine's mutable state for one cycle
pub struct Cycle<'a> {
    engine: &'a CondorEngine,
    state: MutexGuard<'a, EngineState>,
}

impl Cycle<'_> {
    /// Validate, reserve, build. Fatal only when a rollback leaves exposure.
    pub async fn open(&mut self, structure: &CondorStructure) -> Result<OpenOutcome> {
        let engine = self.engine;
        let exchange = &engine.config.exchange;

        let trade = match self
            .state
            .ledger
            .validate_trade(structure, engine.gateway.as_ref(), &exchange.currencies, exchange.settlement)
            .await
        {
            Ok(trade) => trade,
            Err(e) => {
                info!(currency = %structure.currency, reason = %e, "structure rejected");
                if matches!(e, RiskError::EquityUnavailable(_)) {
                    engine
                        .alerts
                        .warning("risk", "Equity unavailable", &e.to_string())
                        .await;
                }
                return Ok(OpenOutcome::Rejected(e));
            }
        };

        if let Err(e) = self.state.ledger.reserve(&trade) {
            info!(position_id = trade.id(), reason = %e, "reservation refused");
            return Ok(OpenOutcome::Rejected(e));
        }

        match engine.builder.open(&trade, engine.config.exit.rules()).await {
            OpenResult::Opened(position) => {
                let state = &mut *self.state;
                state.ledger.record_open_success();
                let summary = format!(
                    "{} {} x{} credit {} max loss {}",
                    position.currency,
                    position.expiration.format("%Y-%m-%d"),
                    position.quantity,
                    position.entry_credit,
                    position.max_loss
                );
                if let Err(e) = state.monitor.register(position.clone()) {
                    // Filled legs with nowhere to go: hold them for an operator.
                    error!(position_id = %position.id, error = %e, "opened position not monitorable");
                    let instruments: Vec<String> =
                        position.legs.iter().map(|l| l.instrument_id.clone()).collect();
                    let mut flagged = position;
                    flagged.stuck_instruments = instruments.clone();
                    state.ledger.hold_for_intervention(&flagged.id);
                    let id = flagged.id.clone();
                    state.flagged.insert(id.clone(), flagged);
                    self.persist().await;
                    engine
                        .alerts
                        .manual_intervention(&id, &instruments, "opened position could not be monitored")
                        .await;
                    return Err(e);
                }
                self.persist().await;
                // A net debit leaves the credit-relative exits inverted; the
                // next monitoring cycle stops it out, and the operator hears why.
                let (level, title) = if position.entry_credit <= Decimal::ZERO {
                    (AlertLevel::Warning, "Condor opened for a net debit")
                } else {
                    (AlertLevel::Info, "Condor opened")
                };
                engine
                    .alerts
                    .alert(Alert::new(level, "lifecycle", title, &summary).for_position(&position.id))
                    .await;
                Ok(OpenOutcome::Opened(position))
            }
            OpenResult::Aborted(report) => {
                let state = &mut *self.state;
                let position_id = report.position.id.clone();
                let tripped = state.ledger.record_abort(&report.reason);

                if report.rollback_failed() {
                    // Exposure is real: keep the reservation until confirmed flat.
                    state.ledger.hold_for_intervention(&position_id);
                    state.flagged.insert(position_id.clone(), report.position.clone());
                    self.persist().await;
                    engine
                        .alerts
                        .manual_intervention(
                            &position_id,
                            &report.stuck_instruments,
                            &format!("rollback after leg {} failed", report.failing_leg_index),
                        )
                        .await;
                    if tripped {
                        engine.alerts.circuit_breaker_tripped(&report.reason).await;
                    }
                    return Err(report.to_error());
                }

                state.ledger.release(&position_id);
                engine
                    .alerts
                    .alert(
                        Alert::new(
                            AlertLevel::Warning,
                            "lifecycle",
                            "Build aborted",
                            &format!(
                                "leg {} ({}) unfilled: {}",
                                report.failing_leg_index, report.failing_role, report.reason
                            ),
                        )
                        .for_position(&position_id),
                    )
                    .await;
                if tripped {
                    engine.alerts.circuit_breaker_tripped(&report.reason).await;
                }
                Ok(OpenOutcome::Aborted {
                    position_id,
                    failing_leg_index: report.failing_leg_index,
                    reason: report.reason,
                })
            }
        }
    }

    /// One pass of the exit monitor over the Open set
    pub async fn monitor(&mut self, now: DateTime<Utc>) -> Vec<ClosedEvent> {
        let engine = self.engine;
        let state = &mut *self.state;
        let report = state
            .monitor
            .run_cycle(
                engine.gateway.as_ref(),
                engine.config.exchange.settlement,
                &engine.builder,
                &mut state.ledger,
                now,
            )
            .await;

        let changed = !report.closed.is_empty() || !report.stuck.is_empty();
        let mut stuck_alerts = Vec::new();
        for position in report.stuck {
            stuck_alerts.push((position.id.clone(), position.stuck_instruments.clone()));
            state.flagged.insert(position.id.clone(), position);
        }
        if changed {
            self.persist().await;
        }

        for (id, instruments) in &stuck_alerts {
            engine
                .alerts
                .manual_intervention(id, instruments, "scheduled close could not flatten every leg")
                .await;
        }
        for event in &report.closed {
            let pnl = event
                .realized_pnl
                .map(|p| p.round_dp(2).to_string())
                .unwrap_or_else(|| "unknown".to_string());
            engine
                .alerts
                .alert(
                    Alert::new(
                        AlertLevel::Info,
                        "monitor",
                        "Condor closed",
                        &format!("{} realized {}", event.reason, pnl),
                    )
                    .for_position(&event.position_id),
                )
                .await;
        }
        for (id, message) in &report.errors {
            engine
                .alerts
                .alert(
                    Alert::new(AlertLevel::Warning, "monitor", "Position evaluation failed", message)
                        .for_position(id),
                )
                .await;
        }

        report.closed
    }

    pub async fn summary(&self) -> PortfolioSummary {
        let engine = self.engine;
        self.state
            .monitor
            .portfolio_summary(
                engine.gateway.as_ref(),
                engine.config.exchange.settlement,
                &self.state.ledger,
                self.state.flagged.len(),
            )
            .await
    }

    /// Match tracked positions against the exchange and rebuild the
    /// Open set, the flagged set and the reservations from the result.
    pub async fn reconcile(&mut self) -> Result<ReconciliationReport> {
        let started = Instant::now();
        let engine = self.engine;

        let in_memory = !self.state.monitor.is_empty() || !self.state.flagged.is_empty();
        let (open, flagged) = if in_memory {
            (
                self.state.monitor.positions().cloned().collect::<Vec<_>>(),
                self.state.flagged.values().cloned().collect::<Vec<_>>(),
            )
        } else if let Some(store) = &engine.store {
            let persisted = store.load().await?;
            info!(
                path = %store.path().display(),
                open = persisted.open.len(),
                flagged = persisted.flagged.len(),
                "loaded persisted positions"
            );
            (persisted.open, persisted.flagged)
        } else {
            (Vec::new(), Vec::new())
        };

        let mut currencies: BTreeSet<String> = engine
            .config
            .exchange
            .currencies
            .iter()
            .map(|c| c.to_uppercase())
            .collect();
        currencies.extend(open.iter().chain(flagged.iter()).map(|p| p.currency.to_uppercase()));

        // Nothing in memory changes unless the exchange answered.
        let exchange_positions =
            reconciliation::fetch_exchange_positions(engine.gateway.as_ref(), &currencies).await?;

        let plan = reconciliation::plan(open, flagged, &exchange_positions);
        let report = plan.report(started);

        let state = &mut *self.state;
        state.monitor.drain();
        state.flagged.clear();

        for position in plan.released {
            if state.ledger.confirm_flat(&position.id).is_none() && state.ledger.reserved_for(&position.id).is_some() {
                state.ledger.release(&position.id);
            }
        }
        for position in plan.open {
            state.ledger.restore(&position.id, position.max_loss);
            let id = position.id.clone();
            if let Err(e) = state.monitor.register(position) {
                warn!(position_id = %id, error = %e, "restored position not monitorable");
            }
        }
        for position in plan.flagged {
            state.ledger.restore(&position.id, position.max_loss);
            state.ledger.hold_for_intervention(&position.id);
            state.flagged.insert(position.id.clone(), position);
        }

        self.persist().await;
        reconciliation::log_report(&report);

        for id in &report.flagged {
            let instruments = self
                .state
                .flagged
                .get(id)
                .map(|p| p.stuck_instruments.clone())
                .unwrap_or_default();
            engine
                .alerts
                .manual_intervention(id, &instruments, "only some legs found on the exchange")
                .await;
        }
        for orphan in &report.orphans {
            engine
                .alerts
                .critical(
                    "reconciliation",
                    "Untracked exchange exposure",
                    &format!("{} size {}", orphan.instrument, orphan.size),
                )
                .await;
        }

        Ok(report)
    }

    /// Snapshot the Open and flagged sets. Failures are loud but not fatal.
    async fn persist(&self) {
        let Some(store) = &self.engine.store else {
            return;
        };
        if let Err(e) = store
            .save(self.state.monitor.positions(), self.state.flagged.values())
            .await
        {
            error!(path = %store.path().display(), error = %e, "failed to persist positions");
            self.engine
                .alerts
                .error("persistence", "State write failed", &e.to_string())
                .await;
        }
    }
}
