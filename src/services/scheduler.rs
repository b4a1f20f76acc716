//! Drives the engine from two periodic triggers.
//!
//! Both loops share the engine's single cycle lock. A tick that finds the
//! lock held is skipped and counted, never queued.

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::inbox::StructureSource;
use crate::config::ScheduleConfig;
use crate::strategy::{ClosedEvent, CondorEngine, OpenOutcome};

#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub open_cycles: AtomicU64,
    pub monitor_cycles: AtomicU64,
    pub skipped_open_ticks: AtomicU64,
    pub skipped_monitor_ticks: AtomicU64,
}

/// What one open tick did
#[derive(Debug, Default)]
pub struct OpenTickReport {
    pub opened: usize,
    pub rejected: usize,
    pub aborted: usize,
    pub failed: usize,
}

pub struct Scheduler {
    engine: Arc<CondorEngine>,
    source: Arc<dyn StructureSource>,
    open_every: Duration,
    monitor_every: Duration,
    stats: Arc<SchedulerStats>,
}

impl Scheduler {
    pub fn new(engine: Arc<CondorEngine>, source: Arc<dyn StructureSource>, config: &ScheduleConfig) -> Self {
        Self {
            engine,
            source,
            open_every: Duration::from_secs(config.open_interval_secs.max(1)),
            monitor_every: Duration::from_secs(config.monitor_interval_secs.max(1)),
            stats: Arc::new(SchedulerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<SchedulerStats> {
        self.stats.clone()
    }

    /// Run both loops until `shutdown` flips to true. A cycle already in
    /// progress finishes before its loop exits.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        info!(
            open_every_secs = self.open_every.as_secs(),
            monitor_every_secs = self.monitor_every.as_secs(),
            source = self.source.name(),
            "scheduler started"
        );
        tokio::join!(self.open_loop(shutdown.clone()), self.monitor_loop(shutdown));
        info!(
            open_cycles = self.stats.open_cycles.load(Ordering::Relaxed),
            monitor_cycles = self.stats.monitor_cycles.load(Ordering::Relaxed),
            skipped_open = self.stats.skipped_open_ticks.load(Ordering::Relaxed),
            skipped_monitor = self.stats.skipped_monitor_ticks.load(Ordering::Relaxed),
            "scheduler stopped"
        );
    }

    async fn open_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = interval(self.open_every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = tick.tick() => {
                    self.open_tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("open loop stopped");
    }

    async fn monitor_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = interval(self.monitor_every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = tick.tick() => {
                    self.monitor_tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("monitor loop stopped");
    }

    /// Pull candidates and try each in turn inside one cycle.
    /// `None` if another cycle held the lock.
    pub async fn open_tick(&self) -> Option<OpenTickReport> {
        let Some(mut cycle) = self.engine.try_begin_cycle() else {
            self.stats.skipped_open_ticks.fetch_add(1, Ordering::Relaxed);
            warn!("open tick skipped: previous cycle still running");
            return None;
        };
        self.stats.open_cycles.fetch_add(1, Ordering::Relaxed);

        let mut report = OpenTickReport::default();
        let candidates = match self.source.next_batch().await {
            Ok(batch) => batch,
            Err(e) => {
                error!(source = self.source.name(), error = %e, "could not read candidates");
                return Some(report);
            }
        };

        for structure in &candidates {
            match cycle.open(structure).await {
                Ok(OpenOutcome::Opened(position)) => {
                    report.opened += 1;
                    info!(position_id = %position.id, "candidate opened");
                }
                Ok(OpenOutcome::Rejected(reason)) => {
                    report.rejected += 1;
                    info!(currency = %structure.currency, %reason, "candidate rejected");
                }
                Ok(OpenOutcome::Aborted {
                    position_id,
                    failing_leg_index,
                    ..
                }) => {
                    report.aborted += 1;
                    warn!(%position_id, failing_leg_index, "candidate aborted");
                }
                Err(e) => {
                    report.failed += 1;
                    error!(
                        error = %e,
                        manual_intervention = e.requires_manual_intervention(),
                        "open failed"
                    );
                }
            }
        }
        Some(report)
    }

    /// One exit-monitor pass. `None` if another cycle held the lock.
    pub async fn monitor_tick(&self) -> Option<Vec<ClosedEvent>> {
        let Some(mut cycle) = self.engine.try_begin_cycle() else {
            self.stats.skipped_monitor_ticks.fetch_add(1, Ordering::Relaxed);
            warn!("monitor tick skipped: previous cycle still running");
            return None;
        };
        self.stats.monitor_cycles.fetch_add(1, Ordering::Relaxed);
        let closed = cycle.monitor(Utc::now()).await;
        if !closed.is_empty() {
            info!(closed = closed.len(), "monitor cycle closed positions");
        }
        Some(closed)
    }
}
