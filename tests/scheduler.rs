mod common;

use async_trait::async_trait;
use chrono::Duration;
use common::*;
use condor::config::ScheduleConfig;
use condor::domain::CondorStructure;
use condor::exchange::FillBehavior;
use condor::{Result, Scheduler, StructureSource};
use rust_decimal_macros::dec;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Hands out its queued structures once
struct VecSource {
    queue: Mutex<Vec<CondorStructure>>,
}

impl VecSource {
    fn new(structures: Vec<CondorStructure>) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(structures),
        })
    }
}

#[async_trait]
impl StructureSource for VecSource {
    fn name(&self) -> &str {
        "vec"
    }

    async fn next_batch(&self) -> Result<Vec<CondorStructure>> {
        Ok(std::mem::take(&mut *self.queue.lock().unwrap()))
    }
}

#[tokio::test]
async fn open_tick_tries_every_candidate() {
    let paper = paper();
    let engine = engine(config(None), &paper);
    let mut too_big = structure(Duration::days(10));
    too_big.quantity = Some(dec!(5));
    let source = VecSource::new(vec![structure(Duration::days(10)), too_big]);
    let scheduler = Scheduler::new(engine.clone(), source, &ScheduleConfig::default());

    let report = scheduler.open_tick().await.unwrap();
    assert_eq!(report.opened, 1);
    assert_eq!(report.rejected, 1);
    assert_eq!(engine.snapshot().await.open.len(), 1);

    // the batch was consumed
    let report = scheduler.open_tick().await.unwrap();
    assert_eq!(report.opened + report.rejected, 0);
    assert_eq!(scheduler.stats().open_cycles.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn ticks_are_skipped_while_a_cycle_runs() {
    let paper = paper();
    let engine = engine(config(None), &paper);
    let source = VecSource::new(vec![structure(Duration::days(10))]);
    let scheduler = Scheduler::new(engine.clone(), source, &ScheduleConfig::default());

    let cycle = engine.try_begin_cycle().unwrap();
    assert!(scheduler.monitor_tick().await.is_none());
    assert!(scheduler.open_tick().await.is_none());
    assert!(engine.try_begin_cycle().is_none());
    drop(cycle);

    let stats = scheduler.stats();
    assert_eq!(stats.skipped_monitor_ticks.load(Ordering::Relaxed), 1);
    assert_eq!(stats.skipped_open_ticks.load(Ordering::Relaxed), 1);
    assert_eq!(stats.open_cycles.load(Ordering::Relaxed), 0);
    // skipped, not queued: the candidate is still waiting
    assert!(paper.placed_orders().is_empty());

    assert_eq!(scheduler.open_tick().await.unwrap().opened, 1);
    assert!(scheduler.monitor_tick().await.unwrap().is_empty());
}

#[tokio::test]
async fn fatal_open_does_not_stop_the_batch() {
    let paper = paper();
    paper.script(SHORT_PUT, [FillBehavior::Never; 3]);
    paper.script(
        LONG_CALL,
        [FillBehavior::Immediate, FillBehavior::Never, FillBehavior::Never],
    );
    let engine = engine(config(None), &paper);
    let source = VecSource::new(vec![
        structure(Duration::days(10)),
        structure(Duration::days(10)),
    ]);
    let scheduler = Scheduler::new(engine.clone(), source, &ScheduleConfig::default());

    let report = scheduler.open_tick().await.unwrap();
    assert_eq!(report.failed, 1);
    // trading halted behind the flagged position
    assert_eq!(report.rejected, 1);
    assert_eq!(engine.snapshot().await.flagged.len(), 1);
}

#[tokio::test]
async fn run_stops_on_shutdown() {
    let paper = paper();
    let engine = engine(config(None), &paper);
    let source = VecSource::new(vec![structure(Duration::days(10))]);
    let scheduler = Arc::new(Scheduler::new(
        engine.clone(),
        source,
        &ScheduleConfig {
            open_interval_secs: 1,
            monitor_interval_secs: 1,
        },
    ));

    let (tx, rx) = watch::channel(false);
    let handle = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run(rx).await })
    };

    // both intervals fire immediately on the first tick
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    tx.send(true).unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .expect("scheduler did not stop")
        .unwrap();

    let stats = scheduler.stats();
    assert!(stats.open_cycles.load(Ordering::Relaxed) >= 1);
    // the first monitor tick may have found the open cycle holding the lock
    let monitor_ticks = stats.monitor_cycles.load(Ordering::Relaxed)
        + stats.skipped_monitor_ticks.load(Ordering::Relaxed);
    assert!(monitor_ticks >= 1);
    assert_eq!(engine.snapshot().await.open.len(), 1);
}
