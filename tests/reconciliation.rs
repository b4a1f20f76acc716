mod common;

use chrono::Duration;
use common::*;
use condor::domain::PositionState;
use rust_decimal_macros::dec;
use tempfile::TempDir;

/// Open one condor with a state file, then hand back a fresh engine over
/// the same exchange book and file, as after a restart.
async fn restart_with_open_position(dir: &TempDir) -> (condor::PaperExchange, std::sync::Arc<condor::CondorEngine>) {
    let file = dir.path().join("positions.json");
    let paper = paper();
    let first = engine(config(Some(file.clone())), &paper);
    assert!(first
        .try_open(&structure(Duration::days(10)))
        .await
        .unwrap()
        .is_opened());
    drop(first);

    let second = engine(config(Some(file)), &paper);
    (paper, second)
}

#[tokio::test]
async fn fully_held_position_is_restored_with_its_risk() {
    let dir = TempDir::new().unwrap();
    let (_paper, engine) = restart_with_open_position(&dir).await;
    assert_eq!(engine.snapshot().await.committed_risk, dec!(0));

    let report = engine.reconcile().await.unwrap();
    assert_eq!(report.restored.len(), 1);
    assert!(report.flagged.is_empty());
    assert!(report.orphans.is_empty());

    let snapshot = engine.snapshot().await;
    assert_eq!(snapshot.open.len(), 1);
    assert_eq!(snapshot.committed_risk, dec!(500));
    assert!(snapshot.halt_reason.is_none());

    // running it again changes nothing
    let again = engine.reconcile().await.unwrap();
    assert_eq!(again.restored, report.restored);
    assert_eq!(engine.snapshot().await.committed_risk, dec!(500));
}

#[tokio::test]
async fn partially_held_position_is_flagged() {
    let dir = TempDir::new().unwrap();
    let (paper, engine) = restart_with_open_position(&dir).await;
    paper.set_position(LONG_CALL, dec!(0));

    let report = engine.reconcile().await.unwrap();
    assert_eq!(report.flagged.len(), 1);
    assert!(report.restored.is_empty());

    let snapshot = engine.snapshot().await;
    assert!(snapshot.open.is_empty());
    assert_eq!(snapshot.flagged.len(), 1);
    let flagged = &snapshot.flagged[0];
    assert_eq!(flagged.state, PositionState::Closing);
    assert!(!flagged.stuck_instruments.contains(&LONG_CALL.to_string()));
    assert_eq!(flagged.stuck_instruments.len(), 3);
    assert_eq!(snapshot.committed_risk, dec!(500));
    assert!(snapshot.halt_reason.is_some());
}

#[tokio::test]
async fn vanished_position_is_dropped_and_released() {
    let dir = TempDir::new().unwrap();
    let (paper, engine) = restart_with_open_position(&dir).await;
    for instrument in [LONG_PUT, SHORT_PUT, SHORT_CALL, LONG_CALL] {
        paper.set_position(instrument, dec!(0));
    }

    let report = engine.reconcile().await.unwrap();
    assert_eq!(report.dropped.len(), 1);
    let snapshot = engine.snapshot().await;
    assert!(snapshot.open.is_empty());
    assert_eq!(snapshot.committed_risk, dec!(0));
}

#[tokio::test]
async fn untracked_exposure_is_reported() {
    let paper = paper();
    paper.set_position("BTC-IT-90000-C", dec!(-2));
    let engine = engine(config(None), &paper);
    let mut alerts = engine.alerts().subscribe();

    let report = engine.reconcile().await.unwrap();
    assert_eq!(report.orphans.len(), 1);
    assert_eq!(report.orphans[0].instrument, "BTC-IT-90000-C");
    assert_eq!(report.orphans[0].size, dec!(-2));

    let alert = alerts.try_recv().unwrap();
    assert_eq!(alert.level, condor::AlertLevel::Critical);
}

#[tokio::test]
async fn unreachable_exchange_changes_nothing() {
    let dir = TempDir::new().unwrap();
    let (paper, engine) = restart_with_open_position(&dir).await;
    paper.set_unreachable(true);

    assert!(engine.reconcile().await.is_err());
    let snapshot = engine.snapshot().await;
    assert!(snapshot.open.is_empty());
    assert_eq!(snapshot.committed_risk, dec!(0));

    paper.set_unreachable(false);
    assert_eq!(engine.reconcile().await.unwrap().restored.len(), 1);
}

#[tokio::test]
async fn flagged_position_clears_once_flat() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("positions.json");
    let paper = paper();
    paper.script(SHORT_PUT, [condor::exchange::FillBehavior::Never; 3]);
    paper.script(
        LONG_CALL,
        [
            condor::exchange::FillBehavior::Immediate,
            condor::exchange::FillBehavior::Never,
            condor::exchange::FillBehavior::Never,
        ],
    );
    let first = engine(config(Some(file.clone())), &paper);
    assert!(first.try_open(&structure(Duration::days(10))).await.is_err());
    drop(first);

    // still held: restored as flagged, trading stays halted
    let second = engine(config(Some(file.clone())), &paper);
    let report = second.reconcile().await.unwrap();
    assert_eq!(report.still_stuck.len(), 1);
    assert!(second.snapshot().await.halt_reason.is_some());
    drop(second);

    // the operator flattened it by hand
    paper.set_position(LONG_CALL, dec!(0));
    let third = engine(config(Some(file)), &paper);
    let report = third.reconcile().await.unwrap();
    assert_eq!(report.cleared.len(), 1);
    let snapshot = third.snapshot().await;
    assert!(snapshot.flagged.is_empty());
    assert_eq!(snapshot.committed_risk, dec!(0));
    assert!(snapshot.halt_reason.is_none());
}
