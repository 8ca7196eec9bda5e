use brain::core::config::BrainConfig;
use brain::core::error::BrainError;
use brain::core::event_log::MemoryLog;
use brain::core::history::MemoryHistory;
use brain::core::time::{Clock, FixedClock};
use brain::core::workspace::Workspace;
use brain::plugins::identity::Identity;
use brain::plugins::receipts::{self, Freshness};
use chrono::{Duration, TimeZone, Utc};
use tempfile::tempdir;

fn setup(root: &std::path::Path) -> (Workspace, Identity, MemoryHistory, FixedClock) {
    let history = MemoryHistory::new();
    let clock = FixedClock::at(Utc.with_ymd_and_hms(2025, 12, 3, 12, 0, 0).unwrap());
    let ws = Workspace::with_backends(
        root,
        BrainConfig::default(),
        Box::new(history.clone()),
        Box::new(MemoryLog::new()),
        Box::new(clock.clone()),
    );
    let me = Identity::new("alice", "red", "joy", clock.now());
    (ws, me, history, clock)
}

#[test]
fn test_no_receipt_is_missing() {
    let tmp = tempdir().unwrap();
    let (ws, me, _, clock) = setup(tmp.path());
    assert_eq!(receipts::latest(&ws, &me).unwrap(), None);
    assert_eq!(
        receipts::freshness(&ws, &me, clock.now(), Duration::hours(24)).unwrap(),
        Freshness::Missing
    );
}

#[test]
fn test_max_age_boundary_is_inclusive() {
    let tmp = tempdir().unwrap();
    let (ws, me, history, clock) = setup(tmp.path());
    let head = history.advance_head();
    let receipt = receipts::post(&ws, &me, &head).unwrap();
    let max_age = ws.config.receipt_max_age();

    clock.advance(Duration::hours(24));
    assert_eq!(
        receipts::freshness(&ws, &me, clock.now(), max_age).unwrap(),
        Freshness::Fresh(receipt.clone())
    );

    clock.advance(Duration::seconds(1));
    match receipts::freshness(&ws, &me, clock.now(), max_age).unwrap() {
        Freshness::Stale { receipt: stale, age } => {
            assert_eq!(stale, receipt);
            assert_eq!(age, Duration::hours(24) + Duration::seconds(1));
        }
        other => panic!("expected stale receipt, got {:?}", other),
    }
    assert!(!receipts::is_fresh(&ws, &me, clock.now(), max_age).unwrap());
}

#[test]
fn test_newest_receipt_wins() {
    let tmp = tempdir().unwrap();
    let (ws, me, history, clock) = setup(tmp.path());
    let first = history.advance_head();
    receipts::post(&ws, &me, &first).unwrap();
    clock.advance(Duration::hours(30));
    let second = history.advance_head();
    receipts::post(&ws, &me, &second).unwrap();

    let latest = receipts::latest(&ws, &me).unwrap().unwrap();
    assert_eq!(latest.up_to_commit, second);
    assert!(receipts::is_fresh(&ws, &me, clock.now(), Duration::hours(24)).unwrap());
}

#[test]
fn test_receipt_for_foreign_commit_does_not_count() {
    let tmp = tempdir().unwrap();
    let (ws, me, history, clock) = setup(tmp.path());
    let base = history.advance_head();
    let elsewhere = history.add_commit(&[&base]);
    receipts::post(&ws, &me, &elsewhere).unwrap();

    let state = receipts::freshness(&ws, &me, clock.now(), Duration::hours(24)).unwrap();
    assert!(matches!(state, Freshness::UnknownCommit(_)));
    assert!(matches!(
        state.to_error(Duration::hours(24)),
        Some(BrainError::MissingReceipt)
    ));

    // Once HEAD contains the commit the same receipt is accepted.
    history.checkout(&elsewhere);
    assert!(receipts::is_fresh(&ws, &me, clock.now(), Duration::hours(24)).unwrap());
}

#[test]
fn test_other_participants_receipts_are_ignored() {
    let tmp = tempdir().unwrap();
    let (ws, me, history, clock) = setup(tmp.path());
    let head = history.advance_head();
    let bob = Identity::new("bob", "blue", "calm", clock.now());
    receipts::post(&ws, &bob, &head).unwrap();

    assert_eq!(receipts::latest(&ws, &me).unwrap(), None);
    assert!(receipts::latest(&ws, &bob).unwrap().is_some());
}
