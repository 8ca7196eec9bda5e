use brain::core::config::BrainConfig;
use brain::core::event::EventKind;
use brain::core::event_log::{MemoryLog, Replay};
use brain::core::history::MemoryHistory;
use brain::core::time::FixedClock;
use brain::core::workspace::{UNKNOWN_AUTHOR, Workspace};
use brain::plugins::gate::{self, AllowReason, Decision, DenyReason, GatePolicy};
use brain::plugins::identity::{self, Identity};
use brain::plugins::keys::KeyStore;
use brain::plugins::receipts;
use chrono::{Duration, TimeZone, Utc};
use rand_core::OsRng;
use std::fs;
use tempfile::{TempDir, tempdir};

struct Repo {
    _tmp: TempDir,
    ws: Workspace,
    history: MemoryHistory,
    clock: FixedClock,
}

fn repo() -> Repo {
    let tmp = tempdir().unwrap();
    let history = MemoryHistory::new();
    history.advance_head();
    let clock = FixedClock::at(Utc.with_ymd_and_hms(2025, 12, 3, 12, 0, 0).unwrap());
    let mut ws = Workspace::with_backends(
        tmp.path(),
        BrainConfig::default(),
        Box::new(history.clone()),
        Box::new(MemoryLog::new()),
        Box::new(clock.clone()),
    );
    ws.keys = KeyStore::with_backends(&ws.paths, Vec::new());
    Repo {
        _tmp: tmp,
        ws,
        history,
        clock,
    }
}

fn init_with_receipt(repo: &Repo) -> Identity {
    let me = identity::create(&repo.ws, "alice", &mut OsRng).unwrap();
    let head = repo.history.advance_head();
    receipts::post(&repo.ws, &me, &head).unwrap();
    me
}

#[test]
fn test_denies_without_identity() {
    let repo = repo();
    repo.history.stage_paths(&["src/lib.rs"]);
    assert_eq!(
        gate::run_pre_commit(&repo.ws, None).unwrap(),
        Decision::Deny(vec![DenyReason::MissingIdentity, DenyReason::MissingReceipt])
    );
}

#[test]
fn test_denies_without_receipt() {
    let repo = repo();
    identity::create(&repo.ws, "alice", &mut OsRng).unwrap();
    repo.history.stage_paths(&["src/lib.rs"]);
    assert_eq!(
        gate::run_pre_commit(&repo.ws, None).unwrap(),
        Decision::Deny(vec![DenyReason::MissingReceipt])
    );
}

#[test]
fn test_allows_with_fresh_receipt_then_denies_when_stale() {
    let repo = repo();
    init_with_receipt(&repo);
    repo.history.stage_paths(&["src/lib.rs", "docs/notes.md"]);
    assert_eq!(
        gate::run_pre_commit(&repo.ws, None).unwrap(),
        Decision::Allow(AllowReason::Checked)
    );

    repo.clock.advance(Duration::hours(25));
    assert_eq!(
        gate::run_pre_commit(&repo.ws, None).unwrap(),
        Decision::Deny(vec![DenyReason::StaleReceipt {
            age_hours: 25,
            max_age_hours: 24,
        }])
    );
}

#[test]
fn test_docs_only_commit_is_exempt() {
    let repo = repo();
    repo.history
        .stage_paths(&["README.md", "docs/guide/setup.txt", "crates/x/CHANGES.md"]);
    assert_eq!(
        gate::run_pre_commit(&repo.ws, None).unwrap(),
        Decision::Allow(AllowReason::ExemptPaths)
    );
}

#[test]
fn test_configured_exemptions_replace_defaults() {
    let mut repo = repo();
    repo.ws.config.gate.exempt_paths = vec!["notes/**".to_string()];
    repo.history.stage_paths(&["README.md"]);
    assert!(!gate::run_pre_commit(&repo.ws, None).unwrap().is_allow());

    let policy = GatePolicy::from_config(&repo.ws.config).unwrap();
    assert!(policy.is_exempt("notes/2025/dec.txt"));
}

#[test]
fn test_bypass_is_audited_under_unknown_author() {
    let repo = repo();
    repo.history.stage_paths(&["src/main.rs"]);

    let decision = gate::run_pre_commit(&repo.ws, Some("prod is down")).unwrap();
    assert_eq!(decision, Decision::Allow(AllowReason::Bypass));

    let audit = repo.ws.log.events(Replay::From(UNKNOWN_AUTHOR)).unwrap();
    assert_eq!(audit.len(), 1);
    match &audit[0].kind {
        EventKind::GateBypass { paths, reason } => {
            assert_eq!(paths, &vec!["src/main.rs".to_string()]);
            assert_eq!(reason.as_deref(), Some("prod is down"));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_bypass_by_identity_is_audited_in_its_stream() {
    let repo = repo();
    let me = identity::create(&repo.ws, "alice", &mut OsRng).unwrap();
    repo.history.stage_paths(&["src/main.rs"]);

    assert!(gate::run_pre_commit(&repo.ws, Some("1")).unwrap().is_allow());
    let audit = repo.ws.log.events(Replay::From(&me.full_id)).unwrap();
    assert!(matches!(
        &audit[0].kind,
        EventKind::GateBypass { reason: None, .. }
    ));
}

#[test]
fn test_blank_bypass_value_is_ignored() {
    let repo = repo();
    repo.history.stage_paths(&["src/main.rs"]);
    assert!(!gate::run_pre_commit(&repo.ws, Some("  ")).unwrap().is_allow());
    assert!(repo.ws.log.events(Replay::All).unwrap().is_empty());
}

#[test]
fn test_unreadable_identity_fails_closed() {
    let repo = repo();
    init_with_receipt(&repo);
    repo.history.stage_paths(&["src/lib.rs"]);

    // A directory where the identity file should be cannot be read.
    fs::remove_file(&repo.ws.paths.self_file).unwrap();
    fs::create_dir_all(&repo.ws.paths.self_file).unwrap();

    match gate::run_pre_commit(&repo.ws, None).unwrap() {
        Decision::Deny(reasons) => {
            assert!(matches!(reasons[0], DenyReason::UnreadableState(_)));
            assert!(reasons.contains(&DenyReason::MissingIdentity));
        }
        other => panic!("expected deny, got {:?}", other),
    }
}
