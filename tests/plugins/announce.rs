use brain::core::config::BrainConfig;
use brain::core::error::BrainError;
use brain::core::event::{Event, EventKind};
use brain::core::event_log::{MemoryLog, Replay};
use brain::core::history::MemoryHistory;
use brain::core::time::{Clock, FixedClock};
use brain::core::workspace::Workspace;
use brain::plugins::announce::{self, MemorySharedRef, PublishOutcome, SharedRef, Snapshot};
use brain::plugins::identity::Identity;
use chrono::{Duration, TimeZone, Utc};
use std::cell::Cell;
use tempfile::tempdir;

fn setup(root: &std::path::Path) -> (Workspace, Identity, FixedClock) {
    let history = MemoryHistory::new();
    history.advance_head();
    let clock = FixedClock::at(Utc.with_ymd_and_hms(2025, 12, 3, 12, 0, 0).unwrap());
    let ws = Workspace::with_backends(
        root,
        BrainConfig::default(),
        Box::new(history),
        Box::new(MemoryLog::new()),
        Box::new(clock.clone()),
    );
    let me = Identity::new("alice", "red", "joy", clock.now());
    (ws, me, clock)
}

/// Lets a rival publish first on the next `races` attempts.
struct Contended {
    inner: MemorySharedRef,
    races: Cell<u32>,
    rival: Event,
}

impl Contended {
    fn new(inner: MemorySharedRef, races: u32) -> Self {
        let rival = Event::new(
            "bob-blue-calm",
            Utc.with_ymd_and_hms(2025, 12, 3, 11, 0, 0).unwrap(),
            EventKind::Announce {
                body: "rival".to_string(),
                source_branch: None,
                head_commit: None,
            },
        );
        Self {
            inner,
            races: Cell::new(races),
            rival,
        }
    }
}

impl SharedRef for Contended {
    fn fetch(&self) -> Result<Snapshot, BrainError> {
        self.inner.fetch()
    }

    fn publish(
        &self,
        base: Option<&str>,
        contents: &str,
        message: &str,
    ) -> Result<PublishOutcome, BrainError> {
        if self.races.get() > 0 {
            self.races.set(self.races.get() - 1);
            let current = self.inner.fetch()?;
            let mut rival = current.contents;
            rival.push_str(&self.rival.to_line()?);
            rival.push('\n');
            self.inner
                .publish(current.tip.as_deref(), &rival, "announce: bob: rival")?;
        }
        self.inner.publish(base, contents, message)
    }
}

fn bodies(events: &[Event]) -> Vec<String> {
    events
        .iter()
        .map(|e| match &e.kind {
            EventKind::Announce { body, .. } => body.clone(),
            other => panic!("unexpected {:?}", other),
        })
        .collect()
}

#[test]
fn test_announce_publishes_without_touching_local_log() {
    let tmp = tempdir().unwrap();
    let (ws, me, _) = setup(tmp.path());
    let shared = MemorySharedRef::new();

    let event = announce::announce(&ws, &shared, &me, "  deploy freeze at 17:00 ").unwrap();
    assert_eq!(event.from, "alice-red-joy");
    match &event.kind {
        EventKind::Announce {
            body,
            source_branch,
            head_commit,
        } => {
            assert_eq!(body, "deploy freeze at 17:00");
            assert_eq!(source_branch.as_deref(), Some("main"));
            assert!(head_commit.is_some());
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(ws.log.events(Replay::All).unwrap().is_empty());
    assert_eq!(shared.contents(), format!("{}\n", event.to_line().unwrap()));
}

#[test]
fn test_empty_announcement_is_rejected() {
    let tmp = tempdir().unwrap();
    let (ws, me, _) = setup(tmp.path());
    let shared = MemorySharedRef::new();
    let err = announce::announce(&ws, &shared, &me, "   ").unwrap_err();
    assert!(matches!(err, BrainError::ValidationError(_)));
    assert_eq!(shared.contents(), "");
}

#[test]
fn test_lost_race_is_retried_on_top_of_the_winner() {
    let tmp = tempdir().unwrap();
    let (ws, me, _) = setup(tmp.path());
    let shared = MemorySharedRef::new();
    let contended = Contended::new(shared.clone(), 1);

    announce::announce(&ws, &contended, &me, "mine").unwrap();

    // A third participant that only reads the ref sees both, newest first.
    let listener = shared.clone();
    let seen = announce::listen(&listener, 10).unwrap();
    assert_eq!(bodies(&seen), vec!["mine", "rival"]);
}

#[test]
fn test_retries_are_bounded() {
    let tmp = tempdir().unwrap();
    let (ws, me, _) = setup(tmp.path());
    let contended = Contended::new(MemorySharedRef::new(), u32::MAX);

    match announce::announce(&ws, &contended, &me, "never lands").unwrap_err() {
        BrainError::AnnouncePushExhausted { attempts } => {
            assert_eq!(attempts, ws.config.announce_max_attempts);
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn test_listen_orders_and_limits() {
    let tmp = tempdir().unwrap();
    let (ws, me, clock) = setup(tmp.path());
    let shared = MemorySharedRef::new();
    for body in ["one", "two", "three"] {
        announce::announce(&ws, &shared, &me, body).unwrap();
        clock.advance(Duration::minutes(1));
    }

    assert_eq!(bodies(&announce::listen(&shared, 2).unwrap()), vec!["three", "two"]);
    assert_eq!(announce::listen(&shared, 10).unwrap().len(), 3);
    assert!(announce::listen(&MemorySharedRef::new(), 10).unwrap().is_empty());
}

#[test]
fn test_listen_skips_malformed_lines() {
    let shared = MemorySharedRef::new();
    let good = Event::new(
        "bob-blue-calm",
        Utc.with_ymd_and_hms(2025, 12, 3, 12, 0, 0).unwrap(),
        EventKind::Announce {
            body: "hello".to_string(),
            source_branch: None,
            head_commit: None,
        },
    );
    let contents = format!("garbage\n{}\n\n", good.to_line().unwrap());
    shared.publish(None, &contents, "seed").unwrap();

    assert_eq!(announce::listen(&shared, 10).unwrap(), vec![good]);
}
