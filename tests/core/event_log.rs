use brain::core::event::{Event, EventKind};
use brain::core::event_log::{EventLog, FileLog, LogBackend, MemoryLog, Replay, record_id};
use brain::plugins::keys::{self, DalekBackend, KeyBackend};
use chrono::{DateTime, TimeZone, Utc};
use std::fs;
use tempfile::tempdir;

fn at(secs: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 12, 3, 12, 0, secs).unwrap()
}

fn message(from: &str, secs: u32, body: &str) -> Event {
    Event::new(
        from,
        at(secs),
        EventKind::Message {
            body: body.to_string(),
            to: None,
            head_commit: None,
        },
    )
}

fn signed(private_pem: &str, mut event: Event) -> Event {
    let payload = event.signing_payload().unwrap();
    event.sig = Some(keys::sign(private_pem, payload.as_bytes()).unwrap());
    event
}

#[test]
fn test_union_merged_stream_replays_each_record_once() {
    let tmp = tempdir().unwrap();
    let log = EventLog::new(Box::new(FileLog::new(tmp.path())));
    log.append(&message("alice-red-joy", 0, "base")).unwrap();

    // Both sides of a union merge carry the common prefix; git keeps both copies.
    let path = tmp.path().join("alice-red-joy.jsonl");
    let base = fs::read_to_string(&path).unwrap();
    let theirs = message("alice-red-joy", 2, "theirs").to_line().unwrap();
    fs::write(&path, format!("{}{}{}\n", base, base, theirs)).unwrap();
    log.append(&message("alice-red-joy", 1, "ours")).unwrap();

    let bodies: Vec<String> = log
        .events(Replay::All)
        .unwrap()
        .into_iter()
        .map(|e| match e.kind {
            EventKind::Message { body, .. } => body,
            other => panic!("unexpected {:?}", other),
        })
        .collect();
    assert_eq!(bodies, vec!["base", "theirs", "ours"]);
}

#[test]
fn test_merge_from_is_idempotent() {
    let ours = EventLog::new(Box::new(MemoryLog::new()));
    let theirs = EventLog::new(Box::new(MemoryLog::new()));
    ours.append(&message("alice-red-joy", 0, "hi")).unwrap();
    theirs.append(&message("alice-red-joy", 0, "hi")).unwrap();
    theirs.append(&message("bob-blue-calm", 1, "hello")).unwrap();

    let (added, touched) = ours.merge_from(&theirs).unwrap();
    assert_eq!(added, 1);
    assert!(touched.is_empty());
    assert_eq!(ours.events(Replay::All).unwrap().len(), 2);

    let (again, _) = ours.merge_from(&theirs).unwrap();
    assert_eq!(again, 0);
}

#[test]
fn test_merge_into_files_reports_touched_streams() {
    let tmp = tempdir().unwrap();
    let ours = EventLog::new(Box::new(FileLog::new(tmp.path())));
    let theirs = EventLog::new(Box::new(MemoryLog::new()));
    theirs.append(&message("bob-blue-calm", 0, "a")).unwrap();
    theirs.append(&message("bob-blue-calm", 1, "b")).unwrap();

    let (added, touched) = ours.merge_from(&theirs).unwrap();
    assert_eq!(added, 2);
    assert_eq!(touched, vec![tmp.path().join("bob-blue-calm.jsonl")]);
}

#[test]
fn test_malformed_lines_are_skipped() {
    let backend = MemoryLog::new();
    let log = EventLog::new(Box::new(backend.clone()));
    log.append(&message("alice-red-joy", 0, "good")).unwrap();
    backend.push_raw("alice-red-joy", "{not json");
    backend.push_raw("alice-red-joy", "");
    backend.push_raw("alice-red-joy", r#"{"from":"alice-red-joy","ts":"2025-12-03T12:00:05Z","type":"teleport"}"#);
    log.append(&message("alice-red-joy", 9, "also good")).unwrap();

    assert_eq!(log.events(Replay::All).unwrap().len(), 2);
}

#[test]
fn test_replay_from_reads_one_stream() {
    let log = EventLog::new(Box::new(MemoryLog::new()));
    log.append(&message("alice-red-joy", 0, "a")).unwrap();
    log.append(&message("bob-blue-calm", 1, "b")).unwrap();

    let from_bob = log.events(Replay::From("bob-blue-calm")).unwrap();
    assert_eq!(from_bob.len(), 1);
    assert_eq!(from_bob[0].from, "bob-blue-calm");
    assert!(log.events(Replay::From("nobody-red-joy")).unwrap().is_empty());
}

#[test]
fn test_records_are_identified_by_content() {
    let log = EventLog::new(Box::new(MemoryLog::new()));
    let event = message("alice-red-joy", 0, "a");
    log.append(&event).unwrap();
    let records = log.records(Replay::All).unwrap();
    assert_eq!(records[0].id, record_id(&event.to_line().unwrap()));
    assert_eq!(records[0].stream, "alice-red-joy");
}

#[test]
fn test_stream_names_cannot_escape_the_directory() {
    let tmp = tempdir().unwrap();
    let backend = FileLog::new(tmp.path());
    assert!(backend.stream_path("../evil").is_err());
    assert!(backend.stream_path(".hidden").is_err());
    assert!(backend.stream_path("").is_err());
    assert!(backend.append("a\\b", "{}").is_err());
}

#[test]
fn test_verify_classifies_records() {
    let alice = DalekBackend.generate().unwrap();
    let mallory = DalekBackend.generate().unwrap();
    let backend = MemoryLog::new();
    let log = EventLog::new(Box::new(backend.clone()));

    log.append(&signed(&alice.private_pem, message("alice-red-joy", 0, "genuine")))
        .unwrap();
    log.append(&message("alice-red-joy", 1, "unsigned")).unwrap();
    log.append(&signed(&mallory.private_pem, message("alice-red-joy", 2, "forged")))
        .unwrap();

    let mut tampered = signed(&alice.private_pem, message("alice-red-joy", 3, "original"));
    tampered.kind = EventKind::Message {
        body: "edited".to_string(),
        to: None,
        head_commit: None,
    };
    log.append(&tampered).unwrap();

    // A genuine record copied into someone else's stream does not count for them.
    let genuine = signed(&alice.private_pem, message("alice-red-joy", 4, "moved"));
    backend.push_raw("bob-blue-calm", &genuine.to_line().unwrap());

    let public = alice.public_pem.clone();
    let report = log
        .verify(&|id| {
            if id == "alice-red-joy" {
                vec![public.clone()]
            } else {
                Vec::new()
            }
        })
        .unwrap();

    assert_eq!(report.verified, 1);
    assert_eq!(report.unsigned, 1);
    assert_eq!(report.invalid.len(), 3);
    assert!(report.invalid.iter().any(|(stream, _)| stream == "bob-blue-calm"));
    assert!(!report.is_clean());
}

#[test]
fn test_verify_accepts_any_published_key_version() {
    let old = DalekBackend.generate().unwrap();
    let new = DalekBackend.generate().unwrap();
    let log = EventLog::new(Box::new(MemoryLog::new()));
    log.append(&signed(&old.private_pem, message("alice-red-joy", 0, "before")))
        .unwrap();
    log.append(&signed(&new.private_pem, message("alice-red-joy", 1, "after")))
        .unwrap();

    let published = vec![old.public_pem.clone(), new.public_pem.clone()];
    let report = log.verify(&|_| published.clone()).unwrap();
    assert_eq!(report.verified, 2);
    assert!(report.is_clean());
}

#[test]
fn test_verify_accepts_fields_from_newer_writers() {
    let alice = DalekBackend.generate().unwrap();
    let backend = MemoryLog::new();
    let log = EventLog::new(Box::new(backend.clone()));

    let mut record: serde_json::Value =
        serde_json::from_str(&message("alice-red-joy", 0, "from the future").to_line().unwrap())
            .unwrap();
    record["client"] = serde_json::json!("v9");
    let unsigned = record.to_string();
    let payload = Event::raw_signing_payload(&unsigned).unwrap();
    record["sig"] = serde_json::json!(keys::sign(&alice.private_pem, payload.as_bytes()).unwrap());
    backend.push_raw("alice-red-joy", &record.to_string());

    // Dropping the extra field breaks the signature.
    record.as_object_mut().unwrap().remove("client");
    backend.push_raw("alice-red-joy", &record.to_string());

    let public = alice.public_pem.clone();
    let report = log.verify(&|_| vec![public.clone()]).unwrap();
    assert_eq!(report.verified, 1);
    assert_eq!(report.invalid.len(), 1);
}

#[test]
fn test_invalid_utf8_line_does_not_block_replay() {
    let tmp = tempdir().unwrap();
    let log = EventLog::new(Box::new(FileLog::new(tmp.path())));
    log.append(&message("alice-red-joy", 0, "claiming")).unwrap();
    log.append(&message("bob-blue-calm", 1, "before")).unwrap();

    let bob = tmp.path().join("bob-blue-calm.jsonl");
    let mut bytes = fs::read(&bob).unwrap();
    bytes.extend_from_slice(b"\xff\xfe garbage\n");
    bytes.extend_from_slice(message("bob-blue-calm", 2, "after").to_line().unwrap().as_bytes());
    bytes.push(b'\n');
    fs::write(&bob, bytes).unwrap();

    let events = log.events(Replay::All).unwrap();
    assert_eq!(events.len(), 3);
    assert_eq!(log.events(Replay::From("bob-blue-calm")).unwrap().len(), 2);
}
