use brain::core::config::BrainConfig;
use brain::core::error::BrainError;
use brain::core::event::EventKind;
use brain::core::event_log::{MemoryLog, Replay};
use brain::core::history::{History, MemoryHistory};
use brain::core::time::{Clock, FixedClock};
use brain::core::workspace::Workspace;
use brain::plugins::identity::{self, COLORS, EMOTIONS};
use brain::plugins::keys::KeyStore;
use chrono::{Duration, TimeZone, Utc};
use rand_core::{OsRng, RngCore};
use std::fs;
use tempfile::tempdir;

/// Replays a fixed sequence of draws, then repeats the last one.
struct ScriptedRng {
    values: Vec<u32>,
    pos: usize,
}

impl ScriptedRng {
    fn new(values: &[u32]) -> Self {
        Self {
            values: values.to_vec(),
            pos: 0,
        }
    }
}

impl RngCore for ScriptedRng {
    fn next_u32(&mut self) -> u32 {
        let v = self.values[self.pos.min(self.values.len() - 1)];
        self.pos += 1;
        v
    }

    fn next_u64(&mut self) -> u64 {
        self.next_u32() as u64
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        dest.fill(0);
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

fn workspace(root: &std::path::Path) -> (Workspace, MemoryHistory, MemoryLog, FixedClock) {
    let history = MemoryHistory::new();
    let log = MemoryLog::new();
    let clock = FixedClock::at(Utc.with_ymd_and_hms(2025, 12, 3, 12, 0, 0).unwrap());
    let ws = Workspace::with_backends(
        root,
        BrainConfig::default(),
        Box::new(history.clone()),
        Box::new(log.clone()),
        Box::new(clock.clone()),
    );
    (ws, history, log, clock)
}

#[test]
fn test_create_generates_and_publishes_keys() {
    let tmp = tempdir().unwrap();
    let (ws, history, _, clock) = workspace(tmp.path());

    let me = identity::create(&ws, "Alice", &mut ScriptedRng::new(&[0, 0])).unwrap();
    assert_eq!(me.short_name, "alice");
    assert_eq!(me.full_id, format!("alice-{}-{}", COLORS[0], EMOTIONS[0]));
    assert!(me.has_keys);
    assert_eq!(me.created_at, clock.now());
    assert_eq!(me.schema_version, identity::SCHEMA_VERSION);

    let fingerprint = me.public_key_fingerprint.clone().unwrap();
    let published = identity::resolve(&ws, &me.full_id).unwrap();
    assert_eq!(brain::plugins::keys::fingerprint(&published), fingerprint);

    let staged = history.staged_paths().unwrap();
    assert_eq!(
        staged,
        vec![format!(".brain/keys/public/{}.pem", me.full_id)]
    );
    assert!(ws.keys.private_path(&me.full_id).exists());
    assert_eq!(identity::current(&ws).unwrap(), me);
}

#[cfg(unix)]
#[test]
fn test_secret_files_are_owner_only() {
    use std::os::unix::fs::PermissionsExt;
    let tmp = tempdir().unwrap();
    let (ws, _, _, _) = workspace(tmp.path());
    let me = identity::create(&ws, "alice", &mut OsRng).unwrap();

    let self_mode = fs::metadata(&ws.paths.self_file).unwrap().permissions().mode();
    assert_eq!(self_mode & 0o777, 0o600);
    let key_mode = fs::metadata(ws.keys.private_path(&me.full_id))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(key_mode & 0o777, 0o600);
}

#[test]
fn test_create_refuses_second_identity() {
    let tmp = tempdir().unwrap();
    let (ws, _, _, _) = workspace(tmp.path());
    identity::create(&ws, "alice", &mut OsRng).unwrap();
    let err = identity::create(&ws, "bob", &mut OsRng).unwrap_err();
    assert!(matches!(err, BrainError::ValidationError(_)));
}

#[test]
fn test_create_rejects_bad_names() {
    let tmp = tempdir().unwrap();
    let (ws, _, _, _) = workspace(tmp.path());
    let err = identity::create(&ws, "9lives", &mut OsRng).unwrap_err();
    assert!(matches!(err, BrainError::InvalidName(_)));
    assert!(!ws.paths.self_file.exists());
}

#[test]
fn test_create_redraws_around_taken_ids() {
    let tmp = tempdir().unwrap();
    let (ws, _, log, _) = workspace(tmp.path());
    let taken = format!("alice-{}-{}", COLORS[0], EMOTIONS[0]);
    log.push_raw(&taken, "{}");

    let me = identity::create(&ws, "alice", &mut ScriptedRng::new(&[0, 0, 1, 2])).unwrap();
    assert_eq!(me.full_id, format!("alice-{}-{}", COLORS[1], EMOTIONS[2]));
}

#[test]
fn test_create_gives_up_after_max_draws() {
    let tmp = tempdir().unwrap();
    let (mut ws, _, log, _) = workspace(tmp.path());
    ws.config.identity_max_draws = 4;
    log.push_raw(&format!("alice-{}-{}", COLORS[0], EMOTIONS[0]), "{}");

    let err = identity::create(&ws, "alice", &mut ScriptedRng::new(&[0])).unwrap_err();
    match err {
        BrainError::IdentityCollision {
            short_name,
            attempts,
        } => {
            assert_eq!(short_name, "alice");
            assert_eq!(attempts, 4);
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(!ws.paths.self_file.exists());
}

#[test]
fn test_keyless_fallback_writes_unsigned_events() {
    let tmp = tempdir().unwrap();
    let (mut ws, history, _, _) = workspace(tmp.path());
    ws.keys = KeyStore::with_backends(&ws.paths, Vec::new());

    let me = identity::create(&ws, "carol", &mut OsRng).unwrap();
    assert!(!me.has_keys);
    assert!(me.public_key_fingerprint.is_none());
    assert!(history.staged_paths().unwrap().is_empty());

    let event = ws
        .append(
            &me,
            EventKind::Message {
                body: "no keys here".to_string(),
                to: None,
                head_commit: None,
            },
        )
        .unwrap();
    assert!(event.sig.is_none());
    assert!(matches!(
        identity::resolve(&ws, &me.full_id),
        Err(BrainError::NotFound(_))
    ));
}

#[test]
fn test_corrupt_identity_file_reads_as_missing() {
    let tmp = tempdir().unwrap();
    let (ws, _, _, _) = workspace(tmp.path());
    assert!(matches!(identity::current(&ws), Err(BrainError::MissingIdentity)));

    fs::create_dir_all(&ws.paths.brain_dir).unwrap();
    fs::write(&ws.paths.self_file, "{ truncated").unwrap();
    assert!(matches!(identity::current(&ws), Err(BrainError::MissingIdentity)));

    fs::write(&ws.paths.self_file, r#"{"short_name": "alice"}"#).unwrap();
    assert!(matches!(identity::current(&ws), Err(BrainError::MissingIdentity)));
}

#[test]
fn test_rotation_keeps_old_signatures_verifiable() {
    let tmp = tempdir().unwrap();
    let (ws, history, _, clock) = workspace(tmp.path());
    let me = identity::create(&ws, "alice", &mut OsRng).unwrap();
    let body = |text: &str| EventKind::Message {
        body: text.to_string(),
        to: None,
        head_commit: None,
    };
    ws.append(&me, body("before rotation")).unwrap();

    clock.advance(Duration::hours(1));
    let rotated = identity::rotate_keys(&ws, &me).unwrap();
    assert_ne!(rotated.public_key_fingerprint, me.public_key_fingerprint);
    assert!(rotated.keys_rotated_at.is_some());
    assert_eq!(rotated.full_id, me.full_id);
    assert_eq!(identity::current(&ws).unwrap(), rotated);
    assert!(
        history
            .staged_paths()
            .unwrap()
            .contains(&format!(".brain/keys/public/{}.2.pem", me.full_id))
    );

    ws.append(&rotated, body("after rotation")).unwrap();
    assert_eq!(ws.public_keys(&me.full_id).len(), 2);

    let report = ws.log.verify(&|id| ws.public_keys(id)).unwrap();
    assert_eq!(report.verified, 2);
    assert!(report.is_clean());
    assert_eq!(ws.log.events(Replay::All).unwrap().len(), 2);
}
