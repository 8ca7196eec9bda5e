//! Per-invocation protocol context.
//!
//! A [`Workspace`] owns every backend an operation needs: configuration, version-control
//! history, the event log, the key store and the clock. Production code opens one over the
//! current git checkout; tests assemble one from in-memory parts.

use crate::core::config::{BrainConfig, ProtocolPaths, find_repo_root};
use crate::core::error::BrainError;
use crate::core::event::{Event, EventKind};
use crate::core::event_log::{EventLog, FileLog, LogBackend, Replay};
use crate::core::history::{GitHistory, History};
use crate::core::time::{Clock, SystemClock};
use crate::plugins::identity::Identity;
use crate::plugins::keys::{self, KeyStore};
use chrono::{DateTime, Duration, Utc};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Stream used for audit records written when no identity exists.
pub const UNKNOWN_AUTHOR: &str = "unknown";

pub struct Workspace {
    pub config: BrainConfig,
    pub paths: ProtocolPaths,
    pub history: Box<dyn History>,
    pub log: EventLog,
    pub keys: KeyStore,
    clock: Box<dyn Clock>,
}

impl Workspace {
    /// Open the checkout containing `cwd`, backed by git and the on-disk log.
    pub fn open(cwd: &Path) -> Result<Self, BrainError> {
        let root = find_repo_root(cwd)?;
        let config = BrainConfig::load(&root)?;
        let paths = ProtocolPaths::new(&root, &config);
        debug!(root = %root.display(), "opened workspace");
        Ok(Self {
            history: Box::new(GitHistory::new(&root)),
            log: EventLog::new(Box::new(FileLog::new(&paths.events_dir))),
            keys: KeyStore::new(&paths),
            clock: Box::new(SystemClock),
            config,
            paths,
        })
    }

    pub fn with_backends(
        root: &Path,
        config: BrainConfig,
        history: Box<dyn History>,
        log: Box<dyn LogBackend>,
        clock: Box<dyn Clock>,
    ) -> Self {
        let paths = ProtocolPaths::new(root, &config);
        Self {
            keys: KeyStore::new(&paths),
            history,
            log: EventLog::new(log),
            clock,
            config,
            paths,
        }
    }

    pub fn root(&self) -> &Path {
        &self.paths.repo_root
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Stage files so they land in the next commit.
    pub fn stage(&self, files: &[PathBuf]) -> Result<(), BrainError> {
        let relative: Vec<PathBuf> = files
            .iter()
            .map(|f| PathBuf::from(self.paths.relative(f)))
            .collect();
        self.history.stage(&relative)
    }

    /// Record `kind` as authored by `identity`, signed when a private key is present.
    pub fn append(&self, identity: &Identity, kind: EventKind) -> Result<Event, BrainError> {
        let event = self.build_event(identity, kind)?;
        self.append_event(&event)?;
        Ok(event)
    }

    /// Stamp and sign an event without writing it anywhere.
    ///
    /// The stamp never goes backwards within the author's own stream: a clock that stepped
    /// back is clamped to one microsecond after the author's latest record.
    pub fn build_event(&self, identity: &Identity, kind: EventKind) -> Result<Event, BrainError> {
        let ts = self.next_stamp(&identity.full_id)?;
        let mut event = Event::new(&identity.full_id, ts, kind);
        match self.signing_key(identity)? {
            Some(private_pem) => {
                let payload = event.signing_payload()?;
                event.sig = Some(keys::sign(&private_pem, payload.as_bytes())?);
            }
            None => warn!(
                from = %identity.full_id,
                kind = event.kind.type_name(),
                "writing unsigned event: identity has no keys"
            ),
        }
        Ok(event)
    }

    /// Append an already built event and stage its stream.
    pub fn append_event(&self, event: &Event) -> Result<(), BrainError> {
        if let Some(path) = self.log.append(event)? {
            self.stage(&[path])?;
        }
        Ok(())
    }

    fn next_stamp(&self, full_id: &str) -> Result<DateTime<Utc>, BrainError> {
        let now = self.now();
        let last = self
            .log
            .events(Replay::From(full_id))?
            .into_iter()
            .filter(|e| e.from == full_id)
            .map(|e| e.ts)
            .max();
        match last {
            Some(last) if last >= now => {
                let clamped = last + Duration::microseconds(1);
                debug!(from = full_id, %now, %clamped, "clock behind own stream; clamping stamp");
                Ok(clamped)
            }
            _ => Ok(now),
        }
    }

    fn signing_key(&self, identity: &Identity) -> Result<Option<String>, BrainError> {
        if !identity.has_keys {
            return Ok(None);
        }
        self.keys.load_private(&identity.full_id)
    }

    /// Every published public key of `full_id`, oldest first.
    pub fn public_keys(&self, full_id: &str) -> Vec<String> {
        self.keys.public_keys(full_id).unwrap_or_default()
    }
}
