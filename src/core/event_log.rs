//! Append-only event log.
//!
//! The log is a set of streams, one per author, each an ordered list of JSON lines. Lines are
//! only ever appended; replay reads every stream in lexical order and drops duplicate
//! records, so the union of two copies of a log replays the same as either copy after a merge.

use crate::core::error::BrainError;
use crate::core::event::Event;
use sha2::{Digest, Sha256};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::warn;

const STREAM_EXT: &str = "jsonl";

/// Storage for log streams.
pub trait LogBackend {
    /// Append one serialised record to `stream`. Returns the file that changed, if any.
    fn append(&self, stream: &str, line: &str) -> Result<Option<PathBuf>, BrainError>;
    /// All stream names, sorted.
    fn streams(&self) -> Result<Vec<String>, BrainError>;
    fn lines(&self, stream: &str) -> Result<Vec<String>, BrainError>;
}

/// One `<dir>/<stream>.jsonl` file per author.
pub struct FileLog {
    dir: PathBuf,
}

impl FileLog {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn stream_path(&self, stream: &str) -> Result<PathBuf, BrainError> {
        if stream.is_empty()
            || stream.starts_with('.')
            || stream.contains(['/', '\\'])
        {
            return Err(BrainError::ValidationError(format!(
                "invalid stream name '{}'",
                stream
            )));
        }
        Ok(self.dir.join(format!("{}.{}", stream, STREAM_EXT)))
    }
}

impl LogBackend for FileLog {
    fn append(&self, stream: &str, line: &str) -> Result<Option<PathBuf>, BrainError> {
        let path = self.stream_path(stream)?;
        fs::create_dir_all(&self.dir)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{}", line.trim_end())?;
        Ok(Some(path))
    }

    fn streams(&self) -> Result<Vec<String>, BrainError> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut streams = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(STREAM_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                streams.push(stem.to_string());
            }
        }
        streams.sort();
        Ok(streams)
    }

    fn lines(&self, stream: &str) -> Result<Vec<String>, BrainError> {
        let path = self.stream_path(stream)?;
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read(&path)?;
        let mut lines = Vec::new();
        for (number, bytes) in content.split(|b| *b == b'\n').enumerate() {
            match std::str::from_utf8(bytes) {
                Ok(line) => lines.push(line.trim_end_matches('\r').to_string()),
                Err(e) => warn!(stream, line = number + 1, error = %e, "skipping non-UTF-8 log line"),
            }
        }
        Ok(lines)
    }
}

/// In-memory streams. Clones share storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryLog {
    streams: Rc<RefCell<BTreeMap<String, Vec<String>>>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a raw line without validation, for corrupt-input tests.
    pub fn push_raw(&self, stream: &str, line: &str) {
        self.streams
            .borrow_mut()
            .entry(stream.to_string())
            .or_default()
            .push(line.to_string());
    }
}

impl LogBackend for MemoryLog {
    fn append(&self, stream: &str, line: &str) -> Result<Option<PathBuf>, BrainError> {
        self.push_raw(stream, line.trim_end());
        Ok(None)
    }

    fn streams(&self) -> Result<Vec<String>, BrainError> {
        Ok(self.streams.borrow().keys().cloned().collect())
    }

    fn lines(&self, stream: &str) -> Result<Vec<String>, BrainError> {
        Ok(self
            .streams
            .borrow()
            .get(stream)
            .cloned()
            .unwrap_or_default())
    }
}

/// A parsed line together with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// SHA-256 of the exact line; two records are the same record iff their ids match.
    pub id: String,
    pub stream: String,
    pub raw: String,
    pub event: Event,
}

impl LogRecord {
    fn parse(stream: &str, line: &str) -> Option<Self> {
        let raw = line.trim();
        if raw.is_empty() {
            return None;
        }
        match Event::from_line(raw) {
            Ok(event) => Some(Self {
                id: record_id(raw),
                stream: stream.to_string(),
                raw: raw.to_string(),
                event,
            }),
            Err(e) => {
                warn!(stream, error = %e, "skipping malformed log line");
                None
            }
        }
    }
}

pub fn record_id(raw: &str) -> String {
    let digest = Sha256::digest(raw.trim().as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replay<'a> {
    All,
    From(&'a str),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    pub verified: usize,
    pub unsigned: usize,
    /// `(stream, record id)` of every record whose signature does not check out.
    pub invalid: Vec<(String, String)>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.invalid.is_empty()
    }
}

pub struct EventLog {
    backend: Box<dyn LogBackend>,
}

impl EventLog {
    pub fn new(backend: Box<dyn LogBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &dyn LogBackend {
        self.backend.as_ref()
    }

    /// Append `event` to its author's stream.
    pub fn append(&self, event: &Event) -> Result<Option<PathBuf>, BrainError> {
        let line = event.to_line()?;
        self.backend.append(&event.from, &line)
    }

    /// Lazily replay records. Streams are visited in lexical order, lines in stored order;
    /// a record seen earlier in the walk is not yielded again.
    pub fn replay<'a>(
        &'a self,
        scope: Replay<'a>,
    ) -> Result<impl Iterator<Item = Result<LogRecord, BrainError>> + 'a, BrainError> {
        let streams = match scope {
            Replay::All => self.backend.streams()?,
            Replay::From(stream) => vec![stream.to_string()],
        };
        let mut seen = HashSet::new();
        Ok(streams
            .into_iter()
            .flat_map(move |stream| {
                let parsed: Vec<Result<LogRecord, BrainError>> = match self.backend.lines(&stream)
                {
                    Ok(lines) => lines
                        .iter()
                        .filter_map(|line| LogRecord::parse(&stream, line))
                        .map(Ok)
                        .collect(),
                    Err(e) => vec![Err(e)],
                };
                parsed
            })
            .filter(move |record| match record {
                Ok(r) => seen.insert(r.id.clone()),
                Err(_) => true,
            }))
    }

    pub fn records(&self, scope: Replay<'_>) -> Result<Vec<LogRecord>, BrainError> {
        self.replay(scope)?.collect()
    }

    pub fn events(&self, scope: Replay<'_>) -> Result<Vec<Event>, BrainError> {
        Ok(self.records(scope)?.into_iter().map(|r| r.event).collect())
    }

    /// Union `other` into this log. Returns the number of records added and the files touched.
    pub fn merge_from(&self, other: &EventLog) -> Result<(usize, Vec<PathBuf>), BrainError> {
        let mut known: HashSet<String> = self
            .records(Replay::All)?
            .into_iter()
            .map(|r| r.id)
            .collect();
        let mut added = 0;
        let mut touched: Vec<PathBuf> = Vec::new();
        for record in other.records(Replay::All)? {
            if !known.insert(record.id.clone()) {
                continue;
            }
            if let Some(path) = self.backend.append(&record.stream, &record.raw)?
                && !touched.contains(&path)
            {
                touched.push(path);
            }
            added += 1;
        }
        Ok((added, touched))
    }

    /// Check every signed record against the author's published keys.
    pub fn verify(
        &self,
        public_keys: &dyn Fn(&str) -> Vec<String>,
    ) -> Result<VerifyReport, BrainError> {
        let mut report = VerifyReport::default();
        for record in self.records(Replay::All)? {
            let Some(sig) = record.event.sig.as_deref() else {
                report.unsigned += 1;
                continue;
            };
            let payload = Event::raw_signing_payload(&record.raw)?;
            let valid = record.event.from == record.stream
                && public_keys(&record.event.from)
                    .iter()
                    .any(|pem| crate::plugins::keys::verify(pem, payload.as_bytes(), sig));
            if valid {
                report.verified += 1;
            } else {
                report.invalid.push((record.stream.clone(), record.id.clone()));
            }
        }
        Ok(report)
    }
}
