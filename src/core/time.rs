//! Shared timestamp helpers and the injectable clock.

use chrono::{DateTime, Duration, DurationRound, SecondsFormat, Utc};
use serde_json::Value as JsonValue;
use std::cell::Cell;
use std::rc::Rc;

/// Source of "now" for every protocol operation.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        truncate_micros(Utc::now())
    }
}

/// Manually driven clock. Clones share the same instant.
#[derive(Debug, Clone)]
pub struct FixedClock {
    at: Rc<Cell<DateTime<Utc>>>,
}

impl FixedClock {
    pub fn at(ts: DateTime<Utc>) -> Self {
        Self {
            at: Rc::new(Cell::new(truncate_micros(ts))),
        }
    }

    pub fn set(&self, ts: DateTime<Utc>) {
        self.at.set(truncate_micros(ts));
    }

    pub fn advance(&self, by: Duration) {
        self.at.set(self.at.get() + by);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.at.get()
    }
}

/// Event timestamps carry microsecond precision so that a record re-serialises byte-identically.
pub fn truncate_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(Duration::microseconds(1)).unwrap_or(ts)
}

pub fn to_iso(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_iso(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Standard command response envelope shape used by `--format json` surfaces.
pub fn command_envelope(cmd: &str, status: &str, extra: JsonValue) -> JsonValue {
    let mut base = serde_json::json!({
        "envelope_version": "1.0.0",
        "ts": to_iso(&SystemClock.now()),
        "cmd": cmd,
        "status": status
    });
    if let (Some(base_obj), Some(extra_obj)) = (base.as_object_mut(), extra.as_object()) {
        for (k, v) in extra_obj {
            base_obj.insert(k.clone(), v.clone());
        }
    }
    base
}
