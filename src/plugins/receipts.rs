//! Read receipts: proof that a participant caught up with history before committing.

use crate::core::error::BrainError;
use crate::core::event::EventKind;
use crate::core::event_log::Replay;
use crate::core::workspace::Workspace;
use crate::plugins::identity::Identity;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Receipt {
    pub from: String,
    pub up_to_commit: String,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Freshness {
    Fresh(Receipt),
    Missing,
    Stale { receipt: Receipt, age: Duration },
    /// The receipt names a commit that is not in `HEAD`'s history.
    UnknownCommit(Receipt),
}

impl Freshness {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Freshness::Fresh(_))
    }

    /// The error a gate reports for this state, if any.
    pub fn to_error(&self, max_age: Duration) -> Option<BrainError> {
        match self {
            Freshness::Fresh(_) => None,
            Freshness::Missing | Freshness::UnknownCommit(_) => Some(BrainError::MissingReceipt),
            Freshness::Stale { age, .. } => Some(BrainError::StaleReceipt {
                age_hours: age.num_hours(),
                max_age_hours: max_age.num_hours(),
            }),
        }
    }
}

pub fn post(ws: &Workspace, identity: &Identity, up_to_commit: &str) -> Result<Receipt, BrainError> {
    let event = ws.append(
        identity,
        EventKind::ReadReceipt {
            up_to_commit: up_to_commit.to_string(),
        },
    )?;
    Ok(Receipt {
        from: event.from,
        up_to_commit: up_to_commit.to_string(),
        ts: event.ts,
    })
}

/// The newest receipt written by `identity`.
pub fn latest(ws: &Workspace, identity: &Identity) -> Result<Option<Receipt>, BrainError> {
    let receipts = ws
        .log
        .events(Replay::From(&identity.full_id))?
        .into_iter()
        .filter(|e| e.from == identity.full_id)
        .filter_map(|e| match e.kind {
            EventKind::ReadReceipt { up_to_commit } => Some(Receipt {
                from: e.from,
                up_to_commit,
                ts: e.ts,
            }),
            _ => None,
        });
    Ok(receipts.max_by_key(|r| r.ts))
}

pub fn freshness(
    ws: &Workspace,
    identity: &Identity,
    now: DateTime<Utc>,
    max_age: Duration,
) -> Result<Freshness, BrainError> {
    let Some(receipt) = latest(ws, identity)? else {
        return Ok(Freshness::Missing);
    };
    if !ws.history.is_ancestor(&receipt.up_to_commit, "HEAD")? {
        return Ok(Freshness::UnknownCommit(receipt));
    }
    let age = now - receipt.ts;
    if age > max_age {
        return Ok(Freshness::Stale { receipt, age });
    }
    Ok(Freshness::Fresh(receipt))
}

pub fn is_fresh(
    ws: &Workspace,
    identity: &Identity,
    now: DateTime<Utc>,
    max_age: Duration,
) -> Result<bool, BrainError> {
    Ok(freshness(ws, identity, now, max_age)?.is_fresh())
}
