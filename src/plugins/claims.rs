//! Exclusive claims on work resources.
//!
//! Claims are never locked against a server. Each participant appends `claim`, `release` and
//! `complete` events to their own stream, and [`resolve`] folds the merged log into one
//! claim table that every participant computes identically. When two branches both claimed a
//! resource, the earliest claim wins and [`reconcile`] records the loser and notifies it.

use crate::core::error::BrainError;
use crate::core::event::{Event, EventKind};
use crate::core::event_log::Replay;
use crate::core::time::to_iso;
use crate::core::workspace::Workspace;
use crate::plugins::identity::Identity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use tracing::{info, warn};

/// Name of a claimable resource, e.g. `phase-11` or `task-auth`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn phase(n: u32) -> Self {
        Self(format!("phase-{}", n))
    }

    pub fn task(id: &str) -> Result<Self, BrainError> {
        let id = id.trim();
        if id.is_empty() || id.contains(char::is_whitespace) {
            return Err(BrainError::ValidationError(format!(
                "invalid task id '{}'",
                id
            )));
        }
        Ok(Self(format!("task-{}", id)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClaimStatus {
    Active,
    Released,
    Completed,
    ConflictRejected,
}

impl fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ClaimStatus::Active => "active",
            ClaimStatus::Released => "released",
            ClaimStatus::Completed => "completed",
            ClaimStatus::ConflictRejected => "conflict-rejected",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub resource: String,
    pub developer: String,
    pub branch: String,
    pub ts: DateTime<Utc>,
    pub head_at_claim: Option<String>,
    pub status: ClaimStatus,
    pub closed_ts: Option<DateTime<Utc>>,
    /// Release reason, completion ref, or rejection explanation.
    pub note: Option<String>,
    /// Winner's `full_id` for a conflict-rejected claim.
    pub superseded_by: Option<String>,
}

impl Claim {
    fn opened(resource: &str, event: &Event, branch: &str, head_at_claim: &Option<String>) -> Self {
        Self {
            resource: resource.to_string(),
            developer: event.from.clone(),
            branch: branch.to_string(),
            ts: event.ts,
            head_at_claim: head_at_claim.clone(),
            status: ClaimStatus::Active,
            closed_ts: None,
            note: None,
            superseded_by: None,
        }
    }

    fn reject(&mut self, winner: &str, note: String) {
        self.status = ClaimStatus::ConflictRejected;
        self.closed_ts = Some(self.ts);
        self.superseded_by = Some(winner.to_string());
        self.note = Some(note);
    }
}

/// A claim the reducer rejected, paired with the claim that beat it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub winner: Claim,
    pub loser: Claim,
}

fn kind_rank(kind: &EventKind) -> u8 {
    match kind {
        EventKind::Claim { .. } => 0,
        EventKind::Complete { .. } => 1,
        EventKind::Release { .. } => 2,
        EventKind::ClaimRejected { .. } => 3,
        _ => 4,
    }
}

type SortKey = (DateTime<Utc>, String, u8, String);

fn sort_key(event: &Event) -> SortKey {
    (
        event.ts,
        event.from.clone(),
        kind_rank(&event.kind),
        serde_json::to_string(&event.kind).unwrap_or_default(),
    )
}

/// Fold claim-protocol events into the claim table.
///
/// Events are put in the total order `(ts, from, kind)` first, so the result does not depend
/// on the order streams were merged or replayed in. Per resource the first claimant holds until
/// it releases or completes; any other claim while it holds is conflict-rejected. A
/// `claim-rejected` record forces the named claim to conflict-rejected.
pub fn resolve(events: &[Event]) -> Vec<Claim> {
    let mut keyed: Vec<(SortKey, &Event)> = events
        .iter()
        .filter(|e| e.kind.resource().is_some())
        .map(|e| (sort_key(e), e))
        .collect();
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    keyed.dedup_by(|a, b| a.0 == b.0);

    let forced: BTreeMap<(String, String, DateTime<Utc>), String> = keyed
        .iter()
        .filter_map(|(_, e)| match &e.kind {
            EventKind::ClaimRejected {
                resource,
                claimant,
                claimant_ts,
                winner,
                ..
            } => Some((
                (resource.clone(), claimant.clone(), *claimant_ts),
                winner.clone(),
            )),
            _ => None,
        })
        .collect();

    let mut claims: Vec<Claim> = Vec::new();
    let mut holders: BTreeMap<String, usize> = BTreeMap::new();

    for (_, event) in keyed {
        match &event.kind {
            EventKind::Claim {
                resource,
                branch,
                head_at_claim,
            } => {
                let mut claim = Claim::opened(resource, event, branch, head_at_claim);
                let key = (resource.clone(), event.from.clone(), event.ts);
                if let Some(winner) = forced.get(&key) {
                    claim.reject(winner, format!("rejected in favour of {}", winner));
                    claims.push(claim);
                    continue;
                }
                match holders.get(resource).map(|&i| &claims[i]) {
                    None => {
                        holders.insert(resource.clone(), claims.len());
                        claims.push(claim);
                    }
                    Some(holder) if holder.developer == event.from => {}
                    Some(holder) => {
                        let note = format!(
                            "{} already held since {}",
                            holder.developer,
                            to_iso(&holder.ts)
                        );
                        let winner = holder.developer.clone();
                        claim.reject(&winner, note);
                        claims.push(claim);
                    }
                }
            }
            EventKind::Release { resource, reason } => {
                close(&mut claims, &mut holders, resource, event, ClaimStatus::Released, reason);
            }
            EventKind::Complete {
                resource,
                reference,
                ..
            } => {
                close(&mut claims, &mut holders, resource, event, ClaimStatus::Completed, reference);
            }
            _ => {}
        }
    }

    claims.sort_by(|a, b| (&a.resource, a.ts, &a.developer).cmp(&(&b.resource, b.ts, &b.developer)));
    claims
}

fn close(
    claims: &mut [Claim],
    holders: &mut BTreeMap<String, usize>,
    resource: &str,
    event: &Event,
    status: ClaimStatus,
    note: &str,
) {
    let Some(&index) = holders.get(resource) else {
        return;
    };
    if claims[index].developer != event.from {
        return;
    }
    let claim = &mut claims[index];
    claim.status = status;
    claim.closed_ts = Some(event.ts);
    claim.note = Some(note.to_string());
    holders.remove(resource);
}

/// The active claim on `resource`, if any.
pub fn active_holder<'a>(claims: &'a [Claim], resource: &str) -> Option<&'a Claim> {
    claims
        .iter()
        .find(|c| c.resource == resource && c.status == ClaimStatus::Active)
}

/// Rejected claims with no `claim-rejected` record yet, each paired with its winner.
pub fn conflicts(events: &[Event]) -> Vec<Conflict> {
    let recorded: HashSet<(String, String, DateTime<Utc>)> = events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::ClaimRejected {
                resource,
                claimant,
                claimant_ts,
                ..
            } => Some((resource.clone(), claimant.clone(), *claimant_ts)),
            _ => None,
        })
        .collect();
    let claims = resolve(events);
    claims
        .iter()
        .filter(|c| c.status == ClaimStatus::ConflictRejected)
        .filter(|c| !recorded.contains(&(c.resource.clone(), c.developer.clone(), c.ts)))
        .filter_map(|loser| {
            let winner_id = loser.superseded_by.as_deref()?;
            let winner = claims
                .iter()
                .filter(|w| {
                    w.resource == loser.resource
                        && w.developer == winner_id
                        && w.status != ClaimStatus::ConflictRejected
                        && w.ts <= loser.ts
                })
                .max_by_key(|w| w.ts)?;
            Some(Conflict {
                winner: winner.clone(),
                loser: loser.clone(),
            })
        })
        .collect()
}

fn check_sync(ws: &Workspace) -> Result<Option<String>, BrainError> {
    let head = ws.history.head()?;
    let Some(tip) = ws.history.resolve(&ws.config.sync_ref)? else {
        warn!(sync_ref = %ws.config.sync_ref, "sync ref does not resolve; skipping staleness check");
        return Ok(head);
    };
    let behind = ws.history.commits_behind("HEAD", &tip)?;
    if behind > ws.config.claim_max_behind {
        return Err(BrainError::StaleSync {
            head: head.unwrap_or_else(|| "(no commits)".to_string()),
            tip: ws.config.sync_ref.clone(),
            behind,
            max_behind: ws.config.claim_max_behind,
        });
    }
    Ok(head)
}

pub fn list(ws: &Workspace) -> Result<Vec<Claim>, BrainError> {
    Ok(resolve(&ws.log.events(Replay::All)?))
}

/// Claim `resource` for `identity`. Re-claiming a resource the caller already holds returns
/// the existing claim.
pub fn claim(ws: &Workspace, identity: &Identity, resource: &ResourceId) -> Result<Claim, BrainError> {
    let head = check_sync(ws)?;
    let claims = list(ws)?;
    if let Some(holder) = active_holder(&claims, resource.as_str()) {
        if holder.developer == identity.full_id {
            return Ok(holder.clone());
        }
        return Err(BrainError::ResourceHeld {
            resource: resource.to_string(),
            holder: holder.developer.clone(),
        });
    }

    let branch = format!(
        "{}{}/{}",
        ws.config.participant_branch_prefix, identity.short_name, resource
    );
    let event = ws.append(
        identity,
        EventKind::Claim {
            resource: resource.to_string(),
            branch: branch.clone(),
            head_at_claim: head.clone(),
        },
    )?;
    info!(%resource, from = %identity.full_id, "claimed");
    Ok(Claim::opened(resource.as_str(), &event, &branch, &head))
}

fn require_holder(ws: &Workspace, identity: &Identity, resource: &ResourceId) -> Result<(), BrainError> {
    let claims = list(ws)?;
    match active_holder(&claims, resource.as_str()) {
        Some(holder) if holder.developer == identity.full_id => Ok(()),
        other => Err(BrainError::NotClaimHolder {
            resource: resource.to_string(),
            caller: identity.full_id.clone(),
            holder: other.map(|c| c.developer.clone()),
        }),
    }
}

pub fn release(
    ws: &Workspace,
    identity: &Identity,
    resource: &ResourceId,
    reason: &str,
) -> Result<Event, BrainError> {
    require_holder(ws, identity, resource)?;
    ws.append(
        identity,
        EventKind::Release {
            resource: resource.to_string(),
            reason: reason.to_string(),
        },
    )
}

pub fn complete(
    ws: &Workspace,
    identity: &Identity,
    resource: &ResourceId,
    reference: &str,
) -> Result<Event, BrainError> {
    require_holder(ws, identity, resource)?;
    let head_commit = ws.history.head()?;
    ws.append(
        identity,
        EventKind::Complete {
            resource: resource.to_string(),
            reference: reference.to_string(),
            head_commit,
        },
    )
}

/// Record every unrecorded conflict in the merged log and notify each losing claimant.
pub fn reconcile(ws: &Workspace, identity: &Identity) -> Result<Vec<Conflict>, BrainError> {
    let found = conflicts(&ws.log.events(Replay::All)?);
    for conflict in &found {
        let (winner, loser) = (&conflict.winner, &conflict.loser);
        ws.append(
            identity,
            EventKind::ClaimRejected {
                resource: loser.resource.clone(),
                claimant: loser.developer.clone(),
                claimant_ts: loser.ts,
                winner: winner.developer.clone(),
                winner_ts: winner.ts,
            },
        )?;
        ws.append(
            identity,
            EventKind::Message {
                body: format!(
                    "Your claim on {} ({}) lost to {} who claimed it at {}. Pick another resource.",
                    loser.resource,
                    to_iso(&loser.ts),
                    winner.developer,
                    to_iso(&winner.ts)
                ),
                to: Some(loser.developer.clone()),
                head_commit: None,
            },
        )?;
        warn!(resource = %loser.resource, loser = %loser.developer, winner = %winner.developer, "claim conflict recorded");
    }
    Ok(found)
}
