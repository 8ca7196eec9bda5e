//! Protocol event records.
//!
//! One [`Event`] is one line of a participant's JSONL stream. The `type` tag selects the
//! kind; unknown extra fields written by newer peers are ignored on read but stay covered by
//! the signature.

use crate::core::error::BrainError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Author's `full_id`.
    pub from: String,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
    /// Base64 Ed25519 signature over [`Event::signing_payload`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EventKind {
    Message {
        body: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        head_commit: Option<String>,
    },
    Announce {
        body: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source_branch: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        head_commit: Option<String>,
    },
    ReadReceipt {
        up_to_commit: String,
    },
    Claim {
        resource: String,
        branch: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        head_at_claim: Option<String>,
    },
    Release {
        resource: String,
        reason: String,
    },
    Complete {
        resource: String,
        #[serde(rename = "ref")]
        reference: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        head_commit: Option<String>,
    },
    ClaimRejected {
        resource: String,
        claimant: String,
        claimant_ts: DateTime<Utc>,
        winner: String,
        winner_ts: DateTime<Utc>,
    },
    GateBypass {
        paths: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl EventKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            EventKind::Message { .. } => "message",
            EventKind::Announce { .. } => "announce",
            EventKind::ReadReceipt { .. } => "read-receipt",
            EventKind::Claim { .. } => "claim",
            EventKind::Release { .. } => "release",
            EventKind::Complete { .. } => "complete",
            EventKind::ClaimRejected { .. } => "claim-rejected",
            EventKind::GateBypass { .. } => "gate-bypass",
        }
    }

    /// Resource a claim-protocol event refers to.
    pub fn resource(&self) -> Option<&str> {
        match self {
            EventKind::Claim { resource, .. }
            | EventKind::Release { resource, .. }
            | EventKind::Complete { resource, .. }
            | EventKind::ClaimRejected { resource, .. } => Some(resource),
            _ => None,
        }
    }
}

impl Event {
    pub fn new(from: &str, ts: DateTime<Utc>, kind: EventKind) -> Self {
        Self {
            from: from.to_string(),
            ts,
            kind,
            sig: None,
        }
    }

    /// Canonical bytes covered by `sig`: the record as a JSON object without `sig`, keys
    /// sorted at every level.
    pub fn signing_payload(&self) -> Result<String, BrainError> {
        canonical_payload(serde_json::to_value(self)?)
    }

    /// Signing payload of a stored line. Fields this version does not model stay covered.
    pub fn raw_signing_payload(raw: &str) -> Result<String, BrainError> {
        canonical_payload(serde_json::from_str(raw.trim())?)
    }

    pub fn to_line(&self) -> Result<String, BrainError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_line(line: &str) -> Result<Self, BrainError> {
        Ok(serde_json::from_str(line.trim())?)
    }
}

fn canonical_payload(mut record: Value) -> Result<String, BrainError> {
    if let Some(fields) = record.as_object_mut() {
        fields.remove("sig");
    }
    Ok(serde_json::to_string(&sorted(record))?)
}

fn sorted(value: Value) -> Value {
    match value {
        Value::Object(fields) => {
            let mut entries: Vec<(String, Value)> = fields.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, sorted(v)))
                    .collect::<Map<String, Value>>(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sorted).collect()),
        other => other,
    }
}
