//! Pre-commit gate.
//!
//! [`evaluate`] is a pure function from a snapshot of protocol state to an allow/deny
//! decision. [`collect`] builds that snapshot from a workspace; any state it cannot read is
//! carried into the snapshot so the gate fails closed.

use crate::core::config::BrainConfig;
use crate::core::error::BrainError;
use crate::core::event::{Event, EventKind};
use crate::core::workspace::{UNKNOWN_AUTHOR, Workspace};
use crate::plugins::identity;
use crate::plugins::receipts::{self, Freshness};
use chrono::Duration;
use regex::{Regex, RegexBuilder};
use std::fmt;
use tracing::warn;

/// Compiled gate configuration.
#[derive(Debug, Clone)]
pub struct GatePolicy {
    exempt: Vec<Regex>,
    pub max_receipt_age: Duration,
}

impl GatePolicy {
    pub fn new(
        exempt_globs: &[String],
        case_sensitive: bool,
        max_receipt_age: Duration,
    ) -> Result<Self, BrainError> {
        let exempt = exempt_globs
            .iter()
            .map(|glob| {
                RegexBuilder::new(&glob_to_regex(glob))
                    .case_insensitive(!case_sensitive)
                    .build()
                    .map_err(|e| {
                        BrainError::ValidationError(format!("exempt path '{}': {}", glob, e))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            exempt,
            max_receipt_age,
        })
    }

    pub fn from_config(config: &BrainConfig) -> Result<Self, BrainError> {
        Self::new(
            &config.gate.exempt_paths,
            config.gate.case_sensitive,
            config.receipt_max_age(),
        )
    }

    pub fn is_exempt(&self, path: &str) -> bool {
        let path = path.trim_start_matches("./");
        self.exempt.iter().any(|re| re.is_match(path))
    }
}

/// Translate a path glob into an anchored regex: `*` and `?` stay inside one path segment,
/// `**` crosses segments, and `**/` also matches zero directories.
fn glob_to_regex(glob: &str) -> String {
    let mut re = String::from("^");
    let chars: Vec<char> = glob.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if chars.get(i + 2) == Some(&'/') {
                    re.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    re.push_str(".*");
                    i += 2;
                }
                continue;
            }
            '*' => re.push_str("[^/]*"),
            '?' => re.push_str("[^/]"),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }
    re.push('$');
    re
}

/// Everything the gate decides on.
#[derive(Debug, Clone)]
pub struct GateInput {
    pub identity: Option<String>,
    /// Receipt state of the identity; `None` when there is no identity.
    pub receipt: Option<Freshness>,
    pub staged_paths: Vec<String>,
    pub bypass: bool,
    /// State that could not be read.
    pub unreadable: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowReason {
    Checked,
    ExemptPaths,
    Bypass,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    MissingIdentity,
    MissingReceipt,
    StaleReceipt { age_hours: i64, max_age_hours: i64 },
    UnreadableState(String),
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let err = match self {
            DenyReason::MissingIdentity => BrainError::MissingIdentity,
            DenyReason::MissingReceipt => BrainError::MissingReceipt,
            DenyReason::StaleReceipt {
                age_hours,
                max_age_hours,
            } => BrainError::StaleReceipt {
                age_hours: *age_hours,
                max_age_hours: *max_age_hours,
            },
            DenyReason::UnreadableState(what) => {
                return write!(f, "Protocol state is unreadable: {}", what);
            }
        };
        write!(f, "{}", err)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow(AllowReason),
    Deny(Vec<DenyReason>),
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow(_))
    }
}

/// Decide whether a commit may proceed. Every failing check is reported.
pub fn evaluate(input: &GateInput, policy: &GatePolicy) -> Decision {
    if input.bypass {
        return Decision::Allow(AllowReason::Bypass);
    }
    if !input.staged_paths.is_empty() && input.staged_paths.iter().all(|p| policy.is_exempt(p)) {
        return Decision::Allow(AllowReason::ExemptPaths);
    }

    let mut reasons: Vec<DenyReason> = input
        .unreadable
        .iter()
        .map(|what| DenyReason::UnreadableState(what.clone()))
        .collect();
    if input.identity.is_none() {
        reasons.push(DenyReason::MissingIdentity);
    }
    match &input.receipt {
        Some(Freshness::Fresh(_)) => {}
        None | Some(Freshness::Missing) | Some(Freshness::UnknownCommit(_)) => {
            reasons.push(DenyReason::MissingReceipt);
        }
        Some(Freshness::Stale { age, .. }) => reasons.push(DenyReason::StaleReceipt {
            age_hours: age.num_hours(),
            max_age_hours: policy.max_receipt_age.num_hours(),
        }),
    }

    if reasons.is_empty() {
        Decision::Allow(AllowReason::Checked)
    } else {
        Decision::Deny(reasons)
    }
}

/// `true` iff the bypass variable holds a non-blank value.
pub fn bypass_requested(value: Option<&str>) -> bool {
    value.is_some_and(|v| !v.trim().is_empty())
}

/// Read the gate's inputs from `ws`. Failures become `unreadable` entries, never errors.
pub fn collect(ws: &Workspace, bypass_value: Option<&str>) -> GateInput {
    let mut unreadable = Vec::new();
    let staged_paths = ws.history.staged_paths().unwrap_or_else(|e| {
        unreadable.push(format!("staged paths: {}", e));
        Vec::new()
    });
    let (identity, receipt) = match identity::current(ws) {
        Ok(me) => {
            let receipt = receipts::freshness(ws, &me, ws.now(), ws.config.receipt_max_age())
                .unwrap_or_else(|e| {
                    unreadable.push(format!("receipts: {}", e));
                    Freshness::Missing
                });
            (Some(me.full_id), Some(receipt))
        }
        Err(BrainError::MissingIdentity) => (None, None),
        Err(e) => {
            unreadable.push(format!("identity: {}", e));
            (None, None)
        }
    };
    GateInput {
        identity,
        receipt,
        staged_paths,
        bypass: bypass_requested(bypass_value),
        unreadable,
    }
}

/// Evaluate the gate for the pending commit. A bypass is recorded in the log and staged
/// into the commit it let through.
pub fn run_pre_commit(ws: &Workspace, bypass_value: Option<&str>) -> Result<Decision, BrainError> {
    let policy = GatePolicy::from_config(&ws.config)?;
    let input = collect(ws, bypass_value);
    let decision = evaluate(&input, &policy);

    if decision == Decision::Allow(AllowReason::Bypass) {
        let reason = bypass_value
            .map(str::trim)
            .filter(|v| !["1", "true", "yes"].contains(&v.to_lowercase().as_str()))
            .map(str::to_string);
        let kind = EventKind::GateBypass {
            paths: input.staged_paths.clone(),
            reason,
        };
        match identity::current(ws) {
            Ok(me) => {
                ws.append(&me, kind)?;
            }
            Err(_) => ws.append_event(&Event::new(UNKNOWN_AUTHOR, ws.now(), kind))?,
        }
        warn!(
            from = input.identity.as_deref().unwrap_or(UNKNOWN_AUTHOR),
            paths = input.staged_paths.len(),
            "pre-commit gate bypassed"
        );
    }
    Ok(decision)
}
